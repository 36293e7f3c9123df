//! AWS API access through the AWS CLI
//!
//! Every AWS-backed server calls its service with
//! `aws <service> <operation> --cli-input-json <params>`, which keeps
//! credential resolution, request signing and retries inside the CLI.
//! Output is always requested as JSON and parsed back into a `Value`.

use crate::core::command::{CommandRunner, CommandSpec};
use crate::core::config::AwsConfig;
use crate::core::service::ServiceError;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// Per-call overrides
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Region for this call only
    pub region: Option<String>,
    /// Custom endpoint (e.g. a Neptune cluster)
    pub endpoint_url: Option<String>,
}

impl CallOptions {
    pub fn region(region: Option<String>) -> Self {
        Self {
            region,
            endpoint_url: None,
        }
    }
}

/// Token names and item key of a paginated operation
#[derive(Debug, Clone, Copy)]
pub struct Pagination<'a> {
    pub input_token: &'a str,
    pub output_token: &'a str,
    pub items_key: &'a str,
    pub max_items: Option<usize>,
}

impl<'a> Pagination<'a> {
    /// The common `NextToken` in / `NextToken` out shape
    pub fn next_token(items_key: &'a str, max_items: Option<usize>) -> Self {
        Self {
            input_token: "NextToken",
            output_token: "NextToken",
            items_key,
            max_items,
        }
    }
}

/// AWS CLI client
#[derive(Clone)]
pub struct AwsCli {
    runner: Arc<dyn CommandRunner>,
    cli_path: String,
    region: Option<String>,
    profile: Option<String>,
}

impl AwsCli {
    pub fn new(runner: Arc<dyn CommandRunner>, config: &AwsConfig) -> Self {
        Self {
            runner,
            cli_path: config.cli_path.clone(),
            region: config.region.clone(),
            profile: config.profile.clone(),
        }
    }

    /// Region used when a call does not override it
    pub fn default_region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    /// Global flags shared by every invocation
    fn global_args(&self, options: &CallOptions) -> Vec<String> {
        let mut args = vec![
            "--output".to_string(),
            "json".to_string(),
            "--no-paginate".to_string(),
        ];
        if let Some(region) = options.region.as_ref().or(self.region.as_ref()) {
            args.push("--region".to_string());
            args.push(region.clone());
        }
        if let Some(profile) = &self.profile {
            args.push("--profile".to_string());
            args.push(profile.clone());
        }
        if let Some(endpoint) = &options.endpoint_url {
            args.push("--endpoint-url".to_string());
            args.push(endpoint.clone());
        }
        args
    }

    /// Call one API operation and parse its JSON response
    ///
    /// # Arguments
    ///
    /// * `service` - CLI service name, e.g. `cloudcontrol`
    /// * `operation` - CLI operation name, e.g. `get-resource`
    /// * `params` - request shape using the API's member names
    pub async fn call(
        &self,
        options: &CallOptions,
        service: &str,
        operation: &str,
        params: Value,
    ) -> Result<Value, ServiceError> {
        let mut spec = CommandSpec::new(&self.cli_path)
            .arg(service)
            .arg(operation)
            .env("AWS_PAGER", "");
        let has_params = params.as_object().map(|m| !m.is_empty()).unwrap_or(false);
        if has_params {
            spec = spec
                .arg("--cli-input-json")
                .arg(serde_json::to_string(&params)?);
        }
        spec = spec.args(self.global_args(options));

        let output = self.runner.run(&spec).await?;
        if !output.success() {
            return Err(parse_cli_error(&output.stderr).unwrap_or_else(|| {
                ServiceError::Command {
                    program: format!("aws {} {}", service, operation),
                    exit_code: output.exit_code,
                    stderr: output.stderr.trim().to_string(),
                }
            }));
        }

        let stdout = output.stdout.trim();
        if stdout.is_empty() {
            return Ok(Value::Object(Map::new()));
        }
        serde_json::from_str(stdout).map_err(|e| {
            ServiceError::Unexpected(format!(
                "Could not parse output of aws {} {}: {}",
                service, operation, e
            ))
        })
    }

    /// Call a paginated operation, following tokens until exhausted
    pub async fn paginate(
        &self,
        options: &CallOptions,
        service: &str,
        operation: &str,
        params: Value,
        page: Pagination<'_>,
    ) -> Result<Vec<Value>, ServiceError> {
        let mut params = match params {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            _ => return Err(ServiceError::invalid("request parameters must be an object")),
        };
        let mut items = Vec::new();

        loop {
            let response = self
                .call(options, service, operation, Value::Object(params.clone()))
                .await?;
            if let Some(batch) = response.get(page.items_key).and_then(Value::as_array) {
                items.extend(batch.iter().cloned());
            }

            if let Some(max) = page.max_items {
                if items.len() >= max {
                    items.truncate(max);
                    break;
                }
            }

            match response.get(page.output_token).and_then(Value::as_str) {
                Some(token) if !token.is_empty() => {
                    debug!("Fetching next page of {} {}", service, operation);
                    params.insert(page.input_token.to_string(), Value::String(token.to_string()));
                }
                _ => break,
            }
        }

        Ok(items)
    }

    /// Run arbitrary CLI arguments and return trimmed stdout
    pub async fn call_text(&self, args: &[&str]) -> Result<String, ServiceError> {
        let spec = CommandSpec::new(&self.cli_path)
            .args(args.iter().copied())
            .args(self.global_args(&CallOptions::default()))
            .env("AWS_PAGER", "");
        let output = self.runner.run(&spec).await?;
        if !output.success() {
            return Err(parse_cli_error(&output.stderr).unwrap_or_else(|| {
                ServiceError::Command {
                    program: "aws".to_string(),
                    exit_code: output.exit_code,
                    stderr: output.stderr.trim().to_string(),
                }
            }));
        }
        Ok(output.stdout.trim().to_string())
    }
}

/// Extract the service error code and message from AWS CLI stderr
///
/// Recognizes `An error occurred (Code) when calling the Op operation: Message`,
/// optionally with a retry note after the operation name.
pub fn parse_cli_error(stderr: &str) -> Option<ServiceError> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let re = PATTERN.get_or_init(|| {
        Regex::new(r"An error occurred \(([^)]+)\) when calling the \w+ operation(?: \([^)]*\))?: (.*)")
            .expect("valid AWS error regex")
    });
    let caps = re.captures(stderr)?;
    Some(ServiceError::Aws {
        code: caps[1].to_string(),
        message: caps[2].trim().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::command::testing::MockRunner;
    use serde_json::json;

    fn cli(runner: Arc<MockRunner>) -> AwsCli {
        AwsCli::new(
            runner,
            &AwsConfig {
                region: Some("us-east-1".into()),
                profile: Some("dev".into()),
                cli_path: "aws".into(),
            },
        )
    }

    #[tokio::test]
    async fn test_call_builds_arguments() {
        let runner = Arc::new(MockRunner::new());
        runner.push_ok(r#"{"TypeName": "AWS::S3::Bucket"}"#);
        let aws = cli(runner.clone());

        let result = aws
            .call(
                &CallOptions::region(Some("eu-west-1".into())),
                "cloudcontrol",
                "get-resource",
                json!({"TypeName": "AWS::S3::Bucket", "Identifier": "b"}),
            )
            .await
            .unwrap();

        assert_eq!(result["TypeName"], "AWS::S3::Bucket");
        let args = runner.args(0);
        assert_eq!(&args[..3], ["cloudcontrol", "get-resource", "--cli-input-json"]);
        let input: Value = serde_json::from_str(&args[3]).unwrap();
        assert_eq!(input["Identifier"], "b");
        let region_at = args.iter().position(|a| a == "--region").unwrap();
        assert_eq!(args[region_at + 1], "eu-west-1");
        assert!(args.windows(2).any(|w| w == ["--profile", "dev"]));
    }

    #[tokio::test]
    async fn test_call_without_params_skips_input_json() {
        let runner = Arc::new(MockRunner::new());
        runner.push_ok("");
        let aws = cli(runner.clone());
        let result = aws
            .call(&CallOptions::default(), "sns", "list-topics", json!({}))
            .await
            .unwrap();
        assert_eq!(result, json!({}));
        assert!(!runner.args(0).contains(&"--cli-input-json".to_string()));
    }

    #[tokio::test]
    async fn test_call_maps_service_error() {
        let runner = Arc::new(MockRunner::new());
        runner.push_err(
            254,
            "\nAn error occurred (ResourceNotFoundException) when calling the GetResource operation: Bucket x not found\n",
        );
        let aws = cli(runner);
        let err = aws
            .call(&CallOptions::default(), "cloudcontrol", "get-resource", json!({"Identifier": "x"}))
            .await
            .unwrap_err();
        match err {
            ServiceError::Aws { code, message } => {
                assert_eq!(code, "ResourceNotFoundException");
                assert_eq!(message, "Bucket x not found");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_paginate_follows_tokens() {
        let runner = Arc::new(MockRunner::new());
        runner
            .push_ok(r#"{"Topics": [{"TopicArn": "a"}, {"TopicArn": "b"}], "NextToken": "t1"}"#)
            .push_ok(r#"{"Topics": [{"TopicArn": "c"}]}"#);
        let aws = cli(runner.clone());

        let items = aws
            .paginate(
                &CallOptions::default(),
                "sns",
                "list-topics",
                json!({}),
                Pagination::next_token("Topics", None),
            )
            .await
            .unwrap();

        assert_eq!(items.len(), 3);
        assert_eq!(runner.calls().len(), 2);
        let second: Value = serde_json::from_str(&runner.args(1)[3]).unwrap();
        assert_eq!(second["NextToken"], "t1");
    }

    #[tokio::test]
    async fn test_paginate_stops_at_max_items() {
        let runner = Arc::new(MockRunner::new());
        runner.push_ok(r#"{"Items": [1, 2, 3], "NextToken": "more"}"#);
        let aws = cli(runner.clone());
        let items = aws
            .paginate(
                &CallOptions::default(),
                "x",
                "list",
                Value::Null,
                Pagination::next_token("Items", Some(2)),
            )
            .await
            .unwrap();
        assert_eq!(items, vec![json!(1), json!(2)]);
        assert_eq!(runner.calls().len(), 1);
    }

    #[test]
    fn test_parse_cli_error_with_retry_note() {
        let stderr = "An error occurred (ThrottlingException) when calling the ListResources operation (reached max retries: 2): Rate exceeded";
        match parse_cli_error(stderr) {
            Some(ServiceError::Aws { code, message }) => {
                assert_eq!(code, "ThrottlingException");
                assert_eq!(message, "Rate exceeded");
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(parse_cli_error("Unable to locate credentials").is_none());
    }
}
