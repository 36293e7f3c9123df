//! Terraform CLI, Terraform Registry and AWS provider documentation
//!
//! Command execution shells out to `terraform`; module and documentation
//! lookups are plain HTTPS requests. Failures are reported in the result
//! body (`status: "error"` or `success: false`) instead of as tool errors.

use crate::conversion::arguments::{parse_args, require_non_empty};
use crate::conversion::tool_result::error_payload;
use crate::core::command::{CommandRunner, CommandSpec, strip_ansi};
use crate::core::config::TerraformConfig;
use crate::core::service::{Service, ServiceError, ServiceKind};
use crate::models::mcp::Tool;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const COMMANDS: &[&str] = &["init", "plan", "validate", "apply", "destroy"];

#[derive(Debug, Deserialize)]
struct ExecuteParams {
    command: String,
    working_directory: String,
    #[serde(default)]
    variables: BTreeMap<String, String>,
    #[serde(default)]
    aws_region: Option<String>,
    #[serde(default = "default_true")]
    strip_ansi: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct ModuleParams {
    module_url: String,
    #[serde(default)]
    version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DocsParams {
    asset_name: String,
    #[serde(default)]
    asset_type: Option<String>,
}

/// Arguments for one terraform invocation
pub fn command_args(command: &str, variables: &BTreeMap<String, String>) -> Result<Vec<String>, ServiceError> {
    if !COMMANDS.contains(&command) {
        return Err(ServiceError::invalid(format!(
            "unsupported terraform command '{}'; expected one of {}",
            command,
            COMMANDS.join(", ")
        )));
    }
    let mut args = vec![command.to_string(), "-no-color".to_string()];
    if matches!(command, "apply" | "destroy") {
        args.push("-auto-approve".to_string());
    }
    if matches!(command, "plan" | "apply" | "destroy") {
        for (key, value) in variables {
            args.push("-var".to_string());
            args.push(format!("{}={}", key, value));
        }
    }
    Ok(args)
}

/// Split `namespace/name/provider`, tolerating a registry host prefix
pub fn parse_module_url(url: &str) -> Result<(String, String, String), ServiceError> {
    let trimmed = url
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("registry.terraform.io/")
        .trim_start_matches("modules/")
        .trim_matches('/');
    let parts: Vec<&str> = trimmed.split('/').collect();
    match parts.as_slice() {
        [namespace, name, provider, ..] if !namespace.is_empty() && !name.is_empty() && !provider.is_empty() => {
            Ok((namespace.to_string(), name.to_string(), provider.to_string()))
        }
        _ => Err(ServiceError::invalid(format!(
            "module_url '{}' must look like namespace/name/provider",
            url
        ))),
    }
}

/// Reshape a registry module response
fn module_summary(module: &Value) -> Value {
    let inputs: Vec<Value> = module["root"]["inputs"]
        .as_array()
        .map(|inputs| {
            inputs
                .iter()
                .map(|i| {
                    json!({
                        "name": i["name"],
                        "type": i["type"],
                        "description": i["description"],
                        "default": i["default"],
                        "required": i["required"],
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    let outputs: Vec<Value> = module["root"]["outputs"]
        .as_array()
        .map(|outputs| {
            outputs
                .iter()
                .map(|o| json!({ "name": o["name"], "description": o["description"] }))
                .collect()
        })
        .unwrap_or_default();
    let submodules: Vec<Value> = module["submodules"]
        .as_array()
        .map(|subs| subs.iter().map(|s| s["path"].clone()).collect())
        .unwrap_or_default();

    json!({
        "success": true,
        "module": module["id"],
        "version": module["version"],
        "description": module["description"],
        "source": module["source"],
        "published_at": module["published_at"],
        "downloads": module["downloads"],
        "inputs": inputs,
        "outputs": outputs,
        "submodules": submodules,
    })
}

/// Pieces of a provider documentation page
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DocPage {
    pub description: String,
    pub example_usage: Option<String>,
    pub arguments: Vec<String>,
}

/// Extract description, first example and argument names from provider markdown
pub fn parse_doc_page(markdown: &str) -> DocPage {
    let mut page = DocPage::default();
    let mut body = markdown;

    // front matter
    if let Some(rest) = markdown.strip_prefix("---") {
        if let Some(end) = rest.find("\n---") {
            let front = &rest[..end];
            body = &rest[end + 4..];
            if let Some(desc) = front.split("description:").nth(1) {
                page.description = desc
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty() && *l != "|-" && *l != "|")
                    .collect::<Vec<_>>()
                    .join(" ");
            }
        }
    }

    if page.description.is_empty() {
        page.description = body
            .split("\n\n")
            .map(str::trim)
            .find(|p| !p.is_empty() && !p.starts_with('#') && !p.starts_with("```"))
            .unwrap_or_default()
            .to_string();
    }

    if let Some(start) = body.find("```") {
        let after = &body[start + 3..];
        let code_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        if let Some(end) = after[code_start..].find("```") {
            page.example_usage = Some(after[code_start..code_start + end].trim_end().to_string());
        }
    }

    let mut in_arguments = false;
    for line in body.lines() {
        if line.starts_with("## ") {
            in_arguments = line.contains("Argument Reference");
            continue;
        }
        if in_arguments {
            if let Some(rest) = line.trim_start().strip_prefix("* `") {
                if let Some(end) = rest.find('`') {
                    page.arguments.push(rest[..end].to_string());
                }
            }
        }
    }
    page
}

/// Terraform server
pub struct TerraformService {
    runner: Arc<dyn CommandRunner>,
    config: TerraformConfig,
    http: Client,
}

impl TerraformService {
    pub fn new(runner: Arc<dyn CommandRunner>, config: TerraformConfig, timeout_secs: u64) -> Result<Self, ServiceError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(concat!("aws-mcp-servers/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { runner, config, http })
    }

    async fn execute(&self, params: ExecuteParams) -> Result<Value, ServiceError> {
        let args = command_args(&params.command, &params.variables)?;
        require_non_empty("working_directory", &params.working_directory)?;
        if !Path::new(&params.working_directory).is_dir() {
            return Err(ServiceError::invalid(format!(
                "working_directory '{}' does not exist",
                params.working_directory
            )));
        }

        let mut spec = CommandSpec::new(&self.config.binary)
            .args(args)
            .cwd(&params.working_directory)
            .env("TF_IN_AUTOMATION", "1");
        if let Some(region) = &params.aws_region {
            spec = spec.env("AWS_REGION", region);
        }

        info!("Running {} in {}", spec.display(), params.working_directory);
        let clean = |text: String| if params.strip_ansi { strip_ansi(&text) } else { text };
        let mut result = Map::new();
        result.insert("command".into(), json!(format!("terraform {}", params.command)));
        result.insert("working_directory".into(), json!(params.working_directory));

        let output = match self.runner.run(&spec).await {
            Ok(output) => output,
            Err(e) => {
                result.insert("status".into(), json!("error"));
                result.insert("return_code".into(), Value::Null);
                result.insert("stdout".into(), json!(""));
                result.insert("stderr".into(), json!(e.to_string()));
                return Ok(Value::Object(result));
            }
        };

        let success = output.success();
        result.insert("status".into(), json!(if success { "success" } else { "error" }));
        result.insert("return_code".into(), json!(output.exit_code));
        result.insert("stdout".into(), json!(clean(output.stdout)));
        result.insert("stderr".into(), json!(clean(output.stderr)));

        if success && params.command == "apply" {
            if let Some(outputs) = self.collect_outputs(&params.working_directory).await {
                result.insert("outputs".into(), outputs);
            }
        }
        Ok(Value::Object(result))
    }

    /// `terraform output -json`, flattened to name → value
    async fn collect_outputs(&self, working_directory: &str) -> Option<Value> {
        let spec = CommandSpec::new(&self.config.binary)
            .args(["output", "-json"])
            .cwd(working_directory);
        let output = self.runner.run(&spec).await.ok()?;
        if !output.success() {
            debug!("terraform output failed: {}", output.stderr.trim());
            return None;
        }
        let raw: Map<String, Value> = serde_json::from_str(&output.stdout).ok()?;
        Some(Value::Object(
            raw.into_iter()
                .map(|(name, detail)| (name, detail["value"].clone()))
                .collect(),
        ))
    }

    async fn search_module(&self, params: ModuleParams) -> Result<Value, ServiceError> {
        let (namespace, name, provider) = parse_module_url(&params.module_url)?;
        let mut url = format!(
            "{}/v1/modules/{}/{}/{}",
            self.config.registry_url.trim_end_matches('/'),
            namespace,
            name,
            provider
        );
        if let Some(version) = params.version.filter(|v| !v.is_empty()) {
            url.push('/');
            url.push_str(&version);
        }

        debug!("Fetching module {}", url);
        let response = match self.http.get(&url).send().await {
            Ok(response) => response,
            Err(e) => return Ok(error_payload(&ServiceError::Http(e))),
        };
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(error_payload(&ServiceError::NotFound(format!(
                "module {}/{}/{} not found in the registry",
                namespace, name, provider
            ))));
        }
        match response.error_for_status() {
            Ok(response) => match response.json::<Value>().await {
                Ok(module) => Ok(module_summary(&module)),
                Err(e) => Ok(error_payload(&ServiceError::Http(e))),
            },
            Err(e) => Ok(error_payload(&ServiceError::Http(e))),
        }
    }

    async fn fetch_doc(&self, kind_dir: &str, asset: &str) -> Result<Option<String>, ServiceError> {
        let url = format!(
            "{}/{}/{}.html.markdown",
            self.config.provider_docs_url.trim_end_matches('/'),
            kind_dir,
            asset
        );
        debug!("Fetching provider docs {}", url);
        let response = self.http.get(&url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(response.error_for_status()?.text().await?))
    }

    async fn search_docs(&self, params: DocsParams) -> Result<Value, ServiceError> {
        require_non_empty("asset_name", &params.asset_name)?;
        let asset = params.asset_name.trim().trim_start_matches("aws_").to_string();
        let kinds: &[(&str, &str)] = match params.asset_type.as_deref().unwrap_or("resource") {
            "resource" => &[("resource", "r")],
            "data_source" => &[("data_source", "d")],
            "both" => &[("resource", "r"), ("data_source", "d")],
            other => {
                return Err(ServiceError::invalid(format!(
                    "asset_type '{}' must be resource, data_source or both",
                    other
                )));
            }
        };

        let mut results = Vec::new();
        for (kind, dir) in kinds {
            match self.fetch_doc(dir, &asset).await {
                Ok(Some(markdown)) => {
                    let page = parse_doc_page(&markdown);
                    results.push(json!({
                        "asset_name": format!("aws_{}", asset),
                        "asset_type": kind,
                        "url": format!(
                            "https://registry.terraform.io/providers/hashicorp/aws/latest/docs/{}/{}",
                            if *kind == "resource" { "resources" } else { "data-sources" },
                            asset
                        ),
                        "description": page.description,
                        "example_usage": page.example_usage,
                        "arguments": page.arguments,
                    }));
                }
                Ok(None) => debug!("No {} documentation for {}", kind, asset),
                Err(e) => return Ok(error_payload(&e)),
            }
        }

        if results.is_empty() {
            return Ok(error_payload(&ServiceError::NotFound(format!(
                "no AWS provider documentation found for '{}'",
                params.asset_name
            ))));
        }
        Ok(json!({ "success": true, "results": results }))
    }
}

#[async_trait]
impl Service for TerraformService {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Terraform
    }

    fn instructions(&self) -> Option<String> {
        Some(
            "Run Terraform workflows and look up registry modules and AWS provider documentation. \
             Run validate and plan before apply."
                .to_string(),
        )
    }

    fn tools(&self) -> Vec<Tool> {
        vec![
            Tool::new(
                "execute_terraform_command",
                "Run terraform init, plan, validate, apply or destroy in a directory",
                json!({
                    "type": "object",
                    "properties": {
                        "command": { "type": "string", "enum": COMMANDS },
                        "working_directory": { "type": "string" },
                        "variables": { "type": "object", "additionalProperties": { "type": "string" } },
                        "aws_region": { "type": "string" },
                        "strip_ansi": { "type": "boolean", "default": true }
                    },
                    "required": ["command", "working_directory"]
                }),
            ),
            Tool::new(
                "search_user_provided_module",
                "Describe a Terraform Registry module's inputs and outputs",
                json!({
                    "type": "object",
                    "properties": {
                        "module_url": { "type": "string", "description": "namespace/name/provider, e.g. terraform-aws-modules/vpc/aws" },
                        "version": { "type": "string" }
                    },
                    "required": ["module_url"]
                }),
            ),
            Tool::new(
                "search_aws_provider_docs",
                "Fetch AWS provider documentation for a resource or data source",
                json!({
                    "type": "object",
                    "properties": {
                        "asset_name": { "type": "string", "description": "e.g. aws_s3_bucket" },
                        "asset_type": { "type": "string", "enum": ["resource", "data_source", "both"] }
                    },
                    "required": ["asset_name"]
                }),
            ),
        ]
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, ServiceError> {
        match name {
            "execute_terraform_command" => self.execute(parse_args(arguments)?).await,
            "search_user_provided_module" => self.search_module(parse_args(arguments)?).await,
            "search_aws_provider_docs" => self.search_docs(parse_args(arguments)?).await,
            other => Err(ServiceError::UnknownTool(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::command::testing::MockRunner;

    fn service(runner: Arc<MockRunner>) -> TerraformService {
        TerraformService::new(runner, TerraformConfig::default(), 5).unwrap()
    }

    #[test]
    fn test_command_args() {
        let mut vars = BTreeMap::new();
        vars.insert("env".to_string(), "dev".to_string());
        assert_eq!(
            command_args("apply", &vars).unwrap(),
            ["apply", "-no-color", "-auto-approve", "-var", "env=dev"]
        );
        assert_eq!(command_args("init", &vars).unwrap(), ["init", "-no-color"]);
        assert!(command_args("import", &vars).is_err());
    }

    #[test]
    fn test_parse_module_url() {
        let expected = ("terraform-aws-modules".to_string(), "vpc".to_string(), "aws".to_string());
        assert_eq!(parse_module_url("terraform-aws-modules/vpc/aws").unwrap(), expected);
        assert_eq!(
            parse_module_url("registry.terraform.io/terraform-aws-modules/vpc/aws").unwrap(),
            expected
        );
        assert!(parse_module_url("vpc").is_err());
    }

    #[test]
    fn test_parse_doc_page() {
        let markdown = "---\nsubcategory: \"S3\"\ndescription: |-\n  Provides a S3 bucket resource.\n---\n\n# Resource: aws_s3_bucket\n\n## Example Usage\n\n```terraform\nresource \"aws_s3_bucket\" \"b\" {\n  bucket = \"x\"\n}\n```\n\n## Argument Reference\n\n* `bucket` - (Optional) Name.\n* `tags` - (Optional) Tags.\n\n## Attribute Reference\n\n* `arn` - ARN.\n";
        let page = parse_doc_page(markdown);
        assert_eq!(page.description, "Provides a S3 bucket resource.");
        assert!(page.example_usage.unwrap().starts_with("resource \"aws_s3_bucket\""));
        assert_eq!(page.arguments, ["bucket", "tags"]);
    }

    #[test]
    fn test_module_summary() {
        let module = json!({
            "id": "terraform-aws-modules/vpc/aws/5.0.0",
            "version": "5.0.0",
            "root": {
                "inputs": [{"name": "cidr", "type": "string", "required": false, "default": "\"10.0.0.0/16\""}],
                "outputs": [{"name": "vpc_id", "description": "The ID of the VPC"}]
            },
            "submodules": [{"path": "modules/vpc-endpoints"}]
        });
        let summary = module_summary(&module);
        assert_eq!(summary["inputs"][0]["name"], "cidr");
        assert_eq!(summary["outputs"][0]["name"], "vpc_id");
        assert_eq!(summary["submodules"], json!(["modules/vpc-endpoints"]));
    }

    #[tokio::test]
    async fn test_apply_collects_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new());
        runner
            .push_ok("\x1b[32mApply complete!\x1b[0m")
            .push_ok(r#"{"bucket": {"sensitive": false, "type": "string", "value": "my-bucket"}}"#);
        let result = service(runner.clone())
            .call_tool(
                "execute_terraform_command",
                json!({
                    "command": "apply",
                    "working_directory": dir.path().to_str().unwrap(),
                    "variables": {"name": "x"},
                    "aws_region": "eu-west-1"
                }),
            )
            .await
            .unwrap();

        assert_eq!(result["status"], "success");
        assert_eq!(result["stdout"], "Apply complete!");
        assert_eq!(result["outputs"]["bucket"], "my-bucket");
        let calls = runner.calls();
        assert_eq!(calls[0].args, ["apply", "-no-color", "-auto-approve", "-var", "name=x"]);
        assert!(calls[0].env.contains(&("AWS_REGION".to_string(), "eu-west-1".to_string())));
        assert_eq!(calls[1].args, ["output", "-json"]);
    }

    #[tokio::test]
    async fn test_failed_plan_reported_in_band() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new());
        runner.push_err(1, "Error: Invalid reference");
        let result = service(runner.clone())
            .call_tool(
                "execute_terraform_command",
                json!({"command": "plan", "working_directory": dir.path().to_str().unwrap()}),
            )
            .await
            .unwrap();
        assert_eq!(result["status"], "error");
        assert_eq!(result["return_code"], 1);
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_directory_rejected() {
        let err = service(Arc::new(MockRunner::new()))
            .call_tool(
                "execute_terraform_command",
                json!({"command": "init", "working_directory": "/definitely/not/here"}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidParams(_)));
    }
}
