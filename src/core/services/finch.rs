//! Container image builds with Finch, pushed to Amazon ECR

use crate::conversion::arguments::{parse_args, require_non_empty};
use crate::core::aws_cli::{AwsCli, CallOptions};
use crate::core::command::{CommandRunner, CommandSpec, strip_ansi};
use crate::core::config::FinchConfig;
use crate::core::service::{Service, ServiceError, ServiceKind};
use crate::models::mcp::Tool;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info};

const BUILD_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// State reported by `finch vm status`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Running,
    Stopped,
    Nonexistent,
    Unknown,
}

impl VmState {
    pub fn parse(output: &str) -> Self {
        let text = output.to_lowercase();
        if text.contains("nonexistent") {
            VmState::Nonexistent
        } else if text.contains("stopped") {
            VmState::Stopped
        } else if text.contains("running") {
            VmState::Running
        } else {
            VmState::Unknown
        }
    }
}

/// Registry host and region of an ECR image reference
pub fn ecr_registry(image: &str) -> Option<(String, String)> {
    static ECR: OnceLock<Regex> = OnceLock::new();
    let re = ECR.get_or_init(|| {
        Regex::new(r"^(\d{12}\.dkr\.ecr\.([a-z0-9-]+)\.amazonaws\.com(?:\.cn)?)/")
            .expect("valid ECR regex")
    });
    let caps = re.captures(image)?;
    Some((caps[1].to_string(), caps[2].to_string()))
}

/// Decode an ECR authorization token into its password
pub fn decode_auth_token(token: &str) -> Result<String, ServiceError> {
    let bytes = STANDARD
        .decode(token.trim())
        .map_err(|e| ServiceError::Unexpected(format!("invalid ECR token: {}", e)))?;
    let decoded = String::from_utf8(bytes)
        .map_err(|_| ServiceError::Unexpected("ECR token is not UTF-8".to_string()))?;
    decoded
        .strip_prefix("AWS:")
        .map(String::from)
        .ok_or_else(|| ServiceError::Unexpected("ECR token has no AWS user".to_string()))
}

#[derive(Debug, Deserialize)]
struct BuildParams {
    dockerfile_path: String,
    context_path: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    platforms: Vec<String>,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    no_cache: bool,
    #[serde(default)]
    pull: bool,
    #[serde(default)]
    build_args: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct PushParams {
    image: String,
}

#[derive(Debug, Deserialize)]
struct CreateRepoParams {
    app_name: String,
    #[serde(default)]
    region: Option<String>,
}

fn build_args(p: &BuildParams) -> Vec<String> {
    let mut args = vec!["build".to_string(), "-f".to_string(), p.dockerfile_path.clone()];
    for tag in &p.tags {
        args.push("-t".to_string());
        args.push(tag.clone());
    }
    if !p.platforms.is_empty() {
        args.push("--platform".to_string());
        args.push(p.platforms.join(","));
    }
    if let Some(target) = &p.target {
        args.push("--target".to_string());
        args.push(target.clone());
    }
    if p.no_cache {
        args.push("--no-cache".to_string());
    }
    if p.pull {
        args.push("--pull".to_string());
    }
    for (key, value) in &p.build_args {
        args.push("--build-arg".to_string());
        args.push(format!("{}={}", key, value));
    }
    args.push(p.context_path.clone());
    args
}

fn success(message: impl Into<String>, stdout: Option<String>) -> Value {
    let mut result = json!({ "status": "success", "message": message.into() });
    if let Some(stdout) = stdout {
        result["stdout"] = json!(strip_ansi(&stdout));
    }
    result
}

fn failure(message: impl Into<String>) -> Value {
    json!({ "status": "error", "message": strip_ansi(&message.into()) })
}

/// Finch server
pub struct FinchService {
    runner: Arc<dyn CommandRunner>,
    aws: AwsCli,
    binary: String,
    /// Linux runs containerd natively, so there is no VM to manage
    manage_vm: bool,
}

impl FinchService {
    pub fn new(runner: Arc<dyn CommandRunner>, aws: AwsCli, config: &FinchConfig) -> Self {
        Self {
            runner,
            aws,
            binary: config.binary.clone(),
            manage_vm: !cfg!(target_os = "linux"),
        }
    }

    async fn finch(&self, spec: CommandSpec) -> Result<String, ServiceError> {
        info!("Running {}", spec.display());
        let output = self.runner.run(&spec).await?.check("finch")?;
        Ok(output.stdout)
    }

    /// Make sure the Finch VM is running
    async fn ensure_vm(&self) -> Result<(), ServiceError> {
        if !self.manage_vm {
            return Ok(());
        }
        let status = self
            .runner
            .run(&CommandSpec::new(&self.binary).args(["vm", "status"]))
            .await?;
        let state = VmState::parse(&format!("{}\n{}", status.stdout, status.stderr));
        debug!("Finch VM state: {:?}", state);
        match state {
            VmState::Running => Ok(()),
            VmState::Stopped => {
                self.finch(CommandSpec::new(&self.binary).args(["vm", "start"]).timeout(BUILD_TIMEOUT))
                    .await?;
                Ok(())
            }
            VmState::Nonexistent => {
                self.finch(CommandSpec::new(&self.binary).args(["vm", "init"]).timeout(BUILD_TIMEOUT))
                    .await?;
                Ok(())
            }
            VmState::Unknown => Err(ServiceError::Unexpected(format!(
                "could not determine Finch VM state: {}",
                status.stdout.trim()
            ))),
        }
    }

    async fn ecr_login(&self, registry: &str, region: &str) -> Result<(), ServiceError> {
        let response = self
            .aws
            .call(
                &CallOptions::region(Some(region.to_string())),
                "ecr",
                "get-authorization-token",
                json!({}),
            )
            .await?;
        let token = response["authorizationData"][0]["authorizationToken"]
            .as_str()
            .ok_or_else(|| ServiceError::Unexpected("no ECR authorization token returned".to_string()))?;
        let password = decode_auth_token(token)?;

        self.finch(
            CommandSpec::new(&self.binary)
                .args(["login", "--username", "AWS", "--password-stdin", registry])
                .stdin(password),
        )
        .await?;
        Ok(())
    }

    async fn build(&self, p: BuildParams) -> Result<Value, ServiceError> {
        require_non_empty("dockerfile_path", &p.dockerfile_path)?;
        require_non_empty("context_path", &p.context_path)?;
        if let Err(e) = self.ensure_vm().await {
            return Ok(failure(e.to_string()));
        }
        let spec = CommandSpec::new(&self.binary)
            .args(build_args(&p))
            .timeout(BUILD_TIMEOUT);
        Ok(match self.finch(spec).await {
            Ok(stdout) => success(format!("Built image from {}", p.dockerfile_path), Some(stdout)),
            Err(e) => failure(e.to_string()),
        })
    }

    async fn push(&self, p: PushParams) -> Result<Value, ServiceError> {
        require_non_empty("image", &p.image)?;
        if let Err(e) = self.ensure_vm().await {
            return Ok(failure(e.to_string()));
        }
        if let Some((registry, region)) = ecr_registry(&p.image) {
            if let Err(e) = self.ecr_login(&registry, &region).await {
                return Ok(failure(format!("ECR login failed: {}", e)));
            }
        }
        let spec = CommandSpec::new(&self.binary)
            .args(["push", p.image.as_str()])
            .timeout(BUILD_TIMEOUT);
        Ok(match self.finch(spec).await {
            Ok(stdout) => success(format!("Pushed {}", p.image), Some(stdout)),
            Err(e) => failure(e.to_string()),
        })
    }

    async fn create_ecr_repo(&self, p: CreateRepoParams) -> Result<Value, ServiceError> {
        require_non_empty("app_name", &p.app_name)?;
        let options = CallOptions::region(p.region);

        let existing = self
            .aws
            .call(
                &options,
                "ecr",
                "describe-repositories",
                json!({ "repositoryNames": [p.app_name] }),
            )
            .await;
        match existing {
            Ok(response) => {
                let uri = &response["repositories"][0]["repositoryUri"];
                let mut result = success(format!("Repository {} already exists", p.app_name), None);
                result["repository_uri"] = uri.clone();
                result["exists"] = json!(true);
                return Ok(result);
            }
            Err(ServiceError::Aws { code, .. }) if code == "RepositoryNotFoundException" => {}
            Err(e) => return Ok(failure(e.to_string())),
        }

        let created = self
            .aws
            .call(
                &options,
                "ecr",
                "create-repository",
                json!({
                    "repositoryName": p.app_name,
                    "imageScanningConfiguration": { "scanOnPush": true },
                    "imageTagMutability": "IMMUTABLE",
                }),
            )
            .await;
        Ok(match created {
            Ok(response) => {
                let mut result = success(format!("Created repository {}", p.app_name), None);
                result["repository_uri"] = response["repository"]["repositoryUri"].clone();
                result["exists"] = json!(false);
                result
            }
            Err(e) => failure(e.to_string()),
        })
    }
}

#[async_trait]
impl Service for FinchService {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Finch
    }

    fn instructions(&self) -> Option<String> {
        Some(
            "Build container images with Finch and push them to Amazon ECR. The Finch VM is \
             started on demand."
                .to_string(),
        )
    }

    fn tools(&self) -> Vec<Tool> {
        vec![
            Tool::new(
                "finch_build_container_image",
                "Build a container image from a Dockerfile",
                json!({
                    "type": "object",
                    "properties": {
                        "dockerfile_path": { "type": "string" },
                        "context_path": { "type": "string" },
                        "tags": { "type": "array", "items": { "type": "string" } },
                        "platforms": { "type": "array", "items": { "type": "string" } },
                        "target": { "type": "string" },
                        "no_cache": { "type": "boolean" },
                        "pull": { "type": "boolean" },
                        "build_args": { "type": "object", "additionalProperties": { "type": "string" } }
                    },
                    "required": ["dockerfile_path", "context_path"]
                }),
            ),
            Tool::new(
                "finch_push_image",
                "Push an image; ECR registries are logged into automatically",
                json!({
                    "type": "object",
                    "properties": { "image": { "type": "string" } },
                    "required": ["image"]
                }),
            ),
            Tool::new(
                "finch_create_ecr_repo",
                "Create an ECR repository unless it already exists",
                json!({
                    "type": "object",
                    "properties": {
                        "app_name": { "type": "string" },
                        "region": { "type": "string" }
                    },
                    "required": ["app_name"]
                }),
            ),
        ]
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, ServiceError> {
        match name {
            "finch_build_container_image" => self.build(parse_args(arguments)?).await,
            "finch_push_image" => self.push(parse_args(arguments)?).await,
            "finch_create_ecr_repo" => self.create_ecr_repo(parse_args(arguments)?).await,
            other => Err(ServiceError::UnknownTool(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::command::testing::MockRunner;
    use crate::core::config::AwsConfig;

    fn service(runner: Arc<MockRunner>, manage_vm: bool) -> FinchService {
        let mut svc = FinchService::new(
            runner.clone(),
            AwsCli::new(runner, &AwsConfig::default()),
            &FinchConfig::default(),
        );
        svc.manage_vm = manage_vm;
        svc
    }

    #[test]
    fn test_vm_state_parse() {
        assert_eq!(VmState::parse("Running"), VmState::Running);
        assert_eq!(VmState::parse("Stopped\n"), VmState::Stopped);
        assert_eq!(VmState::parse("Error: Nonexistent"), VmState::Nonexistent);
        assert_eq!(VmState::parse("???"), VmState::Unknown);
    }

    #[test]
    fn test_ecr_registry() {
        assert_eq!(
            ecr_registry("123456789012.dkr.ecr.eu-west-1.amazonaws.com/app:1"),
            Some((
                "123456789012.dkr.ecr.eu-west-1.amazonaws.com".to_string(),
                "eu-west-1".to_string()
            ))
        );
        assert_eq!(ecr_registry("docker.io/library/nginx"), None);
    }

    #[test]
    fn test_decode_auth_token() {
        let token = STANDARD.encode("AWS:secret");
        assert_eq!(decode_auth_token(&token).unwrap(), "secret");
        assert!(decode_auth_token(&STANDARD.encode("nobody")).is_err());
    }

    #[tokio::test]
    async fn test_build_starts_stopped_vm() {
        let runner = Arc::new(MockRunner::new());
        runner.push_ok("Stopped").push_ok("").push_ok("built");
        let result = service(runner.clone(), true)
            .call_tool(
                "finch_build_container_image",
                json!({
                    "dockerfile_path": "Dockerfile",
                    "context_path": ".",
                    "tags": ["app:1"],
                    "platforms": ["linux/amd64", "linux/arm64"],
                    "build_args": {"V": "1"}
                }),
            )
            .await
            .unwrap();
        assert_eq!(result["status"], "success");
        assert_eq!(runner.args(1), ["vm", "start"]);
        assert_eq!(
            runner.args(2),
            [
                "build", "-f", "Dockerfile", "-t", "app:1", "--platform",
                "linux/amd64,linux/arm64", "--build-arg", "V=1", "."
            ]
        );
    }

    #[tokio::test]
    async fn test_nonexistent_vm_is_initialized() {
        let runner = Arc::new(MockRunner::new());
        runner.push_err(1, "Nonexistent").push_ok("").push_ok("");
        service(runner.clone(), true)
            .call_tool("finch_push_image", json!({"image": "docker.io/me/app:1"}))
            .await
            .unwrap();
        assert_eq!(runner.args(1), ["vm", "init"]);
        assert_eq!(runner.args(2), ["push", "docker.io/me/app:1"]);
    }

    #[tokio::test]
    async fn test_push_to_ecr_logs_in() {
        let runner = Arc::new(MockRunner::new());
        let token = STANDARD.encode("AWS:pw");
        runner
            .push_ok(&format!(r#"{{"authorizationData": [{{"authorizationToken": "{}"}}]}}"#, token))
            .push_ok("Login Succeeded")
            .push_ok("pushed");
        let image = "123456789012.dkr.ecr.us-west-2.amazonaws.com/app:1";
        let result = service(runner.clone(), false)
            .call_tool("finch_push_image", json!({ "image": image }))
            .await
            .unwrap();
        assert_eq!(result["status"], "success");

        let calls = runner.calls();
        assert_eq!(&calls[0].args[..2], ["ecr", "get-authorization-token"]);
        assert_eq!(calls[1].stdin.as_deref(), Some("pw"));
        assert_eq!(calls[1].args.last().unwrap(), "123456789012.dkr.ecr.us-west-2.amazonaws.com");
        assert_eq!(calls[2].args, ["push", image]);
    }

    #[tokio::test]
    async fn test_create_repo_when_missing() {
        let runner = Arc::new(MockRunner::new());
        runner
            .push_err(
                254,
                "An error occurred (RepositoryNotFoundException) when calling the DescribeRepositories operation: not found",
            )
            .push_ok(r#"{"repository": {"repositoryUri": "123.dkr.ecr.us-east-1.amazonaws.com/app"}}"#);
        let result = service(runner.clone(), false)
            .call_tool("finch_create_ecr_repo", json!({"app_name": "app"}))
            .await
            .unwrap();
        assert_eq!(result["exists"], false);
        assert_eq!(result["repository_uri"], "123.dkr.ecr.us-east-1.amazonaws.com/app");
        assert_eq!(&runner.args(1)[..2], ["ecr", "create-repository"]);
    }

    #[tokio::test]
    async fn test_build_failure_is_in_band() {
        let runner = Arc::new(MockRunner::new());
        runner.push_err(1, "failed to solve: Dockerfile not found");
        let result = service(runner, false)
            .call_tool(
                "finch_build_container_image",
                json!({"dockerfile_path": "Dockerfile", "context_path": "."}),
            )
            .await
            .unwrap();
        assert_eq!(result["status"], "error");
        assert!(result["message"].as_str().unwrap().contains("Dockerfile not found"));
        assert!(result.get("stdout").is_none());
    }
}
