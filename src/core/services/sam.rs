//! AWS SAM CLI
//!
//! Each tool translates typed parameters into `sam` flags. Deploying needs
//! `--allow-write`; reading logs needs `--allow-sensitive-data-access`.

use crate::conversion::arguments::{parse_args, require_non_empty};
use crate::core::command::{CommandRunner, CommandSpec, strip_ansi};
use crate::core::config::SamConfig;
use crate::core::service::{Service, ServiceError, ServiceKind};
use crate::models::mcp::Tool;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Builds and deploys routinely outlast the default subprocess timeout
const LONG_RUNNING: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Deserialize)]
struct InitParams {
    project_name: String,
    project_directory: String,
    #[serde(default)]
    runtime: Option<String>,
    #[serde(default)]
    dependency_manager: Option<String>,
    #[serde(default)]
    application_template: Option<String>,
    #[serde(default)]
    architecture: Option<String>,
    #[serde(default)]
    package_type: Option<String>,
    #[serde(default)]
    base_image: Option<String>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    extra_content: Option<Value>,
    #[serde(default)]
    tracing: Option<bool>,
    #[serde(default)]
    application_insights: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct BuildParams {
    project_directory: String,
    #[serde(default)]
    template_file: Option<String>,
    #[serde(default)]
    build_dir: Option<String>,
    #[serde(default)]
    base_dir: Option<String>,
    #[serde(default)]
    use_container: bool,
    #[serde(default)]
    build_image: Option<String>,
    #[serde(default)]
    container_env_vars: BTreeMap<String, String>,
    #[serde(default)]
    parameter_overrides: Option<String>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    cached: bool,
    #[serde(default)]
    parallel: bool,
    #[serde(default)]
    debug: bool,
}

#[derive(Debug, Deserialize)]
struct DeployParams {
    application_name: String,
    project_directory: String,
    #[serde(default)]
    template_file: Option<String>,
    #[serde(default)]
    s3_bucket: Option<String>,
    #[serde(default)]
    s3_prefix: Option<String>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    profile: Option<String>,
    #[serde(default)]
    parameter_overrides: Option<String>,
    #[serde(default)]
    capabilities: Option<Vec<String>>,
    #[serde(default)]
    tags: BTreeMap<String, String>,
    #[serde(default)]
    config_file: Option<String>,
    #[serde(default)]
    config_env: Option<String>,
    #[serde(default)]
    debug: bool,
}

#[derive(Debug, Deserialize)]
struct LogsParams {
    #[serde(default)]
    resource_name: Option<String>,
    #[serde(default)]
    stack_name: Option<String>,
    #[serde(default)]
    start_time: Option<String>,
    #[serde(default)]
    end_time: Option<String>,
    #[serde(default)]
    filter: Option<String>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    profile: Option<String>,
    #[serde(default)]
    cw_log_group: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct LocalInvokeParams {
    project_directory: String,
    resource_name: String,
    #[serde(default)]
    template_file: Option<String>,
    #[serde(default)]
    event_file: Option<String>,
    #[serde(default)]
    event_data: Option<String>,
    #[serde(default)]
    environment_variables_file: Option<String>,
    #[serde(default)]
    docker_network: Option<String>,
    #[serde(default)]
    container_env_vars: BTreeMap<String, String>,
    #[serde(default)]
    parameter_overrides: Option<String>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    profile: Option<String>,
}

fn flag(args: &mut Vec<String>, name: &str, value: &Option<String>) {
    if let Some(value) = value.as_ref().filter(|v| !v.is_empty()) {
        args.push(name.to_string());
        args.push(value.clone());
    }
}

fn switch(args: &mut Vec<String>, name: &str, on: bool) {
    if on {
        args.push(name.to_string());
    }
}

fn init_args(p: &InitParams) -> Vec<String> {
    let mut args = vec![
        "init".to_string(),
        "--no-interactive".to_string(),
        "--name".to_string(),
        p.project_name.clone(),
        "--output-dir".to_string(),
        p.project_directory.clone(),
    ];
    if p.location.is_some() {
        flag(&mut args, "--location", &p.location);
    } else {
        flag(&mut args, "--runtime", &p.runtime);
        flag(&mut args, "--dependency-manager", &p.dependency_manager);
        let template = Some(
            p.application_template
                .clone()
                .unwrap_or_else(|| "hello-world".to_string()),
        );
        flag(&mut args, "--app-template", &template);
    }
    flag(&mut args, "--architecture", &p.architecture);
    flag(&mut args, "--package-type", &p.package_type);
    flag(&mut args, "--base-image", &p.base_image);
    if let Some(extra) = &p.extra_content {
        args.push("--extra-context".to_string());
        args.push(extra.to_string());
    }
    match p.tracing {
        Some(true) => args.push("--tracing".to_string()),
        Some(false) => args.push("--no-tracing".to_string()),
        None => {}
    }
    match p.application_insights {
        Some(true) => args.push("--application-insights".to_string()),
        Some(false) => args.push("--no-application-insights".to_string()),
        None => {}
    }
    args
}

fn build_args(p: &BuildParams) -> Vec<String> {
    let mut args = vec!["build".to_string()];
    flag(&mut args, "--template-file", &p.template_file);
    flag(&mut args, "--build-dir", &p.build_dir);
    flag(&mut args, "--base-dir", &p.base_dir);
    switch(&mut args, "--use-container", p.use_container);
    flag(&mut args, "--build-image", &p.build_image);
    for (key, value) in &p.container_env_vars {
        args.push("--container-env-var".to_string());
        args.push(format!("{}={}", key, value));
    }
    flag(&mut args, "--parameter-overrides", &p.parameter_overrides);
    flag(&mut args, "--region", &p.region);
    switch(&mut args, "--cached", p.cached);
    switch(&mut args, "--parallel", p.parallel);
    switch(&mut args, "--debug", p.debug);
    args
}

fn deploy_args(p: &DeployParams) -> Vec<String> {
    let mut args = vec![
        "deploy".to_string(),
        "--stack-name".to_string(),
        p.application_name.clone(),
        "--no-confirm-changeset".to_string(),
        "--no-fail-on-empty-changeset".to_string(),
    ];
    flag(&mut args, "--template-file", &p.template_file);
    if p.s3_bucket.is_some() {
        flag(&mut args, "--s3-bucket", &p.s3_bucket);
    } else {
        args.push("--resolve-s3".to_string());
    }
    flag(&mut args, "--s3-prefix", &p.s3_prefix);
    flag(&mut args, "--region", &p.region);
    flag(&mut args, "--profile", &p.profile);
    flag(&mut args, "--parameter-overrides", &p.parameter_overrides);
    args.push("--capabilities".to_string());
    match &p.capabilities {
        Some(caps) if !caps.is_empty() => args.extend(caps.iter().cloned()),
        _ => args.push("CAPABILITY_IAM".to_string()),
    }
    if !p.tags.is_empty() {
        args.push("--tags".to_string());
        args.extend(p.tags.iter().map(|(k, v)| format!("{}={}", k, v)));
    }
    flag(&mut args, "--config-file", &p.config_file);
    flag(&mut args, "--config-env", &p.config_env);
    switch(&mut args, "--debug", p.debug);
    args
}

fn logs_args(p: &LogsParams) -> Vec<String> {
    let mut args = vec!["logs".to_string()];
    flag(&mut args, "--name", &p.resource_name);
    flag(&mut args, "--stack-name", &p.stack_name);
    flag(&mut args, "--start-time", &p.start_time);
    flag(&mut args, "--end-time", &p.end_time);
    flag(&mut args, "--filter", &p.filter);
    flag(&mut args, "--region", &p.region);
    flag(&mut args, "--profile", &p.profile);
    for group in &p.cw_log_group {
        args.push("--cw-log-group".to_string());
        args.push(group.clone());
    }
    args
}

/// Body of the `--container-env-vars` file; `Parameters` applies to every function
fn container_env_document(vars: &BTreeMap<String, String>) -> Value {
    json!({ "Parameters": vars })
}

/// Write JSON to a temp file that lives as long as the returned handle
fn json_temp_file(body: &[u8]) -> Result<tempfile::NamedTempFile, ServiceError> {
    let mut file = tempfile::Builder::new().suffix(".json").tempfile()?;
    file.write_all(body)?;
    file.flush()?;
    Ok(file)
}

fn temp_path(file: &Option<tempfile::NamedTempFile>) -> Option<String> {
    file.as_ref().map(|f| f.path().to_string_lossy().into_owned())
}

fn local_invoke_args(
    p: &LocalInvokeParams,
    event_path: Option<&str>,
    container_env_path: Option<&str>,
) -> Vec<String> {
    let mut args = vec!["local".to_string(), "invoke".to_string(), p.resource_name.clone()];
    flag(&mut args, "--template", &p.template_file);
    if let Some(path) = event_path {
        args.push("--event".to_string());
        args.push(path.to_string());
    }
    flag(&mut args, "--env-vars", &p.environment_variables_file);
    flag(&mut args, "--docker-network", &p.docker_network);
    if let Some(path) = container_env_path {
        args.push("--container-env-vars".to_string());
        args.push(path.to_string());
    }
    flag(&mut args, "--parameter-overrides", &p.parameter_overrides);
    flag(&mut args, "--region", &p.region);
    flag(&mut args, "--profile", &p.profile);
    args
}

/// SAM server
pub struct SamService {
    runner: Arc<dyn CommandRunner>,
    config: SamConfig,
}

impl SamService {
    pub fn new(runner: Arc<dyn CommandRunner>, config: SamConfig) -> Self {
        Self { runner, config }
    }

    /// Run `sam` and wrap the outcome in the in-band result shape
    async fn run(&self, what: &str, args: Vec<String>, cwd: Option<&str>, long: bool) -> Value {
        let mut spec = CommandSpec::new(&self.config.binary)
            .args(args)
            .env("SAM_CLI_TELEMETRY", "0");
        if let Some(dir) = cwd {
            spec = spec.cwd(dir);
        }
        if long {
            spec = spec.timeout(LONG_RUNNING);
        }

        info!("Running {}", spec.display());
        match self.runner.run(&spec).await.and_then(|o| o.check("sam")) {
            Ok(output) => json!({
                "success": true,
                "message": format!("{} completed successfully", what),
                "output": strip_ansi(&output.stdout),
            }),
            Err(e) => json!({
                "success": false,
                "message": format!("{} failed", what),
                "error": strip_ansi(&e.to_string()),
            }),
        }
    }

    async fn init(&self, p: InitParams) -> Result<Value, ServiceError> {
        require_non_empty("project_name", &p.project_name)?;
        require_non_empty("project_directory", &p.project_directory)?;
        if p.location.is_none() && p.runtime.is_none() {
            return Err(ServiceError::invalid("either runtime or location is required"));
        }
        Ok(self.run("sam init", init_args(&p), None, false).await)
    }

    async fn build(&self, p: BuildParams) -> Result<Value, ServiceError> {
        require_non_empty("project_directory", &p.project_directory)?;
        Ok(self
            .run("sam build", build_args(&p), Some(&p.project_directory), true)
            .await)
    }

    async fn deploy(&self, p: DeployParams) -> Result<Value, ServiceError> {
        if !self.config.allow_write {
            return Err(ServiceError::Forbidden(
                "sam_deploy requires the server to be started with --allow-write".to_string(),
            ));
        }
        require_non_empty("application_name", &p.application_name)?;
        require_non_empty("project_directory", &p.project_directory)?;
        Ok(self
            .run("sam deploy", deploy_args(&p), Some(&p.project_directory), true)
            .await)
    }

    async fn logs(&self, p: LogsParams) -> Result<Value, ServiceError> {
        if !self.config.allow_sensitive_data_access {
            return Err(ServiceError::Forbidden(
                "sam_logs requires the server to be started with --allow-sensitive-data-access".to_string(),
            ));
        }
        if p.resource_name.is_none() && p.stack_name.is_none() && p.cw_log_group.is_empty() {
            return Err(ServiceError::invalid(
                "one of resource_name, stack_name or cw_log_group is required",
            ));
        }
        Ok(self.run("sam logs", logs_args(&p), None, false).await)
    }

    async fn local_invoke(&self, p: LocalInvokeParams) -> Result<Value, ServiceError> {
        require_non_empty("project_directory", &p.project_directory)?;
        require_non_empty("resource_name", &p.resource_name)?;
        if p.event_file.is_some() && p.event_data.is_some() {
            return Err(ServiceError::invalid("pass either event_file or event_data, not both"));
        }

        // Temp files are kept alive until the command finishes
        let event_temp = match &p.event_data {
            Some(data) => {
                serde_json::from_str::<Value>(data)
                    .map_err(|e| ServiceError::invalid(format!("event_data is not valid JSON: {}", e)))?;
                Some(json_temp_file(data.as_bytes())?)
            }
            None => None,
        };
        let event_path = temp_path(&event_temp).or_else(|| p.event_file.clone());

        let env_temp = if p.container_env_vars.is_empty() {
            None
        } else {
            let body = serde_json::to_vec(&container_env_document(&p.container_env_vars))?;
            Some(json_temp_file(&body)?)
        };
        let env_path = temp_path(&env_temp);

        let args = local_invoke_args(&p, event_path.as_deref(), env_path.as_deref());
        Ok(self
            .run("sam local invoke", args, Some(&p.project_directory), true)
            .await)
    }
}

#[async_trait]
impl Service for SamService {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Sam
    }

    fn instructions(&self) -> Option<String> {
        let mut text = String::from(
            "Create, build, test and deploy serverless applications with the AWS SAM CLI.",
        );
        if !self.config.allow_write {
            text.push_str(" Deployment is disabled; restart with --allow-write to enable it.");
        }
        if !self.config.allow_sensitive_data_access {
            text.push_str(" Log access is disabled; restart with --allow-sensitive-data-access to enable it.");
        }
        Some(text)
    }

    fn tools(&self) -> Vec<Tool> {
        vec![
            Tool::new(
                "sam_init",
                "Initialize a serverless application from a SAM template",
                json!({
                    "type": "object",
                    "properties": {
                        "project_name": { "type": "string" },
                        "project_directory": { "type": "string", "description": "Absolute directory to create the project in" },
                        "runtime": { "type": "string", "description": "e.g. python3.13, nodejs22.x" },
                        "dependency_manager": { "type": "string", "description": "e.g. pip, npm, maven" },
                        "application_template": { "type": "string", "default": "hello-world" },
                        "architecture": { "type": "string", "enum": ["x86_64", "arm64"] },
                        "package_type": { "type": "string", "enum": ["Zip", "Image"] },
                        "base_image": { "type": "string" },
                        "location": { "type": "string", "description": "Template location (git, zip, path)" },
                        "extra_content": { "type": "object" },
                        "tracing": { "type": "boolean" },
                        "application_insights": { "type": "boolean" }
                    },
                    "required": ["project_name", "project_directory"]
                }),
            ),
            Tool::new(
                "sam_build",
                "Build a serverless application",
                json!({
                    "type": "object",
                    "properties": {
                        "project_directory": { "type": "string" },
                        "template_file": { "type": "string" },
                        "build_dir": { "type": "string" },
                        "base_dir": { "type": "string" },
                        "use_container": { "type": "boolean" },
                        "build_image": { "type": "string" },
                        "container_env_vars": { "type": "object", "additionalProperties": { "type": "string" } },
                        "parameter_overrides": { "type": "string" },
                        "region": { "type": "string" },
                        "cached": { "type": "boolean" },
                        "parallel": { "type": "boolean" },
                        "debug": { "type": "boolean" }
                    },
                    "required": ["project_directory"]
                }),
            ),
            Tool::new(
                "sam_deploy",
                "Deploy a serverless application with CloudFormation",
                json!({
                    "type": "object",
                    "properties": {
                        "application_name": { "type": "string", "description": "Stack name" },
                        "project_directory": { "type": "string" },
                        "template_file": { "type": "string" },
                        "s3_bucket": { "type": "string" },
                        "s3_prefix": { "type": "string" },
                        "region": { "type": "string" },
                        "profile": { "type": "string" },
                        "parameter_overrides": { "type": "string" },
                        "capabilities": { "type": "array", "items": { "type": "string" } },
                        "tags": { "type": "object", "additionalProperties": { "type": "string" } },
                        "config_file": { "type": "string" },
                        "config_env": { "type": "string" },
                        "debug": { "type": "boolean" }
                    },
                    "required": ["application_name", "project_directory"]
                }),
            ),
            Tool::new(
                "sam_logs",
                "Fetch logs of a deployed serverless application",
                json!({
                    "type": "object",
                    "properties": {
                        "resource_name": { "type": "string" },
                        "stack_name": { "type": "string" },
                        "start_time": { "type": "string" },
                        "end_time": { "type": "string" },
                        "filter": { "type": "string" },
                        "region": { "type": "string" },
                        "profile": { "type": "string" },
                        "cw_log_group": { "type": "array", "items": { "type": "string" } }
                    }
                }),
            ),
            Tool::new(
                "sam_local_invoke",
                "Invoke a function locally in a container",
                json!({
                    "type": "object",
                    "properties": {
                        "project_directory": { "type": "string" },
                        "resource_name": { "type": "string" },
                        "template_file": { "type": "string" },
                        "event_file": { "type": "string" },
                        "event_data": { "type": "string", "description": "Inline JSON event" },
                        "environment_variables_file": { "type": "string" },
                        "docker_network": { "type": "string" },
                        "container_env_vars": {
                            "type": "object",
                            "additionalProperties": { "type": "string" },
                            "description": "Written to a JSON file passed as --container-env-vars"
                        },
                        "parameter_overrides": { "type": "string" },
                        "region": { "type": "string" },
                        "profile": { "type": "string" }
                    },
                    "required": ["project_directory", "resource_name"]
                }),
            ),
        ]
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, ServiceError> {
        match name {
            "sam_init" => self.init(parse_args(arguments)?).await,
            "sam_build" => self.build(parse_args(arguments)?).await,
            "sam_deploy" => self.deploy(parse_args(arguments)?).await,
            "sam_logs" => self.logs(parse_args(arguments)?).await,
            "sam_local_invoke" => self.local_invoke(parse_args(arguments)?).await,
            other => Err(ServiceError::UnknownTool(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::command::testing::MockRunner;

    fn service(runner: Arc<MockRunner>, allow_write: bool, sensitive: bool) -> SamService {
        SamService::new(
            runner,
            SamConfig {
                allow_write,
                allow_sensitive_data_access: sensitive,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_init_args() {
        let runner = Arc::new(MockRunner::new());
        runner.push_ok("created");
        let result = service(runner.clone(), false, false)
            .call_tool(
                "sam_init",
                json!({
                    "project_name": "app",
                    "project_directory": "/tmp/work",
                    "runtime": "python3.13",
                    "dependency_manager": "pip",
                    "architecture": "arm64"
                }),
            )
            .await
            .unwrap();
        assert_eq!(result["success"], true);
        assert_eq!(
            runner.args(0),
            [
                "init", "--no-interactive", "--name", "app", "--output-dir", "/tmp/work",
                "--runtime", "python3.13", "--dependency-manager", "pip",
                "--app-template", "hello-world", "--architecture", "arm64"
            ]
        );
    }

    #[tokio::test]
    async fn test_build_runs_in_project_directory() {
        let runner = Arc::new(MockRunner::new());
        runner.push_ok("Build Succeeded");
        service(runner.clone(), false, false)
            .call_tool(
                "sam_build",
                json!({"project_directory": "/tmp/app", "use_container": true, "container_env_vars": {"A": "1"}}),
            )
            .await
            .unwrap();
        let call = &runner.calls()[0];
        assert_eq!(call.cwd.as_deref(), Some(std::path::Path::new("/tmp/app")));
        assert_eq!(call.args, ["build", "--use-container", "--container-env-var", "A=1"]);
        assert_eq!(call.timeout, Some(LONG_RUNNING));
    }

    #[tokio::test]
    async fn test_deploy_requires_allow_write() {
        let runner = Arc::new(MockRunner::new());
        let err = service(runner.clone(), false, false)
            .call_tool("sam_deploy", json!({"application_name": "s", "project_directory": "/tmp/app"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_deploy_args() {
        let runner = Arc::new(MockRunner::new());
        runner.push_ok("Successfully created/updated stack");
        service(runner.clone(), true, false)
            .call_tool(
                "sam_deploy",
                json!({"application_name": "stack", "project_directory": "/tmp/app", "tags": {"team": "x"}}),
            )
            .await
            .unwrap();
        assert_eq!(
            runner.args(0),
            [
                "deploy", "--stack-name", "stack", "--no-confirm-changeset",
                "--no-fail-on-empty-changeset", "--resolve-s3", "--capabilities",
                "CAPABILITY_IAM", "--tags", "team=x"
            ]
        );
    }

    #[tokio::test]
    async fn test_logs_requires_sensitive_access() {
        let runner = Arc::new(MockRunner::new());
        let err = service(runner.clone(), true, false)
            .call_tool("sam_logs", json!({"stack_name": "s"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));

        runner.push_ok("log line");
        let result = service(runner.clone(), true, true)
            .call_tool("sam_logs", json!({"stack_name": "s", "resource_name": "Fn"}))
            .await
            .unwrap();
        assert_eq!(result["output"], "log line");
        assert_eq!(runner.args(0), ["logs", "--name", "Fn", "--stack-name", "s"]);
    }

    #[tokio::test]
    async fn test_local_invoke_writes_event_file() {
        let runner = Arc::new(MockRunner::new());
        runner.push_ok(r#"{"statusCode": 200}"#);
        let result = service(runner.clone(), false, false)
            .call_tool(
                "sam_local_invoke",
                json!({"project_directory": "/tmp/app", "resource_name": "Fn", "event_data": "{\"k\": 1}"}),
            )
            .await
            .unwrap();
        assert_eq!(result["success"], true);
        let args = runner.args(0);
        assert_eq!(&args[..3], ["local", "invoke", "Fn"]);
        assert_eq!(args[3], "--event");
        assert!(args[4].ends_with(".json"));
        // removed once the call returns
        assert!(!std::path::Path::new(&args[4]).exists());
    }

    #[test]
    fn test_container_env_document() {
        let vars = BTreeMap::from([("A".to_string(), "1".to_string())]);
        assert_eq!(container_env_document(&vars), json!({"Parameters": {"A": "1"}}));
    }

    #[tokio::test]
    async fn test_local_invoke_passes_container_env_file() {
        let runner = Arc::new(MockRunner::new());
        runner.push_ok("{}");
        service(runner.clone(), false, false)
            .call_tool(
                "sam_local_invoke",
                json!({"project_directory": "/tmp/app", "resource_name": "Fn", "container_env_vars": {"A": "1"}}),
            )
            .await
            .unwrap();
        let args = runner.args(0);
        let at = args.iter().position(|a| a == "--container-env-vars").unwrap();
        assert!(args[at + 1].ends_with(".json"));
        assert!(!args.iter().any(|a| a == "A=1"));
    }

    #[tokio::test]
    async fn test_failure_reported_in_band() {
        let runner = Arc::new(MockRunner::new());
        runner.push_err(1, "Error: Template file not found");
        let result = service(runner, false, false)
            .call_tool("sam_build", json!({"project_directory": "/tmp/app"}))
            .await
            .unwrap();
        assert_eq!(result["success"], false);
        assert!(result["error"].as_str().unwrap().contains("Template file not found"));
    }

    #[tokio::test]
    async fn test_invalid_event_data() {
        let err = service(Arc::new(MockRunner::new()), false, false)
            .call_tool(
                "sam_local_invoke",
                json!({"project_directory": "/tmp/app", "resource_name": "Fn", "event_data": "not json"}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidParams(_)));
    }
}
