//! CloudFormation resources through Cloud Control
//!
//! CRUD over any CloudFormation resource type via `aws cloudcontrol`, plus
//! schema lookup backed by the [`SchemaCache`].

use crate::conversion::arguments::{parse_args, require_non_empty};
use crate::core::aws_cli::{AwsCli, CallOptions, Pagination};
use crate::core::schema_cache::{SchemaCache, validate_type_name};
use crate::core::service::{Service, ServiceError, ServiceKind};
use crate::models::mcp::{Resource, ResourceContent, ResourceReadResult, Tool};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

const SCHEMA_URI_PREFIX: &str = "cfn://schemas/";
const PATCH_OPERATIONS: &[&str] = &["add", "remove", "replace", "move", "copy", "test"];

#[derive(Debug, Deserialize)]
struct SchemaParams {
    resource_type: String,
    #[serde(default)]
    region: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListParams {
    resource_type: String,
    #[serde(default)]
    region: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResourceParams {
    resource_type: String,
    identifier: String,
    #[serde(default)]
    region: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateParams {
    resource_type: String,
    properties: Value,
    #[serde(default)]
    region: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpdateParams {
    resource_type: String,
    identifier: String,
    patch_document: Vec<Value>,
    #[serde(default)]
    region: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusParams {
    request_token: String,
    #[serde(default)]
    region: Option<String>,
}

/// Parse the JSON-encoded `Properties` string Cloud Control returns
fn parse_properties(raw: Option<&Value>) -> Value {
    match raw {
        Some(Value::String(text)) => serde_json::from_str(text).unwrap_or_else(|_| json!(text)),
        Some(other) => other.clone(),
        None => Value::Null,
    }
}

/// Flatten a `ProgressEvent` response into snake_case fields
fn progress_event(response: &Value) -> Value {
    let event = &response["ProgressEvent"];
    json!({
        "status": event["OperationStatus"],
        "operation": event["Operation"],
        "resource_type": event["TypeName"],
        "identifier": event["Identifier"],
        "request_token": event["RequestToken"],
        "status_message": event["StatusMessage"],
        "error_code": event["ErrorCode"],
        "retry_after": event["RetryAfter"],
        "resource_info": parse_properties(event.get("ResourceModel")),
    })
}

/// Check an RFC 6902 patch document
fn validate_patch(patch: &[Value]) -> Result<(), ServiceError> {
    if patch.is_empty() {
        return Err(ServiceError::invalid("patch_document must contain at least one operation"));
    }
    for (i, op) in patch.iter().enumerate() {
        let name = op.get("op").and_then(Value::as_str).unwrap_or_default();
        if !PATCH_OPERATIONS.contains(&name) {
            return Err(ServiceError::invalid(format!(
                "patch operation {} has invalid op '{}'; expected one of {}",
                i,
                name,
                PATCH_OPERATIONS.join(", ")
            )));
        }
        let path = op.get("path").and_then(Value::as_str).unwrap_or_default();
        if !path.starts_with('/') {
            return Err(ServiceError::invalid(format!(
                "patch operation {} needs a JSON pointer path starting with '/'",
                i
            )));
        }
        if matches!(name, "add" | "replace" | "test") && op.get("value").is_none() {
            return Err(ServiceError::invalid(format!("patch operation {} ('{}') needs a value", i, name)));
        }
        if matches!(name, "move" | "copy") && op.get("from").and_then(Value::as_str).is_none() {
            return Err(ServiceError::invalid(format!("patch operation {} ('{}') needs 'from'", i, name)));
        }
    }
    Ok(())
}

/// CloudFormation / Cloud Control server
pub struct CloudFormationService {
    aws: AwsCli,
    schemas: SchemaCache,
    readonly: bool,
}

impl CloudFormationService {
    pub fn new(aws: AwsCli, schemas: SchemaCache, readonly: bool) -> Self {
        Self { aws, schemas, readonly }
    }

    fn ensure_writable(&self, action: &str) -> Result<(), ServiceError> {
        if self.readonly {
            Err(ServiceError::Forbidden(format!(
                "{} is not allowed: the server is running in read-only mode",
                action
            )))
        } else {
            Ok(())
        }
    }

    async fn get_schema_information(&self, params: SchemaParams) -> Result<Value, ServiceError> {
        self.schemas
            .get_schema(&params.resource_type, params.region.as_deref())
            .await
    }

    async fn list_resources_of_type(&self, params: ListParams) -> Result<Value, ServiceError> {
        validate_type_name(&params.resource_type)?;
        let items = self
            .aws
            .paginate(
                &CallOptions::region(params.region),
                "cloudcontrol",
                "list-resources",
                json!({ "TypeName": params.resource_type }),
                Pagination::next_token("ResourceDescriptions", None),
            )
            .await?;
        let identifiers: Vec<Value> = items.iter().map(|item| item["Identifier"].clone()).collect();
        Ok(json!(identifiers))
    }

    async fn get_resource(&self, params: ResourceParams) -> Result<Value, ServiceError> {
        validate_type_name(&params.resource_type)?;
        require_non_empty("identifier", &params.identifier)?;
        let response = self
            .aws
            .call(
                &CallOptions::region(params.region),
                "cloudcontrol",
                "get-resource",
                json!({ "TypeName": params.resource_type, "Identifier": params.identifier }),
            )
            .await?;
        let description = &response["ResourceDescription"];
        Ok(json!({
            "identifier": description["Identifier"],
            "properties": parse_properties(description.get("Properties")),
        }))
    }

    async fn create_resource(&self, params: CreateParams) -> Result<Value, ServiceError> {
        self.ensure_writable("create_resource")?;
        validate_type_name(&params.resource_type)?;
        if !params.properties.is_object() {
            return Err(ServiceError::invalid("properties must be an object"));
        }
        info!("Creating {}", params.resource_type);
        let response = self
            .aws
            .call(
                &CallOptions::region(params.region),
                "cloudcontrol",
                "create-resource",
                json!({
                    "TypeName": params.resource_type,
                    "DesiredState": serde_json::to_string(&params.properties)?,
                }),
            )
            .await?;
        Ok(progress_event(&response))
    }

    async fn update_resource(&self, params: UpdateParams) -> Result<Value, ServiceError> {
        self.ensure_writable("update_resource")?;
        validate_type_name(&params.resource_type)?;
        require_non_empty("identifier", &params.identifier)?;
        validate_patch(&params.patch_document)?;
        info!("Updating {} {}", params.resource_type, params.identifier);
        let response = self
            .aws
            .call(
                &CallOptions::region(params.region),
                "cloudcontrol",
                "update-resource",
                json!({
                    "TypeName": params.resource_type,
                    "Identifier": params.identifier,
                    "PatchDocument": serde_json::to_string(&params.patch_document)?,
                }),
            )
            .await?;
        Ok(progress_event(&response))
    }

    async fn delete_resource(&self, params: ResourceParams) -> Result<Value, ServiceError> {
        self.ensure_writable("delete_resource")?;
        validate_type_name(&params.resource_type)?;
        require_non_empty("identifier", &params.identifier)?;
        info!("Deleting {} {}", params.resource_type, params.identifier);
        let response = self
            .aws
            .call(
                &CallOptions::region(params.region),
                "cloudcontrol",
                "delete-resource",
                json!({ "TypeName": params.resource_type, "Identifier": params.identifier }),
            )
            .await?;
        Ok(progress_event(&response))
    }

    async fn get_request_status(&self, params: StatusParams) -> Result<Value, ServiceError> {
        require_non_empty("request_token", &params.request_token)?;
        let response = self
            .aws
            .call(
                &CallOptions::region(params.region),
                "cloudcontrol",
                "get-resource-request-status",
                json!({ "RequestToken": params.request_token }),
            )
            .await?;
        Ok(progress_event(&response))
    }
}

fn region_schema() -> Value {
    json!({ "type": "string", "description": "AWS region; defaults to the configured region" })
}

fn type_schema() -> Value {
    json!({ "type": "string", "description": "Resource type, e.g. AWS::S3::Bucket" })
}

#[async_trait]
impl Service for CloudFormationService {
    fn kind(&self) -> ServiceKind {
        ServiceKind::CloudFormation
    }

    fn instructions(&self) -> Option<String> {
        let mode = if self.readonly { " The server is read-only." } else { "" };
        Some(format!(
            "Manage AWS resources through Cloud Control. Look up a type's schema with \
             get_resource_schema_information before creating or updating resources.{}",
            mode
        ))
    }

    fn tools(&self) -> Vec<Tool> {
        vec![
            Tool::new(
                "get_resource_schema_information",
                "Get the CloudFormation schema of a resource type",
                json!({
                    "type": "object",
                    "properties": { "resource_type": type_schema(), "region": region_schema() },
                    "required": ["resource_type"]
                }),
            ),
            Tool::new(
                "list_resources",
                "List identifiers of all resources of a type",
                json!({
                    "type": "object",
                    "properties": { "resource_type": type_schema(), "region": region_schema() },
                    "required": ["resource_type"]
                }),
            ),
            Tool::new(
                "get_resource",
                "Get the current properties of a resource",
                json!({
                    "type": "object",
                    "properties": {
                        "resource_type": type_schema(),
                        "identifier": { "type": "string", "description": "Primary identifier of the resource" },
                        "region": region_schema()
                    },
                    "required": ["resource_type", "identifier"]
                }),
            ),
            Tool::new(
                "create_resource",
                "Create a resource with the given properties",
                json!({
                    "type": "object",
                    "properties": {
                        "resource_type": type_schema(),
                        "properties": { "type": "object", "description": "Desired resource state" },
                        "region": region_schema()
                    },
                    "required": ["resource_type", "properties"]
                }),
            ),
            Tool::new(
                "update_resource",
                "Update a resource with an RFC 6902 JSON patch",
                json!({
                    "type": "object",
                    "properties": {
                        "resource_type": type_schema(),
                        "identifier": { "type": "string" },
                        "patch_document": {
                            "type": "array",
                            "items": { "type": "object" },
                            "description": "JSON patch operations, e.g. [{\"op\": \"replace\", \"path\": \"/Tags\", \"value\": []}]"
                        },
                        "region": region_schema()
                    },
                    "required": ["resource_type", "identifier", "patch_document"]
                }),
            ),
            Tool::new(
                "delete_resource",
                "Delete a resource",
                json!({
                    "type": "object",
                    "properties": {
                        "resource_type": type_schema(),
                        "identifier": { "type": "string" },
                        "region": region_schema()
                    },
                    "required": ["resource_type", "identifier"]
                }),
            ),
            Tool::new(
                "get_request_status",
                "Get the status of a create, update or delete request",
                json!({
                    "type": "object",
                    "properties": {
                        "request_token": { "type": "string" },
                        "region": region_schema()
                    },
                    "required": ["request_token"]
                }),
            ),
        ]
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, ServiceError> {
        match name {
            "get_resource_schema_information" => self.get_schema_information(parse_args(arguments)?).await,
            "list_resources" => self.list_resources_of_type(parse_args(arguments)?).await,
            "get_resource" => self.get_resource(parse_args(arguments)?).await,
            "create_resource" => self.create_resource(parse_args(arguments)?).await,
            "update_resource" => self.update_resource(parse_args(arguments)?).await,
            "delete_resource" => self.delete_resource(parse_args(arguments)?).await,
            "get_request_status" => self.get_request_status(parse_args(arguments)?).await,
            other => Err(ServiceError::UnknownTool(other.to_string())),
        }
    }

    fn has_resources(&self) -> bool {
        true
    }

    async fn list_resources(&self) -> Result<Vec<Resource>, ServiceError> {
        Ok(self
            .schemas
            .cached_entries()
            .await
            .into_iter()
            .map(|(region, type_name, updated)| Resource {
                uri: format!("{}{}/{}", SCHEMA_URI_PREFIX, region, type_name),
                name: format!("{} ({})", type_name, region),
                description: Some(format!("Cached schema, fetched {}", updated.to_rfc3339())),
                mime_type: Some("application/json".to_string()),
            })
            .collect())
    }

    async fn read_resource(&self, uri: &str) -> Result<ResourceReadResult, ServiceError> {
        let (region, type_name) = uri
            .strip_prefix(SCHEMA_URI_PREFIX)
            .and_then(|rest| rest.split_once('/'))
            .ok_or_else(|| ServiceError::UnknownResource(uri.to_string()))?;
        let schema = self.schemas.get_schema(type_name, Some(region)).await?;
        Ok(ResourceReadResult {
            contents: vec![ResourceContent::json(uri, &schema)],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::command::testing::MockRunner;
    use crate::core::config::AwsConfig;
    use std::sync::Arc;

    fn service(runner: Arc<MockRunner>, dir: &std::path::Path, readonly: bool) -> CloudFormationService {
        let aws = AwsCli::new(runner, &AwsConfig::default());
        let schemas = SchemaCache::new(aws.clone(), dir, 7);
        CloudFormationService::new(aws, schemas, readonly)
    }

    fn input_json(runner: &MockRunner, n: usize) -> Value {
        let args = runner.args(n);
        let at = args.iter().position(|a| a == "--cli-input-json").unwrap();
        serde_json::from_str(&args[at + 1]).unwrap()
    }

    #[tokio::test]
    async fn test_get_resource_parses_properties() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new());
        runner.push_ok(
            r#"{"TypeName": "AWS::S3::Bucket", "ResourceDescription": {"Identifier": "b1", "Properties": "{\"BucketName\": \"b1\"}"}}"#,
        );
        let svc = service(runner.clone(), dir.path(), true);
        let result = svc
            .call_tool(
                "get_resource",
                json!({"resource_type": "AWS::S3::Bucket", "identifier": "b1", "region": "eu-west-1"}),
            )
            .await
            .unwrap();
        assert_eq!(result["properties"]["BucketName"], "b1");
        assert_eq!(&runner.args(0)[..2], ["cloudcontrol", "get-resource"]);
        assert!(runner.args(0).windows(2).any(|w| w == ["--region", "eu-west-1"]));
    }

    #[tokio::test]
    async fn test_list_resources_returns_identifiers() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new());
        runner
            .push_ok(r#"{"ResourceDescriptions": [{"Identifier": "a"}], "NextToken": "n"}"#)
            .push_ok(r#"{"ResourceDescriptions": [{"Identifier": "b"}]}"#);
        let svc = service(runner.clone(), dir.path(), true);
        let result = svc
            .call_tool("list_resources", json!({"resource_type": "AWS::S3::Bucket"}))
            .await
            .unwrap();
        assert_eq!(result, json!(["a", "b"]));
    }

    #[tokio::test]
    async fn test_readonly_blocks_mutations() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new());
        let svc = service(runner.clone(), dir.path(), true);
        let err = svc
            .call_tool(
                "delete_resource",
                json!({"resource_type": "AWS::S3::Bucket", "identifier": "b1"}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_create_resource_sends_desired_state() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new());
        runner.push_ok(
            r#"{"ProgressEvent": {"TypeName": "AWS::S3::Bucket", "RequestToken": "tok", "Operation": "CREATE", "OperationStatus": "IN_PROGRESS"}}"#,
        );
        let svc = service(runner.clone(), dir.path(), false);
        let result = svc
            .call_tool(
                "create_resource",
                json!({"resource_type": "AWS::S3::Bucket", "properties": {"BucketName": "x"}}),
            )
            .await
            .unwrap();
        assert_eq!(result["status"], "IN_PROGRESS");
        assert_eq!(result["request_token"], "tok");
        let input = input_json(&runner, 0);
        let desired: Value = serde_json::from_str(input["DesiredState"].as_str().unwrap()).unwrap();
        assert_eq!(desired["BucketName"], "x");
    }

    #[tokio::test]
    async fn test_update_requires_valid_patch() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new());
        let svc = service(runner.clone(), dir.path(), false);
        for patch in [json!([]), json!([{"op": "frobnicate", "path": "/A"}]), json!([{"op": "add", "path": "A", "value": 1}])] {
            let err = svc
                .call_tool(
                    "update_resource",
                    json!({"resource_type": "AWS::S3::Bucket", "identifier": "b", "patch_document": patch}),
                )
                .await
                .unwrap_err();
            assert!(matches!(err, ServiceError::InvalidParams(_)));
        }
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_type_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(Arc::new(MockRunner::new()), dir.path(), true);
        let err = svc
            .call_tool("get_resource_schema_information", json!({"resource_type": "s3 bucket"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn test_schema_resources_listed_after_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new());
        runner.push_ok(r#"{"Schema": "{\"typeName\": \"AWS::SQS::Queue\"}"}"#);
        let svc = service(runner, dir.path(), true);
        svc.call_tool(
            "get_resource_schema_information",
            json!({"resource_type": "AWS::SQS::Queue", "region": "us-east-2"}),
        )
        .await
        .unwrap();

        let resources = Service::list_resources(&svc).await.unwrap();
        assert_eq!(resources[0].uri, "cfn://schemas/us-east-2/AWS::SQS::Queue");
        let read = svc.read_resource(&resources[0].uri).await.unwrap();
        assert!(read.contents[0].text.contains("AWS::SQS::Queue"));
    }
}
