//! Amazon ECS read access and task log retrieval

use crate::conversion::arguments::{parse_args, require_non_empty};
use crate::core::aws_cli::{AwsCli, CallOptions, Pagination};
use crate::core::service::{Service, ServiceError, ServiceKind};
use crate::core::services::put;
use crate::models::mcp::Tool;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value, json};

const ACTIONS: &[&str] = &[
    "list_clusters",
    "describe_clusters",
    "list_services",
    "describe_services",
    "list_tasks",
    "describe_tasks",
    "list_task_definitions",
    "describe_task_definition",
];

const DEFAULT_LOG_LIMIT: u32 = 100;

#[derive(Debug, Deserialize)]
struct ManagementParams {
    action: String,
    #[serde(default)]
    parameters: ActionParameters,
}

#[derive(Debug, Default, Deserialize)]
struct ActionParameters {
    #[serde(default)]
    cluster: Option<String>,
    #[serde(default)]
    clusters: Vec<String>,
    #[serde(default)]
    services: Vec<String>,
    #[serde(default)]
    service_name: Option<String>,
    #[serde(default)]
    tasks: Vec<String>,
    #[serde(default)]
    desired_status: Option<String>,
    #[serde(default)]
    family_prefix: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    task_definition: Option<String>,
    #[serde(default)]
    max_results: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct TaskLogsParams {
    cluster: String,
    log_group: String,
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    filter_pattern: Option<String>,
    #[serde(default)]
    limit: Option<u32>,
}

/// ECS paginates with lower-case `nextToken`
fn ecs_pages(items_key: &str, max_items: Option<usize>) -> Pagination<'_> {
    Pagination {
        input_token: "nextToken",
        output_token: "nextToken",
        items_key,
        max_items,
    }
}

fn require<'a>(value: &'a Option<String>, name: &str, action: &str) -> Result<&'a str, ServiceError> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ServiceError::invalid(format!("{} requires parameters.{}", action, name)))
}

fn require_list(values: &[String], name: &str, action: &str) -> Result<(), ServiceError> {
    if values.is_empty() {
        Err(ServiceError::invalid(format!("{} requires a non-empty parameters.{}", action, name)))
    } else {
        Ok(())
    }
}

fn format_timestamp(millis: Option<i64>) -> Value {
    millis
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|t| json!(t.to_rfc3339()))
        .unwrap_or(Value::Null)
}

/// ECS server
pub struct EcsService {
    aws: AwsCli,
}

impl EcsService {
    pub fn new(aws: AwsCli) -> Self {
        Self { aws }
    }

    async fn list(&self, operation: &str, params: Map<String, Value>, key: &str, max: Option<usize>) -> Result<Value, ServiceError> {
        let items = self
            .aws
            .paginate(
                &CallOptions::default(),
                "ecs",
                operation,
                Value::Object(params),
                ecs_pages(key, max),
            )
            .await?;
        Ok(json!({ (key): items, "count": items.len() }))
    }

    async fn describe(&self, operation: &str, params: Value) -> Result<Value, ServiceError> {
        self.aws.call(&CallOptions::default(), "ecs", operation, params).await
    }

    async fn resource_management(&self, params: ManagementParams) -> Result<Value, ServiceError> {
        let action = params.action.as_str();
        let p = params.parameters;
        let mut request = Map::new();
        match action {
            "list_clusters" => self.list("list-clusters", request, "clusterArns", p.max_results).await,
            "describe_clusters" => {
                require_list(&p.clusters, "clusters", action)?;
                self.describe(
                    "describe-clusters",
                    json!({ "clusters": p.clusters, "include": ["STATISTICS", "SETTINGS"] }),
                )
                .await
            }
            "list_services" => {
                put(&mut request, "cluster", p.cluster)?;
                self.list("list-services", request, "serviceArns", p.max_results).await
            }
            "describe_services" => {
                let cluster = require(&p.cluster, "cluster", action)?;
                require_list(&p.services, "services", action)?;
                self.describe(
                    "describe-services",
                    json!({ "cluster": cluster, "services": p.services }),
                )
                .await
            }
            "list_tasks" => {
                put(&mut request, "cluster", p.cluster)?;
                put(&mut request, "serviceName", p.service_name)?;
                put(&mut request, "desiredStatus", p.desired_status)?;
                self.list("list-tasks", request, "taskArns", p.max_results).await
            }
            "describe_tasks" => {
                let cluster = require(&p.cluster, "cluster", action)?;
                require_list(&p.tasks, "tasks", action)?;
                self.describe("describe-tasks", json!({ "cluster": cluster, "tasks": p.tasks }))
                    .await
            }
            "list_task_definitions" => {
                put(&mut request, "familyPrefix", p.family_prefix)?;
                put(&mut request, "status", p.status)?;
                self.list(
                    "list-task-definitions",
                    request,
                    "taskDefinitionArns",
                    p.max_results,
                )
                .await
            }
            "describe_task_definition" => {
                let definition = require(&p.task_definition, "task_definition", action)?;
                self.describe(
                    "describe-task-definition",
                    json!({ "taskDefinition": definition, "include": ["TAGS"] }),
                )
                .await
            }
            other => Err(ServiceError::invalid(format!(
                "unknown action '{}'; expected one of {}",
                other,
                ACTIONS.join(", ")
            ))),
        }
    }

    async fn logs(&self, operation: &str, params: Value) -> Result<Value, ServiceError> {
        self.aws.call(&CallOptions::default(), "logs", operation, params).await
    }

    async fn task_logs(&self, params: TaskLogsParams) -> Result<Value, ServiceError> {
        require_non_empty("log_group", &params.log_group)?;
        let mut request = Map::new();
        request.insert("logGroupName".into(), json!(params.log_group));
        request.insert("limit".into(), json!(params.limit.unwrap_or(DEFAULT_LOG_LIMIT)));
        put(&mut request, "filterPattern", params.filter_pattern)?;

        if let Some(task_id) = params.task_id.as_deref().filter(|t| !t.is_empty()) {
            let streams = self
                .logs(
                    "describe-log-streams",
                    json!({ "logGroupName": params.log_group, "orderBy": "LastEventTime", "descending": true }),
                )
                .await?;
            let suffix = format!("/{}", task_id);
            let names: Vec<Value> = streams["logStreams"]
                .as_array()
                .map(|streams| {
                    streams
                        .iter()
                        .filter_map(|s| s["logStreamName"].as_str())
                        .filter(|name| name.ends_with(&suffix))
                        .map(|name| json!(name))
                        .collect()
                })
                .unwrap_or_default();
            if names.is_empty() {
                return Err(ServiceError::NotFound(format!(
                    "no log stream for task {} in {}",
                    task_id, params.log_group
                )));
            }
            request.insert("logStreamNames".into(), Value::Array(names));
        }

        let response = self.logs("filter-log-events", Value::Object(request)).await?;
        let events: Vec<Value> = response["events"]
            .as_array()
            .map(|events| {
                events
                    .iter()
                    .map(|e| {
                        json!({
                            "timestamp": format_timestamp(e["timestamp"].as_i64()),
                            "log_stream": e["logStreamName"],
                            "message": e["message"],
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        let error_count = events
            .iter()
            .filter(|e| {
                e["message"]
                    .as_str()
                    .map(|m| m.contains("ERROR") || m.contains("Exception"))
                    .unwrap_or(false)
            })
            .count();

        Ok(json!({
            "cluster": params.cluster,
            "log_group": params.log_group,
            "task_id": params.task_id,
            "event_count": events.len(),
            "error_count": error_count,
            "events": events,
        }))
    }
}

#[async_trait]
impl Service for EcsService {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Ecs
    }

    fn tools(&self) -> Vec<Tool> {
        vec![
            Tool::new(
                "ecs_resource_management",
                "Read ECS clusters, services, tasks and task definitions",
                json!({
                    "type": "object",
                    "properties": {
                        "action": { "type": "string", "enum": ACTIONS },
                        "parameters": {
                            "type": "object",
                            "description": "Action parameters: cluster, clusters, services, service_name, tasks, desired_status, family_prefix, status, task_definition, max_results"
                        }
                    },
                    "required": ["action"]
                }),
            ),
            Tool::new(
                "fetch_task_logs",
                "Fetch CloudWatch Logs events for ECS tasks",
                json!({
                    "type": "object",
                    "properties": {
                        "cluster": { "type": "string" },
                        "log_group": { "type": "string" },
                        "task_id": { "type": "string" },
                        "filter_pattern": { "type": "string" },
                        "limit": { "type": "integer", "minimum": 1, "maximum": 10000 }
                    },
                    "required": ["cluster", "log_group"]
                }),
            ),
        ]
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, ServiceError> {
        match name {
            "ecs_resource_management" => self.resource_management(parse_args(arguments)?).await,
            "fetch_task_logs" => self.task_logs(parse_args(arguments)?).await,
            other => Err(ServiceError::UnknownTool(other.to_string())),
        }
    }
}
