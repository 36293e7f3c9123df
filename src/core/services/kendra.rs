//! Amazon Kendra index search

use crate::conversion::arguments::{parse_args, require_non_empty};
use crate::core::aws_cli::{AwsCli, CallOptions, Pagination};
use crate::core::service::{Service, ServiceError, ServiceKind};
use crate::models::mcp::Tool;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

#[derive(Debug, Deserialize)]
struct ListIndexesParams {
    #[serde(default)]
    region: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryParams {
    query: String,
    #[serde(default)]
    index_id: Option<String>,
    #[serde(default)]
    region: Option<String>,
}

/// Flatten one `ResultItems` entry
fn result_item(item: &Value) -> Value {
    json!({
        "id": item["Id"],
        "type": item["Type"],
        "document_id": item["DocumentId"],
        "document_title": item["DocumentTitle"]["Text"],
        "document_uri": item["DocumentURI"],
        "excerpt": item["DocumentExcerpt"]["Text"],
        "score": item["ScoreAttributes"]["ScoreConfidence"],
    })
}

/// Kendra server
pub struct KendraService {
    aws: AwsCli,
    default_index_id: Option<String>,
}

impl KendraService {
    pub fn new(aws: AwsCli, default_index_id: Option<String>) -> Self {
        Self { aws, default_index_id }
    }

    async fn list_indexes(&self, params: ListIndexesParams) -> Result<Value, ServiceError> {
        let items = self
            .aws
            .paginate(
                &CallOptions::region(params.region),
                "kendra",
                "list-indices",
                json!({}),
                Pagination::next_token("IndexConfigurationSummaryItems", None),
            )
            .await?;
        let indexes: Vec<Value> = items
            .iter()
            .map(|index| {
                json!({
                    "id": index["Id"],
                    "name": index["Name"],
                    "status": index["Status"],
                    "edition": index["Edition"],
                    "created_at": index["CreatedAt"],
                    "updated_at": index["UpdatedAt"],
                })
            })
            .collect();
        Ok(json!({ "count": indexes.len(), "indexes": indexes }))
    }

    async fn query(&self, params: QueryParams) -> Result<Value, ServiceError> {
        require_non_empty("query", &params.query)?;
        let index_id = params
            .index_id
            .filter(|id| !id.is_empty())
            .or_else(|| self.default_index_id.clone())
            .ok_or_else(|| {
                ServiceError::invalid("no index_id given and KENDRA_INDEX_ID is not set")
            })?;

        debug!("Querying Kendra index {}", index_id);
        let response = self
            .aws
            .call(
                &CallOptions::region(params.region),
                "kendra",
                "query",
                json!({ "IndexId": index_id, "QueryText": params.query }),
            )
            .await?;

        let results: Vec<Value> = response["ResultItems"]
            .as_array()
            .map(|items| items.iter().map(result_item).collect())
            .unwrap_or_default();
        Ok(json!({
            "query": params.query,
            "total_results_count": response["TotalNumberOfResults"],
            "results": results,
        }))
    }
}

#[async_trait]
impl Service for KendraService {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Kendra
    }

    fn instructions(&self) -> Option<String> {
        Some(
            "Search Amazon Kendra indexes. Call list_indexes to discover index ids; query uses \
             KENDRA_INDEX_ID when no index_id is given."
                .to_string(),
        )
    }

    fn tools(&self) -> Vec<Tool> {
        vec![
            Tool::new(
                "list_indexes",
                "List Kendra indexes in a region",
                json!({
                    "type": "object",
                    "properties": { "region": { "type": "string" } }
                }),
            ),
            Tool::new(
                "query",
                "Run a natural language query against a Kendra index",
                json!({
                    "type": "object",
                    "properties": {
                        "query": { "type": "string" },
                        "index_id": { "type": "string" },
                        "region": { "type": "string" }
                    },
                    "required": ["query"]
                }),
            ),
        ]
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, ServiceError> {
        match name {
            "list_indexes" => self.list_indexes(parse_args(arguments)?).await,
            "query" => self.query(parse_args(arguments)?).await,
            other => Err(ServiceError::UnknownTool(other.to_string())),
        }
    }
}
