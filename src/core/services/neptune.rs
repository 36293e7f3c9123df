//! Amazon Neptune graph queries through the Neptune data API

use crate::conversion::arguments::{parse_args, require_non_empty};
use crate::core::aws_cli::{AwsCli, CallOptions};
use crate::core::service::{Service, ServiceError, ServiceKind};
use crate::models::mcp::{Resource, ResourceContent, ResourceReadResult, Tool};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::collections::BTreeSet;

const SCHEMA_URI: &str = "neptune://schema";
const STATUS_URI: &str = "neptune://status";

#[derive(Debug, Deserialize)]
struct OpenCypherParams {
    query: String,
    #[serde(default)]
    parameters: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct GremlinParams {
    query: String,
}

/// Build the data API URL from `NEPTUNE_ENDPOINT`
///
/// Accepts a full `https://` URL, a `neptune-db://host` URI or a bare host
/// name; the latter two get the configured port.
pub fn endpoint_url(endpoint: &str, port: u16) -> String {
    let endpoint = endpoint.trim().trim_end_matches('/');
    if endpoint.starts_with("https://") || endpoint.starts_with("http://") {
        return endpoint.to_string();
    }
    let host = endpoint.strip_prefix("neptune-db://").unwrap_or(endpoint);
    if host.contains(':') {
        format!("https://{}", host)
    } else {
        format!("https://{}:{}", host, port)
    }
}

/// Collect distinct property names from summary structures
fn property_names(structures: &Value, field: &str) -> Vec<String> {
    let mut names = BTreeSet::new();
    if let Some(items) = structures.as_array() {
        for item in items {
            if let Some(props) = item[field].as_array() {
                names.extend(props.iter().filter_map(Value::as_str).map(String::from));
            }
        }
    }
    names.into_iter().collect()
}

/// Reshape a `get-propertygraph-summary` response
fn graph_schema(summary: &Value) -> Value {
    let graph = &summary["payload"]["graphSummary"];
    json!({
        "node_labels": graph["nodeLabels"].as_array().cloned().unwrap_or_default(),
        "edge_labels": graph["edgeLabels"].as_array().cloned().unwrap_or_default(),
        "node_properties": property_names(&graph["nodeStructures"], "nodeProperties"),
        "edge_properties": property_names(&graph["edgeStructures"], "edgeProperties"),
        "num_nodes": graph["numNodes"],
        "num_edges": graph["numEdges"],
        "last_statistics_computation_time": summary["payload"]["lastStatisticsComputationTime"],
    })
}

/// Neptune server
pub struct NeptuneService {
    aws: AwsCli,
    endpoint: Option<String>,
}

impl NeptuneService {
    pub fn new(aws: AwsCli, endpoint: Option<&str>, port: u16) -> Self {
        Self {
            aws,
            endpoint: endpoint.filter(|e| !e.is_empty()).map(|e| endpoint_url(e, port)),
        }
    }

    async fn data_api(&self, operation: &str, params: Value) -> Result<Value, ServiceError> {
        let endpoint = self
            .endpoint
            .clone()
            .ok_or_else(|| ServiceError::Connection("NEPTUNE_ENDPOINT is not configured".to_string()))?;
        let options = CallOptions {
            region: None,
            endpoint_url: Some(endpoint),
        };
        self.aws.call(&options, "neptunedata", operation, params).await
    }

    async fn graph_status(&self) -> Result<Value, ServiceError> {
        let status = self.data_api("get-engine-status", json!({})).await?;
        Ok(json!({
            "status": status["status"],
            "db_engine_version": status["dbEngineVersion"],
            "role": status["role"],
            "start_time": status["startTime"],
            "features": status["features"],
        }))
    }

    async fn propertygraph_schema(&self) -> Result<Value, ServiceError> {
        let summary = self
            .data_api("get-propertygraph-summary", json!({ "mode": "detailed" }))
            .await?;
        Ok(graph_schema(&summary))
    }

    async fn run_opencypher(&self, params: OpenCypherParams) -> Result<Value, ServiceError> {
        require_non_empty("query", &params.query)?;
        let mut request = Map::new();
        request.insert("openCypherQuery".into(), json!(params.query));
        if let Some(parameters) = params.parameters.filter(|p| !p.is_empty()) {
            request.insert("parameters".into(), json!(serde_json::to_string(&parameters)?));
        }
        let response = self
            .data_api("execute-open-cypher-query", Value::Object(request))
            .await?;
        Ok(json!({ "results": response["results"] }))
    }

    async fn run_gremlin(&self, params: GremlinParams) -> Result<Value, ServiceError> {
        require_non_empty("query", &params.query)?;
        let response = self
            .data_api("execute-gremlin-query", json!({ "gremlinQuery": params.query }))
            .await?;
        Ok(json!({ "results": response["result"]["data"] }))
    }
}

#[async_trait]
impl Service for NeptuneService {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Neptune
    }

    fn instructions(&self) -> Option<String> {
        Some(
            "Query an Amazon Neptune database with openCypher or Gremlin. Read the schema first \
             to learn the node and edge labels."
                .to_string(),
        )
    }

    fn tools(&self) -> Vec<Tool> {
        vec![
            Tool::new(
                "get_graph_status",
                "Get the status of the Neptune engine",
                json!({ "type": "object", "properties": {} }),
            ),
            Tool::new(
                "get_propertygraph_schema",
                "Get node labels, edge labels and property names of the graph",
                json!({ "type": "object", "properties": {} }),
            ),
            Tool::new(
                "run_opencypher_query",
                "Run an openCypher query",
                json!({
                    "type": "object",
                    "properties": {
                        "query": { "type": "string" },
                        "parameters": { "type": "object", "description": "Query parameters" }
                    },
                    "required": ["query"]
                }),
            ),
            Tool::new(
                "run_gremlin_query",
                "Run a Gremlin query",
                json!({
                    "type": "object",
                    "properties": { "query": { "type": "string" } },
                    "required": ["query"]
                }),
            ),
        ]
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, ServiceError> {
        match name {
            "get_graph_status" => self.graph_status().await,
            "get_propertygraph_schema" => self.propertygraph_schema().await,
            "run_opencypher_query" => self.run_opencypher(parse_args(arguments)?).await,
            "run_gremlin_query" => self.run_gremlin(parse_args(arguments)?).await,
            other => Err(ServiceError::UnknownTool(other.to_string())),
        }
    }

    fn has_resources(&self) -> bool {
        true
    }

    async fn list_resources(&self) -> Result<Vec<Resource>, ServiceError> {
        Ok(vec![
            Resource {
                uri: SCHEMA_URI.to_string(),
                name: "Property graph schema".to_string(),
                description: Some("Node labels, edge labels and property names".to_string()),
                mime_type: Some("application/json".to_string()),
            },
            Resource {
                uri: STATUS_URI.to_string(),
                name: "Engine status".to_string(),
                description: None,
                mime_type: Some("application/json".to_string()),
            },
        ])
    }

    async fn read_resource(&self, uri: &str) -> Result<ResourceReadResult, ServiceError> {
        let body = match uri {
            SCHEMA_URI => self.propertygraph_schema().await?,
            STATUS_URI => self.graph_status().await?,
            other => return Err(ServiceError::UnknownResource(other.to_string())),
        };
        Ok(ResourceReadResult {
            contents: vec![ResourceContent::json(uri, &body)],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::command::testing::MockRunner;
    use crate::core::config::AwsConfig;
    use std::sync::Arc;

    fn service(runner: Arc<MockRunner>) -> NeptuneService {
        NeptuneService::new(
            AwsCli::new(runner, &AwsConfig::default()),
            Some("db.cluster.neptune.amazonaws.com"),
            8182,
        )
    }

    #[test]
    fn test_endpoint_url() {
        assert_eq!(endpoint_url("db.example", 8182), "https://db.example:8182");
        assert_eq!(endpoint_url("neptune-db://db.example", 8182), "https://db.example:8182");
        assert_eq!(endpoint_url("db.example:9000", 8182), "https://db.example:9000");
        assert_eq!(endpoint_url("https://db.example:8182/", 1), "https://db.example:8182");
    }

    #[tokio::test]
    async fn test_schema_reshaped() {
        let runner = Arc::new(MockRunner::new());
        runner.push_ok(
            r#"{"payload": {"graphSummary": {
                "numNodes": 3, "numEdges": 2,
                "nodeLabels": ["person", "city"], "edgeLabels": ["lives_in"],
                "nodeStructures": [{"nodeProperties": ["name", "age"]}, {"nodeProperties": ["name"]}],
                "edgeStructures": [{"edgeProperties": ["since"]}]
            }}}"#,
        );
        let result = service(runner.clone())
            .call_tool("get_propertygraph_schema", Value::Null)
            .await
            .unwrap();
        assert_eq!(result["node_labels"], json!(["person", "city"]));
        assert_eq!(result["node_properties"], json!(["age", "name"]));
        assert_eq!(result["edge_properties"], json!(["since"]));
        let args = runner.args(0);
        assert_eq!(&args[..2], ["neptunedata", "get-propertygraph-summary"]);
        assert!(args.windows(2).any(|w| w == ["--endpoint-url", "https://db.cluster.neptune.amazonaws.com:8182"]));
        let input: Value = serde_json::from_str(&args[3]).unwrap();
        assert_eq!(input, json!({"mode": "detailed"}));
    }

    #[tokio::test]
    async fn test_opencypher_parameters_are_encoded() {
        let runner = Arc::new(MockRunner::new());
        runner.push_ok(r#"{"results": [{"n": 1}]}"#);
        let result = service(runner.clone())
            .call_tool(
                "run_opencypher_query",
                json!({"query": "MATCH (n) WHERE n.age > $age RETURN count(n) AS n", "parameters": {"age": 30}}),
            )
            .await
            .unwrap();
        assert_eq!(result["results"][0]["n"], 1);
        let input: Value = serde_json::from_str(&runner.args(0)[3]).unwrap();
        assert_eq!(input["parameters"], r#"{"age":30}"#);
        assert_eq!(input["openCypherQuery"], "MATCH (n) WHERE n.age > $age RETURN count(n) AS n");
        assert!(input.get("Parameters").is_none());
    }

    #[tokio::test]
    async fn test_gremlin_query_member() {
        let runner = Arc::new(MockRunner::new());
        runner.push_ok(r#"{"result": {"data": [42]}}"#);
        let result = service(runner.clone())
            .call_tool("run_gremlin_query", json!({"query": "g.V().count()"}))
            .await
            .unwrap();
        assert_eq!(result["results"], json!([42]));
        let args = runner.args(0);
        assert_eq!(&args[..2], ["neptunedata", "execute-gremlin-query"]);
        let input: Value = serde_json::from_str(&args[3]).unwrap();
        assert_eq!(input, json!({"gremlinQuery": "g.V().count()"}));
    }

    #[tokio::test]
    async fn test_missing_endpoint() {
        let svc = NeptuneService::new(
            AwsCli::new(Arc::new(MockRunner::new()), &AwsConfig::default()),
            None,
            8182,
        );
        let err = svc.call_tool("get_graph_status", Value::Null).await.unwrap_err();
        assert!(matches!(err, ServiceError::Connection(_)));
    }
}
