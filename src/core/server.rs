//! MCP request dispatch
//!
//! `McpServer` turns one raw JSON-RPC message into at most one serialized
//! response. It owns the lifecycle state of a single client connection and
//! forwards tool and resource requests to the selected [`Service`].

use crate::conversion::tool_result::tool_result;
use crate::core::constants::{error_code, method, protocol};
use crate::core::service::{Service, ServiceError};
use crate::models::jsonrpc::{JSONRPC_VERSION, JsonRpcError, JsonRpcErrorResponse, JsonRpcRequest, JsonRpcResponse};
use crate::models::mcp::{
    Implementation, InitializeParams, InitializeResult, ListChangedCapability, ResourceReadParams,
    ResourcesCapability, ResourcesListResult, ServerCapabilities, ToolCallParams, ToolCallResult,
    ToolsListResult,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Version reported in `serverInfo`
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol-level failures, reported as JSON-RPC errors
#[derive(Debug, Error)]
pub enum McpError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Server not initialized")]
    NotInitialized,

    #[error("{0}")]
    Service(ServiceError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl McpError {
    /// JSON-RPC error code for this error
    pub fn error_code(&self) -> i32 {
        match self {
            McpError::Parse(_) => error_code::PARSE_ERROR,
            McpError::InvalidRequest(_) => error_code::INVALID_REQUEST,
            McpError::MethodNotFound(_) => error_code::METHOD_NOT_FOUND,
            McpError::InvalidParams(_) => error_code::INVALID_PARAMS,
            McpError::NotInitialized => error_code::NOT_INITIALIZED,
            McpError::Service(ServiceError::InvalidParams(_) | ServiceError::UnknownResource(_)) => {
                error_code::INVALID_PARAMS
            }
            McpError::Service(_) => error_code::SERVER_ERROR,
            McpError::Internal(_) => error_code::INTERNAL_ERROR,
        }
    }
}

impl From<ServiceError> for McpError {
    fn from(err: ServiceError) -> Self {
        McpError::Service(err)
    }
}

/// Pick the protocol version to answer `initialize` with
pub fn negotiate_version(requested: &str) -> &'static str {
    protocol::SUPPORTED
        .iter()
        .copied()
        .find(|v| *v == requested)
        .unwrap_or(protocol::LATEST)
}

/// Per-connection MCP server
pub struct McpServer {
    service: Arc<dyn Service>,
    max_response_size: usize,
    initialized: AtomicBool,
}

impl McpServer {
    pub fn new(service: Arc<dyn Service>, max_response_size: usize) -> Self {
        Self {
            service,
            max_response_size,
            initialized: AtomicBool::new(false),
        }
    }

    pub fn service(&self) -> &Arc<dyn Service> {
        &self.service
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Handle one raw message; `None` means nothing should be sent back
    pub async fn handle_message(&self, line: &str) -> Option<String> {
        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => {
                warn!("Discarding unparseable message: {}", e);
                return Some(error_response(Value::Null, &McpError::Parse(e.to_string())));
            }
        };

        // Replies to server-initiated requests carry no method
        if value.get("method").is_none() && (value.get("result").is_some() || value.get("error").is_some()) {
            debug!("Ignoring client response message");
            return None;
        }

        let id = value.get("id").cloned().unwrap_or(Value::Null);
        let request: JsonRpcRequest = match serde_json::from_value(value) {
            Ok(request) => request,
            Err(e) => return Some(error_response(id, &McpError::InvalidRequest(e.to_string()))),
        };
        if request.jsonrpc != JSONRPC_VERSION {
            return Some(error_response(
                id,
                &McpError::InvalidRequest(format!("unsupported jsonrpc version '{}'", request.jsonrpc)),
            ));
        }

        if request.is_notification() {
            self.handle_notification(&request);
            return None;
        }

        let id = request.id.clone().unwrap_or(Value::Null);
        match self.dispatch(request).await {
            Ok(result) => Some(serialize(&JsonRpcResponse::new(id, result))),
            Err(e) => Some(error_response(id, &e)),
        }
    }

    fn handle_notification(&self, request: &JsonRpcRequest) {
        match request.method.as_str() {
            method::INITIALIZED => debug!("Client finished initialization"),
            method::CANCELLED => debug!("Client cancelled a request: {:?}", request.params),
            other => debug!("Ignoring notification {}", other),
        }
    }

    async fn dispatch(&self, request: JsonRpcRequest) -> Result<Value, McpError> {
        let JsonRpcRequest { method: name, params, .. } = request;
        match name.as_str() {
            method::INITIALIZE => self.initialize(parse_params(params)?),
            method::PING => Ok(json!({})),
            method::TOOLS_LIST | method::TOOLS_CALL | method::RESOURCES_LIST | method::RESOURCES_READ
                if !self.is_initialized() =>
            {
                Err(McpError::NotInitialized)
            }
            method::TOOLS_LIST => to_value(&ToolsListResult {
                tools: self.service.tools(),
            }),
            method::TOOLS_CALL => {
                let result = self.call_tool(parse_params(params)?).await;
                to_value(&result)
            }
            method::RESOURCES_LIST => {
                let resources = self.service.list_resources().await?;
                to_value(&ResourcesListResult { resources })
            }
            method::RESOURCES_READ => {
                let params: ResourceReadParams = parse_params(params)?;
                let result = self.service.read_resource(&params.uri).await?;
                to_value(&result)
            }
            other => Err(McpError::MethodNotFound(other.to_string())),
        }
    }

    fn initialize(&self, params: InitializeParams) -> Result<Value, McpError> {
        let version = negotiate_version(&params.protocol_version);
        if version != params.protocol_version {
            warn!(
                "Client requested protocol {}, answering with {}",
                params.protocol_version, version
            );
        }
        if let Some(client) = &params.client_info {
            info!("🤝 Client connected: {} {}", client.name, client.version);
        }
        self.initialized.store(true, Ordering::SeqCst);

        let kind = self.service.kind();
        to_value(&InitializeResult {
            protocol_version: version.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ListChangedCapability { list_changed: false }),
                resources: self.service.has_resources().then(ResourcesCapability::default),
            },
            server_info: Implementation {
                name: kind.server_name(),
                version: SERVER_VERSION.to_string(),
            },
            instructions: self.service.instructions(),
        })
    }

    async fn call_tool(&self, params: ToolCallParams) -> ToolCallResult {
        if !self.service.tools().iter().any(|t| t.name == params.name) {
            warn!("Unknown tool requested: {}", params.name);
            return tool_result(
                Err(ServiceError::UnknownTool(params.name)),
                self.max_response_size,
            );
        }

        let started = Instant::now();
        info!("🔧 Calling tool {}", params.name);
        let result = self
            .service
            .call_tool(&params.name, params.arguments.unwrap_or(Value::Null))
            .await;
        match &result {
            Ok(_) => info!("✅ Tool {} finished in {:?}", params.name, started.elapsed()),
            Err(e) => warn!("❌ Tool {} failed after {:?}: {}", params.name, started.elapsed(), e),
        }
        tool_result(result, self.max_response_size)
    }
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, McpError> {
    serde_json::from_value(params.unwrap_or_else(|| json!({})))
        .map_err(|e| McpError::InvalidParams(e.to_string()))
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, McpError> {
    serde_json::to_value(value).map_err(|e| McpError::Internal(e.to_string()))
}

fn serialize<T: Serialize>(message: &T) -> String {
    serde_json::to_string(message).unwrap_or_else(|e| {
        format!(
            r#"{{"jsonrpc":"2.0","id":null,"error":{{"code":{},"message":"{}"}}}}"#,
            error_code::INTERNAL_ERROR,
            e.to_string().replace('"', "'")
        )
    })
}

/// Serialized JSON-RPC error response
pub fn error_response(id: Value, err: &McpError) -> String {
    serialize(&JsonRpcErrorResponse::new(
        id,
        JsonRpcError::new(err.error_code(), err.to_string()),
    ))
}
