//! Service abstraction layer for the individual MCP servers
//!
//! This module defines the common trait every server implements (one per
//! AWS service or developer tool), the error type tool handlers return, and
//! the enum used to pick a server at startup.

use crate::models::mcp::{Resource, ResourceReadResult, Tool};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error types for tool and resource operations
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Unknown resource: {0}")]
    UnknownResource(String),

    #[error("Operation not permitted: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{program} exited with code {exit_code}: {stderr}")]
    Command {
        program: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("{program} timed out after {seconds}s")]
    Timeout { program: String, seconds: u64 },

    #[error("AWS error ({code}): {message}")]
    Aws { code: String, message: String },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] mongodb::error::Error),

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl ServiceError {
    /// Shorthand for parameter validation failures
    pub fn invalid(message: impl Into<String>) -> Self {
        ServiceError::InvalidParams(message.into())
    }
}

/// Trait for the MCP servers
///
/// Implementations hold their own clients and configuration; the MCP layer
/// only sees tool and resource descriptors plus the dispatch entry points.
#[async_trait]
pub trait Service: Send + Sync {
    /// Which server this is
    fn kind(&self) -> ServiceKind;

    /// Usage notes sent to the client in the `initialize` result
    fn instructions(&self) -> Option<String> {
        None
    }

    /// Tool descriptors for `tools/list`
    fn tools(&self) -> Vec<Tool>;

    /// Dispatch a tool call by name
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, ServiceError>;

    /// Whether the server exposes resources at all
    fn has_resources(&self) -> bool {
        false
    }

    /// Resource descriptors for `resources/list`
    async fn list_resources(&self) -> Result<Vec<Resource>, ServiceError> {
        Ok(Vec::new())
    }

    /// Read a resource by URI
    async fn read_resource(&self, uri: &str) -> Result<ResourceReadResult, ServiceError> {
        Err(ServiceError::UnknownResource(uri.to_string()))
    }
}

/// Supported server types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    CloudFormation,
    SnsSqs,
    Kendra,
    Neptune,
    Ecs,
    Terraform,
    Sam,
    Finch,
    DocumentDb,
    Valkey,
    Memcached,
}

impl ServiceKind {
    /// Every server, in help-text order
    pub const ALL: [ServiceKind; 11] = [
        ServiceKind::CloudFormation,
        ServiceKind::SnsSqs,
        ServiceKind::Kendra,
        ServiceKind::Neptune,
        ServiceKind::Ecs,
        ServiceKind::Terraform,
        ServiceKind::Sam,
        ServiceKind::Finch,
        ServiceKind::DocumentDb,
        ServiceKind::Valkey,
        ServiceKind::Memcached,
    ];

    /// Canonical short name, also the CLI argument
    pub fn name(&self) -> &'static str {
        match self {
            ServiceKind::CloudFormation => "cfn",
            ServiceKind::SnsSqs => "sns-sqs",
            ServiceKind::Kendra => "kendra",
            ServiceKind::Neptune => "neptune",
            ServiceKind::Ecs => "ecs",
            ServiceKind::Terraform => "terraform",
            ServiceKind::Sam => "sam",
            ServiceKind::Finch => "finch",
            ServiceKind::DocumentDb => "documentdb",
            ServiceKind::Valkey => "valkey",
            ServiceKind::Memcached => "memcached",
        }
    }

    /// Name reported in `serverInfo`
    pub fn server_name(&self) -> String {
        format!("{}-mcp-server", self.name())
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ServiceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "cfn" | "cloudformation" | "cloudcontrol" => Ok(ServiceKind::CloudFormation),
            "sns-sqs" | "sns" | "sqs" | "amazon-sns-sqs" => Ok(ServiceKind::SnsSqs),
            "kendra" | "amazon-kendra-index" => Ok(ServiceKind::Kendra),
            "neptune" | "amazon-neptune" => Ok(ServiceKind::Neptune),
            "ecs" => Ok(ServiceKind::Ecs),
            "terraform" | "tf" => Ok(ServiceKind::Terraform),
            "sam" | "aws-serverless" | "serverless" => Ok(ServiceKind::Sam),
            "finch" => Ok(ServiceKind::Finch),
            "documentdb" | "docdb" => Ok(ServiceKind::DocumentDb),
            "valkey" | "elasticache-valkey" => Ok(ServiceKind::Valkey),
            "memcached" | "elasticache-memcached" => Ok(ServiceKind::Memcached),
            other => Err(format!(
                "unknown server '{}'. Must be one of: {}",
                other,
                ServiceKind::ALL
                    .iter()
                    .map(|k| k.name())
                    .collect::<Vec<_>>()
                    .join(", ")
            )),
        }
    }
}
