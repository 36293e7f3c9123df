//! Protocol constants
//!
//! This module defines string and numeric constants used throughout the
//! application for MCP method names, JSON-RPC error codes, protocol
//! versions and SSE event names.

/// MCP protocol versions
pub mod protocol {
    /// Newest protocol version this server speaks
    pub const LATEST: &str = "2025-06-18";

    /// All protocol versions accepted during `initialize`
    pub const SUPPORTED: &[&str] = &["2024-11-05", "2025-03-26", "2025-06-18"];
}

/// MCP method names
pub mod method {
    /// Lifecycle handshake
    pub const INITIALIZE: &str = "initialize";

    /// Client notification sent after a successful handshake
    pub const INITIALIZED: &str = "notifications/initialized";

    /// Client notification that a request was cancelled
    pub const CANCELLED: &str = "notifications/cancelled";

    /// Liveness check
    pub const PING: &str = "ping";

    /// List available tools
    pub const TOOLS_LIST: &str = "tools/list";

    /// Invoke a tool
    pub const TOOLS_CALL: &str = "tools/call";

    /// List available resources
    pub const RESOURCES_LIST: &str = "resources/list";

    /// Read a resource by URI
    pub const RESOURCES_READ: &str = "resources/read";
}

/// JSON-RPC error codes
pub mod error_code {
    /// Invalid JSON was received
    pub const PARSE_ERROR: i32 = -32700;

    /// The JSON sent is not a valid request object
    pub const INVALID_REQUEST: i32 = -32600;

    /// The method does not exist
    pub const METHOD_NOT_FOUND: i32 = -32601;

    /// Invalid method parameters
    pub const INVALID_PARAMS: i32 = -32602;

    /// Internal JSON-RPC error
    pub const INTERNAL_ERROR: i32 = -32603;

    /// Generic server error
    pub const SERVER_ERROR: i32 = -32000;

    /// Request received before `initialize`
    pub const NOT_INITIALIZED: i32 = -32002;
}

/// Server-sent event names used by the SSE transport
pub mod event {
    /// First event of a stream, carries the POST endpoint
    pub const ENDPOINT: &str = "endpoint";

    /// JSON-RPC message event
    pub const MESSAGE: &str = "message";
}

/// Tag applied to AWS resources created through the servers
pub mod tag {
    /// Tag key marking resources created by an MCP server
    pub const MCP_SERVER_VERSION: &str = "mcp_server_version";
}
