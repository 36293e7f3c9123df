//! Conversion between MCP payloads and service calls
//!
//! Tool arguments arrive as loose JSON and are deserialized into typed
//! parameter structs; handler output is turned back into MCP tool results.

pub mod arguments;
pub mod tool_result;
