//! Protocol data models
//!
//! This module contains data structures for JSON-RPC 2.0 and the MCP
//! lifecycle, tool and resource messages.

pub mod jsonrpc;
pub mod mcp;
