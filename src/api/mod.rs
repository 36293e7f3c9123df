//! MCP transports
//!
//! `stdio` serves a single client over newline-delimited JSON on
//! stdin/stdout; `endpoints` serves any number of clients over HTTP with
//! server-sent events.

pub mod endpoints;
pub mod stdio;
