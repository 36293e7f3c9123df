//! MCP servers for AWS services and developer tools
//!
//! Each server adapts one backend (an AWS API, a CLI such as `sam` or
//! `terraform`, or a database) into MCP tools and resources, served over
//! stdio or SSE.

pub mod api;
pub mod conversion;
pub mod core;
pub mod models;
