//! Core application modules
//!
//! This module contains configuration, constants, logging, the MCP request
//! handler, the backend clients (AWS CLI, subprocesses, RESP, memcached) and
//! the individual servers built on top of them.

pub mod aws_cli;
pub mod command;
pub mod config;
pub mod constants;
pub mod logging;
pub mod memcache;
pub mod pool;
pub mod resp;
pub mod schema_cache;
pub mod server;
pub mod service;
pub mod services;
