//! AWS MCP servers
//!
//! Runs one MCP server, selected by name, over stdio (the default) or SSE.

use anyhow::{Context, Result};
use aws_mcp_servers::api::endpoints::{AppState, create_router};
use aws_mcp_servers::api::stdio::serve_stdio;
use aws_mcp_servers::core::command::ProcessRunner;
use aws_mcp_servers::core::config::Config;
use aws_mcp_servers::core::logging::init_logging;
use aws_mcp_servers::core::server::{McpServer, SERVER_VERSION};
use aws_mcp_servers::core::service::{Service, ServiceKind};
use aws_mcp_servers::core::services::build_service;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "aws-mcp-servers", version, about = "MCP servers for AWS services and developer tools")]
struct Cli {
    /// Server to run: cfn, sns-sqs, kendra, neptune, ecs, terraform, sam, finch,
    /// documentdb, valkey or memcached
    server: ServiceKind,

    /// Serve over SSE instead of stdio
    #[arg(long)]
    sse: bool,

    /// SSE listen port
    #[arg(long)]
    port: Option<u16>,

    /// SSE listen address
    #[arg(long)]
    host: Option<String>,

    /// TOML configuration file
    #[arg(long, env = "CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Refuse mutating operations
    #[arg(long, conflicts_with = "allow_write")]
    readonly: bool,

    /// Enable mutating operations that are off by default (SAM deploy, DocumentDB writes)
    #[arg(long)]
    allow_write: bool,

    /// Enable tools that return logs or other sensitive data
    #[arg(long)]
    allow_sensitive_data_access: bool,

    /// Refuse to create SNS topics or SQS queues
    #[arg(long)]
    disallow_resource_creation: bool,

    /// AWS region used when a tool call names none
    #[arg(long)]
    region: Option<String>,

    /// AWS CLI profile
    #[arg(long)]
    profile: Option<String>,

    /// debug, info, warning or error
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    /// CLI flags are the last configuration layer
    fn apply(&self, config: &mut Config) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(level) = &self.log_level {
            config.server.log_level = level.clone();
        }
        if let Some(region) = &self.region {
            config.aws.region = Some(region.clone());
        }
        if let Some(profile) = &self.profile {
            config.aws.profile = Some(profile.clone());
        }
        if self.readonly {
            config.cfn.readonly = true;
            config.documentdb.readonly = true;
            config.valkey.readonly = true;
            config.memcached.readonly = true;
            config.sam.allow_write = false;
        }
        if self.allow_write {
            config.sam.allow_write = true;
            config.documentdb.readonly = false;
        }
        if self.allow_sensitive_data_access {
            config.sam.allow_sensitive_data_access = true;
        }
        if self.disallow_resource_creation {
            config.sns_sqs.allow_resource_creation = false;
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration Error: {:#}", e);
            std::process::exit(1);
        }
    };
    cli.apply(&mut config);

    init_logging(&config.server.log_level);

    if let Err(e) = run(cli, config).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli, config: Config) -> Result<()> {
    let config = Arc::new(config);
    let shutdown = CancellationToken::new();
    let runner = Arc::new(ProcessRunner::new(config.request.timeout_secs));
    let service = build_service(cli.server, &config, runner, &shutdown)
        .with_context(|| format!("Could not start the {} server", cli.server))?;

    info!("🚀 {} v{}", cli.server.server_name(), SERVER_VERSION);

    let result = if cli.sse {
        serve_sse(config.clone(), service, shutdown.clone()).await
    } else {
        let server = McpServer::new(service, config.request.max_response_size);
        serve_stdio(server).await
    };
    shutdown.cancel();
    result
}

async fn serve_sse(
    config: Arc<Config>,
    service: Arc<dyn Service>,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let app = create_router(AppState::new(config, service));

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("Server listening on http://{}/sse", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Shutting down"),
                _ = shutdown.cancelled() => {}
            }
        })
        .await
        .context("Server error")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::parse_from([
            "aws-mcp-servers",
            "sam",
            "--allow-write",
            "--allow-sensitive-data-access",
            "--port",
            "9000",
        ]);
        let mut config = Config::default();
        cli.apply(&mut config);
        assert_eq!(cli.server, ServiceKind::Sam);
        assert!(config.sam.allow_write);
        assert!(config.sam.allow_sensitive_data_access);
        assert!(!config.documentdb.readonly);
        assert_eq!(config.server.port, 9000);
    }

    #[test]
    fn test_readonly_conflicts_with_allow_write() {
        assert!(Cli::try_parse_from(["aws-mcp-servers", "documentdb", "--readonly", "--allow-write"]).is_err());
    }

    #[test]
    fn test_unknown_server_rejected() {
        assert!(Cli::try_parse_from(["aws-mcp-servers", "lambda"]).is_err());
    }
}
