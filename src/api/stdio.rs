//! stdio transport
//!
//! One JSON-RPC message per line in each direction. Requests are handled in
//! arrival order; stdout carries nothing but responses.

use crate::core::server::McpServer;
use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info};

/// Serve the process's stdin/stdout until stdin closes
pub async fn serve_stdio(server: McpServer) -> Result<()> {
    info!("📡 Serving {} on stdio", server.service().kind().server_name());
    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    serve(&server, stdin, stdout).await
}

/// Read messages from `reader` and write responses to `writer`
pub async fn serve<R, W>(server: &McpServer, reader: R, mut writer: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await.context("Failed to read from stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(reply) = server.handle_message(line).await {
            writer.write_all(reply.as_bytes()).await.context("Failed to write response")?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }
    }
    debug!("stdin closed, shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::service::{Service, ServiceError, ServiceKind};
    use crate::models::mcp::Tool;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::sync::Arc;

    struct PingService;

    #[async_trait]
    impl Service for PingService {
        fn kind(&self) -> ServiceKind {
            ServiceKind::Ecs
        }

        fn tools(&self) -> Vec<Tool> {
            vec![Tool::new("pong", "Reply with pong", json!({"type": "object"}))]
        }

        async fn call_tool(&self, _name: &str, _arguments: Value) -> Result<Value, ServiceError> {
            Ok(json!("pong"))
        }
    }

    #[tokio::test]
    async fn test_one_response_per_request_line() {
        let input = concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2025-06-18"}}"#,
            "\n\n",
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"pong"}}"#,
            "\n",
        );
        let server = McpServer::new(Arc::new(PingService), 10_000);
        let mut output = Vec::new();
        serve(&server, input.as_bytes(), &mut output).await.unwrap();

        let output = String::from_utf8(output).unwrap();
        let replies: Vec<Value> = output
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0]["id"], 1);
        assert_eq!(replies[0]["result"]["serverInfo"]["name"], "ecs-mcp-server");
        assert_eq!(replies[1]["result"]["content"][0]["text"], "pong");
    }
}
