//! ElastiCache Memcached over the text protocol

use crate::conversion::arguments::parse_args;
use crate::core::config::CacheConfig;
use crate::core::memcache::{MemcacheConnection, StoreMode, validate_key};
use crate::core::pool::ConnectionPool;
use crate::core::service::{Service, ServiceError, ServiceKind};
use crate::models::mcp::Tool;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::info;

pub const DEFAULT_PORT: u16 = 11211;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct ConnectParams {
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct ConnectionParams {
    connection_id: String,
}

#[derive(Debug, Deserialize)]
struct GetParams {
    connection_id: String,
    keys: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct StoreParams {
    connection_id: String,
    key: String,
    value: String,
    /// Seconds; 0 never expires
    #[serde(default)]
    expire: u32,
    #[serde(default)]
    flags: u32,
}

#[derive(Debug, Deserialize)]
struct KeyParams {
    connection_id: String,
    key: String,
}

#[derive(Debug, Deserialize)]
struct DeltaParams {
    connection_id: String,
    key: String,
    #[serde(default = "default_delta")]
    delta: u64,
}

fn default_delta() -> u64 {
    1
}

#[derive(Debug, Deserialize)]
struct TouchParams {
    connection_id: String,
    key: String,
    expire: u32,
}

/// Memcached server
pub struct MemcachedService {
    pool: ConnectionPool<MemcacheConnection<TcpStream>>,
    config: CacheConfig,
}

impl MemcachedService {
    pub fn new(pool: ConnectionPool<MemcacheConnection<TcpStream>>, config: CacheConfig) -> Self {
        Self { pool, config }
    }

    fn ensure_writable(&self, tool: &str) -> Result<(), ServiceError> {
        if self.config.readonly {
            return Err(ServiceError::Forbidden(format!(
                "{} is disabled in read-only mode",
                tool
            )));
        }
        Ok(())
    }

    async fn connect(&self, p: ConnectParams) -> Result<Value, ServiceError> {
        let host = p
            .host
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| self.config.host.clone());
        let port = p.port.or(self.config.port).unwrap_or(DEFAULT_PORT);

        let mut connection = MemcacheConnection::connect(&host, port, CONNECT_TIMEOUT).await?;
        // memcached accepts connections lazily; a stats round trip proves it speaks the protocol
        connection.stats().await?;

        let target = format!("{}:{}", host, port);
        let connection_id = self.pool.insert(target.clone(), connection).await?;
        info!("Connected to memcached at {} as {}", target, connection_id);
        Ok(json!({ "connection_id": connection_id, "message": format!("Connected to {}", target) }))
    }

    async fn disconnect(&self, p: ConnectionParams) -> Result<Value, ServiceError> {
        if !self.pool.remove(&p.connection_id).await {
            return Err(ServiceError::NotFound(format!(
                "connection '{}' does not exist",
                p.connection_id
            )));
        }
        Ok(json!({ "success": true, "message": format!("Closed connection {}", p.connection_id) }))
    }

    async fn get(&self, p: GetParams) -> Result<Value, ServiceError> {
        if p.keys.is_empty() {
            return Err(ServiceError::invalid("keys must not be empty"));
        }
        let connection = self.pool.get(&p.connection_id).await?;
        let items = connection.lock().await.get(&p.keys).await?;

        let mut values = Map::new();
        for item in items {
            values.insert(
                item.key,
                json!({
                    "value": String::from_utf8_lossy(&item.value),
                    "flags": item.flags,
                }),
            );
        }
        let missing: Vec<&String> = p.keys.iter().filter(|k| !values.contains_key(*k)).collect();
        Ok(json!({ "values": values, "missing": missing }))
    }

    async fn store(&self, mode: StoreMode, tool: &str, p: StoreParams) -> Result<Value, ServiceError> {
        self.ensure_writable(tool)?;
        validate_key(&p.key)?;
        let connection = self.pool.get(&p.connection_id).await?;
        let stored = connection
            .lock()
            .await
            .store(mode, &p.key, p.value.as_bytes(), p.flags, p.expire)
            .await?;
        let message = match (stored, mode) {
            (true, _) => "stored",
            (false, StoreMode::Add) => "key already exists",
            (false, StoreMode::Replace) => "key does not exist",
            (false, _) => "not stored",
        };
        Ok(json!({ "success": stored, "key": p.key, "message": message }))
    }

    async fn delete(&self, p: KeyParams) -> Result<Value, ServiceError> {
        self.ensure_writable("cache_delete")?;
        let connection = self.pool.get(&p.connection_id).await?;
        let deleted = connection.lock().await.delete(&p.key).await?;
        Ok(json!({ "success": deleted, "key": p.key }))
    }

    async fn incr_decr(&self, p: DeltaParams, decrement: bool) -> Result<Value, ServiceError> {
        self.ensure_writable(if decrement { "cache_decr" } else { "cache_incr" })?;
        let connection = self.pool.get(&p.connection_id).await?;
        let value = connection
            .lock()
            .await
            .incr_decr(&p.key, p.delta, decrement)
            .await?;
        Ok(match value {
            Some(value) => json!({ "success": true, "key": p.key, "value": value }),
            None => json!({ "success": false, "key": p.key, "message": "key does not exist" }),
        })
    }

    async fn touch(&self, p: TouchParams) -> Result<Value, ServiceError> {
        self.ensure_writable("cache_touch")?;
        let connection = self.pool.get(&p.connection_id).await?;
        let touched = connection.lock().await.touch(&p.key, p.expire).await?;
        Ok(json!({ "success": touched, "key": p.key }))
    }

    async fn stats(&self, p: ConnectionParams) -> Result<Value, ServiceError> {
        let connection = self.pool.get(&p.connection_id).await?;
        let stats = connection.lock().await.stats().await?;
        let stats: Map<String, Value> = stats.into_iter().map(|(k, v)| (k, Value::String(v))).collect();
        Ok(json!({ "stats": stats }))
    }
}

fn schema(properties: Value, required: &[&str]) -> Value {
    let mut props = json!({ "connection_id": { "type": "string" } });
    if let (Some(props), Some(extra)) = (props.as_object_mut(), properties.as_object()) {
        props.extend(extra.clone());
    }
    let mut all_required = vec!["connection_id"];
    all_required.extend_from_slice(required);
    json!({ "type": "object", "properties": props, "required": all_required })
}

fn store_schema() -> Value {
    schema(
        json!({
            "key": { "type": "string", "maxLength": 250 },
            "value": { "type": "string" },
            "expire": { "type": "integer", "minimum": 0, "description": "Seconds; 0 never expires" },
            "flags": { "type": "integer", "minimum": 0 }
        }),
        &["key", "value"],
    )
}

#[async_trait]
impl Service for MemcachedService {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Memcached
    }

    fn instructions(&self) -> Option<String> {
        let mut text = String::from(
            "Work with an ElastiCache Memcached cluster. Call connect first and pass the returned \
             connection_id to every other tool. Keys are at most 250 bytes without whitespace.",
        );
        if self.config.readonly {
            text.push_str(" The server is read-only.");
        }
        Some(text)
    }

    fn tools(&self) -> Vec<Tool> {
        let key = json!({ "key": { "type": "string" } });
        let delta = json!({
            "key": { "type": "string" },
            "delta": { "type": "integer", "minimum": 0, "default": 1 }
        });
        vec![
            Tool::new(
                "connect",
                "Connect to a memcached server",
                json!({
                    "type": "object",
                    "properties": {
                        "host": { "type": "string" },
                        "port": { "type": "integer" }
                    }
                }),
            ),
            Tool::new("disconnect", "Close a connection", schema(json!({}), &[])),
            Tool::new(
                "cache_get",
                "Get one or more values",
                schema(
                    json!({ "keys": { "type": "array", "items": { "type": "string" } } }),
                    &["keys"],
                ),
            ),
            Tool::new("cache_set", "Store a value", store_schema()),
            Tool::new("cache_add", "Store a value only if the key does not exist", store_schema()),
            Tool::new("cache_replace", "Store a value only if the key exists", store_schema()),
            Tool::new("cache_delete", "Delete a key", schema(key.clone(), &["key"])),
            Tool::new("cache_incr", "Increment a numeric value", schema(delta.clone(), &["key"])),
            Tool::new("cache_decr", "Decrement a numeric value, stopping at 0", schema(delta, &["key"])),
            Tool::new(
                "cache_touch",
                "Update a key's expiration",
                schema(
                    json!({ "key": { "type": "string" }, "expire": { "type": "integer", "minimum": 0 } }),
                    &["key", "expire"],
                ),
            ),
            Tool::new("cache_stats", "Server statistics", schema(json!({}), &[])),
        ]
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, ServiceError> {
        match name {
            "connect" => self.connect(parse_args(arguments)?).await,
            "disconnect" => self.disconnect(parse_args(arguments)?).await,
            "cache_get" => self.get(parse_args(arguments)?).await,
            "cache_set" => self.store(StoreMode::Set, name, parse_args(arguments)?).await,
            "cache_add" => self.store(StoreMode::Add, name, parse_args(arguments)?).await,
            "cache_replace" => self.store(StoreMode::Replace, name, parse_args(arguments)?).await,
            "cache_delete" => self.delete(parse_args(arguments)?).await,
            "cache_incr" => self.incr_decr(parse_args(arguments)?, false).await,
            "cache_decr" => self.incr_decr(parse_args(arguments)?, true).await,
            "cache_touch" => self.touch(parse_args(arguments)?).await,
            "cache_stats" => self.stats(parse_args(arguments)?).await,
            other => Err(ServiceError::UnknownTool(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    async fn fake_server(replies: Vec<&'static [u8]>) -> (u16, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            for reply in replies {
                let mut buf = vec![0u8; 4096];
                let n = socket.read(&mut buf).await.unwrap();
                received.push(String::from_utf8_lossy(&buf[..n]).into_owned());
                socket.write_all(reply).await.unwrap();
            }
            received
        });
        (port, handle)
    }

    fn service(readonly: bool) -> MemcachedService {
        MemcachedService::new(
            ConnectionPool::new(4),
            CacheConfig {
                readonly,
                ..Default::default()
            },
        )
    }

    async fn connect(svc: &MemcachedService, port: u16) -> String {
        let result = svc
            .call_tool("connect", json!({"host": "127.0.0.1", "port": port}))
            .await
            .unwrap();
        result["connection_id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let (port, server) = fake_server(vec![
            b"STAT pid 1\r\nEND\r\n",
            b"STORED\r\n",
            b"VALUE greeting 7 5\r\nhello\r\nEND\r\n",
        ])
        .await;
        let svc = service(false);
        let id = connect(&svc, port).await;

        let set = svc
            .call_tool(
                "cache_set",
                json!({"connection_id": id, "key": "greeting", "value": "hello", "expire": 30, "flags": 7}),
            )
            .await
            .unwrap();
        assert_eq!(set["success"], true);

        let got = svc
            .call_tool("cache_get", json!({"connection_id": id, "keys": ["greeting", "other"]}))
            .await
            .unwrap();
        assert_eq!(got["values"]["greeting"]["value"], "hello");
        assert_eq!(got["values"]["greeting"]["flags"], 7);
        assert_eq!(got["missing"], json!(["other"]));

        let received = server.await.unwrap();
        assert_eq!(received[1], "set greeting 7 30 5\r\nhello\r\n");
        assert_eq!(received[2], "get greeting other\r\n");
    }

    #[tokio::test]
    async fn test_add_existing_key() {
        let (port, _server) = fake_server(vec![b"END\r\n", b"NOT_STORED\r\n"]).await;
        let svc = service(false);
        let id = connect(&svc, port).await;
        let result = svc
            .call_tool("cache_add", json!({"connection_id": id, "key": "k", "value": "v"}))
            .await
            .unwrap();
        assert_eq!(result["success"], false);
        assert_eq!(result["message"], "key already exists");
    }

    #[tokio::test]
    async fn test_incr_missing_key() {
        let (port, _server) = fake_server(vec![b"END\r\n", b"NOT_FOUND\r\n"]).await;
        let svc = service(false);
        let id = connect(&svc, port).await;
        let result = svc
            .call_tool("cache_incr", json!({"connection_id": id, "key": "counter"}))
            .await
            .unwrap();
        assert_eq!(result["success"], false);
    }

    #[tokio::test]
    async fn test_invalid_key_rejected_before_io() {
        let svc = service(false);
        let err = svc
            .call_tool("cache_set", json!({"connection_id": "x", "key": "has space", "value": "v"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn test_readonly_refuses_writes() {
        let svc = service(true);
        for tool in ["cache_set", "cache_add", "cache_replace", "cache_delete", "cache_incr", "cache_decr", "cache_touch"] {
            let err = svc
                .call_tool(tool, json!({"connection_id": "x", "key": "k", "value": "v", "expire": 1}))
                .await
                .unwrap_err();
            assert!(matches!(err, ServiceError::Forbidden(_)), "{}", tool);
        }
    }
}
