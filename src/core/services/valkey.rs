//! ElastiCache Valkey over RESP2

use crate::conversion::arguments::{parse_args, require_non_empty};
use crate::core::config::CacheConfig;
use crate::core::pool::ConnectionPool;
use crate::core::resp::{RespConnection, RespValue};
use crate::core::service::{Service, ServiceError, ServiceKind};
use crate::models::mcp::Tool;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::info;

pub const DEFAULT_PORT: u16 = 6379;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Split `INFO` output into `{section: {field: value}}`
pub fn parse_info(text: &str) -> Value {
    let mut sections = Map::new();
    let mut current = "default".to_string();
    for line in text.lines().map(str::trim) {
        if line.is_empty() {
            continue;
        }
        if let Some(name) = line.strip_prefix("# ") {
            current = name.to_lowercase();
            continue;
        }
        if let Some((field, value)) = line.split_once(':') {
            let section = sections
                .entry(current.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Some(section) = section.as_object_mut() {
                section.insert(field.to_string(), json!(value));
            }
        }
    }
    Value::Object(sections)
}

/// Turn a flat `[field, value, ...]` reply into an object
fn pairs_to_object(reply: &RespValue) -> Value {
    let mut object = Map::new();
    if let RespValue::Array(Some(items)) = reply {
        for pair in items.chunks(2) {
            if let [field, value] = pair {
                if let Value::String(field) = field.to_json() {
                    object.insert(field, value.to_json());
                }
            }
        }
    }
    Value::Object(object)
}

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
struct KeyParams {
    connection_id: String,
    key: String,
}

#[derive(Debug, Deserialize)]
struct StringSetParams {
    connection_id: String,
    key: String,
    value: String,
    #[serde(default)]
    expire_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct HashSetParams {
    connection_id: String,
    key: String,
    field: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct ListPushParams {
    connection_id: String,
    key: String,
    values: Vec<String>,
    #[serde(default)]
    left: bool,
}

#[derive(Debug, Deserialize)]
struct ListRangeParams {
    connection_id: String,
    key: String,
    #[serde(default)]
    start: i64,
    #[serde(default = "default_stop")]
    stop: i64,
}

fn default_stop() -> i64 {
    -1
}

#[derive(Debug, Deserialize)]
struct DeleteParams {
    connection_id: String,
    keys: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ExpireParams {
    connection_id: String,
    key: String,
    seconds: u64,
}

#[derive(Debug, Deserialize)]
struct InfoParams {
    connection_id: String,
    #[serde(default)]
    section: Option<String>,
}

/// Valkey server
pub struct ValkeyService {
    pool: ConnectionPool<RespConnection<TcpStream>>,
    config: CacheConfig,
}

impl ValkeyService {
    pub fn new(pool: ConnectionPool<RespConnection<TcpStream>>, config: CacheConfig) -> Self {
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

    async fn command(&self, connection_id: &str, parts: &[&str]) -> Result<RespValue, ServiceError> {
        let connection = self.pool.get(connection_id).await?;
        let mut connection = connection.lock().await;
        connection.command(parts).await
    }

    async fn connect(&self, p: ConnectParams) -> Result<Value, ServiceError> {
        let host = p
            .host
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| self.config.host.clone());
        let port = p.port.or(self.config.port).unwrap_or(DEFAULT_PORT);

        let mut connection = RespConnection::connect(&host, port, CONNECT_TIMEOUT).await?;
        connection.command(&["PING"]).await?;

        let target = format!("{}:{}", host, port);
        let connection_id = self.pool.insert(target.clone(), connection).await?;
        info!("Connected to Valkey at {} as {}", target, connection_id);
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

    async fn string_set(&self, p: StringSetParams) -> Result<Value, ServiceError> {
        self.ensure_writable("string_set")?;
        require_non_empty("key", &p.key)?;
        let seconds = p.expire_seconds.map(|s| s.to_string());
        let mut parts = vec!["SET", p.key.as_str(), p.value.as_str()];
        if let Some(seconds) = &seconds {
            parts.extend(["EX", seconds.as_str()]);
        }
        self.command(&p.connection_id, &parts).await?;
        Ok(json!({ "success": true, "key": p.key }))
    }

    async fn string_get(&self, p: KeyParams) -> Result<Value, ServiceError> {
        require_non_empty("key", &p.key)?;
        let reply = self.command(&p.connection_id, &["GET", &p.key]).await?;
        Ok(json!({ "key": p.key, "value": reply.to_json() }))
    }

    async fn hash_set(&self, p: HashSetParams) -> Result<Value, ServiceError> {
        self.ensure_writable("hash_set")?;
        require_non_empty("key", &p.key)?;
        let reply = self
            .command(&p.connection_id, &["HSET", &p.key, &p.field, &p.value])
            .await?;
        Ok(json!({ "success": true, "fields_added": reply.to_json() }))
    }

    async fn hash_get_all(&self, p: KeyParams) -> Result<Value, ServiceError> {
        require_non_empty("key", &p.key)?;
        let reply = self.command(&p.connection_id, &["HGETALL", &p.key]).await?;
        Ok(json!({ "key": p.key, "fields": pairs_to_object(&reply) }))
    }

    async fn list_push(&self, p: ListPushParams) -> Result<Value, ServiceError> {
        self.ensure_writable("list_push")?;
        require_non_empty("key", &p.key)?;
        if p.values.is_empty() {
            return Err(ServiceError::invalid("values must not be empty"));
        }
        let verb = if p.left { "LPUSH" } else { "RPUSH" };
        let mut parts = vec![verb, p.key.as_str()];
        parts.extend(p.values.iter().map(String::as_str));
        let reply = self.command(&p.connection_id, &parts).await?;
        Ok(json!({ "success": true, "length": reply.to_json() }))
    }

    async fn list_range(&self, p: ListRangeParams) -> Result<Value, ServiceError> {
        require_non_empty("key", &p.key)?;
        let (start, stop) = (p.start.to_string(), p.stop.to_string());
        let reply = self
            .command(&p.connection_id, &["LRANGE", &p.key, &start, &stop])
            .await?;
        Ok(json!({ "key": p.key, "values": reply.to_json() }))
    }

    async fn delete(&self, p: DeleteParams) -> Result<Value, ServiceError> {
        self.ensure_writable("delete")?;
        if p.keys.is_empty() {
            return Err(ServiceError::invalid("keys must not be empty"));
        }
        let mut parts = vec!["DEL"];
        parts.extend(p.keys.iter().map(String::as_str));
        let reply = self.command(&p.connection_id, &parts).await?;
        Ok(json!({ "success": true, "deleted": reply.to_json() }))
    }

    async fn expire(&self, p: ExpireParams) -> Result<Value, ServiceError> {
        self.ensure_writable("expire")?;
        require_non_empty("key", &p.key)?;
        let seconds = p.seconds.to_string();
        let reply = self
            .command(&p.connection_id, &["EXPIRE", &p.key, &seconds])
            .await?;
        Ok(json!({ "success": reply == RespValue::Integer(1), "key": p.key }))
    }

    async fn ttl(&self, p: KeyParams) -> Result<Value, ServiceError> {
        require_non_empty("key", &p.key)?;
        let reply = self.command(&p.connection_id, &["TTL", &p.key]).await?;
        // -2: missing key, -1: no expiry
        let ttl = match reply {
            RespValue::Integer(n) => n,
            other => return Err(ServiceError::Unexpected(format!("unexpected TTL reply: {:?}", other))),
        };
        Ok(json!({
            "key": p.key,
            "ttl": ttl,
            "exists": ttl != -2,
            "persistent": ttl == -1,
        }))
    }

    async fn server_info(&self, p: InfoParams) -> Result<Value, ServiceError> {
        let mut parts = vec!["INFO"];
        if let Some(section) = p.section.as_deref().filter(|s| !s.is_empty()) {
            parts.push(section);
        }
        let reply = self.command(&p.connection_id, &parts).await?;
        match reply {
            RespValue::Bulk(Some(bytes)) => Ok(parse_info(&String::from_utf8_lossy(&bytes))),
            other => Ok(other.to_json()),
        }
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

#[async_trait]
impl Service for ValkeyService {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Valkey
    }

    fn instructions(&self) -> Option<String> {
        let mut text = String::from(
            "Work with an ElastiCache Valkey cluster. Call connect first and pass the returned \
             connection_id to every other tool.",
        );
        if self.config.readonly {
            text.push_str(" The server is read-only.");
        }
        Some(text)
    }

    fn tools(&self) -> Vec<Tool> {
        let key = json!({ "key": { "type": "string" } });
        vec![
            Tool::new(
                "connect",
                "Connect to a Valkey server",
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
                "string_set",
                "Set a string value",
                schema(
                    json!({
                        "key": { "type": "string" },
                        "value": { "type": "string" },
                        "expire_seconds": { "type": "integer", "minimum": 1 }
                    }),
                    &["key", "value"],
                ),
            ),
            Tool::new("string_get", "Get a string value", schema(key.clone(), &["key"])),
            Tool::new(
                "hash_set",
                "Set a hash field",
                schema(
                    json!({
                        "key": { "type": "string" },
                        "field": { "type": "string" },
                        "value": { "type": "string" }
                    }),
                    &["key", "field", "value"],
                ),
            ),
            Tool::new("hash_get_all", "Get every field of a hash", schema(key.clone(), &["key"])),
            Tool::new(
                "list_push",
                "Append (or prepend) values to a list",
                schema(
                    json!({
                        "key": { "type": "string" },
                        "values": { "type": "array", "items": { "type": "string" } },
                        "left": { "type": "boolean", "description": "Push to the head instead of the tail" }
                    }),
                    &["key", "values"],
                ),
            ),
            Tool::new(
                "list_range",
                "Read a range of list elements",
                schema(
                    json!({
                        "key": { "type": "string" },
                        "start": { "type": "integer", "default": 0 },
                        "stop": { "type": "integer", "default": -1 }
                    }),
                    &["key"],
                ),
            ),
            Tool::new(
                "delete",
                "Delete keys",
                schema(
                    json!({ "keys": { "type": "array", "items": { "type": "string" } } }),
                    &["keys"],
                ),
            ),
            Tool::new(
                "expire",
                "Set a key's time to live",
                schema(
                    json!({ "key": { "type": "string" }, "seconds": { "type": "integer", "minimum": 1 } }),
                    &["key", "seconds"],
                ),
            ),
            Tool::new("ttl", "Get a key's remaining time to live", schema(key, &["key"])),
            Tool::new(
                "server_info",
                "Server information and statistics",
                schema(json!({ "section": { "type": "string" } }), &[]),
            ),
        ]
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, ServiceError> {
        match name {
            "connect" => self.connect(parse_args(arguments)?).await,
            "disconnect" => self.disconnect(parse_args(arguments)?).await,
            "string_set" => self.string_set(parse_args(arguments)?).await,
            "string_get" => self.string_get(parse_args(arguments)?).await,
            "hash_set" => self.hash_set(parse_args(arguments)?).await,
            "hash_get_all" => self.hash_get_all(parse_args(arguments)?).await,
            "list_push" => self.list_push(parse_args(arguments)?).await,
            "list_range" => self.list_range(parse_args(arguments)?).await,
            "delete" => self.delete(parse_args(arguments)?).await,
            "expire" => self.expire(parse_args(arguments)?).await,
            "ttl" => self.ttl(parse_args(arguments)?).await,
            "server_info" => self.server_info(parse_args(arguments)?).await,
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

    /// Fake server answering each received frame with the next scripted reply
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

    fn service(readonly: bool) -> ValkeyService {
        ValkeyService::new(
            ConnectionPool::new(4),
            CacheConfig {
                readonly,
                ..Default::default()
            },
        )
    }

    async fn connect(svc: &ValkeyService, port: u16) -> String {
        let result = svc
            .call_tool("connect", json!({"host": "127.0.0.1", "port": port}))
            .await
            .unwrap();
        result["connection_id"].as_str().unwrap().to_string()
    }

    #[test]
    fn test_parse_info() {
        let info = parse_info("# Server\r\nvalkey_version:8.0.1\r\n\r\n# Clients\r\nconnected_clients:3\r\n");
        assert_eq!(info["server"]["valkey_version"], "8.0.1");
        assert_eq!(info["clients"]["connected_clients"], "3");
    }

    #[tokio::test]
    async fn test_set_with_expiry_and_get() {
        let (port, server) = fake_server(vec![b"+PONG\r\n", b"+OK\r\n", b"$3\r\nbar\r\n"]).await;
        let svc = service(false);
        let id = connect(&svc, port).await;

        svc.call_tool(
            "string_set",
            json!({"connection_id": id, "key": "foo", "value": "bar", "expire_seconds": 60}),
        )
        .await
        .unwrap();
        let result = svc
            .call_tool("string_get", json!({"connection_id": id, "key": "foo"}))
            .await
            .unwrap();
        assert_eq!(result["value"], "bar");

        let received = server.await.unwrap();
        assert_eq!(received[1], "*5\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n$2\r\nEX\r\n$2\r\n60\r\n");
    }

    #[tokio::test]
    async fn test_hash_get_all_becomes_object() {
        let (port, _server) = fake_server(vec![
            b"+PONG\r\n",
            b"*4\r\n$1\r\na\r\n$1\r\n1\r\n$1\r\nb\r\n$1\r\n2\r\n",
        ])
        .await;
        let svc = service(true);
        let id = connect(&svc, port).await;
        let result = svc
            .call_tool("hash_get_all", json!({"connection_id": id, "key": "h"}))
            .await
            .unwrap();
        assert_eq!(result["fields"], json!({"a": "1", "b": "2"}));
    }

    #[tokio::test]
    async fn test_ttl_of_missing_key() {
        let (port, _server) = fake_server(vec![b"+PONG\r\n", b":-2\r\n"]).await;
        let svc = service(false);
        let id = connect(&svc, port).await;
        let result = svc
            .call_tool("ttl", json!({"connection_id": id, "key": "gone"}))
            .await
            .unwrap();
        assert_eq!(result["exists"], false);
    }

    #[tokio::test]
    async fn test_server_error_reply() {
        let (port, _server) = fake_server(vec![
            b"+PONG\r\n",
            b"-WRONGTYPE Operation against a key holding the wrong kind of value\r\n",
        ])
        .await;
        let svc = service(false);
        let id = connect(&svc, port).await;
        let err = svc
            .call_tool("list_range", json!({"connection_id": id, "key": "s"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("WRONGTYPE"));
    }

    #[tokio::test]
    async fn test_readonly_refuses_writes() {
        let svc = service(true);
        for tool in ["string_set", "hash_set", "list_push", "delete", "expire"] {
            let err = svc
                .call_tool(
                    tool,
                    json!({"connection_id": "x", "key": "k", "value": "v", "field": "f",
                           "values": ["v"], "keys": ["k"], "seconds": 1}),
                )
                .await
                .unwrap_err();
            assert!(matches!(err, ServiceError::Forbidden(_)), "{}", tool);
        }
    }

    #[tokio::test]
    async fn test_disconnect_unknown() {
        let err = service(false)
            .call_tool("disconnect", json!({"connection_id": "nope"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }
}
