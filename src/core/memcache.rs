//! Memcached text protocol client

use crate::core::service::ServiceError;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// Longest key the server accepts
pub const MAX_KEY_LEN: usize = 250;

/// Largest value accepted from the server (memcached's own item size ceiling)
const MAX_VALUE_LEN: usize = 1024 * 1024 * 1024;

/// One item returned by `get`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub key: String,
    pub flags: u32,
    pub value: Vec<u8>,
}

/// Storage commands sharing the `<cmd> <key> <flags> <exptime> <bytes>` form
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
}

impl StoreMode {
    fn verb(&self) -> &'static str {
        match self {
            StoreMode::Set => "set",
            StoreMode::Add => "add",
            StoreMode::Replace => "replace",
            StoreMode::Append => "append",
            StoreMode::Prepend => "prepend",
        }
    }
}

/// Reject keys the protocol cannot carry
pub fn validate_key(key: &str) -> Result<(), ServiceError> {
    if key.is_empty() {
        return Err(ServiceError::invalid("key must not be empty"));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(ServiceError::invalid(format!(
            "key exceeds {} bytes: {}",
            MAX_KEY_LEN,
            key.len()
        )));
    }
    if key.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ServiceError::invalid(format!(
            "key must not contain whitespace or control characters: {:?}",
            key
        )));
    }
    Ok(())
}

fn server_error(line: &str) -> Option<ServiceError> {
    if line == "ERROR" || line.starts_with("CLIENT_ERROR") || line.starts_with("SERVER_ERROR") {
        Some(ServiceError::Command {
            program: "memcached".to_string(),
            exit_code: 1,
            stderr: line.to_string(),
        })
    } else {
        None
    }
}

fn unexpected(line: &str) -> ServiceError {
    server_error(line)
        .unwrap_or_else(|| ServiceError::Unexpected(format!("unexpected memcached reply: {:?}", line)))
}

/// A memcached connection over any async byte stream
pub struct MemcacheConnection<S> {
    stream: BufReader<S>,
}

impl MemcacheConnection<TcpStream> {
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, ServiceError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| ServiceError::Connection(format!("timed out connecting to {}:{}", host, port)))?
            .map_err(|e| ServiceError::Connection(format!("{}:{}: {}", host, port, e)))?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> MemcacheConnection<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<(), ServiceError> {
        let writer = self.stream.get_mut();
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String, ServiceError> {
        let mut line = String::new();
        if self.stream.read_line(&mut line).await? == 0 {
            return Err(ServiceError::Connection("connection closed by server".to_string()));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Fetch one or more keys; missing keys are simply absent
    pub async fn get(&mut self, keys: &[String]) -> Result<Vec<Item>, ServiceError> {
        for key in keys {
            validate_key(key)?;
        }
        self.send(format!("get {}\r\n", keys.join(" ")).as_bytes()).await?;

        let mut items = Vec::new();
        loop {
            let line = self.read_line().await?;
            if line == "END" {
                return Ok(items);
            }
            let mut parts = line.split(' ');
            if parts.next() != Some("VALUE") {
                return Err(unexpected(&line));
            }
            let (Some(key), Some(flags), Some(len)) = (parts.next(), parts.next(), parts.next())
            else {
                return Err(unexpected(&line));
            };
            let flags: u32 = flags.parse().map_err(|_| unexpected(&line))?;
            let len: usize = len.parse().map_err(|_| unexpected(&line))?;
            if len > MAX_VALUE_LEN {
                return Err(ServiceError::Unexpected(format!("value too large: {} bytes", len)));
            }

            let mut data = vec![0u8; len + 2];
            self.stream.read_exact(&mut data).await?;
            data.truncate(len);
            items.push(Item {
                key: key.to_string(),
                flags,
                value: data,
            });
        }
    }

    /// Store a value; returns false when the mode's precondition failed
    pub async fn store(
        &mut self,
        mode: StoreMode,
        key: &str,
        value: &[u8],
        flags: u32,
        exptime: u32,
    ) -> Result<bool, ServiceError> {
        validate_key(key)?;
        let mut frame = format!("{} {} {} {} {}\r\n", mode.verb(), key, flags, exptime, value.len())
            .into_bytes();
        frame.extend_from_slice(value);
        frame.extend_from_slice(b"\r\n");
        self.send(&frame).await?;

        match self.read_line().await?.as_str() {
            "STORED" => Ok(true),
            "NOT_STORED" | "NOT_FOUND" | "EXISTS" => Ok(false),
            other => Err(unexpected(other)),
        }
    }

    /// Delete a key; returns false when it did not exist
    pub async fn delete(&mut self, key: &str) -> Result<bool, ServiceError> {
        validate_key(key)?;
        self.send(format!("delete {}\r\n", key).as_bytes()).await?;
        match self.read_line().await?.as_str() {
            "DELETED" => Ok(true),
            "NOT_FOUND" => Ok(false),
            other => Err(unexpected(other)),
        }
    }

    /// Increment (or decrement) a numeric value; None when the key is missing
    pub async fn incr_decr(&mut self, key: &str, delta: u64, decrement: bool) -> Result<Option<u64>, ServiceError> {
        validate_key(key)?;
        let verb = if decrement { "decr" } else { "incr" };
        self.send(format!("{} {} {}\r\n", verb, key, delta).as_bytes()).await?;
        let line = self.read_line().await?;
        if line == "NOT_FOUND" {
            return Ok(None);
        }
        line.parse().map(Some).map_err(|_| unexpected(&line))
    }

    /// Update a key's expiration; returns false when it did not exist
    pub async fn touch(&mut self, key: &str, exptime: u32) -> Result<bool, ServiceError> {
        validate_key(key)?;
        self.send(format!("touch {} {}\r\n", key, exptime).as_bytes()).await?;
        match self.read_line().await?.as_str() {
            "TOUCHED" => Ok(true),
            "NOT_FOUND" => Ok(false),
            other => Err(unexpected(other)),
        }
    }

    /// General-purpose statistics as name/value pairs
    pub async fn stats(&mut self) -> Result<Vec<(String, String)>, ServiceError> {
        self.send(b"stats\r\n").await?;
        let mut stats = Vec::new();
        loop {
            let line = self.read_line().await?;
            if line == "END" {
                return Ok(stats);
            }
            let mut parts = line.splitn(3, ' ');
            match (parts.next(), parts.next(), parts.next()) {
                (Some("STAT"), Some(name), Some(value)) => {
                    stats.push((name.to_string(), value.to_string()))
                }
                _ => return Err(unexpected(&line)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    /// Connection whose server side replies with a fixed script
    fn scripted(reply: &'static [u8]) -> (MemcacheConnection<DuplexStream>, tokio::task::JoinHandle<Vec<u8>>) {
        let (client, mut server) = tokio::io::duplex(4096);
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let n = server.read(&mut buf).await.unwrap();
            server.write_all(reply).await.unwrap();
            buf.truncate(n);
            buf
        });
        (MemcacheConnection::new(client), handle)
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("user:42").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("has space").is_err());
        assert!(validate_key(&"k".repeat(251)).is_err());
    }

    #[tokio::test]
    async fn test_get_multiple() {
        let (mut conn, server) =
            scripted(b"VALUE a 0 2\r\nhi\r\nVALUE b 5 3\r\nx\r\ny\r\nEND\r\n");
        let items = conn.get(&["a".to_string(), "b".to_string(), "c".to_string()]).await.unwrap();
        assert_eq!(server.await.unwrap(), b"get a b c\r\n");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].value, b"hi");
        assert_eq!(items[1].flags, 5);
        assert_eq!(items[1].value, b"x\r\ny");
    }

    #[tokio::test]
    async fn test_oversized_value_length_rejected() {
        let (mut conn, _server) = scripted(b"VALUE a 0 18446744073709551615\r\n");
        let err = conn.get(&["a".to_string()]).await.unwrap_err();
        assert!(matches!(err, ServiceError::Unexpected(ref m) if m.contains("too large")));
    }

    #[tokio::test]
    async fn test_store_frames_value() {
        let (mut conn, server) = scripted(b"NOT_STORED\r\n");
        let stored = conn.store(StoreMode::Add, "k", b"value", 1, 60).await.unwrap();
        assert!(!stored);
        assert_eq!(server.await.unwrap(), b"add k 1 60 5\r\nvalue\r\n");
    }

    #[tokio::test]
    async fn test_incr_missing_key() {
        let (mut conn, _server) = scripted(b"NOT_FOUND\r\n");
        assert_eq!(conn.incr_decr("n", 1, false).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_server_error_surfaces() {
        let (mut conn, _server) = scripted(b"SERVER_ERROR out of memory\r\n");
        let err = conn.store(StoreMode::Set, "k", b"v", 0, 0).await.unwrap_err();
        assert!(err.to_string().contains("out of memory"));
    }

    #[tokio::test]
    async fn test_stats() {
        let (mut conn, _server) = scripted(b"STAT pid 12\r\nSTAT version 1.6.21\r\nEND\r\n");
        let stats = conn.stats().await.unwrap();
        assert_eq!(stats[1], ("version".to_string(), "1.6.21".to_string()));
    }
}
