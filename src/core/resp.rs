//! Minimal RESP2 client for Valkey
//!
//! Commands are sent as arrays of bulk strings; replies are decoded into
//! [`RespValue`]. The codec is generic over async streams so it can be
//! exercised against in-memory buffers.

use crate::core::service::ServiceError;
use serde_json::{Value, json};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// Upper bound on a single bulk string, matching the server default
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Decoded RESP2 reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    /// JSON form used in tool results
    pub fn to_json(&self) -> Value {
        match self {
            RespValue::Simple(s) => json!(s),
            RespValue::Error(e) => json!({ "error": e }),
            RespValue::Integer(i) => json!(i),
            RespValue::Bulk(None) | RespValue::Array(None) => Value::Null,
            RespValue::Bulk(Some(bytes)) => json!(String::from_utf8_lossy(bytes)),
            RespValue::Array(Some(items)) => {
                Value::Array(items.iter().map(RespValue::to_json).collect())
            }
        }
    }

    /// Turn a `-ERR` reply into an error
    pub fn into_result(self) -> Result<RespValue, ServiceError> {
        match self {
            RespValue::Error(message) => Err(ServiceError::Command {
                program: "valkey".to_string(),
                exit_code: 1,
                stderr: message,
            }),
            other => Ok(other),
        }
    }
}

/// Encode a command as a RESP array of bulk strings
pub fn encode_command<S: AsRef<[u8]>>(parts: &[S]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", parts.len()).into_bytes();
    for part in parts {
        let bytes = part.as_ref();
        out.extend_from_slice(format!("${}\r\n", bytes.len()).as_bytes());
        out.extend_from_slice(bytes);
        out.extend_from_slice(b"\r\n");
    }
    out
}

async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<String, ServiceError> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(ServiceError::Connection("connection closed by server".to_string()));
    }
    if !line.ends_with("\r\n") {
        return Err(ServiceError::Unexpected(format!("malformed RESP line: {:?}", line)));
    }
    line.truncate(line.len() - 2);
    Ok(line)
}

fn parse_int(text: &str) -> Result<i64, ServiceError> {
    text.parse()
        .map_err(|_| ServiceError::Unexpected(format!("invalid RESP integer: {:?}", text)))
}

/// Read one reply from the stream
pub fn read_value<R>(reader: &mut R) -> Pin<Box<dyn Future<Output = Result<RespValue, ServiceError>> + Send + '_>>
where
    R: AsyncBufRead + Unpin + Send,
{
    Box::pin(async move {
        let line = read_line(reader).await?;
        let (marker, rest) = line.split_at(line.chars().next().map(char::len_utf8).unwrap_or(0));
        match marker {
            "+" => Ok(RespValue::Simple(rest.to_string())),
            "-" => Ok(RespValue::Error(rest.to_string())),
            ":" => Ok(RespValue::Integer(parse_int(rest)?)),
            "$" => {
                let len = parse_int(rest)?;
                if len < 0 {
                    return Ok(RespValue::Bulk(None));
                }
                if len > MAX_BULK_LEN {
                    return Err(ServiceError::Unexpected(format!("bulk string too large: {}", len)));
                }
                let mut buf = vec![0u8; len as usize + 2];
                reader.read_exact(&mut buf).await?;
                if &buf[len as usize..] != b"\r\n" {
                    return Err(ServiceError::Unexpected("bulk string missing terminator".to_string()));
                }
                buf.truncate(len as usize);
                Ok(RespValue::Bulk(Some(buf)))
            }
            "*" => {
                let len = parse_int(rest)?;
                if len < 0 {
                    return Ok(RespValue::Array(None));
                }
                let mut items = Vec::with_capacity(len.min(1024) as usize);
                for _ in 0..len {
                    items.push(read_value(&mut *reader).await?);
                }
                Ok(RespValue::Array(Some(items)))
            }
            _ => Err(ServiceError::Unexpected(format!("unknown RESP type in {:?}", line))),
        }
    })
}

/// A RESP connection over any async byte stream
pub struct RespConnection<S> {
    stream: BufReader<S>,
}

impl RespConnection<TcpStream> {
    /// Open a TCP connection to a Valkey server
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, ServiceError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| ServiceError::Connection(format!("timed out connecting to {}:{}", host, port)))?
            .map_err(|e| ServiceError::Connection(format!("{}:{}: {}", host, port, e)))?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> RespConnection<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    /// Send one command and wait for its reply
    pub async fn command<P: AsRef<[u8]>>(&mut self, parts: &[P]) -> Result<RespValue, ServiceError> {
        let frame = encode_command(parts);
        self.stream.get_mut().write_all(&frame).await?;
        self.stream.get_mut().flush().await?;
        read_value(&mut self.stream).await?.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn decode(bytes: &[u8]) -> Result<RespValue, ServiceError> {
        let mut reader = BufReader::new(bytes);
        read_value(&mut reader).await
    }

    #[test]
    fn test_encode_command() {
        assert_eq!(
            encode_command(&["SET", "k", "v v"]),
            b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$3\r\nv v\r\n".to_vec()
        );
    }

    #[tokio::test]
    async fn test_decode_scalars() {
        assert_eq!(decode(b"+OK\r\n").await.unwrap(), RespValue::Simple("OK".into()));
        assert_eq!(decode(b":-3\r\n").await.unwrap(), RespValue::Integer(-3));
        assert_eq!(decode(b"$-1\r\n").await.unwrap(), RespValue::Bulk(None));
        assert_eq!(
            decode(b"$5\r\nhe\r\no\r\n").await.unwrap(),
            RespValue::Bulk(Some(b"he\r\no".to_vec()))
        );
        assert_eq!(
            decode(b"-WRONGTYPE bad\r\n").await.unwrap(),
            RespValue::Error("WRONGTYPE bad".into())
        );
    }

    #[tokio::test]
    async fn test_decode_nested_array() {
        let value = decode(b"*2\r\n$1\r\na\r\n*1\r\n:1\r\n").await.unwrap();
        assert_eq!(value.to_json(), json!(["a", [1]]));
    }

    #[tokio::test]
    async fn test_decode_truncated_input() {
        assert!(decode(b"$10\r\nshort\r\n").await.is_err());
        assert!(matches!(decode(b"").await, Err(ServiceError::Connection(_))));
        assert!(decode(b"?what\r\n").await.is_err());
    }

    #[tokio::test]
    async fn test_command_round_trip_over_duplex() {
        let (client, mut server) = tokio::io::duplex(1024);
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; 64];
            let n = server.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n");
            server.write_all(b"$3\r\nval\r\n").await.unwrap();
        });

        let mut conn = RespConnection::new(client);
        let reply = conn.command(&["GET", "k"]).await.unwrap();
        assert_eq!(reply.to_json(), json!("val"));
        handle.await.unwrap();
    }

    #[test]
    fn test_error_reply_into_result() {
        let err = RespValue::Error("ERR unknown command".into()).into_result().unwrap_err();
        assert!(err.to_string().contains("unknown command"));
    }
}
