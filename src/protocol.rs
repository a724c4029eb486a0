//! Runner wire protocol between a guest and the runner proxy.
//!
//! Messages are bare CBOR values with no length prefix, in the shape
//! fortanixvme guests emit: externally tagged enums with named fields.
//! CBOR is self-delimiting, so a reader keeps buffering until one complete
//! value parses. Buffers larger than [`MAX_MESSAGE_SIZE`] are rejected.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::RunnerError;

/// Largest accepted encoded message.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Bytes requested from the stream per read.
const READ_CHUNK: usize = 1024;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Truncated message: connection closed after {received} bytes")]
    Truncated { received: usize },

    #[error("Connection closed")]
    Closed,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_cbor::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ProtocolError> for RunnerError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Io(io) => RunnerError::Io(io),
            other => RunnerError::Protocol(other.to_string()),
        }
    }
}

/// Guest-to-runner request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Open a proxied connection to `addr` (`host:port`).
    Connect { addr: String },
}

/// Runner-to-guest response. A request the runner cannot serve gets no
/// response; the runner closes the connection instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// The remote is connected; the guest should open a data connection to
    /// `port` on the runner.
    Connected {
        port: u16,
        local_addr: String,
        peer_addr: String,
    },
}

/// Encode `message` as one CBOR value.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    let bytes = serde_cbor::to_vec(message)?;
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: bytes.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(bytes)
}

/// Decode exactly one CBOR value held in `bytes`.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: bytes.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(serde_cbor::from_slice(bytes)?)
}

/// Try to parse one value from the front of `buf`. `None` means more bytes
/// are needed.
fn parse_prefix<T: DeserializeOwned>(buf: &[u8]) -> Result<Option<T>, ProtocolError> {
    let mut de = serde_cbor::Deserializer::from_slice(buf);
    match T::deserialize(&mut de) {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_eof() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write one message and flush.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = encode(message)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one message. A close before any byte arrives yields `Closed`.
pub async fn read_message<R, T>(reader: &mut R) -> Result<T, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut buf = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(if buf.is_empty() {
                ProtocolError::Closed
            } else {
                ProtocolError::Truncated {
                    received: buf.len(),
                }
            });
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: buf.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        if let Some(message) = parse_prefix(&buf)? {
            return Ok(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `Request::Connect { addr: "a:1" }` as a fortanixvme guest writes it:
    /// `{"Connect": {"addr": "a:1"}}`.
    const CONNECT_FIXTURE: &[u8] = &[
        0xa1, 0x67, b'C', b'o', b'n', b'n', b'e', b'c', b't', 0xa1, 0x64, b'a', b'd', b'd', b'r',
        0x63, b'a', b':', b'1',
    ];

    #[test]
    fn test_decode_guest_connect_fixture() {
        let req: Request = decode(CONNECT_FIXTURE).unwrap();
        assert_eq!(req, Request::Connect { addr: "a:1".into() });
    }

    #[test]
    fn test_encode_connect_matches_guest_bytes() {
        let bytes = encode(&Request::Connect { addr: "a:1".into() }).unwrap();
        assert_eq!(bytes, CONNECT_FIXTURE);
    }

    #[test]
    fn test_connected_is_externally_tagged() {
        let bytes = encode(&Response::Connected {
            port: 4000,
            local_addr: "vsock:3:10000".into(),
            peer_addr: "vsock:16:1024".into(),
        })
        .unwrap();
        let value: serde_cbor::Value = serde_cbor::from_slice(&bytes).unwrap();
        let serde_cbor::Value::Map(outer) = value else {
            panic!("expected a tagged map");
        };
        assert_eq!(outer.len(), 1);
        let (tag, body) = outer.into_iter().next().unwrap();
        assert_eq!(tag, serde_cbor::Value::Text("Connected".into()));
        let serde_cbor::Value::Map(fields) = body else {
            panic!("expected named fields");
        };
        assert_eq!(
            fields.get(&serde_cbor::Value::Text("port".into())),
            Some(&serde_cbor::Value::Integer(4000))
        );
        assert!(fields.contains_key(&serde_cbor::Value::Text("local_addr".into())));
        assert!(fields.contains_key(&serde_cbor::Value::Text("peer_addr".into())));
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut bytes = CONNECT_FIXTURE.to_vec();
        bytes.push(0x00);
        let result: Result<Request, _> = decode(&bytes);
        assert!(matches!(result, Err(ProtocolError::Serialization(_))));
    }

    #[test]
    fn test_decode_rejects_unknown_variant() {
        let bytes = serde_cbor::to_vec(&serde_cbor::Value::Text("Bind".into())).unwrap();
        let result: Result<Request, _> = decode(&bytes);
        assert!(matches!(result, Err(ProtocolError::Serialization(_))));
    }

    #[test]
    fn test_encode_rejects_oversized_message() {
        let req = Request::Connect {
            addr: "x".repeat(MAX_MESSAGE_SIZE),
        };
        assert!(matches!(
            encode(&req),
            Err(ProtocolError::MessageTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_read_message_across_partial_reads() {
        // A guest may split its write; the reader waits for a complete value.
        let mut mock = tokio_test::io::Builder::new()
            .read(&CONNECT_FIXTURE[..5])
            .read(&CONNECT_FIXTURE[5..])
            .build();
        let req: Request = read_message(&mut mock).await.unwrap();
        assert_eq!(req, Request::Connect { addr: "a:1".into() });
    }

    #[tokio::test]
    async fn test_read_message_clean_close() {
        let mut mock = tokio_test::io::Builder::new().build();
        let result: Result<Request, _> = read_message(&mut mock).await;
        assert!(matches!(result, Err(ProtocolError::Closed)));
    }

    #[tokio::test]
    async fn test_read_message_truncated() {
        let mut mock = tokio_test::io::Builder::new()
            .read(&CONNECT_FIXTURE[..8])
            .build();
        let result: Result<Request, _> = read_message(&mut mock).await;
        assert!(matches!(result, Err(ProtocolError::Truncated { received: 8 })));
    }

    #[tokio::test]
    async fn test_write_message_to_mock_stream() {
        let mut mock = tokio_test::io::Builder::new()
            .write(CONNECT_FIXTURE)
            .build();
        write_message(&mut mock, &Request::Connect { addr: "a:1".into() })
            .await
            .unwrap();
    }

    #[test]
    fn test_protocol_error_maps_to_runner_error() {
        let err: RunnerError = ProtocolError::Closed.into();
        assert!(matches!(err, RunnerError::Protocol(_)));
    }
}
