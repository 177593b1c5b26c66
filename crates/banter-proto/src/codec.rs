//! Codec for encoding and decoding banter envelopes.
//!
//! Envelopes are single JSON objects. Over message-oriented transports
//! (WebSocket) each transport message carries exactly one envelope; over
//! byte streams envelopes are newline-delimited and [`decode_from`]
//! handles partial reads.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::envelope::{ClientMsg, ServerMsg};

/// Maximum envelope size (1 MiB). Larger payloads are rejected before
/// parsing so a hostile client cannot balloon the decode buffer.
pub const MAX_ENVELOPE_SIZE: usize = 1024 * 1024;

/// Errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Envelope exceeds maximum size.
    #[error("Envelope size {0} exceeds maximum {MAX_ENVELOPE_SIZE}")]
    TooLarge(usize),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Structurally valid JSON that is not a valid envelope.
    #[error("Malformed envelope: {0}")]
    Malformed(String),
}

/// Encode a server envelope to bytes, newline-terminated.
///
/// # Errors
///
/// Returns an error if the envelope is too large or serialization fails.
pub fn encode(msg: &ServerMsg) -> Result<Bytes, ProtocolError> {
    encode_any(msg)
}

/// Encode a client envelope to bytes, newline-terminated.
///
/// # Errors
///
/// Returns an error if the envelope is too large or serialization fails.
pub fn encode_client(msg: &ClientMsg) -> Result<Bytes, ProtocolError> {
    encode_any(msg)
}

fn encode_any<M: Serialize>(msg: &M) -> Result<Bytes, ProtocolError> {
    let payload = serde_json::to_vec(msg)?;

    if payload.len() > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::TooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(payload.len() + 1);
    buf.extend_from_slice(&payload);
    buf.put_u8(b'\n');

    Ok(buf.freeze())
}

/// Decode a client envelope from a complete buffer.
///
/// # Errors
///
/// Returns an error if the data is oversized or not a valid envelope.
pub fn decode(data: &[u8]) -> Result<ClientMsg, ProtocolError> {
    decode_any(data)
}

/// Decode a server envelope from a complete buffer (client side, tests).
///
/// # Errors
///
/// Returns an error if the data is oversized or not a valid envelope.
pub fn decode_server(data: &[u8]) -> Result<ServerMsg, ProtocolError> {
    decode_any(data)
}

fn decode_any<M: DeserializeOwned>(data: &[u8]) -> Result<M, ProtocolError> {
    if data.len() > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::TooLarge(data.len()));
    }
    Ok(serde_json::from_slice(trim_newline(data))?)
}

fn trim_newline(data: &[u8]) -> &[u8] {
    let mut end = data.len();
    while end > 0 && (data[end - 1] == b'\n' || data[end - 1] == b'\r') {
        end -= 1;
    }
    &data[..end]
}

/// Try to decode one client envelope from a stream buffer, advancing it
/// past the envelope if successful.
///
/// Returns `Ok(Some(msg))` if a complete envelope was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
///
/// # Errors
///
/// Returns an error if the pending envelope is oversized or invalid.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<ClientMsg>, ProtocolError> {
    loop {
        let Some(pos) = buf.iter().position(|&b| b == b'\n') else {
            if buf.len() > MAX_ENVELOPE_SIZE {
                return Err(ProtocolError::TooLarge(buf.len()));
            }
            return Ok(None);
        };

        if pos > MAX_ENVELOPE_SIZE {
            return Err(ProtocolError::TooLarge(pos));
        }

        let line = buf.split_to(pos);
        buf.advance(1);

        if line.iter().all(u8::is_ascii_whitespace) {
            // Bare keepalive newline; keep scanning.
            continue;
        }

        return Ok(Some(serde_json::from_slice(trim_newline(&line))?));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{ClientPub, ServerCtrl};
    use serde_json::json;

    #[test]
    fn test_encode_decode_roundtrip() {
        let msg = ClientMsg::Pub(ClientPub {
            id: "1".into(),
            topic: "grpX".into(),
            head: None,
            content: json!("hello"),
        });

        let encoded = encode_client(&msg).unwrap();
        assert_eq!(encoded.last(), Some(&b'\n'));
        let decoded = decode(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_server_roundtrip() {
        let msg = ServerMsg::Ctrl(ServerCtrl {
            id: "1".into(),
            topic: "grpX".into(),
            code: 202,
            text: "accepted".into(),
            params: None,
            ts: 1234,
        });

        let encoded = encode(&msg).unwrap();
        let decoded = decode_server(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode(b"{\"frob\":{}}").is_err());
        assert!(decode(b"not json").is_err());
    }

    #[test]
    fn test_decode_too_large() {
        let big = vec![b'x'; MAX_ENVELOPE_SIZE + 1];
        match decode(&big) {
            Err(ProtocolError::TooLarge(_)) => {}
            other => panic!("expected TooLarge, got {other:?}"),
        }
    }

    #[test]
    fn test_streaming_decode() {
        let msg1 = ClientMsg::Pub(ClientPub {
            id: "1".into(),
            topic: "a".into(),
            head: None,
            content: json!(1),
        });
        let msg2 = ClientMsg::Pub(ClientPub {
            id: "2".into(),
            topic: "b".into(),
            head: None,
            content: json!(2),
        });

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_client(&msg1).unwrap());
        buf.extend_from_slice(&encode_client(&msg2).unwrap());

        assert_eq!(decode_from(&mut buf).unwrap(), Some(msg1));
        assert_eq!(decode_from(&mut buf).unwrap(), Some(msg2));
        assert!(buf.is_empty());
        assert_eq!(decode_from(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_streaming_partial() {
        let msg = ClientMsg::Pub(ClientPub {
            id: "1".into(),
            topic: "a".into(),
            head: None,
            content: json!(1),
        });
        let encoded = encode_client(&msg).unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encoded[..encoded.len() / 2]);
        assert_eq!(decode_from(&mut buf).unwrap(), None);

        buf.extend_from_slice(&encoded[encoded.len() / 2..]);
        assert_eq!(decode_from(&mut buf).unwrap(), Some(msg));
    }
}
