//! DATA payload schemes.
//!
//! A protocol turns the payload of a DATA frame into a `(method, body)` pair
//! and renders responses and error replies. One protocol is active per
//! server instance; the default is the `method:body` text scheme.

use bytes::Bytes;
use thiserror::Error;

/// A parsed inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    pub method: String,
    pub body: Bytes,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("missing method delimiter")]
    MissingDelimiter,
    #[error("method name is not valid UTF-8")]
    BadMethodEncoding,
}

/// Payload scheme seam. Implementations must be cheap to call per frame.
pub trait WireProtocol: Send + Sync + 'static {
    /// Split a DATA payload into method and body.
    fn parse(&self, payload: &Bytes) -> Result<ParsedRequest, ProtocolError>;

    /// Render a server-side payload for the given method.
    fn serialize(&self, method: &str, body: &[u8]) -> Bytes;

    /// Render an error reply.
    fn serialize_error(&self, code: u32, message: &str) -> Bytes;

    /// Whether text WebSocket messages should be accepted as DATA frames
    /// with id 0 (compatibility mode).
    fn accepts_text(&self) -> bool {
        false
    }
}

/// Default scheme: UTF-8 `method:body`, method is the longest prefix with
/// no `:`. Errors render as `error:<code>:<message>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleTextProtocol;

impl WireProtocol for SimpleTextProtocol {
    fn parse(&self, payload: &Bytes) -> Result<ParsedRequest, ProtocolError> {
        let pos = payload
            .iter()
            .position(|&b| b == b':')
            .ok_or(ProtocolError::MissingDelimiter)?;
        let method = std::str::from_utf8(&payload[..pos])
            .map_err(|_| ProtocolError::BadMethodEncoding)?
            .to_string();
        Ok(ParsedRequest {
            method,
            body: payload.slice(pos + 1..),
        })
    }

    fn serialize(&self, method: &str, body: &[u8]) -> Bytes {
        let mut out = Vec::with_capacity(method.len() + 1 + body.len());
        out.extend_from_slice(method.as_bytes());
        out.push(b':');
        out.extend_from_slice(body);
        Bytes::from(out)
    }

    fn serialize_error(&self, code: u32, message: &str) -> Bytes {
        Bytes::from(format!("error:{code}:{message}"))
    }

    fn accepts_text(&self) -> bool {
        true
    }
}
