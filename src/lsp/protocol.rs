// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! JSON-RPC message types and Content-Length framing.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// `MethodNotFound` error code.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// `InternalError` error code.
pub const INTERNAL_ERROR: i64 = -32603;
/// `RequestCancelled` error code (LSP specific).
pub const REQUEST_CANCELLED: i64 = -32800;

const JSONRPC_VERSION: &str = "2.0";

/// Largest message body accepted from a server.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Largest header block accepted before the blank line.
const MAX_HEADER_BYTES: usize = 8 * 1024;

fn default_null() -> serde_json::Value {
    serde_json::Value::Null
}

/// A request or notification sent by either side.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RequestMessage {
    /// Protocol version, always `"2.0"`.
    pub jsonrpc: String,
    /// Correlation id.
    pub id: RequestId,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(default = "default_null")]
    pub params: serde_json::Value,
}

impl RequestMessage {
    /// Builds a request with the given id.
    pub fn new(id: RequestId, method: &str, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// A response to a request.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ResponseMessage {
    /// Protocol version, always `"2.0"`.
    pub jsonrpc: String,
    /// Id of the request being answered.
    pub id: Option<RequestId>,
    /// Successful result.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error result.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl ResponseMessage {
    /// Builds a successful response.
    pub fn ok(id: RequestId, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            // A JSON null result must still be serialized as `"result": null`
            result: Some(result),
            error: None,
        }
    }

    /// Builds an error response.
    pub fn err(id: RequestId, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            result: None,
            error: Some(ResponseError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// A notification (no response expected).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NotificationMessage {
    /// Protocol version, always `"2.0"`.
    pub jsonrpc: String,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(default = "default_null")]
    pub params: serde_json::Value,
}

impl NotificationMessage {
    /// Builds a notification.
    pub fn new(method: &str, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC request id.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric id.
    Number(i64),
    /// String id.
    String(String),
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

/// JSON-RPC error object.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ResponseError {
    /// Error code.
    pub code: i64,
    /// Error message.
    pub message: String,
    /// Optional payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// A decoded message received from the server.
#[derive(Debug)]
pub enum Incoming {
    /// Server to client request.
    Request(RequestMessage),
    /// Server to client notification.
    Notification(NotificationMessage),
    /// Response to one of our requests.
    Response(ResponseMessage),
}

impl Incoming {
    /// Classifies a raw JSON message body.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is not valid JSON or matches no message shape.
    pub fn parse(body: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(body)?;

        if value.get("method").is_some() {
            if value.get("id").is_some() {
                return Ok(Self::Request(serde_json::from_value(value)?));
            }
            return Ok(Self::Notification(serde_json::from_value(value)?));
        }

        if value.get("id").is_some() {
            return Ok(Self::Response(serde_json::from_value(value)?));
        }

        Err(Error::Json(format!("unknown message format: {body}")))
    }
}

/// Serializes a message with its Content-Length header.
///
/// # Errors
///
/// Returns an error if the message cannot be serialized.
pub fn encode_message<T: Serialize>(message: &T) -> Result<Bytes> {
    let body = serde_json::to_vec(message)?;
    let header = format!("Content-Length: {}\r\n\r\n", body.len());

    let mut frame = BytesMut::with_capacity(header.len() + body.len());
    frame.put_slice(header.as_bytes());
    frame.put_slice(&body);
    Ok(frame.freeze())
}

/// Helper to parse the Content-Length header and body from a buffer.
///
/// Returns `Ok(None)` until a complete frame is buffered.
///
/// # Errors
///
/// Returns an error if the headers are malformed, the frame is larger than
/// [`MAX_FRAME_BYTES`], or the body is not UTF-8.
pub fn try_parse_message(buffer: &mut BytesMut) -> Result<Option<String>> {
    let Some(header_end) = buffer.windows(4).position(|w| w == b"\r\n\r\n") else {
        if buffer.len() > MAX_HEADER_BYTES {
            return Err(Error::Json(format!(
                "no end of headers within {MAX_HEADER_BYTES} bytes"
            )));
        }
        return Ok(None);
    };

    let headers = std::str::from_utf8(&buffer[..header_end])
        .map_err(|e| Error::Json(format!("failed to parse headers as UTF-8: {e}")))?;

    let mut content_length = None;
    for line in headers.lines() {
        if let Some((name, value)) = line.split_once(':')
            && name.trim().eq_ignore_ascii_case("content-length")
        {
            content_length = Some(
                value
                    .trim()
                    .parse::<usize>()
                    .map_err(|e| Error::Json(format!("invalid Content-Length: {e}")))?,
            );
        }
    }

    let Some(content_len) = content_length else {
        return Err(Error::Json("missing Content-Length header".to_string()));
    };
    if content_len > MAX_FRAME_BYTES {
        return Err(Error::Json(format!(
            "Content-Length {content_len} exceeds the {MAX_FRAME_BYTES} byte limit"
        )));
    }

    let header_len = header_end + 4;
    if buffer.len() < header_len + content_len {
        return Ok(None);
    }

    buffer.advance(header_len);
    let message_bytes = buffer.split_to(content_len);
    String::from_utf8(message_bytes.to_vec())
        .map(Some)
        .map_err(|e| Error::Json(format!("message body is not UTF-8: {e}")))
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    reason = "Tests use unwrap for clear failure messages"
)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_complete_message() {
        let body = r#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#;
        let raw = format!("Content-Length: {}\r\n\r\n{}", body.len(), body);
        let mut buffer = BytesMut::from(raw.as_str());

        let result = try_parse_message(&mut buffer).unwrap();
        assert_eq!(result, Some(body.to_string()));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_parse_incomplete_header() {
        let mut buffer = BytesMut::from("Content-Length: 10\r\n");
        let result = try_parse_message(&mut buffer).unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn test_parse_incomplete_body() {
        let mut buffer = BytesMut::from("Content-Length: 100\r\n\r\n{\"partial\":");
        let result = try_parse_message(&mut buffer).unwrap();
        assert_eq!(result, None);
        // Nothing consumed until the frame is complete
        assert!(buffer.starts_with(b"Content-Length"));
    }

    #[test]
    fn test_parse_multiple_messages() {
        let body1 = r#"{"jsonrpc":"2.0","id":1}"#;
        let body2 = r#"{"jsonrpc":"2.0","id":2}"#;
        let raw = format!(
            "Content-Length: {}\r\n\r\n{}Content-Length: {}\r\n\r\n{}",
            body1.len(),
            body1,
            body2.len(),
            body2
        );
        let mut buffer = BytesMut::from(raw.as_str());

        let result1 = try_parse_message(&mut buffer).unwrap();
        assert_eq!(result1, Some(body1.to_string()));

        let result2 = try_parse_message(&mut buffer).unwrap();
        assert_eq!(result2, Some(body2.to_string()));

        assert!(buffer.is_empty());
    }

    #[test]
    fn test_parse_case_insensitive_header_with_content_type() {
        let body = r#"{"test":true}"#;
        let raw = format!(
            "content-length: {}\r\nContent-Type: application/vscode-jsonrpc; charset=utf-8\r\n\r\n{}",
            body.len(),
            body
        );
        let mut buffer = BytesMut::from(raw.as_str());

        let result = try_parse_message(&mut buffer).unwrap();
        assert_eq!(result, Some(body.to_string()));
    }

    #[test]
    fn test_missing_content_length_is_an_error() {
        let mut buffer = BytesMut::from("Content-Type: foo\r\n\r\n{}");
        assert!(try_parse_message(&mut buffer).is_err());
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let raw = format!("Content-Length: {}\r\n\r\n{{", MAX_FRAME_BYTES + 1);
        let mut buffer = BytesMut::from(raw.as_str());
        let err = try_parse_message(&mut buffer).unwrap_err();
        assert!(err.to_string().contains("exceeds"), "got {err}");
    }

    #[test]
    fn test_unterminated_headers_are_rejected() {
        let mut buffer = BytesMut::from("X-Junk: ".repeat(2048).as_str());
        assert!(try_parse_message(&mut buffer).is_err());
    }

    #[test]
    fn test_encode_then_parse() {
        let message = NotificationMessage::new("initialized", serde_json::json!({}));
        let frame = encode_message(&message).unwrap();
        let mut buffer = BytesMut::from(&frame[..]);

        let body = try_parse_message(&mut buffer).unwrap().unwrap();
        assert!(matches!(
            Incoming::parse(&body).unwrap(),
            Incoming::Notification(n) if n.method == "initialized"
        ));
    }

    #[test]
    fn test_classify_messages() {
        let request = r#"{"jsonrpc":"2.0","id":"abc-123","method":"workspace/configuration"}"#;
        assert!(matches!(
            Incoming::parse(request).unwrap(),
            Incoming::Request(r) if r.id == RequestId::String("abc-123".to_string())
        ));

        let response = r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32600,"message":"Invalid Request"}}"#;
        match Incoming::parse(response).unwrap() {
            Incoming::Response(r) => {
                assert!(r.result.is_none());
                assert_eq!(r.error.map(|e| e.code), Some(-32600));
            }
            other => panic!("expected response, got {other:?}"),
        }

        assert!(Incoming::parse(r#"{"jsonrpc":"2.0"}"#).is_err());
    }

    #[test]
    fn test_response_null_result() {
        let json = r#"{"jsonrpc":"2.0","id":1,"result":null}"#;
        let msg: ResponseMessage = serde_json::from_str(json).unwrap();
        // null deserializes to None for Option<Value>
        assert!(msg.result.is_none());
        assert!(msg.error.is_none());
    }

    #[test]
    fn test_ok_response_serializes_null_result() {
        let response = ResponseMessage::ok(RequestId::Number(7), serde_json::Value::Null);
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains(r#""result":null"#), "got {json}");
    }

    #[test]
    fn test_request_id_display() {
        assert_eq!(RequestId::Number(42).to_string(), "42");
        assert_eq!(RequestId::String("x".to_string()).to_string(), "x");
    }
}
