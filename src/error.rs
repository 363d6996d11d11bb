// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Error taxonomy for language server operations.
//!
//! Every asynchronous operation exposed by this crate resolves to
//! [`Result<T>`]. Per-server failures during fan-out are isolated by the
//! executor; everything else is surfaced to the caller with one of these
//! kinds.

use std::time::Duration;

use crate::lsp::protocol::{self, ResponseError};

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced by the language server layer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The server process could not be created or exited immediately.
    #[error("failed to start language server '{server}': {reason}")]
    Connection {
        /// Server identifier.
        server: String,
        /// Human readable cause.
        reason: String,
    },

    /// Work was submitted to a wrapper that cannot accept it in its current state.
    #[error("language server '{server}' is not active ({state})")]
    ServerNotActive {
        /// Server identifier.
        server: String,
        /// Lifecycle state at the time of the call.
        state: String,
    },

    /// The server connection was lost while the request was in flight.
    #[error("language server '{server}' disconnected")]
    ServerDisconnected {
        /// Server identifier.
        server: String,
    },

    /// A caller-imposed deadline elapsed.
    #[error("request '{method}' timed out after {timeout:?}")]
    RequestTimeout {
        /// The LSP method (or feature) that timed out.
        method: String,
        /// The deadline that elapsed.
        timeout: Duration,
    },

    /// The server answered with a JSON-RPC error object.
    #[error("LSP error {code}: {message}")]
    Response {
        /// JSON-RPC error code.
        code: i64,
        /// Server supplied message.
        message: String,
        /// Optional server supplied payload.
        data: Option<serde_json::Value>,
    },

    /// The operation was cancelled by its caller.
    #[error("request cancelled")]
    Cancelled,

    /// Underlying I/O failure on the transport.
    #[error("I/O error: {0}")]
    Io(String),

    /// A message could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(String),

    /// A server definition or document selector is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A background task failed without producing a result.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true if the server reported the request as cancelled.
    #[must_use]
    pub const fn is_request_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Response {
                code: protocol::REQUEST_CANCELLED,
                ..
            }
        )
    }

    /// Returns true if the failure means the connection itself is unusable.
    #[must_use]
    pub const fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::ServerDisconnected { .. } | Self::ServerNotActive { .. }
        )
    }
}

impl From<ResponseError> for Error {
    fn from(err: ResponseError) -> Self {
        Self::Response {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_error_passthrough() {
        let err = Error::from(ResponseError {
            code: -32603,
            message: "boom".to_string(),
            data: Some(serde_json::json!({"detail": 1})),
        });
        assert_eq!(err.to_string(), "LSP error -32603: boom");
        assert!(!err.is_request_cancelled());
    }

    #[test]
    fn test_request_cancelled_detection() {
        let err = Error::Response {
            code: protocol::REQUEST_CANCELLED,
            message: "cancelled".to_string(),
            data: None,
        };
        assert!(err.is_request_cancelled());
        assert!(!Error::Cancelled.is_request_cancelled());
    }

    #[test]
    fn test_connection_failures() {
        assert!(
            Error::ServerDisconnected {
                server: "a".to_string()
            }
            .is_connection_failure()
        );
        assert!(
            !Error::RequestTimeout {
                method: "textDocument/hover".to_string(),
                timeout: Duration::from_millis(500),
            }
            .is_connection_failure()
        );
    }
}
