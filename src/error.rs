//! Error taxonomy for the connectivity layer.
//!
//! Every transport and protocol fault becomes a rejected result; nothing in
//! this crate is fatal to the hosting process. The enum is `Clone` so that a
//! single connect outcome can be shared between concurrent callers.

use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    /// The transport failed before the handshake completed.
    #[error("connection failed: {0}")]
    Connection(String),

    /// A response or frame had a malformed or unexpected shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The upstream server returned a structured error. Code, message and
    /// auxiliary data are passed through verbatim.
    #[error("server error {code}: {message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    /// The per-request deadline elapsed without a matching response.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The circuit breaker short-circuited the call without attempting it.
    #[error("circuit breaker open for server '{0}'")]
    BreakerOpen(String),

    /// A transport byte ceiling was exceeded; the transport was
    /// force-disconnected rather than buffering without bound.
    #[error("transport buffer ceiling exceeded ({limit} bytes)")]
    Overflow { limit: usize },

    /// `shutdown()` rejected a still-pending request.
    #[error("request cancelled by shutdown")]
    Cancelled,

    /// No server in the routing table owns this tool name.
    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    /// The named server is not part of the connected set.
    #[error("server '{0}' is not connected")]
    UnknownServer(String),

    /// An operation that requires an established connection was called on a
    /// disconnected client.
    #[error("client is not connected")]
    NotConnected,

    /// The configured executable was refused at construction time.
    #[error("refusing to spawn '{command}': {reason}")]
    Spawn { command: String, reason: String },

    /// A server configuration record failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// True for errors that indicate the peer itself answered, as opposed to
    /// the path to it failing.
    pub fn is_remote(&self) -> bool {
        matches!(self, BridgeError::Remote { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_error_preserves_fields() {
        let err = BridgeError::Remote {
            code: -32602,
            message: "Invalid params".to_string(),
            data: Some(serde_json::json!({"field": "path"})),
        };
        assert!(err.is_remote());
        let text = err.to_string();
        assert!(text.contains("-32602"));
        assert!(text.contains("Invalid params"));
    }

    #[test]
    fn errors_are_cloneable() {
        let err = BridgeError::Timeout(Duration::from_secs(30));
        let copy = err.clone();
        assert_eq!(err.to_string(), copy.to_string());
    }
}
