//! Error types for the ESL client

use crate::stream::DisconnectReason;
use thiserror::Error;

/// Errors produced by the client, the parser and the correlation engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EslError {
    /// Socket I/O failed after the connection was established.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The TCP connection could not be established.
    #[error("failed to connect to {address}: {reason}")]
    ConnectFailed { address: String, reason: String },

    /// The handshake was rejected or did not complete. The connection is unusable.
    #[error("authentication failed: {reason}")]
    AuthFailed { reason: String },

    /// A single wait exceeded its deadline. Other operations are unaffected.
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The inbound message stream ended while the operation was pending.
    #[error("message stream closed: {reason}")]
    StreamClosed { reason: DisconnectReason },

    /// A command was attempted on a client whose stream has already ended.
    #[error("not connected")]
    NotConnected,

    /// Malformed framing or an unsendable command.
    #[error("protocol error: {message}")]
    ProtocolError { message: String },

    /// A header line could not be parsed.
    #[error("invalid header: {header}")]
    InvalidHeader { header: String },

    /// Reply status was `-ERR`.
    #[error("command failed: {reply_text}")]
    CommandFailed { reply_text: String },

    /// Reply status was neither `+OK` nor `-ERR`.
    #[error("unexpected reply: {reply_text}")]
    UnexpectedReply { reply_text: String },

    /// JSON event body could not be decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// XML event body could not be decoded.
    #[error("XML error: {0}")]
    XmlError(#[from] quick_xml::Error),
}

/// Result alias used throughout the crate.
pub type EslResult<T> = Result<T, EslError>;

impl EslError {
    pub fn protocol_error(message: impl Into<String>) -> Self {
        EslError::ProtocolError {
            message: message.into(),
        }
    }

    pub fn auth_failed(reason: impl Into<String>) -> Self {
        EslError::AuthFailed {
            reason: reason.into(),
        }
    }

    /// `true` for [`EslError::Timeout`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, EslError::Timeout { .. })
    }

    /// `true` when the connection is gone, whatever the cause.
    pub fn is_disconnected(&self) -> bool {
        matches!(
            self,
            EslError::StreamClosed { .. } | EslError::NotConnected | EslError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = EslError::Timeout { timeout_ms: 1500 };
        assert_eq!(err.to_string(), "operation timed out after 1500ms");

        let err = EslError::StreamClosed {
            reason: DisconnectReason::ParseError("Missing Content-Type".into()),
        };
        assert_eq!(
            err.to_string(),
            "message stream closed: parse error: Missing Content-Type"
        );
    }

    #[test]
    fn test_classification() {
        assert!(EslError::Timeout { timeout_ms: 1 }.is_timeout());
        assert!(!EslError::NotConnected.is_timeout());
        assert!(EslError::StreamClosed {
            reason: DisconnectReason::ConnectionClosed
        }
        .is_disconnected());
        assert!(!EslError::auth_failed("bad password").is_disconnected());
    }
}
