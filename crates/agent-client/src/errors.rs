/// Top-level error type for the public client API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// Invalid client/transport configuration.
    #[error("config error: {0}")]
    Config(String),
    /// Invalid caller input to a facade or builder.
    #[error("validation error: {0}")]
    Validation(String),
    /// Network/stream transport failed. Never retried.
    #[error("transport error: {message}")]
    Transport { message: String },
    /// Internal protocol misuse or invariant violation.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The request was aborted because its cancel token fired.
    #[error("cancelled")]
    Cancelled,
}

impl ClientError {
    /// Creates a transport-level error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub(crate) fn protocol_msg(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}

/// Reason a decoded JSON record was rejected by the event validator.
///
/// Rejected records are dropped by the decoder; this type only exists so the
/// drop can be logged with a useful reason.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventError {
    /// The record is not a JSON object with a string `type` field.
    #[error("event has no type tag")]
    MissingType,
    /// The `type` tag is not one this client understands.
    #[error("unknown event type: {0}")]
    UnknownType(String),
    /// The tag is known but the payload does not match its shape.
    #[error("malformed {kind} event: {message}")]
    Malformed { kind: String, message: String },
}

/// Failure returned by a local tool handler.
///
/// Tool failures are data: they become `tool-output-error` events and error
/// tool results, never stream errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ToolError {
    message: String,
}

impl ToolError {
    /// Creates a tool error with a human-readable message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for ToolError {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for ToolError {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<serde_json::Error> for ToolError {
    fn from(value: serde_json::Error) -> Self {
        Self::new(format!("invalid tool arguments: {value}"))
    }
}
