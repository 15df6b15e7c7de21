//! Outbound request boundary.
//!
//! The continuation loop only sees [`Transport`]: it hands over an endpoint
//! and a JSON body and gets back either an SSE byte stream or a structured
//! failure. [`HttpTransport`] is the reqwest-backed implementation.
mod config;
mod http;

pub use config::ClientConfig;
pub use http::HttpTransport;

use std::fmt;
use std::pin::Pin;

use crate::cancel::CancelToken;
use crate::errors::ClientError;

/// Response body as raw chunks with arbitrary boundaries.
pub type ByteStream =
    Pin<Box<dyn futures::Stream<Item = Result<bytes::Bytes, ClientError>> + Send + 'static>>;

/// Target of a continuation request: `/{collection}/{entity_id}/{action}`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    collection: String,
    entity_id: String,
    action: String,
}

impl Endpoint {
    pub fn new(
        collection: impl Into<String>,
        entity_id: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            collection: collection.into(),
            entity_id: entity_id.into(),
            action: action.into(),
        }
    }

    /// Endpoint receiving trigger/continue messages for a session.
    pub fn session(session_id: impl Into<String>) -> Self {
        Self::new("sessions", session_id, "messages")
    }

    /// Endpoint receiving start/continue requests for a worker agent.
    pub fn worker(agent_id: impl Into<String>) -> Self {
        Self::new("workers", agent_id, "executions")
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Path relative to the service base URL, with a leading slash.
    pub fn path(&self) -> String {
        format!("/{}/{}/{}", self.collection, self.entity_id, self.action)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

/// Outcome of a request that reached the service.
pub enum TransportResponse {
    /// 2xx response; the body is an SSE stream.
    Stream(ByteStream),
    /// Non-2xx response with the service's error message.
    Failed { status: u16, message: String },
}

impl fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stream(_) => f.write_str("Stream(..)"),
            Self::Failed { status, message } => f
                .debug_struct("Failed")
                .field("status", status)
                .field("message", message)
                .finish(),
        }
    }
}

/// Issues continuation requests against the remote execution service.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// POSTs `body` to `endpoint`.
    ///
    /// Must return `ClientError::Cancelled` promptly once `cancel` fires
    /// before a response arrives; any other `Err` is a transport failure.
    async fn post(
        &self,
        endpoint: &Endpoint,
        body: serde_json::Value,
        cancel: &CancelToken,
    ) -> Result<TransportResponse, ClientError>;
}
