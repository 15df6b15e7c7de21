//! Client-side engine for streaming agent executions.
//!
//! A remote service runs agent executions and streams their progress as
//! server-sent events. This crate decodes those streams into typed
//! [`StreamEvent`]s, resolves the tool calls it has local handlers for, issues
//! continuation requests until the execution finishes, and pauses with a
//! `client-tool-request` when the caller has to supply results itself.
//!
//! # Worker usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use agent_client::prelude::*;
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), ClientError> {
//! agent_client::init_observability();
//! let transport = Arc::new(HttpTransport::from_env()?);
//! let tools = ToolHandlers::new().register_fn("clock", |_args| async move {
//!     Ok::<_, ToolError>(json!("12:00"))
//! });
//!
//! let mut events = Worker::new(transport)
//!     .tools(tools)
//!     .start("summarizer", json!({"text": "..."}))?;
//! while let Some(event) = events.next_event().await {
//!     println!("{:?}", event?);
//! }
//! # Ok(())
//! # }
//! ```

/// Cooperative cancellation shared by a loop and its transport.
pub mod cancel;
/// The continuation loop driving one invocation.
pub mod continuation;
/// Public error types.
pub mod errors;
/// Process-wide tracing setup.
pub mod observability;
/// Common imports for typical usage.
pub mod prelude;
/// Long-lived single-flight sessions.
pub mod session;
/// SSE framing in both directions.
pub mod sse;
/// Wire event schema and validation.
pub mod stream;
/// Local tool handlers.
pub mod tools;
/// Request transport and its HTTP implementation.
pub mod transport;
/// Stateless worker invocations.
pub mod worker;

#[cfg(test)]
mod testing;

pub use cancel::CancelToken;
pub use continuation::{ContinuationLoop, ContinuationState, EventStream, ResourceUpdates};
pub use errors::{ClientError, EventError, ToolError};
pub use observability::init_observability;
pub use session::{
    FlightOutcome, Resource, ResourceRegistry, Session, SessionBuilder, SessionMessage,
    SessionRegistry,
};
pub use sse::{SseDecoder, decode_events, encode_event, encode_events};
pub use stream::{FinishReason, PendingToolCall, StreamEvent, ToolOutcome, ToolResult};
pub use tools::{ToolHandler, ToolHandlers};
pub use transport::{ClientConfig, Endpoint, HttpTransport, Transport, TransportResponse};
pub use worker::Worker;
