//! Common imports for typical client usage.
pub use crate::{
    CancelToken, ClientConfig, ClientError, EventStream, FinishReason, HttpTransport,
    PendingToolCall, Session, SessionMessage, StreamEvent, ToolError, ToolHandlers, ToolResult,
    Worker,
};
