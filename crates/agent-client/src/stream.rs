use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::EventError;

/// Reason attached to a `finish` event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    /// The execution completed normally, or was cancelled by the caller.
    Stop,
    /// The model hit its output length limit.
    Length,
    /// Output was withheld by a content filter.
    ContentFilter,
    /// The remote step ended with pending tool calls.
    ToolCalls,
    /// The execution failed remotely.
    Error,
    /// The execution paused until the caller resolves client-side tools.
    ClientToolCalls,
    /// Any reason this client does not know about.
    #[serde(other)]
    Other,
}

/// One tool invocation the remote agent wants performed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingToolCall {
    pub tool_call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_variable: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
}

/// Outcome of a resolved tool call. Serialized as either `"result"` or
/// `"error"` next to the call metadata, never both.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ToolOutcome {
    Result(Value),
    Error(String),
}

/// Resolution of a [`PendingToolCall`], sent back on the next continuation
/// request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub tool_call_id: String,
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_variable: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(flatten)]
    pub outcome: ToolOutcome,
}

impl ToolResult {
    /// Builds a successful result carrying the call's routing metadata.
    pub fn success(call: &PendingToolCall, result: Value) -> Self {
        Self::for_call(call, ToolOutcome::Result(result))
    }

    /// Builds a failed result carrying the call's routing metadata.
    pub fn failure(call: &PendingToolCall, error: impl Into<String>) -> Self {
        Self::for_call(call, ToolOutcome::Error(error.into()))
    }

    fn for_call(call: &PendingToolCall, outcome: ToolOutcome) -> Self {
        Self {
            tool_call_id: call.tool_call_id.clone(),
            tool_name: call.tool_name.clone(),
            output_variable: call.output_variable.clone(),
            block_index: call.block_index,
            thread: call.thread.clone(),
            worker_id: call.worker_id.clone(),
            outcome,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Error(_))
    }

    /// The caller-facing event reporting this result.
    pub fn to_output_event(&self) -> StreamEvent {
        match &self.outcome {
            ToolOutcome::Result(output) => StreamEvent::ToolOutputAvailable {
                tool_call_id: self.tool_call_id.clone(),
                output: output.clone(),
            },
            ToolOutcome::Error(error_text) => StreamEvent::ToolOutputError {
                tool_call_id: self.tool_call_id.clone(),
                error_text: error_text.clone(),
            },
        }
    }
}

/// Events exchanged with the remote execution service and yielded to callers.
///
/// Tags are kebab-case in the `type` field, payload fields are camelCase.
/// `ToolRequest` is protocol-internal and never reaches a caller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum StreamEvent {
    // Lifecycle
    Start {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        execution_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },
    Finish {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        finish_reason: Option<FinishReason>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        execution_id: Option<String>,
    },
    StartStep,
    FinishStep,

    // Errors
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<u16>,
    },
    InternalError {
        message: String,
    },
    ApiError {
        status: u16,
        message: String,
    },

    // Text and reasoning deltas
    TextStart {
        id: String,
    },
    TextDelta {
        id: String,
        delta: String,
    },
    TextEnd {
        id: String,
    },
    ReasoningStart {
        id: String,
    },
    ReasoningDelta {
        id: String,
        delta: String,
    },
    ReasoningEnd {
        id: String,
    },

    // Tool lifecycle
    ToolInputStart {
        tool_call_id: String,
        tool_name: String,
    },
    ToolInputDelta {
        tool_call_id: String,
        input_text_delta: String,
    },
    ToolInputAvailable {
        tool_call_id: String,
        tool_name: String,
        #[serde(default)]
        input: Value,
    },
    ToolOutputAvailable {
        tool_call_id: String,
        #[serde(default)]
        output: Value,
    },
    ToolOutputError {
        tool_call_id: String,
        error_text: String,
    },
    ToolRequest {
        tool_calls: Vec<PendingToolCall>,
    },

    ResourceUpdate {
        name: String,
        #[serde(default)]
        value: Value,
    },

    // Workers
    WorkerStart {
        worker_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
    },
    WorkerResult {
        worker_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    // Pause
    ClientToolRequest {
        execution_id: String,
        tool_calls: Vec<PendingToolCall>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        server_tool_results: Option<Vec<ToolResult>>,
    },
}

const KNOWN_TYPES: &[&str] = &[
    "start",
    "finish",
    "start-step",
    "finish-step",
    "error",
    "internal-error",
    "api-error",
    "text-start",
    "text-delta",
    "text-end",
    "reasoning-start",
    "reasoning-delta",
    "reasoning-end",
    "tool-input-start",
    "tool-input-delta",
    "tool-input-available",
    "tool-output-available",
    "tool-output-error",
    "tool-request",
    "resource-update",
    "worker-start",
    "worker-result",
    "client-tool-request",
];

impl StreamEvent {
    /// Validates an untrusted decoded JSON value into a typed event.
    ///
    /// Never panics; rejected values are reported as an [`EventError`] so the
    /// caller can skip the record.
    pub fn from_value(value: &Value) -> Result<Self, EventError> {
        let Some(kind) = value.get("type").and_then(Value::as_str) else {
            return Err(EventError::MissingType);
        };
        if !KNOWN_TYPES.contains(&kind) {
            return Err(EventError::UnknownType(kind.to_owned()));
        }
        Self::deserialize(value).map_err(|e| EventError::Malformed {
            kind: kind.to_owned(),
            message: e.to_string(),
        })
    }

    /// Creates a `finish` event.
    pub fn finish(reason: FinishReason, execution_id: Option<String>) -> Self {
        Self::Finish {
            finish_reason: Some(reason),
            execution_id,
        }
    }

    /// Creates the `finish{stop}` event used when the caller cancels.
    pub fn stopped() -> Self {
        Self::finish(FinishReason::Stop, None)
    }

    /// Creates an `internal-error` event.
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }

    /// Returns the wire tag of this event (for logs).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Finish { .. } => "finish",
            Self::StartStep => "start-step",
            Self::FinishStep => "finish-step",
            Self::Error { .. } => "error",
            Self::InternalError { .. } => "internal-error",
            Self::ApiError { .. } => "api-error",
            Self::TextStart { .. } => "text-start",
            Self::TextDelta { .. } => "text-delta",
            Self::TextEnd { .. } => "text-end",
            Self::ReasoningStart { .. } => "reasoning-start",
            Self::ReasoningDelta { .. } => "reasoning-delta",
            Self::ReasoningEnd { .. } => "reasoning-end",
            Self::ToolInputStart { .. } => "tool-input-start",
            Self::ToolInputDelta { .. } => "tool-input-delta",
            Self::ToolInputAvailable { .. } => "tool-input-available",
            Self::ToolOutputAvailable { .. } => "tool-output-available",
            Self::ToolOutputError { .. } => "tool-output-error",
            Self::ToolRequest { .. } => "tool-request",
            Self::ResourceUpdate { .. } => "resource-update",
            Self::WorkerStart { .. } => "worker-start",
            Self::WorkerResult { .. } => "worker-result",
            Self::ClientToolRequest { .. } => "client-tool-request",
        }
    }

    /// True for `finish`, the only event that closes an invocation normally.
    pub fn is_finish(&self) -> bool {
        matches!(self, Self::Finish { .. })
    }

    /// Returns the finish reason for `finish` events.
    pub fn finish_reason(&self) -> Option<FinishReason> {
        match self {
            Self::Finish { finish_reason, .. } => *finish_reason,
            _ => None,
        }
    }
}
