use std::sync::Arc;

use serde_json::{Value, json};
use tracing::info;

use crate::cancel::CancelToken;
use crate::continuation::{ContinuationLoop, ContinuationState, EventStream, ResourceUpdates};
use crate::errors::ClientError;
use crate::stream::ToolResult;
use crate::tools::ToolHandlers;
use crate::transport::{ClientConfig, Endpoint, Transport};

const DEFAULT_STREAM_BUFFER_CAPACITY: usize = 128;

/// Stateless facade for invoking a worker agent by id.
///
/// Each call is an independent invocation; nothing is shared between them
/// except the configured tool handlers and resources.
#[derive(Clone)]
pub struct Worker {
    transport: Arc<dyn Transport>,
    tools: ToolHandlers,
    resource_updates: Option<Arc<dyn ResourceUpdates>>,
    stream_buffer_capacity: usize,
}

impl Worker {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            tools: ToolHandlers::default(),
            resource_updates: None,
            stream_buffer_capacity: DEFAULT_STREAM_BUFFER_CAPACITY,
        }
    }

    pub fn tools(mut self, tools: ToolHandlers) -> Self {
        self.tools = tools;
        self
    }

    pub fn resource_updates(mut self, updates: Arc<dyn ResourceUpdates>) -> Self {
        self.resource_updates = Some(updates);
        self
    }

    pub fn stream_buffer_capacity(mut self, capacity: usize) -> Self {
        self.stream_buffer_capacity = capacity;
        self
    }

    pub fn config(self, config: &ClientConfig) -> Self {
        self.stream_buffer_capacity(config.stream_buffer_capacity)
    }

    /// Starts a fresh execution of `agent_id`.
    pub fn start(&self, agent_id: &str, input: Value) -> Result<EventStream, ClientError> {
        self.start_with_cancel(agent_id, input, CancelToken::new())
    }

    pub fn start_with_cancel(
        &self,
        agent_id: &str,
        input: Value,
        cancel: CancelToken,
    ) -> Result<EventStream, ClientError> {
        require("agent id", agent_id)?;
        info!(%agent_id, "starting worker execution");
        self.invoke(agent_id, ContinuationState::default(), input, cancel)
    }

    /// Resumes a paused execution with the caller's tool results.
    pub fn resume(
        &self,
        agent_id: &str,
        execution_id: &str,
        tool_results: Vec<ToolResult>,
    ) -> Result<EventStream, ClientError> {
        self.resume_with_cancel(agent_id, execution_id, tool_results, CancelToken::new())
    }

    pub fn resume_with_cancel(
        &self,
        agent_id: &str,
        execution_id: &str,
        tool_results: Vec<ToolResult>,
        cancel: CancelToken,
    ) -> Result<EventStream, ClientError> {
        require("agent id", agent_id)?;
        require("execution id", execution_id)?;
        info!(%agent_id, %execution_id, results = tool_results.len(), "resuming worker execution");
        let state = ContinuationState {
            execution_id: Some(execution_id.to_owned()),
            tool_results: Some(tool_results),
        };
        self.invoke(agent_id, state, Value::Null, cancel)
    }

    fn invoke(
        &self,
        agent_id: &str,
        state: ContinuationState,
        input: Value,
        cancel: CancelToken,
    ) -> Result<EventStream, ClientError> {
        let mut looped = ContinuationLoop::new(
            self.transport.clone(),
            Endpoint::worker(agent_id),
            move |state| worker_request_body(state, &input),
        )
        .tools(self.tools.clone())
        .cancel_token(cancel)
        .initial_state(state)
        .stream_buffer_capacity(self.stream_buffer_capacity);
        if let Some(updates) = &self.resource_updates {
            looped = looped.resource_updates(updates.clone());
        }
        looped.start()
    }
}

fn require(what: &str, value: &str) -> Result<(), ClientError> {
    if value.trim().is_empty() {
        return Err(ClientError::Validation(format!("{what} must not be empty")));
    }
    Ok(())
}

fn worker_request_body(state: &ContinuationState, input: &Value) -> Value {
    let Some(tool_results) = &state.tool_results else {
        return json!({
            "type": "start",
            "input": input,
        });
    };
    let mut body = json!({
        "type": "continue",
        "toolResults": tool_results,
    });
    if let Some(execution_id) = &state.execution_id {
        body["executionId"] = json!(execution_id);
    }
    body
}
