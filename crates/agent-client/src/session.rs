use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::continuation::{ContinuationLoop, ContinuationState, ResourceUpdates};
use crate::errors::ClientError;
use crate::stream::{StreamEvent, ToolResult};
use crate::tools::ToolHandlers;
use crate::transport::{ClientConfig, Endpoint, Transport};

const DEFAULT_STREAM_BUFFER_CAPACITY: usize = 128;

/// Inbound message for a [`Session`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SessionMessage {
    /// Starts a new execution through a named trigger.
    Trigger {
        trigger_name: String,
        #[serde(default)]
        input: Value,
    },
    /// Resumes a paused execution with client-side tool results.
    Continue {
        execution_id: String,
        #[serde(default)]
        tool_results: Vec<ToolResult>,
    },
    /// Cancels the flight in progress, if any.
    Stop,
}

/// How a call to [`Session::send`] ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlightOutcome {
    /// The invocation reached its terminal event.
    Finished,
    /// The flight was stopped or replaced by a newer message.
    Cancelled,
    /// The invocation failed; an `internal-error` event was delivered.
    Failed,
    /// A `stop` message was handled.
    Stopped,
}

/// A named object that receives `resource-update` values.
#[async_trait::async_trait]
pub trait Resource: Send + Sync {
    async fn update(&self, value: Value);
}

/// Resource name to object mapping.
///
/// Updates for names that are not registered are dropped.
#[derive(Clone, Default)]
pub struct ResourceRegistry {
    resources: HashMap<String, Arc<dyn Resource>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, name: impl Into<String>, resource: Arc<dyn Resource>) -> Self {
        self.resources.insert(name.into(), resource);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Resource>> {
        self.resources.get(name).cloned()
    }
}

#[async_trait::async_trait]
impl ResourceUpdates for ResourceRegistry {
    async fn resource_updated(&self, name: &str, value: &Value) {
        match self.resources.get(name) {
            Some(resource) => resource.update(value.clone()).await,
            None => debug!(resource = %name, "dropping update for unknown resource"),
        }
    }
}

/// Receives every event a session produces.
pub type EventSink = Arc<dyn Fn(StreamEvent) + Send + Sync>;
/// Called once after each flight that reached its terminal event.
pub type CompletionCallback = Arc<dyn Fn() + Send + Sync>;

/// Holds the cancel token of the one flight allowed to run.
///
/// Installing a flight cancels its predecessor; releasing only clears the slot
/// if it still holds the releasing flight's generation. Every flight also
/// gets a latch that is set once it has delivered its last event, and a new
/// flight waits on its predecessor's latch before emitting anything.
#[derive(Default)]
struct FlightSlot {
    inner: Mutex<SlotState>,
}

#[derive(Default)]
struct SlotState {
    generation: u64,
    active: Option<(u64, CancelToken)>,
    last_drained: Option<CancelToken>,
}

struct Ticket {
    generation: u64,
    cancel: CancelToken,
    drained: CancelToken,
    predecessor: Option<CancelToken>,
}

impl FlightSlot {
    fn replace(&self) -> Ticket {
        let mut slot = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        slot.generation += 1;
        let generation = slot.generation;
        let cancel = CancelToken::new();
        let drained = CancelToken::new();
        if let Some((previous, token)) = slot.active.replace((generation, cancel.clone())) {
            debug!(previous, generation, "replacing in-flight invocation");
            token.cancel();
        }
        let predecessor = slot.last_drained.replace(drained.clone());
        Ticket {
            generation,
            cancel,
            drained,
            predecessor,
        }
    }

    fn stop(&self) -> bool {
        let mut slot = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.active.take() {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn release(&self, generation: u64) {
        let mut slot = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.active.as_ref().is_some_and(|(g, _)| *g == generation) {
            slot.active = None;
        }
    }

    fn is_active(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .active
            .is_some()
    }
}

/// Releases a flight's slot and sets its drained latch, also when the
/// `send` future is dropped early.
struct FlightGuard<'a> {
    slot: &'a FlightSlot,
    generation: u64,
    drained: CancelToken,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.slot.release(self.generation);
        self.drained.cancel();
    }
}

/// Long-lived conversational entity with at most one invocation in flight.
///
/// A new trigger or continue message cancels the running invocation before
/// starting its own; `stop` only cancels.
pub struct Session {
    id: String,
    transport: Arc<dyn Transport>,
    tools: ToolHandlers,
    resources: Arc<ResourceRegistry>,
    sink: EventSink,
    on_finish: Option<CompletionCallback>,
    stream_buffer_capacity: usize,
    flights: FlightSlot,
}

impl Session {
    /// Starts a builder for a session with the given id.
    pub fn builder(id: impl Into<String>, transport: Arc<dyn Transport>) -> SessionBuilder {
        SessionBuilder {
            id: id.into(),
            transport,
            tools: ToolHandlers::default(),
            resources: ResourceRegistry::default(),
            sink: None,
            on_finish: None,
            stream_buffer_capacity: DEFAULT_STREAM_BUFFER_CAPACITY,
        }
    }

    /// Starts a builder for a session with a freshly generated id.
    pub fn anonymous(transport: Arc<dyn Transport>) -> SessionBuilder {
        Self::builder(uuid::Uuid::new_v4().to_string(), transport)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// True while an invocation is running.
    pub fn is_busy(&self) -> bool {
        self.flights.is_active()
    }

    /// Cancels the running invocation, if any.
    pub fn stop(&self) -> bool {
        let stopped = self.flights.stop();
        info!(session_id = %self.id, stopped, "stop requested");
        stopped
    }

    /// Parses an untyped inbound message and handles it.
    pub async fn send_json(&self, message: Value) -> FlightOutcome {
        match serde_json::from_value::<SessionMessage>(message) {
            Ok(message) => self.send(message).await,
            Err(err) => {
                warn!(session_id = %self.id, error = %err, "rejecting malformed session message");
                (self.sink)(StreamEvent::internal_error(format!(
                    "invalid session message: {err}"
                )));
                FlightOutcome::Failed
            }
        }
    }

    /// Handles one inbound message, delivering events to the sink until the
    /// resulting invocation ends.
    pub async fn send(&self, message: SessionMessage) -> FlightOutcome {
        match message {
            SessionMessage::Stop => {
                self.stop();
                FlightOutcome::Stopped
            }
            SessionMessage::Trigger {
                trigger_name,
                input,
            } => {
                if trigger_name.trim().is_empty() {
                    return self.reject("trigger name must not be empty");
                }
                info!(session_id = %self.id, trigger = %trigger_name, "triggering execution");
                self.fly(ContinuationState::default(), trigger_name, input)
                    .await
            }
            SessionMessage::Continue {
                execution_id,
                tool_results,
            } => {
                if execution_id.trim().is_empty() {
                    return self.reject("execution id must not be empty");
                }
                info!(session_id = %self.id, %execution_id, results = tool_results.len(), "continuing execution");
                let state = ContinuationState {
                    execution_id: Some(execution_id),
                    tool_results: Some(tool_results),
                };
                self.fly(state, String::new(), Value::Null).await
            }
        }
    }

    fn reject(&self, message: &str) -> FlightOutcome {
        warn!(session_id = %self.id, %message, "rejecting session message");
        (self.sink)(StreamEvent::internal_error(message));
        FlightOutcome::Failed
    }

    async fn fly(
        &self,
        initial_state: ContinuationState,
        trigger_name: String,
        input: Value,
    ) -> FlightOutcome {
        let ticket = self.flights.replace();
        let generation = ticket.generation;
        let cancel = ticket.cancel;
        let guard = FlightGuard {
            slot: &self.flights,
            generation,
            drained: ticket.drained,
        };
        if let Some(predecessor) = ticket.predecessor {
            predecessor.cancelled().await;
        }

        let looped = ContinuationLoop::new(
            self.transport.clone(),
            Endpoint::session(&self.id),
            move |state| session_request_body(state, &trigger_name, &input),
        )
        .tools(self.tools.clone())
        .resource_updates(self.resources.clone())
        .cancel_token(cancel.clone())
        .initial_state(initial_state)
        .stream_buffer_capacity(self.stream_buffer_capacity);

        let outcome = match looped.start() {
            Ok(mut events) => {
                let mut failed = false;
                // True while the most recent event was delivered before any
                // cancellation; a loop that ended on its own leaves it set.
                let mut ended_before_cancel = false;
                while let Some(item) = events.next_event().await {
                    match item {
                        Ok(event) => {
                            ended_before_cancel = !cancel.is_cancelled();
                            (self.sink)(event);
                        }
                        Err(err) if cancel.is_cancelled() => {
                            debug!(session_id = %self.id, error = %err, "ignoring failure of cancelled flight");
                        }
                        Err(err) => {
                            warn!(session_id = %self.id, error = %err, "session flight failed");
                            (self.sink)(StreamEvent::internal_error(err.to_string()));
                            failed = true;
                        }
                    }
                }
                if failed {
                    FlightOutcome::Failed
                } else if ended_before_cancel || !cancel.is_cancelled() {
                    FlightOutcome::Finished
                } else {
                    FlightOutcome::Cancelled
                }
            }
            Err(err) => {
                (self.sink)(StreamEvent::internal_error(err.to_string()));
                FlightOutcome::Failed
            }
        };
        drop(guard);

        debug!(session_id = %self.id, generation, ?outcome, "flight ended");
        if outcome == FlightOutcome::Finished
            && let Some(on_finish) = &self.on_finish
        {
            on_finish();
        }
        outcome
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("tools", &self.tools)
            .field("busy", &self.is_busy())
            .finish_non_exhaustive()
    }
}

/// Trigger body until tool results exist, continue body afterwards.
fn session_request_body(state: &ContinuationState, trigger_name: &str, input: &Value) -> Value {
    let Some(tool_results) = &state.tool_results else {
        return json!({
            "triggerName": trigger_name,
            "input": input,
        });
    };
    let mut body = json!({ "toolResults": tool_results });
    if let Some(execution_id) = &state.execution_id {
        body["executionId"] = json!(execution_id);
    }
    body
}

/// Builder for [`Session`].
pub struct SessionBuilder {
    id: String,
    transport: Arc<dyn Transport>,
    tools: ToolHandlers,
    resources: ResourceRegistry,
    sink: Option<EventSink>,
    on_finish: Option<CompletionCallback>,
    stream_buffer_capacity: usize,
}

impl SessionBuilder {
    pub fn tools(mut self, tools: ToolHandlers) -> Self {
        self.tools = tools;
        self
    }

    pub fn resources(mut self, resources: ResourceRegistry) -> Self {
        self.resources = resources;
        self
    }

    /// Sets the callback receiving every event. Required.
    pub fn event_sink(mut self, sink: impl Fn(StreamEvent) + Send + Sync + 'static) -> Self {
        self.sink = Some(Arc::new(sink));
        self
    }

    pub fn on_finish(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_finish = Some(Arc::new(callback));
        self
    }

    pub fn stream_buffer_capacity(mut self, capacity: usize) -> Self {
        self.stream_buffer_capacity = capacity;
        self
    }

    /// Takes the buffer size from a client config.
    pub fn config(self, config: &ClientConfig) -> Self {
        self.stream_buffer_capacity(config.stream_buffer_capacity)
    }

    pub fn build(self) -> Result<Session, ClientError> {
        if self.id.trim().is_empty() {
            return Err(ClientError::Validation("session id must not be empty".into()));
        }
        if self.stream_buffer_capacity == 0 {
            return Err(ClientError::Validation(
                "stream_buffer_capacity must be greater than 0".into(),
            ));
        }
        let sink = self
            .sink
            .ok_or_else(|| ClientError::Config("session requires an event sink".into()))?;
        Ok(Session {
            id: self.id,
            transport: self.transport,
            tools: self.tools,
            resources: Arc::new(self.resources),
            sink,
            on_finish: self.on_finish,
            stream_buffer_capacity: self.stream_buffer_capacity,
            flights: FlightSlot::default(),
        })
    }
}

/// Live sessions keyed by id.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the session for `id`, building it with `make` on first use.
    pub fn get_or_create(
        &self,
        id: &str,
        make: impl FnOnce(&str) -> Result<Session, ClientError>,
    ) -> Result<Arc<Session>, ClientError> {
        match self.sessions.entry(id.to_owned()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let session = Arc::new(make(id)?);
                entry.insert(session.clone());
                Ok(session)
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Removes a session, stopping its running invocation.
    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        let (_, session) = self.sessions.remove(id)?;
        session.stop();
        Some(session)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
