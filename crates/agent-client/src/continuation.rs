use std::fmt;
use std::pin::{Pin, pin};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::StreamExt as _;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::errors::ClientError;
use crate::sse::decode_events;
use crate::stream::{FinishReason, PendingToolCall, StreamEvent, ToolResult};
use crate::tools::ToolHandlers;
use crate::transport::{ByteStream, Endpoint, Transport, TransportResponse};

const DEFAULT_STREAM_BUFFER_CAPACITY: usize = 128;

/// What the request builder sees before each round trip.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ContinuationState {
    /// Execution id minted by the service, once known.
    pub execution_id: Option<String>,
    /// Results to hand back; only set on the round trip right after they were
    /// produced.
    pub tool_results: Option<Vec<ToolResult>>,
}

type RequestBuilder = Arc<dyn Fn(&ContinuationState) -> Value + Send + Sync>;

/// Receives `resource-update` notifications before they are forwarded.
#[async_trait::async_trait]
pub trait ResourceUpdates: Send + Sync {
    async fn resource_updated(&self, name: &str, value: &Value);
}

/// One invocation of the continuation protocol.
///
/// Issues a request, streams its events to the consumer, resolves tool calls
/// that have a local handler, and keeps issuing continuation requests until
/// the service finishes, the caller is needed for client-side tools, or the
/// cancel token fires.
pub struct ContinuationLoop {
    transport: Arc<dyn Transport>,
    endpoint: Endpoint,
    build_request: RequestBuilder,
    tools: ToolHandlers,
    resource_updates: Option<Arc<dyn ResourceUpdates>>,
    cancel: CancelToken,
    initial_state: ContinuationState,
    stream_buffer_capacity: usize,
}

impl ContinuationLoop {
    pub fn new<F>(transport: Arc<dyn Transport>, endpoint: Endpoint, build_request: F) -> Self
    where
        F: Fn(&ContinuationState) -> Value + Send + Sync + 'static,
    {
        Self {
            transport,
            endpoint,
            build_request: Arc::new(build_request),
            tools: ToolHandlers::default(),
            resource_updates: None,
            cancel: CancelToken::new(),
            initial_state: ContinuationState::default(),
            stream_buffer_capacity: DEFAULT_STREAM_BUFFER_CAPACITY,
        }
    }

    /// Sets the handlers used to resolve tool calls locally.
    pub fn tools(mut self, tools: ToolHandlers) -> Self {
        self.tools = tools;
        self
    }

    pub fn resource_updates(mut self, updates: Arc<dyn ResourceUpdates>) -> Self {
        self.resource_updates = Some(updates);
        self
    }

    /// Uses an externally owned cancel token instead of a fresh one.
    pub fn cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Seeds the first round trip, e.g. when resuming a paused execution.
    pub fn initial_state(mut self, state: ContinuationState) -> Self {
        self.initial_state = state;
        self
    }

    pub fn stream_buffer_capacity(mut self, capacity: usize) -> Self {
        self.stream_buffer_capacity = capacity;
        self
    }

    /// Spawns the loop on the current tokio runtime and returns its events.
    pub fn start(self) -> Result<EventStream, ClientError> {
        if self.stream_buffer_capacity == 0 {
            return Err(ClientError::Validation(
                "stream_buffer_capacity must be greater than 0".into(),
            ));
        }
        let (tx, rx) = mpsc::channel(self.stream_buffer_capacity);
        let cancel = self.cancel.clone();
        tokio::spawn(self.run(tx));
        Ok(EventStream {
            rx,
            cancel,
            stop_delivered: false,
        })
    }

    async fn run(self, tx: mpsc::Sender<Result<StreamEvent, ClientError>>) {
        let outbox = Outbox { tx };
        match self.drive(&outbox).await {
            Ok(()) => {}
            Err(Halt::Closed) => {
                debug!(endpoint = %self.endpoint, "event consumer dropped; stopping loop");
            }
            Err(Halt::Failed(err)) => {
                warn!(endpoint = %self.endpoint, error = %err, "continuation loop failed");
                let _ = outbox.tx.send(Err(err)).await;
            }
        }
    }

    async fn drive(&self, outbox: &Outbox) -> Result<(), Halt> {
        let mut state = self.initial_state.clone();
        let mut round_trip = 0_u32;
        loop {
            round_trip += 1;
            if self.cancel.is_cancelled() {
                return self.stop(outbox, round_trip).await;
            }

            let body = (self.build_request)(&state);
            state.tool_results = None;
            debug!(endpoint = %self.endpoint, round_trip, execution_id = ?state.execution_id, "issuing request");

            let response = match self.transport.post(&self.endpoint, body, &self.cancel).await {
                Ok(response) => response,
                Err(_) if self.cancel.is_cancelled() => {
                    return self.stop(outbox, round_trip).await;
                }
                Err(err) => return Err(Halt::Failed(err)),
            };
            let body = match response {
                TransportResponse::Stream(body) => body,
                TransportResponse::Failed { status, message } => {
                    warn!(endpoint = %self.endpoint, status, %message, "service returned an error status");
                    return outbox
                        .emit(StreamEvent::Error {
                            message,
                            status: Some(status),
                        })
                        .await;
                }
            };

            let trip = self.stream_round_trip(body, &mut state, outbox).await?;
            if trip.interrupted || self.cancel.is_cancelled() {
                return self.stop(outbox, round_trip).await;
            }
            if trip.finished {
                if !trip.pending.is_empty() {
                    warn!(
                        dropped = trip.pending.len(),
                        "service finished with unresolved tool calls"
                    );
                }
                return Ok(());
            }
            if trip.pending.is_empty() {
                warn!(endpoint = %self.endpoint, round_trip, "stream ended without a finish event");
                return outbox
                    .emit(StreamEvent::finish(
                        FinishReason::Other,
                        state.execution_id.clone(),
                    ))
                    .await;
            }

            let (local, external) = self.tools.partition(trip.pending);
            info!(
                round_trip,
                local = local.len(),
                external = external.len(),
                "resolving tool calls"
            );
            // Handlers run to completion even if cancellation fires meanwhile.
            let results = self.tools.execute_local(&local).await;
            if self.cancel.is_cancelled() {
                return self.stop(outbox, round_trip).await;
            }
            for result in &results {
                outbox.emit(result.to_output_event()).await?;
            }

            if external.is_empty() {
                if state.execution_id.is_none() {
                    warn!(round_trip, "continuing without an execution id");
                }
                state.tool_results = Some(results);
                continue;
            }

            let Some(execution_id) = state.execution_id.clone() else {
                warn!(round_trip, "client tool calls requested without an execution id");
                return outbox
                    .emit(StreamEvent::internal_error(
                        "client tool calls were requested before the service assigned an execution id",
                    ))
                    .await;
            };
            info!(%execution_id, pending = external.len(), "pausing for client tool calls");
            outbox
                .emit(StreamEvent::ClientToolRequest {
                    execution_id: execution_id.clone(),
                    tool_calls: external,
                    server_tool_results: (!results.is_empty()).then_some(results),
                })
                .await?;
            return outbox
                .emit(StreamEvent::finish(
                    FinishReason::ClientToolCalls,
                    Some(execution_id),
                ))
                .await;
        }
    }

    /// Forwards one response body and collects what the loop needs next.
    async fn stream_round_trip(
        &self,
        body: ByteStream,
        state: &mut ContinuationState,
        outbox: &Outbox,
    ) -> Result<RoundTrip, Halt> {
        let mut events = pin!(decode_events(body));
        let mut trip = RoundTrip::default();
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    trip.interrupted = true;
                    break;
                }
                next = events.next() => next,
            };
            let event = match next {
                None => break,
                Some(Ok(event)) => event,
                Some(Err(_)) if self.cancel.is_cancelled() => {
                    trip.interrupted = true;
                    break;
                }
                Some(Err(err)) => return Err(Halt::Failed(err)),
            };
            if self.cancel.is_cancelled() {
                trip.interrupted = true;
                break;
            }
            if trip.finished {
                debug!(kind = event.kind(), "dropping event received after finish");
                continue;
            }

            match event {
                StreamEvent::ToolRequest { tool_calls } => {
                    debug!(count = tool_calls.len(), "captured tool request");
                    trip.pending.extend(tool_calls);
                }
                StreamEvent::Finish {
                    finish_reason: Some(FinishReason::ToolCalls),
                    ..
                } if !trip.pending.is_empty() => {
                    debug!("suppressing tool-calls finish until tools are resolved");
                }
                event @ StreamEvent::Finish { .. } => {
                    trip.finished = true;
                    outbox.emit(event).await?;
                }
                StreamEvent::ResourceUpdate { name, value } => {
                    if let Some(updates) = &self.resource_updates {
                        updates.resource_updated(&name, &value).await;
                    }
                    outbox
                        .emit(StreamEvent::ResourceUpdate { name, value })
                        .await?;
                }
                event => {
                    if let StreamEvent::Start {
                        execution_id: Some(id),
                        ..
                    } = &event
                    {
                        adopt_execution_id(state, id);
                    }
                    outbox.emit(event).await?;
                }
            }
        }
        Ok(trip)
    }

    async fn stop(&self, outbox: &Outbox, round_trip: u32) -> Result<(), Halt> {
        info!(endpoint = %self.endpoint, round_trip, "invocation cancelled");
        outbox.emit(StreamEvent::stopped()).await
    }
}

impl fmt::Debug for ContinuationLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContinuationLoop")
            .field("endpoint", &self.endpoint)
            .field("tools", &self.tools)
            .field("initial_state", &self.initial_state)
            .finish_non_exhaustive()
    }
}

fn adopt_execution_id(state: &mut ContinuationState, id: &str) {
    match state.execution_id.as_deref() {
        Some(current) if current == id => {}
        Some(current) => {
            warn!(previous = %current, execution_id = %id, "service rotated the execution id");
            state.execution_id = Some(id.to_owned());
        }
        None => {
            debug!(execution_id = %id, "adopted execution id");
            state.execution_id = Some(id.to_owned());
        }
    }
}

#[derive(Default)]
struct RoundTrip {
    pending: Vec<PendingToolCall>,
    finished: bool,
    interrupted: bool,
}

enum Halt {
    /// The consumer dropped its `EventStream`.
    Closed,
    Failed(ClientError),
}

struct Outbox {
    tx: mpsc::Sender<Result<StreamEvent, ClientError>>,
}

impl Outbox {
    async fn emit(&self, event: StreamEvent) -> Result<(), Halt> {
        self.tx.send(Ok(event)).await.map_err(|_| Halt::Closed)
    }
}

/// Consumer side of a running [`ContinuationLoop`].
///
/// Yields events in order. A transport failure arrives as a final `Err`;
/// otherwise the last item is the invocation's terminal event.
///
/// Once the cancel token fires, anything still queued is discarded and the
/// only item that gets through is the loop's `finish{stop}`.
pub struct EventStream {
    rx: mpsc::Receiver<Result<StreamEvent, ClientError>>,
    cancel: CancelToken,
    stop_delivered: bool,
}

impl EventStream {
    /// Waits for the next event. Returns `None` once the invocation ended.
    pub async fn next_event(&mut self) -> Option<Result<StreamEvent, ClientError>> {
        loop {
            let item = self.rx.recv().await?;
            if self.admit(&item) {
                return Some(item);
            }
        }
    }

    fn admit(&mut self, item: &Result<StreamEvent, ClientError>) -> bool {
        if !self.cancel.is_cancelled() {
            return true;
        }
        match item {
            Ok(event) if !self.stop_delivered && *event == StreamEvent::stopped() => {
                self.stop_delivered = true;
                true
            }
            Ok(event) => {
                debug!(kind = event.kind(), "discarding event queued before cancellation");
                false
            }
            Err(_) => false,
        }
    }

    /// Token that cancels this invocation.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Drains the stream, returning every event or the transport failure.
    pub async fn collect_events(mut self) -> Result<Vec<StreamEvent>, ClientError> {
        let mut events = Vec::new();
        while let Some(item) = self.next_event().await {
            events.push(item?);
        }
        Ok(events)
    }
}

impl futures::Stream for EventStream {
    type Item = Result<StreamEvent, ClientError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            let item = match this.rx.poll_recv(cx) {
                Poll::Ready(Some(item)) => item,
                other => return other,
            };
            if this.admit(&item) {
                return Poll::Ready(Some(item));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ToolError;
    use crate::stream::ToolOutcome;
    use futures::StreamExt as _;
    use crate::testing::{Scripted, ScriptedTransport};
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    fn request_body(state: &ContinuationState) -> Value {
        match &state.execution_id {
            Some(execution_id) => json!({
                "executionId": execution_id,
                "toolResults": state.tool_results.clone().unwrap_or_default(),
            }),
            None => json!({"triggerName": "chat", "input": {"text": "hi"}}),
        }
    }

    fn looped(transport: &Arc<ScriptedTransport>) -> ContinuationLoop {
        ContinuationLoop::new(transport.clone(), Endpoint::session("s1"), request_body)
    }

    fn tool_request(calls: Value) -> Value {
        json!({"type": "tool-request", "toolCalls": calls})
    }

    fn handlers() -> ToolHandlers {
        ToolHandlers::new()
            .register_fn("lookup", |args| async move {
                Ok::<_, ToolError>(json!({"found": args["key"]}))
            })
            .register_fn("fail", |_args| async move {
                Err::<Value, _>(ToolError::new("lookup backend down"))
            })
    }

    #[tokio::test]
    async fn plain_stream_is_forwarded_until_finish() {
        let transport = ScriptedTransport::new(vec![Scripted::events(vec![
            json!({"type":"start","executionId":"e1"}),
            json!({"type":"text-delta","id":"t","delta":"hello"}),
            json!({"type":"finish","finishReason":"stop","executionId":"e1"}),
        ])]);
        let events = looped(&transport)
            .start()
            .expect("start")
            .collect_events()
            .await
            .expect("events");
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].finish_reason(), Some(FinishReason::Stop));
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test]
    async fn cancelled_before_request_yields_only_stop_finish() {
        let transport = ScriptedTransport::new(vec![]);
        let cancel = CancelToken::new();
        cancel.cancel();
        let events = looped(&transport)
            .cancel_token(cancel)
            .start()
            .expect("start")
            .collect_events()
            .await
            .expect("events");
        assert_eq!(events, vec![StreamEvent::stopped()]);
        assert_eq!(transport.request_count(), 0);
    }

    #[tokio::test]
    async fn mixed_batch_pauses_with_local_results_attached() {
        let transport = ScriptedTransport::new(vec![Scripted::events(vec![
            json!({"type":"start","executionId":"e1"}),
            tool_request(json!([
                {"toolCallId":"a","toolName":"lookup","args":{"key":"k"}},
                {"toolCallId":"b","toolName":"ask_user","args":{}}
            ])),
            json!({"type":"finish","finishReason":"tool-calls"}),
        ])]);
        let events = looped(&transport)
            .tools(handlers())
            .start()
            .expect("start")
            .collect_events()
            .await
            .expect("events");

        assert_eq!(events.len(), 4, "{events:?}");
        assert_eq!(
            events[1],
            StreamEvent::ToolOutputAvailable {
                tool_call_id: "a".into(),
                output: json!({"found": "k"}),
            }
        );
        let StreamEvent::ClientToolRequest {
            execution_id,
            tool_calls,
            server_tool_results,
        } = &events[2]
        else {
            panic!("expected client-tool-request, got {:?}", events[2]);
        };
        assert_eq!(execution_id, "e1");
        assert_eq!(tool_calls.len(), 1);
        assert_eq!(tool_calls[0].tool_call_id, "b");
        let server = server_tool_results.as_ref().expect("server results");
        assert_eq!(server[0].tool_call_id, "a");
        assert_eq!(
            events[3],
            StreamEvent::finish(FinishReason::ClientToolCalls, Some("e1".into()))
        );
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test]
    async fn all_local_batch_continues_with_tool_results() {
        let transport = ScriptedTransport::new(vec![
            Scripted::events(vec![
                json!({"type":"start","executionId":"e1"}),
                tool_request(json!([
                    {"toolCallId":"a","toolName":"lookup","args":{"key":"k"},"outputVariable":"hit"},
                    {"toolCallId":"b","toolName":"fail"}
                ])),
                json!({"type":"finish","finishReason":"tool-calls"}),
            ]),
            Scripted::events(vec![
                json!({"type":"text-delta","id":"t","delta":"done"}),
                json!({"type":"finish","finishReason":"stop"}),
            ]),
        ]);
        let events = looped(&transport)
            .tools(handlers())
            .start()
            .expect("start")
            .collect_events()
            .await
            .expect("events");

        assert!(
            !events
                .iter()
                .any(|e| matches!(e, StreamEvent::ClientToolRequest { .. } | StreamEvent::ToolRequest { .. }))
        );
        assert_eq!(
            events[2],
            StreamEvent::ToolOutputError {
                tool_call_id: "b".into(),
                error_text: "lookup backend down".into(),
            }
        );
        assert_eq!(events.iter().filter(|e| e.is_finish()).count(), 1);
        assert_eq!(events.last().and_then(StreamEvent::finish_reason), Some(FinishReason::Stop));

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1]["executionId"], "e1");
        let results: Vec<ToolResult> =
            serde_json::from_value(requests[1]["toolResults"].clone()).expect("tool results");
        assert_eq!(results[0].outcome, ToolOutcome::Result(json!({"found": "k"})));
        assert_eq!(results[0].output_variable.as_deref(), Some("hit"));
        assert_eq!(results[1].outcome, ToolOutcome::Error("lookup backend down".into()));
    }

    #[tokio::test]
    async fn each_tool_batch_rides_only_the_next_request() {
        let transport = ScriptedTransport::new(vec![
            Scripted::events(vec![
                json!({"type":"start","executionId":"e1"}),
                tool_request(json!([{"toolCallId":"a","toolName":"lookup"}])),
                json!({"type":"finish","finishReason":"tool-calls"}),
            ]),
            Scripted::events(vec![
                tool_request(json!([{"toolCallId":"c","toolName":"lookup"}])),
                json!({"type":"finish","finishReason":"tool-calls"}),
            ]),
            Scripted::events(vec![json!({"type":"finish","finishReason":"stop"})]),
        ]);
        let captured = Arc::new(Mutex::new(Vec::new()));
        let seen = captured.clone();
        let events = ContinuationLoop::new(transport.clone(), Endpoint::session("s1"), move |state| {
            seen.lock()
                .expect("lock")
                .push(state.tool_results.as_ref().map(Vec::len));
            request_body(state)
        })
        .tools(handlers())
        .start()
        .expect("start")
        .collect_events()
        .await
        .expect("events");

        assert_eq!(events.last().and_then(StreamEvent::finish_reason), Some(FinishReason::Stop));
        assert_eq!(*captured.lock().expect("lock"), vec![None, Some(1), Some(1)]);
    }

    #[tokio::test]
    async fn external_calls_without_execution_id_become_internal_error() {
        let transport = ScriptedTransport::new(vec![Scripted::events(vec![
            tool_request(json!([{"toolCallId":"b","toolName":"ask_user"}])),
            json!({"type":"finish","finishReason":"tool-calls"}),
        ])]);
        let events = looped(&transport)
            .start()
            .expect("start")
            .collect_events()
            .await
            .expect("events");
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::InternalError { .. }));
    }

    #[tokio::test]
    async fn error_status_becomes_error_event_without_retry() {
        let transport = ScriptedTransport::new(vec![Scripted::Failed {
            status: 429,
            message: "slow down".into(),
        }]);
        let events = looped(&transport)
            .start()
            .expect("start")
            .collect_events()
            .await
            .expect("events");
        assert_eq!(
            events,
            vec![StreamEvent::Error {
                message: "slow down".into(),
                status: Some(429),
            }]
        );
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test]
    async fn transport_failure_is_propagated() {
        let transport = ScriptedTransport::new(vec![Scripted::Error(ClientError::transport(
            "connection refused",
        ))]);
        let result = looped(&transport).start().expect("start").collect_events().await;
        assert_eq!(result, Err(ClientError::transport("connection refused")));
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test]
    async fn resource_updates_are_dispatched_and_forwarded() {
        struct Recorder(Mutex<Vec<(String, Value)>>);

        #[async_trait::async_trait]
        impl ResourceUpdates for Recorder {
            async fn resource_updated(&self, name: &str, value: &Value) {
                self.0
                    .lock()
                    .expect("lock")
                    .push((name.to_owned(), value.clone()));
            }
        }

        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let transport = ScriptedTransport::new(vec![Scripted::events(vec![
            json!({"type":"resource-update","name":"X","value":{"n":1}}),
            json!({"type":"finish","finishReason":"stop"}),
        ])]);
        let events = looped(&transport)
            .resource_updates(recorder.clone())
            .start()
            .expect("start")
            .collect_events()
            .await
            .expect("events");
        assert_eq!(
            events[0],
            StreamEvent::ResourceUpdate {
                name: "X".into(),
                value: json!({"n": 1}),
            }
        );
        assert_eq!(
            *recorder.0.lock().expect("lock"),
            vec![("X".to_string(), json!({"n": 1}))]
        );
    }

    #[tokio::test]
    async fn malformed_record_does_not_interrupt_stream() {
        let transport = ScriptedTransport::new(vec![Scripted::raw(concat!(
            "data: {\"type\":\"text-delta\",\"id\":\"t\",\"delta\":\"a\"}\n\n",
            "data: {\"type\":\"text-delta\",\n\n",
            "data: {\"type\":\"text-delta\",\"id\":\"t\",\"delta\":\"b\"}\n\n",
            "data: {\"type\":\"finish\",\"finishReason\":\"stop\"}\n\n",
            "data: [DONE]\n\n",
        ))]);
        let events = looped(&transport)
            .start()
            .expect("start")
            .collect_events()
            .await
            .expect("events");
        let deltas: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::TextDelta { delta, .. } => Some(delta.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, vec!["a", "b"]);
        assert!(events.last().is_some_and(StreamEvent::is_finish));
    }

    #[tokio::test]
    async fn stream_closing_without_finish_gets_synthetic_finish() {
        let transport = ScriptedTransport::new(vec![Scripted::events(vec![
            json!({"type":"start","executionId":"e1"}),
        ])]);
        let events = looped(&transport)
            .start()
            .expect("start")
            .collect_events()
            .await
            .expect("events");
        assert_eq!(
            events.last(),
            Some(&StreamEvent::finish(FinishReason::Other, Some("e1".into())))
        );
    }

    #[tokio::test]
    async fn events_after_finish_are_dropped() {
        let transport = ScriptedTransport::new(vec![Scripted::events(vec![
            json!({"type":"finish","finishReason":"stop"}),
            json!({"type":"text-delta","id":"t","delta":"late"}),
            json!({"type":"finish","finishReason":"stop"}),
        ])]);
        let events = looped(&transport)
            .start()
            .expect("start")
            .collect_events()
            .await
            .expect("events");
        assert_eq!(events, vec![StreamEvent::finish(FinishReason::Stop, None)]);
    }

    #[tokio::test]
    async fn cancelling_mid_stream_ends_with_stop_finish() {
        let transport = ScriptedTransport::new(vec![Scripted::hanging(vec![
            json!({"type":"start","executionId":"e1"}),
            json!({"type":"text-delta","id":"t","delta":"partial"}),
        ])]);
        let mut stream = looped(&transport).start().expect("start");
        let first = stream.next_event().await.expect("first").expect("ok");
        assert!(matches!(first, StreamEvent::Start { .. }));
        let _ = stream.next_event().await;
        stream.cancel_token().cancel();

        let rest = tokio::time::timeout(Duration::from_secs(1), stream.collect_events())
            .await
            .expect("loop should stop promptly")
            .expect("events");
        assert_eq!(rest, vec![StreamEvent::stopped()]);
    }

    #[tokio::test]
    async fn cancelling_pending_request_ends_with_stop_finish() {
        let transport = ScriptedTransport::new(vec![Scripted::Pending]);
        let mut stream = looped(&transport).start().expect("start");
        let cancel = stream.cancel_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let event = tokio::time::timeout(Duration::from_secs(1), stream.next_event())
            .await
            .expect("stop should arrive")
            .expect("event")
            .expect("ok");
        assert_eq!(event, StreamEvent::stopped());
        assert!(stream.next_event().await.is_none());
    }

    #[tokio::test]
    async fn events_queued_before_cancel_are_discarded() {
        let mut events = vec![json!({"type":"start","executionId":"e1"})];
        events.extend((0..20).map(|i| json!({"type":"text-delta","id":"t","delta":format!("{i}")})));
        let transport = ScriptedTransport::new(vec![Scripted::hanging(events)]);
        let mut stream = looped(&transport).start().expect("start");
        let first = stream.next_event().await.expect("first").expect("ok");
        assert!(matches!(first, StreamEvent::Start { .. }));
        // Let the loop fill the queue before cancelling.
        tokio::time::sleep(Duration::from_millis(20)).await;
        stream.cancel_token().cancel();

        let rest: Vec<_> = tokio::time::timeout(Duration::from_secs(1), stream.collect())
            .await
            .expect("loop should stop promptly");
        assert_eq!(rest, vec![Ok(StreamEvent::stopped())]);
    }

    #[tokio::test]
    async fn rotated_execution_id_is_carried_forward() {
        let transport = ScriptedTransport::new(vec![
            Scripted::events(vec![
                json!({"type":"start","executionId":"e1"}),
                json!({"type":"start","executionId":"e2"}),
                tool_request(json!([{"toolCallId":"a","toolName":"lookup","args":{"key":"k"}}])),
                json!({"type":"finish","finishReason":"tool-calls"}),
            ]),
            Scripted::events(vec![
                tool_request(json!([{"toolCallId":"b","toolName":"ask_user"}])),
                json!({"type":"finish","finishReason":"tool-calls"}),
            ]),
        ]);
        let events = looped(&transport)
            .tools(handlers())
            .start()
            .expect("start")
            .collect_events()
            .await
            .expect("events");

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1]["executionId"], "e2");
        assert!(matches!(
            events.iter().rev().nth(1),
            Some(StreamEvent::ClientToolRequest { execution_id, .. }) if execution_id == "e2"
        ));
        assert_eq!(
            events.last(),
            Some(&StreamEvent::finish(
                FinishReason::ClientToolCalls,
                Some("e2".into())
            ))
        );
    }

    #[tokio::test]
    async fn cancel_during_local_batch_suppresses_outputs() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let started = Arc::new(tokio::sync::Notify::new());
        let completed = Arc::new(AtomicBool::new(false));
        let tools = ToolHandlers::new().register_fn("slow", {
            let started = started.clone();
            let completed = completed.clone();
            move |_args| {
                let started = started.clone();
                let completed = completed.clone();
                async move {
                    started.notify_one();
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    completed.store(true, Ordering::SeqCst);
                    Ok::<_, ToolError>(json!("late"))
                }
            }
        });
        let transport = ScriptedTransport::new(vec![
            Scripted::events(vec![
                json!({"type":"start","executionId":"e1"}),
                tool_request(json!([{"toolCallId":"a","toolName":"slow"}])),
                json!({"type":"finish","finishReason":"tool-calls"}),
            ]),
            Scripted::events(vec![json!({"type":"finish","finishReason":"stop"})]),
        ]);
        let stream = looped(&transport).tools(tools).start().expect("start");
        started.notified().await;
        stream.cancel_token().cancel();

        let events = tokio::time::timeout(Duration::from_secs(1), stream.collect_events())
            .await
            .expect("loop should stop")
            .expect("events");
        assert_eq!(events, vec![StreamEvent::stopped()]);
        assert!(completed.load(Ordering::SeqCst));
        assert_eq!(transport.request_count(), 1);
    }

    #[test]
    fn zero_buffer_is_rejected() {
        let transport = ScriptedTransport::new(vec![]);
        let result = looped(&transport).stream_buffer_capacity(0).start();
        assert!(matches!(result, Err(ClientError::Validation(_))));
    }
}
