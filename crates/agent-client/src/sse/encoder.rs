use bytes::Bytes;
use futures::StreamExt as _;
use futures::stream;
use tracing::warn;

use crate::errors::ClientError;
use crate::stream::StreamEvent;

use super::DATA_PREFIX;

/// Final record of every encoded stream.
pub const DONE_RECORD: &str = "data: [DONE]\n\n";

/// Serializes one event as a `data: <json>\n\n` record.
pub fn encode_event(event: &StreamEvent) -> String {
    match serde_json::to_string(event) {
        Ok(json) => format!("{DATA_PREFIX}{json}\n\n"),
        Err(err) => {
            let fallback = serde_json::json!({
                "type": "internal-error",
                "message": format!("failed to encode {} event: {err}", event.kind()),
            });
            format!("{DATA_PREFIX}{fallback}\n\n")
        }
    }
}

/// Encodes an event sequence as an SSE response body.
///
/// The body always ends with [`DONE_RECORD`]. If the source yields an error,
/// it is reported as one `internal-error` record and the body is closed.
pub fn encode_events<S>(events: S) -> impl futures::Stream<Item = Bytes> + Send
where
    S: futures::Stream<Item = Result<StreamEvent, ClientError>> + Send + 'static,
{
    enum State<S> {
        Streaming(std::pin::Pin<Box<S>>),
        Closing,
        Closed,
    }

    stream::unfold(State::Streaming(Box::pin(events)), |state| async move {
        match state {
            State::Streaming(mut events) => match events.next().await {
                Some(Ok(event)) => Some((
                    Bytes::from(encode_event(&event)),
                    State::Streaming(events),
                )),
                Some(Err(err)) => {
                    warn!(error = %err, "event source failed while encoding SSE body");
                    let record = encode_event(&StreamEvent::internal_error(err.to_string()));
                    Some((Bytes::from(record), State::Closing))
                }
                None => Some((Bytes::from_static(DONE_RECORD.as_bytes()), State::Closed)),
            },
            State::Closing => Some((Bytes::from_static(DONE_RECORD.as_bytes()), State::Closed)),
            State::Closed => None,
        }
    })
}
