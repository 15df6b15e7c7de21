use std::collections::VecDeque;

use futures::StreamExt as _;
use futures::stream;
use tracing::debug;

use crate::errors::ClientError;
use crate::stream::StreamEvent;
use crate::transport::ByteStream;

use super::{DATA_PREFIX, DONE_SENTINEL};

/// Incremental line decoder for `data: ` records.
///
/// Bytes are buffered until a newline arrives, so chunk boundaries (including
/// ones that split a multi-byte character) never change the output.
#[derive(Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    /// Appends a chunk and returns the payloads of every completed record.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<String> {
        let scan_from = self.buf.len();
        self.buf.extend_from_slice(chunk);
        let mut records = Vec::new();
        let mut start = 0;
        for idx in scan_from..self.buf.len() {
            if self.buf[idx] == b'\n' {
                if let Some(record) = parse_line(&self.buf[start..idx]) {
                    records.push(record);
                }
                start = idx + 1;
            }
        }
        self.buf.drain(..start);
        records
    }

    /// Drains whatever is left after end-of-stream.
    ///
    /// An unterminated `data: ` line still counts; an empty buffer does not.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        parse_line(&rest)
    }
}

fn parse_line(bytes: &[u8]) -> Option<String> {
    if bytes.is_empty() {
        return None;
    }
    let text = String::from_utf8_lossy(bytes);
    let line = text.trim_end_matches('\r');
    let payload = line.strip_prefix(DATA_PREFIX)?;
    if payload == DONE_SENTINEL {
        return None;
    }
    Some(payload.to_owned())
}

/// Parses and validates one record payload, dropping anything unusable.
pub(crate) fn parse_record(payload: &str) -> Option<StreamEvent> {
    let value: serde_json::Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(err) => {
            debug!(error = %err, "dropping SSE record with invalid JSON");
            return None;
        }
    };
    match StreamEvent::from_value(&value) {
        Ok(event) => Some(event),
        Err(err) => {
            debug!(error = %err, "dropping SSE record that failed validation");
            None
        }
    }
}

/// Turns a response body into a lazy stream of validated events.
///
/// Read failures are yielded as a final `Err`; malformed records are skipped.
pub fn decode_events(
    bytes_stream: ByteStream,
) -> impl futures::Stream<Item = Result<StreamEvent, ClientError>> + Send {
    struct State {
        bytes_stream: ByteStream,
        decoder: SseDecoder,
        pending: VecDeque<StreamEvent>,
        done: bool,
    }

    stream::try_unfold(
        State {
            bytes_stream,
            decoder: SseDecoder::default(),
            pending: VecDeque::new(),
            done: false,
        },
        |mut state| async move {
            loop {
                if let Some(event) = state.pending.pop_front() {
                    return Ok(Some((event, state)));
                }
                if state.done {
                    return Ok(None);
                }

                match state.bytes_stream.next().await {
                    Some(Ok(chunk)) => {
                        let records = state.decoder.push_chunk(&chunk);
                        state
                            .pending
                            .extend(records.iter().filter_map(|r| parse_record(r)));
                    }
                    Some(Err(err)) => return Err(err),
                    None => {
                        state.done = true;
                        if let Some(event) = state.decoder.finish().as_deref().and_then(parse_record)
                        {
                            state.pending.push_back(event);
                        }
                    }
                }
            }
        },
    )
}
