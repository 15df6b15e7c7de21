//! Server-Sent-Events framing for the event stream.
//!
//! Only `data: ` lines carry records; `data: [DONE]` closes a stream and is
//! not a record itself.
mod decoder;
mod encoder;

pub use decoder::{SseDecoder, decode_events};
pub use encoder::{DONE_RECORD, encode_event, encode_events};

const DATA_PREFIX: &str = "data: ";
const DONE_SENTINEL: &str = "[DONE]";
