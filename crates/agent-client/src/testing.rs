//! Scripted in-memory transport for exercising the loop without a network.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::StreamExt as _;
use serde_json::Value;

use crate::cancel::CancelToken;
use crate::errors::ClientError;
use crate::transport::{ByteStream, Endpoint, Transport, TransportResponse};

/// Chunk size used to split scripted bodies, so every test also crosses
/// record boundaries mid-line.
const CHUNK: usize = 7;

pub(crate) enum Scripted {
    /// Full SSE body, closed after `data: [DONE]`.
    Body(String),
    /// SSE body that never closes after its last chunk.
    Hanging(String),
    Failed { status: u16, message: String },
    Error(ClientError),
    /// Never responds until the cancel token fires.
    Pending,
}

impl Scripted {
    pub(crate) fn events(events: Vec<Value>) -> Self {
        let mut body = encode(&events);
        body.push_str("data: [DONE]\n\n");
        Self::Body(body)
    }

    pub(crate) fn hanging(events: Vec<Value>) -> Self {
        Self::Hanging(encode(&events))
    }

    pub(crate) fn raw(body: &str) -> Self {
        Self::Body(body.to_string())
    }
}

fn encode(events: &[Value]) -> String {
    events.iter().map(|e| format!("data: {e}\n\n")).collect()
}

fn chunked(body: &str) -> Vec<Result<Bytes, ClientError>> {
    body.as_bytes()
        .chunks(CHUNK)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect()
}

pub(crate) struct ScriptedTransport {
    responses: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<(Endpoint, Value)>>,
}

impl ScriptedTransport {
    pub(crate) fn new(responses: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Request bodies in the order they were posted.
    pub(crate) fn requests(&self) -> Vec<Value> {
        self.requests
            .lock()
            .expect("requests lock")
            .iter()
            .map(|(_, body)| body.clone())
            .collect()
    }

    pub(crate) fn endpoints(&self) -> Vec<Endpoint> {
        self.requests
            .lock()
            .expect("requests lock")
            .iter()
            .map(|(endpoint, _)| endpoint.clone())
            .collect()
    }

    pub(crate) fn request_count(&self) -> usize {
        self.requests.lock().expect("requests lock").len()
    }
}

#[async_trait::async_trait]
impl Transport for ScriptedTransport {
    async fn post(
        &self,
        endpoint: &Endpoint,
        body: Value,
        cancel: &CancelToken,
    ) -> Result<TransportResponse, ClientError> {
        self.requests
            .lock()
            .expect("requests lock")
            .push((endpoint.clone(), body));
        let next = self.responses.lock().expect("responses lock").pop_front();
        match next {
            Some(Scripted::Body(body)) => {
                let stream: ByteStream = Box::pin(futures::stream::iter(chunked(&body)));
                Ok(TransportResponse::Stream(stream))
            }
            Some(Scripted::Hanging(body)) => {
                let stream: ByteStream = Box::pin(
                    futures::stream::iter(chunked(&body)).chain(futures::stream::pending()),
                );
                Ok(TransportResponse::Stream(stream))
            }
            Some(Scripted::Failed { status, message }) => {
                Ok(TransportResponse::Failed { status, message })
            }
            Some(Scripted::Error(err)) => Err(err),
            Some(Scripted::Pending) => {
                cancel.cancelled().await;
                Err(ClientError::Cancelled)
            }
            None => Err(ClientError::protocol_msg(format!(
                "no scripted response left for {endpoint}"
            ))),
        }
    }
}
