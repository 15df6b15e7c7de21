use futures::StreamExt as _;
use reqwest::StatusCode;
use reqwest::header::ACCEPT;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::errors::ClientError;
use crate::transport::{ClientConfig, Endpoint, Transport, TransportResponse};

/// reqwest-backed [`Transport`].
pub struct HttpTransport {
    client: reqwest::Client,
    config: ClientConfig,
}

impl HttpTransport {
    /// Creates a transport from explicit configuration.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| ClientError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    /// Creates a transport configured from `AGENT_CLIENT_*` variables.
    pub fn from_env() -> Result<Self, ClientError> {
        Self::new(ClientConfig::from_env()?)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn post(
        &self,
        endpoint: &Endpoint,
        body: serde_json::Value,
        cancel: &CancelToken,
    ) -> Result<TransportResponse, ClientError> {
        let url = self.config.url_for(endpoint);
        debug!(%url, "posting continuation request");

        let mut request = self
            .client
            .post(&url)
            .header(ACCEPT, "text/event-stream")
            .json(&body);
        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            sent = request.send() => sent
                .map_err(|e| ClientError::transport(format!("request to {url} failed: {e}")))?,
        };

        let status = response.status();
        if !status.is_success() {
            let text = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                text = response.text() => text.unwrap_or_default(),
            };
            let message = error_message(status, &text);
            debug!(%url, status = status.as_u16(), %message, "service rejected request");
            return Ok(TransportResponse::Failed {
                status: status.as_u16(),
                message,
            });
        }

        let stream = response.bytes_stream().map(|chunk| {
            chunk.map_err(|e| ClientError::transport(format!("stream read failed: {e}")))
        });
        Ok(TransportResponse::Stream(Box::pin(stream)))
    }
}

/// Extracts a human-readable message from an error response body.
fn error_message(status: StatusCode, body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        let message = value
            .get("message")
            .and_then(|v| v.as_str())
            .or_else(|| {
                value
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(|v| v.as_str())
            })
            .or_else(|| value.get("error").and_then(|v| v.as_str()));
        if let Some(message) = message {
            return message.to_string();
        }
    }
    let trimmed = body.trim();
    if !trimmed.is_empty() {
        return trimmed.to_string();
    }
    status
        .canonical_reason()
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| format!("request failed with status {}", status.as_u16()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sse::decode_events;
    use crate::stream::StreamEvent;
    use futures::StreamExt as _;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::TcpListener;

    #[test]
    fn error_message_prefers_structured_fields() {
        let status = StatusCode::BAD_REQUEST;
        assert_eq!(error_message(status, r#"{"message":"bad input"}"#), "bad input");
        assert_eq!(
            error_message(status, r#"{"error":{"message":"nested"}}"#),
            "nested"
        );
        assert_eq!(error_message(status, r#"{"error":"flat"}"#), "flat");
        assert_eq!(error_message(status, "plain text\n"), "plain text");
        assert_eq!(error_message(status, ""), "Bad Request");
    }

    /// Accepts one connection, captures the request, and replies with `response`.
    async fn serve_once(response: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut request = Vec::new();
            let mut buf = [0_u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.expect("read");
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let content_length = text[..head_end]
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if request.len() >= head_end + 4 + content_length {
                        break;
                    }
                }
            }
            socket.write_all(response.as_bytes()).await.expect("write");
            socket.shutdown().await.expect("shutdown");
            String::from_utf8_lossy(&request).into_owned()
        });
        (format!("http://{addr}"), handle)
    }

    #[tokio::test]
    async fn streams_sse_body_and_sends_auth_and_json() {
        let (base_url, server) = serve_once(concat!(
            "HTTP/1.1 200 OK\r\n",
            "content-type: text/event-stream\r\n",
            "connection: close\r\n\r\n",
            "data: {\"type\":\"start\",\"executionId\":\"e1\"}\n\n",
            "data: [DONE]\n\n",
        ))
        .await;
        let transport =
            HttpTransport::new(ClientConfig::new(base_url).api_key("secret")).expect("transport");

        let response = transport
            .post(
                &Endpoint::session("s1"),
                serde_json::json!({"triggerName": "chat"}),
                &CancelToken::new(),
            )
            .await
            .expect("post");
        let TransportResponse::Stream(body) = response else {
            panic!("expected stream response");
        };
        let events: Vec<_> = decode_events(body).collect().await;
        assert_eq!(
            events,
            vec![Ok(StreamEvent::Start {
                execution_id: Some("e1".into()),
                message_id: None,
            })]
        );

        let request = server.await.expect("server");
        assert!(request.starts_with("POST /sessions/s1/messages HTTP/1.1"));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer secret"));
        assert!(request.contains(r#"{"triggerName":"chat"}"#));
    }

    #[tokio::test]
    async fn non_success_status_becomes_failed_response() {
        let (base_url, server) = serve_once(concat!(
            "HTTP/1.1 404 Not Found\r\n",
            "content-type: application/json\r\n",
            "content-length: 29\r\n",
            "connection: close\r\n\r\n",
            "{\"message\":\"unknown session\"}",
        ))
        .await;
        let transport = HttpTransport::new(ClientConfig::new(base_url)).expect("transport");
        let response = transport
            .post(
                &Endpoint::session("missing"),
                serde_json::json!({}),
                &CancelToken::new(),
            )
            .await
            .expect("post");
        assert!(matches!(
            response,
            TransportResponse::Failed { status: 404, ref message } if message == "unknown session"
        ));
        let _ = server.await;
    }

    #[tokio::test]
    async fn cancelled_token_aborts_before_send() {
        let transport =
            HttpTransport::new(ClientConfig::new("http://127.0.0.1:9")).expect("transport");
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = transport
            .post(&Endpoint::worker("a"), serde_json::json!({}), &cancel)
            .await;
        assert!(matches!(result, Err(ClientError::Cancelled)));
    }

    #[test]
    fn new_rejects_invalid_config() {
        assert!(matches!(
            HttpTransport::new(ClientConfig::new("")),
            Err(ClientError::Config(_))
        ));
    }
}
