use std::time::Duration;

use crate::errors::ClientError;
use crate::transport::Endpoint;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_STREAM_BUFFER_CAPACITY: usize = 128;

/// Configuration for talking to the remote execution service.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Base URL of the service, without a trailing path.
    pub base_url: String,
    /// Optional bearer token.
    pub api_key: Option<String>,
    /// Connection timeout. Streams themselves are not time-limited.
    pub connect_timeout: Duration,
    /// Bounded event buffer between the loop task and the consumer.
    pub stream_buffer_capacity: usize,
}

impl ClientConfig {
    /// Creates a config with defaults for everything but the base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            stream_buffer_capacity: DEFAULT_STREAM_BUFFER_CAPACITY,
        }
    }

    /// Builds a config from the environment.
    ///
    /// - `AGENT_CLIENT_BASE_URL` (required)
    /// - `AGENT_CLIENT_API_KEY` (optional bearer token)
    /// - `AGENT_CLIENT_CONNECT_TIMEOUT_SECS` (optional, whole seconds)
    pub fn from_env() -> Result<Self, ClientError> {
        let base_url = std::env::var("AGENT_CLIENT_BASE_URL").unwrap_or_default();
        if base_url.trim().is_empty() {
            return Err(ClientError::Config(
                "missing AGENT_CLIENT_BASE_URL for agent client".into(),
            ));
        }
        let mut config = Self::new(base_url.trim());
        if let Ok(key) = std::env::var("AGENT_CLIENT_API_KEY")
            && !key.trim().is_empty()
        {
            config = config.api_key(key.trim());
        }
        if let Ok(raw) = std::env::var("AGENT_CLIENT_CONNECT_TIMEOUT_SECS") {
            let secs: u64 = raw.trim().parse().map_err(|_| {
                ClientError::Config(format!(
                    "AGENT_CLIENT_CONNECT_TIMEOUT_SECS must be a whole number, got {raw:?}"
                ))
            })?;
            config = config.connect_timeout(Duration::from_secs(secs));
        }
        Ok(config)
    }

    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn stream_buffer_capacity(mut self, capacity: usize) -> Self {
        self.stream_buffer_capacity = capacity;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ClientError> {
        if self.base_url.trim().is_empty() {
            return Err(ClientError::Config("base_url must not be empty".into()));
        }
        if self.stream_buffer_capacity == 0 {
            return Err(ClientError::Config(
                "stream_buffer_capacity must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn url_for(&self, endpoint: &Endpoint) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), endpoint.path())
    }
}
