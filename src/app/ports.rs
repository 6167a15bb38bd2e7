use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::{Duration, Instant};

// Extract-side ports
#[async_trait]
pub trait HttpClientPort: Send + Sync {
    async fn get(&self, url: &str, query: &[(String, String)]) -> Result<HttpGetResult, TransportError>;
}

#[derive(Clone, Debug)]
pub struct HttpGetResult {
    pub status: u16,
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub retry_after: Option<Duration>,
}

impl HttpGetResult {
    pub fn is_success(&self) -> bool {
        (200..=299).contains(&self.status)
    }

    /// Leading part of the body for log lines and error messages
    pub fn body_excerpt(&self, max_chars: usize) -> String {
        String::from_utf8_lossy(&self.bytes).chars().take(max_chars).collect()
    }
}

/// Failure below HTTP: the request never produced a status code
#[derive(Clone, Debug, PartialEq)]
pub struct TransportError {
    pub message: String,
    /// Timeouts and refused/reset connections are worth another attempt
    pub transient: bool,
}

impl TransportError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Source of time for pacing, backoff and timestamps
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn utc_now(&self) -> DateTime<Utc>;
    async fn sleep(&self, duration: Duration);
}
