//! Downstream event sinks.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use thiserror::Error;
use tracing::info;

/// Publish failure.
#[derive(Debug, Error)]
pub enum EmitError {
    #[error("sink rejected publish: {0}")]
    Rejected(String),
    #[error("sink unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Destination for acknowledgement, dead-letter and campaign events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, payload: Bytes) -> Result<(), EmitError>;
}

// =============================================================================
// MemorySink
// =============================================================================

/// One record captured by [`MemorySink`].
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedEvent {
    pub topic: String,
    pub key: String,
    pub payload: Bytes,
}

impl PublishedEvent {
    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.payload).ok()
    }
}

/// In-process sink that keeps every published record.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<PublishedEvent>>,
    failures: Mutex<u32>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `n` publishes.
    pub fn fail_next(&self, n: u32) {
        if let Ok(mut failures) = self.failures.lock() {
            *failures = n;
        }
    }

    pub fn events(&self) -> Vec<PublishedEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn on_topic(&self, topic: &str) -> Vec<PublishedEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.topic == topic)
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn publish(&self, topic: &str, key: &str, payload: Bytes) -> Result<(), EmitError> {
        if let Ok(mut failures) = self.failures.lock() {
            if *failures > 0 {
                *failures -= 1;
                return Err(EmitError::Rejected("injected failure".into()));
            }
        }

        let mut events = self
            .events
            .lock()
            .map_err(|_| EmitError::Rejected("sink lock poisoned".into()))?;
        events.push(PublishedEvent {
            topic: topic.to_string(),
            key: key.to_string(),
            payload,
        });
        Ok(())
    }
}

// =============================================================================
// HttpSink
// =============================================================================

/// POSTs each record to `{url}/{topic}` with the key in `X-Event-Key`.
#[derive(Debug, Clone)]
pub struct HttpSink {
    url: String,
    client: Client,
}

impl HttpSink {
    pub fn new(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl EventSink for HttpSink {
    async fn publish(&self, topic: &str, key: &str, payload: Bytes) -> Result<(), EmitError> {
        let response = self
            .client
            .post(format!("{}/{}", self.url, topic))
            .header("Content-Type", "application/json")
            .header("X-Event-Key", key)
            .body(payload)
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(EmitError::Rejected(format!(
                "{} returned status {}",
                topic,
                response.status()
            )))
        }
    }
}

// =============================================================================
// LogSink
// =============================================================================

/// Writes each record as a structured log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn publish(&self, topic: &str, key: &str, payload: Bytes) -> Result<(), EmitError> {
        info!(
            topic,
            key,
            payload = %String::from_utf8_lossy(&payload),
            "event published"
        );
        Ok(())
    }
}
