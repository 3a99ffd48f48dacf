//! Scripted vendor transport for testing without vendor endpoints.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, Instant};
use tracing::trace;

use crate::message::Channel;
use crate::vendor::{RawResponse, VendorId, VendorRequest};

use super::transport::{HttpTransport, TransportError};

/// Reply the mock gives to one request.
#[derive(Debug, Clone)]
pub enum MockReply {
    Respond(RawResponse),
    /// Fail without a response (connect error).
    Fail(String),
    /// Never answer; only cancellation ends the attempt.
    Hang,
}

impl MockReply {
    pub fn ok(body: &str) -> Self {
        MockReply::Respond(RawResponse::new(200, body))
    }

    pub fn status(status: u16, body: &str) -> Self {
        MockReply::Respond(RawResponse::new(status, body))
    }
}

/// A request seen by the mock.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub channel: Channel,
    pub vendor: VendorId,
    pub request: VendorRequest,
}

/// Transport answering from a script, then from a default reply.
#[derive(Debug)]
pub struct MockTransport {
    script: Mutex<VecDeque<MockReply>>,
    default: MockReply,
    latency: Duration,
    calls: Mutex<Vec<MockCall>>,
}

impl MockTransport {
    /// Every request gets `default` once the script is empty.
    pub fn new(default: MockReply) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default,
            latency: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Queue a reply for the next unanswered request.
    pub fn push(&self, reply: MockReply) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(reply);
        }
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Poll until at least `n` requests arrived or `timeout` passes.
    pub async fn wait_for_calls(&self, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.call_count() < n {
            if Instant::now() >= deadline {
                return false;
            }
            sleep(Duration::from_millis(5)).await;
        }
        true
    }

    fn next_reply(&self) -> MockReply {
        self.script
            .lock()
            .ok()
            .and_then(|mut s| s.pop_front())
            .unwrap_or_else(|| self.default.clone())
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn execute(
        &self,
        channel: Channel,
        vendor: VendorId,
        request: VendorRequest,
    ) -> Result<RawResponse, TransportError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(MockCall {
                channel,
                vendor,
                request,
            });
        }

        let reply = self.next_reply();
        trace!(%channel, %vendor, reply = ?reply, "mock transport answering");

        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }

        match reply {
            MockReply::Respond(response) => Ok(response),
            MockReply::Fail(reason) => Err(TransportError::Connect(reason)),
            MockReply::Hang => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_then_default() {
        let mock = MockTransport::new(MockReply::ok("default"));
        mock.push(MockReply::status(500, "boom"));
        mock.push(MockReply::Fail("refused".into()));

        let req = || VendorRequest::post("http://vendor.test/send");
        let first = mock.execute(Channel::Sms, VendorId::Gupshup, req()).await.unwrap();
        assert_eq!(first.status, 500);
        assert!(mock.execute(Channel::Sms, VendorId::Karix, req()).await.is_err());
        let third = mock.execute(Channel::Sms, VendorId::Gupshup, req()).await.unwrap();
        assert_eq!(third.body, "default");

        let calls = mock.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[1].vendor, VendorId::Karix);
    }
}
