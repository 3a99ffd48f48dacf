//! Vendor HTTP transport.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::config::VendorConfig;
use crate::message::Channel;
use crate::vendor::{RawResponse, VendorId, VendorRequest};

/// Default client timeouts for pairs without configuration.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Failure to obtain any HTTP response from a vendor.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("failed to read response body: {0}")]
    Body(String),
}

impl TransportError {
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::Timeout => "timeout",
            TransportError::Connect(_) => "connect",
            TransportError::Request(_) => "request",
            TransportError::Body(_) => "body",
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout
        } else if e.is_connect() {
            TransportError::Connect(e.to_string())
        } else if e.is_body() || e.is_decode() {
            TransportError::Body(e.to_string())
        } else {
            TransportError::Request(e.to_string())
        }
    }
}

/// Executes vendor requests.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(
        &self,
        channel: Channel,
        vendor: VendorId,
        request: VendorRequest,
    ) -> Result<RawResponse, TransportError>;
}

/// reqwest-backed transport with one client per `(channel, vendor)` pair,
/// each carrying that pair's connect and read timeouts.
pub struct ReqwestTransport {
    clients: HashMap<(Channel, VendorId), reqwest::Client>,
    fallback: reqwest::Client,
}

impl ReqwestTransport {
    pub fn from_config(vendors: &[VendorConfig]) -> anyhow::Result<Self> {
        let mut clients = HashMap::new();
        for vendor in vendors {
            for channel in &vendor.channels {
                let client = reqwest::Client::builder()
                    .connect_timeout(channel.connect_timeout)
                    .timeout(channel.connect_timeout + channel.read_timeout)
                    .build()?;
                clients.insert((channel.channel, vendor.vendor), client);
            }
        }

        let fallback = reqwest::Client::builder()
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()?;

        Ok(Self { clients, fallback })
    }

    fn client(&self, channel: Channel, vendor: VendorId) -> &reqwest::Client {
        self.clients.get(&(channel, vendor)).unwrap_or(&self.fallback)
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(
        &self,
        channel: Channel,
        vendor: VendorId,
        request: VendorRequest,
    ) -> Result<RawResponse, TransportError> {
        let mut builder = self
            .client(channel, vendor)
            .request(request.method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;

        debug!(%channel, %vendor, status, "vendor responded");
        Ok(RawResponse::new(status, body))
    }
}
