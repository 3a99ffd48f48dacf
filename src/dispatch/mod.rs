//! Non-blocking dispatch with callback-driven completion.
//!
//! ```text
//!  Dispatcher::send(msg)
//!        │
//!        ▼
//!  DispatchService (per channel)
//!   1. opt-in gate (WhatsApp)
//!   2. vendor: pinned or VendorSelector
//!   3. Vendor::build_request
//!   4. pending Acknowledgement row
//!   5. in-flight +1, spawn attempt ──► HttpTransport ──► DeliveryCallback
//!                                                         │
//!                  Resubmit (bounded by RetryPolicy) ◄────┤
//!                  dead-letter / terminal event ◄─────────┘
//! ```
//!
//! `send` returns once the row is written. Every attempt ends on exactly one
//! callback path, which releases its in-flight slot.

mod callback;
mod inflight;
mod mock;
mod retry;
mod service;
mod transport;

pub use callback::{AttemptOutcome, DeliveryCallback, Resubmission};
pub use inflight::{InFlightPermit, InFlightTracker};
pub use mock::{MockCall, MockReply, MockTransport};
pub use retry::{RetryDecision, RetryPolicy};
pub use service::{DispatchService, SubmitError};
pub use transport::{HttpTransport, ReqwestTransport, TransportError};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{OptInConfig, RetryConfig};
use crate::events::EventEmitter;
use crate::message::{Channel, DerivedMessage};
use crate::store::SharedStorage;
use crate::telemetry::AdminState;
use crate::vendor::{VendorRegistry, VendorSelector};

/// Collaborators shared by every channel service and callback.
#[derive(Clone)]
pub struct DispatchContext {
    pub registry: Arc<VendorRegistry>,
    pub selector: Arc<VendorSelector>,
    pub transport: Arc<dyn HttpTransport>,
    pub store: SharedStorage,
    pub emitter: Arc<EventEmitter>,
    pub in_flight: InFlightTracker,
    /// Cancelled at the end of drain; outstanding attempts take `on_cancel`.
    pub cancel: CancellationToken,
    pub admin: Arc<AdminState>,
}

/// Routes messages to the service of their channel.
pub struct Dispatcher {
    services: HashMap<Channel, Arc<DispatchService>>,
    in_flight: InFlightTracker,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(ctx: DispatchContext, retry: &RetryConfig, optin: &OptInConfig) -> Self {
        let services = Channel::ALL
            .iter()
            .map(|&channel| {
                let policy = RetryPolicy::new(channel, retry.max_retries_for(channel));
                let service =
                    DispatchService::new(channel, ctx.clone(), policy, optin.no_account_cooldown);
                (channel, Arc::new(service))
            })
            .collect();

        Self {
            services,
            in_flight: ctx.in_flight,
            cancel: ctx.cancel,
        }
    }

    /// Submit a message to the service of its channel.
    pub fn send(&self, msg: DerivedMessage) -> Result<String, SubmitError> {
        match self.services.get(&msg.channel) {
            Some(service) => service.send(msg),
            None => Err(SubmitError::WrongChannel {
                message: msg.channel,
                service: msg.channel,
            }),
        }
    }

    pub fn service(&self, channel: Channel) -> Option<&Arc<DispatchService>> {
        self.services.get(&channel)
    }

    pub fn in_flight(&self) -> &InFlightTracker {
        &self.in_flight
    }

    /// Wait for outstanding attempts up to `timeout`, then cancel the rest.
    /// Returns true when everything finished without cancellation.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let outstanding = self.in_flight.count();
        info!(outstanding, timeout = ?timeout, "draining dispatch attempts");

        if tokio::time::timeout(timeout, self.in_flight.wait_idle())
            .await
            .is_ok()
        {
            info!("all dispatch attempts finished");
            return true;
        }

        warn!(
            remaining = self.in_flight.count(),
            "drain timeout reached, cancelling outstanding attempts"
        );
        self.cancel.cancel();
        self.in_flight.wait_idle().await;
        false
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::EventsConfig;
    use crate::events::MemorySink;
    use crate::store::MemoryStorage;
    use crate::vendor::test_support::vendor_config;
    use crate::vendor::VendorId;

    pub struct Harness {
        pub ctx: DispatchContext,
        pub transport: Arc<MockTransport>,
        pub sink: Arc<MemorySink>,
        pub store: Arc<MemoryStorage>,
    }

    /// Context with every built-in vendor registered, SMS weighted to gupshup.
    pub fn harness(default: MockReply) -> Harness {
        let registry = VendorRegistry::from_config(&[
            vendor_config(VendorId::Gupshup, &[Channel::Sms, Channel::Whatsapp]),
            vendor_config(VendorId::Karix, &[Channel::Sms, Channel::Whatsapp]),
            vendor_config(VendorId::Fcm, &[Channel::AppNotification]),
            vendor_config(VendorId::Netcore, &[Channel::Email]),
        ]);
        let selector = VendorSelector::new(
            [(Channel::Sms, [(VendorId::Gupshup, 1)].into_iter().collect())]
                .into_iter()
                .collect(),
        );
        let transport = Arc::new(MockTransport::new(default));
        let sink = Arc::new(MemorySink::new());
        let store = Arc::new(MemoryStorage::new());
        let events = EventsConfig {
            initial_backoff: Duration::from_millis(1),
            ..EventsConfig::default()
        };

        let ctx = DispatchContext {
            registry: Arc::new(registry),
            selector: Arc::new(selector),
            transport: transport.clone(),
            store: store.clone(),
            emitter: Arc::new(EventEmitter::new(sink.clone(), events)),
            in_flight: InFlightTracker::new(),
            cancel: CancellationToken::new(),
            admin: Arc::new(AdminState::new()),
        };

        Harness {
            ctx,
            transport,
            sink,
            store,
        }
    }
}
