//! Shared service state.
//!
//! Wires every component the front doors need:
//! - storage (acknowledgements, opt-in records)
//! - vendor registry, selector and transport
//! - dispatcher and its in-flight tracker
//! - deriver, webhook reconciler and event emitter

use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Config;
use crate::deriver::{DefaultLanguageResolver, DeriveError, EventDeriver, StaticTemplateCatalog};
use crate::dispatch::{
    DispatchContext, Dispatcher, HttpTransport, InFlightTracker, ReqwestTransport,
};
use crate::events::EventEmitter;
use crate::message::Channel;
use crate::store::{SharedStorage, StoreStats};
use crate::telemetry::AdminState;
use crate::vendor::{VendorRegistry, VendorSelector};
use crate::webhook::InboundWebhookReconciler;

use super::Shutdown;

/// Name of the storage dependency on the readiness endpoint.
pub const STORAGE_DEPENDENCY: &str = "storage";

/// Result of ingesting one message-request event.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ingested {
    /// Reference ids of the submitted messages
    pub reference_ids: Vec<String>,
    /// Channels derived but not submitted
    pub rejected: Vec<Rejection>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Rejection {
    pub channel: Channel,
    pub reason: &'static str,
}

/// Shared service state.
///
/// Passed to the ingress and server; every field is cheap to clone.
#[derive(Clone)]
pub struct ServiceState {
    pub config: Arc<Config>,
    pub store: SharedStorage,
    pub selector: Arc<VendorSelector>,
    pub emitter: Arc<EventEmitter>,
    pub dispatcher: Arc<Dispatcher>,
    pub deriver: Arc<EventDeriver>,
    pub reconciler: Arc<InboundWebhookReconciler>,
    pub admin: Arc<AdminState>,
    pub shutdown: Arc<Shutdown>,
}

/// Shared state handle.
pub type SharedServiceState = Arc<ServiceState>;

impl ServiceState {
    /// Build the state with the configured vendor transport and event sink.
    pub fn new(
        config: Arc<Config>,
        store: SharedStorage,
        admin: Arc<AdminState>,
        shutdown: Arc<Shutdown>,
    ) -> anyhow::Result<Self> {
        let transport = Arc::new(ReqwestTransport::from_config(&config.vendors)?);
        let emitter = Arc::new(EventEmitter::from_config(&config.events)?);
        Ok(Self::assemble(config, store, transport, emitter, admin, shutdown))
    }

    /// Build the state around an explicit transport and emitter.
    pub fn assemble(
        config: Arc<Config>,
        store: SharedStorage,
        transport: Arc<dyn HttpTransport>,
        emitter: Arc<EventEmitter>,
        admin: Arc<AdminState>,
        shutdown: Arc<Shutdown>,
    ) -> Self {
        let registry = Arc::new(VendorRegistry::from_config(&config.vendors));
        let selector = Arc::new(VendorSelector::new(config.selector_weights()));
        let in_flight = InFlightTracker::new();

        admin.register_dependency(STORAGE_DEPENDENCY);
        admin.set_dependency_health(STORAGE_DEPENDENCY, store.is_ready());
        admin.track_in_flight(in_flight.clone());

        let ctx = DispatchContext {
            registry: registry.clone(),
            selector: selector.clone(),
            transport,
            store: store.clone(),
            emitter: emitter.clone(),
            in_flight,
            cancel: CancellationToken::new(),
            admin: admin.clone(),
        };
        let dispatcher = Arc::new(Dispatcher::new(ctx, &config.retry, &config.optin));

        let language = &config.settings.default_language;
        let deriver = Arc::new(EventDeriver::new(
            Arc::new(StaticTemplateCatalog::new(&config.templates, language)),
            Arc::new(DefaultLanguageResolver::new(language)),
        ));

        let reconciler = Arc::new(InboundWebhookReconciler::new(
            store.clone(),
            emitter.clone(),
            dispatcher.clone(),
            admin.clone(),
            config.webhook.clone(),
        ));

        info!(
            vendors = ?registry.available(),
            templates = config.templates.len(),
            "service components built"
        );

        Self {
            config,
            store,
            selector,
            emitter,
            dispatcher,
            deriver,
            reconciler,
            admin,
            shutdown,
        }
    }

    /// Derive an inbound event and submit every derived message.
    ///
    /// Fails only when nothing could be derived; per-channel submission
    /// failures are reported in [`Ingested::rejected`].
    pub fn ingest(&self, raw: Bytes) -> Result<Ingested, DeriveError> {
        let messages = self.deriver.derive(raw)?;
        let mut ingested = Ingested::default();

        for msg in messages {
            let channel = msg.channel;
            match self.dispatcher.send(msg) {
                Ok(reference_id) => ingested.reference_ids.push(reference_id),
                Err(e) => ingested.rejected.push(Rejection {
                    channel,
                    reason: e.reason(),
                }),
            }
        }

        debug!(
            submitted = ingested.reference_ids.len(),
            rejected = ingested.rejected.len(),
            "event ingested"
        );
        Ok(ingested)
    }

    /// Refresh the storage readiness flag.
    pub fn check_storage(&self) -> bool {
        let ready = self.store.is_ready();
        self.admin.set_dependency_health(STORAGE_DEPENDENCY, ready);
        ready
    }

    pub fn store_stats(&self) -> StoreStats {
        self.store.stats()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::EventsConfig;
    use crate::dispatch::{MockReply, MockTransport};
    use crate::events::MemorySink;
    use crate::store::MemoryStorage;
    use std::time::Duration;

    pub const CONFIG: &str = r#"
vendors:
  - vendor: gupshup
    base_url: "https://gupshup.test"
    credentials: { user: "u", password: "p" }
    channels:
      - channel: SMS
      - channel: WHATSAPP
  - vendor: karix
    base_url: "https://karix.test"
    credentials: { api_key: "k" }
    channels:
      - channel: SMS
selector:
  SMS:
    gupshup: 1
templates:
  - name: otp
    channel: SMS
    body: "Your code is {{code}}"
  - name: otp
    channel: WHATSAPP
    body: "Code {{code}}"
"#;

    pub struct TestState {
        pub state: ServiceState,
        pub transport: Arc<MockTransport>,
        pub sink: Arc<MemorySink>,
    }

    pub fn state(default: MockReply) -> TestState {
        let config = Arc::new(Config::from_yaml(CONFIG).unwrap());
        let transport = Arc::new(MockTransport::new(default));
        let sink = Arc::new(MemorySink::new());
        let events = EventsConfig {
            initial_backoff: Duration::from_millis(1),
            ..EventsConfig::default()
        };
        let state = ServiceState::assemble(
            config,
            Arc::new(MemoryStorage::new()),
            transport.clone(),
            Arc::new(EventEmitter::new(sink.clone(), events)),
            Arc::new(AdminState::new()),
            Shutdown::new(Duration::from_secs(1)),
        );
        TestState {
            state,
            transport,
            sink,
        }
    }
}
