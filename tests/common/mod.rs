//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use dispatchd::bootstrap::{ServiceState, Shutdown};
use dispatchd::config::{Config, EventsConfig};
use dispatchd::dispatch::{MockReply, MockTransport};
use dispatchd::events::{EventEmitter, MemorySink};
use dispatchd::store::{MemoryStorage, SharedStorage};
use dispatchd::telemetry::AdminState;

pub const CONFIG: &str = r#"
vendors:
  - vendor: gupshup
    base_url: "https://gupshup.test"
    credentials: { user: "2000", password: "secret" }
    channels:
      - channel: SMS
      - channel: WHATSAPP
  - vendor: karix
    base_url: "https://karix.test"
    credentials: { api_key: "key", sender: "DISPCH" }
    channels:
      - channel: SMS
      - channel: WHATSAPP
  - vendor: fcm
    base_url: "https://fcm.test"
    channels:
      - channel: APP_NOTIFICATION
  - vendor: netcore
    base_url: "https://netcore.test"
    credentials: { api_key: "mail-key", sender: "noreply@dispatch.test" }
    channels:
      - channel: EMAIL
selector:
  SMS:
    gupshup: 1
  WHATSAPP:
    gupshup: 1
retry:
  max_retries: 3
templates:
  - name: otp
    channel: SMS
    body: "Your code is {{code}}"
  - name: otp
    channel: WHATSAPP
    body: "Your code is {{code}}"
  - name: otp
    channel: APP_NOTIFICATION
    body: "Your code is {{code}}"
    subject: "Sign-in code"
  - name: otp
    channel: EMAIL
    body: "<p>Your code is {{code}}</p>"
    subject: "Sign-in code"
"#;

pub const PHONE: &str = "919800000001";

pub const GUPSHUP_OK: &str = "success | 919800000001 | 3456789012345";
pub const GUPSHUP_ERROR: &str = "error | 105 | Invalid destination";
pub const KARIX_OK: &str = r#"{"status":{"code":200,"desc":"Accepted"},"data":{"id":"kx-77"}}"#;
pub const FCM_UNAVAILABLE: &str = r#"{"success":0,"failure":1,"results":[{"error":"Unavailable"}]}"#;
pub const NETCORE_ERROR: &str = r#"{"status":"error","error":[{"message":"invalid sender"}]}"#;

pub struct Fixture {
    pub state: ServiceState,
    pub store: Arc<MemoryStorage>,
    pub transport: Arc<MockTransport>,
    pub sink: Arc<MemorySink>,
}

pub fn fixture(default: MockReply) -> Fixture {
    let config = Arc::new(Config::from_yaml(CONFIG).expect("valid config"));
    let store = Arc::new(MemoryStorage::new());
    let transport = Arc::new(MockTransport::new(default));
    let sink = Arc::new(MemorySink::new());
    let events = EventsConfig {
        initial_backoff: Duration::from_millis(1),
        ..EventsConfig::default()
    };

    let state = ServiceState::assemble(
        config,
        store.clone() as SharedStorage,
        transport.clone(),
        Arc::new(EventEmitter::new(sink.clone(), events)),
        Arc::new(AdminState::new()),
        Shutdown::new(Duration::from_secs(5)),
    );

    Fixture {
        state,
        store,
        transport,
        sink,
    }
}

pub fn event(channel: &str) -> Bytes {
    Bytes::from(format!(
        r#"{{"channels":["{}"],"actorId":42,"actorType":"CUSTOMER",
            "contact":{{"phoneNumber":"{}","fcmToken":"fcm-token-1",
                "fcmApiKey":"srv-key","email":"user@dispatch.test"}},"templateName":"otp",
            "placeholders":{{"code":"1234"}},"campaignName":"CMP_launch"}}"#,
        channel, PHONE
    ))
}

impl Fixture {
    /// Ingest one event and return the single reference id it produced.
    pub fn submit(&self, raw: Bytes) -> String {
        let ingested = self.state.ingest(raw).expect("event derived");
        assert!(ingested.rejected.is_empty(), "rejected: {:?}", ingested.rejected);
        assert_eq!(ingested.reference_ids.len(), 1);
        ingested.reference_ids[0].clone()
    }

    /// Wait until every attempt and retry finished.
    pub async fn settle(&self) {
        assert!(
            self.state.dispatcher.drain(Duration::from_secs(5)).await,
            "dispatch did not settle"
        );
    }
}
