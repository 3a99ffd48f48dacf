//! Downstream event emission.
//!
//! Three streams leave the service:
//! - acknowledgement snapshots at forwarded state transitions
//! - the original raw inbound event when a channel exhausts its retries
//! - campaign analytics for acknowledgements of recognized campaigns
//!
//! Publishing is bounded: `publish_attempts` tries with exponential backoff
//! from `initial_backoff`. A publish that still fails is logged and counted,
//! never returned to the dispatch path.

mod sink;

pub use sink::{EmitError, EventSink, HttpSink, LogSink, MemorySink, PublishedEvent};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{EventsConfig, SinkKind};
use crate::message::Channel;
use crate::store::{AckState, Acknowledgement, Attributes, ContactType};
use crate::telemetry::counters;
use crate::vendor::VendorId;

/// Acknowledgement snapshot on the downstream stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckEvent {
    pub actor_id: u64,
    pub actor_type: String,
    pub channel: Channel,
    pub contact_id: String,
    pub contact_type: ContactType,
    pub template_name: String,
    pub language: String,
    pub vendor_name: VendorId,
    pub state: AckState,
    pub retry_count: u32,
    pub reference_id: String,
    pub parent_reference_id: Option<String>,
    pub vendor_message_id: String,
    pub vendor_delivery_time: Option<DateTime<Utc>>,
    pub actor_delivery_time: Option<DateTime<Utc>>,
    pub placeholders: HashMap<String, String>,
    pub attributes: Attributes,
    pub campaign_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AckEvent {
    pub fn new(ack: &Acknowledgement, state: AckState) -> Self {
        Self {
            actor_id: ack.actor_id,
            actor_type: ack.actor_type.clone(),
            channel: ack.channel,
            contact_id: ack.contact_id.clone(),
            contact_type: ack.contact_type,
            template_name: ack.template_name.clone(),
            language: ack.language.clone(),
            vendor_name: ack.vendor,
            state,
            retry_count: ack.retry_count,
            reference_id: ack.reference_id.clone(),
            parent_reference_id: ack.parent_reference_id.clone(),
            vendor_message_id: ack.vendor_message_id.clone(),
            vendor_delivery_time: ack.vendor_delivery_time,
            actor_delivery_time: ack.actor_delivery_time,
            placeholders: ack.placeholders.clone(),
            attributes: ack.attributes.clone(),
            campaign_name: ack.campaign_name.clone(),
            created_at: ack.created_at,
        }
    }
}

/// Publishes acknowledgement, dead-letter and campaign events through a sink.
pub struct EventEmitter {
    sink: Arc<dyn EventSink>,
    config: EventsConfig,
}

impl EventEmitter {
    pub fn new(sink: Arc<dyn EventSink>, config: EventsConfig) -> Self {
        Self { sink, config }
    }

    /// Build the emitter with the sink named in configuration.
    pub fn from_config(config: &EventsConfig) -> anyhow::Result<Self> {
        let sink: Arc<dyn EventSink> = match config.sink {
            SinkKind::Memory => Arc::new(MemorySink::new()),
            SinkKind::Log => Arc::new(LogSink),
            SinkKind::Http => {
                let url = config
                    .url
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("events.url is required for the http sink"))?;
                Arc::new(HttpSink::new(url, config.timeout)?)
            }
        };
        Ok(Self::new(sink, config.clone()))
    }

    pub fn config(&self) -> &EventsConfig {
        &self.config
    }

    /// Publish an acknowledgement snapshot at `state`.
    pub async fn publish(&self, ack: &Acknowledgement, state: AckState) -> bool {
        let payload = match serde_json::to_vec(&AckEvent::new(ack, state)) {
            Ok(p) => Bytes::from(p),
            Err(e) => {
                warn!(reference_id = %ack.reference_id, error = %e, "failed to encode acknowledgement event");
                counters::event_published(&self.config.ack_topic, "encode_error");
                return false;
            }
        };
        self.send(&self.config.ack_topic, &ack.reference_id, payload)
            .await
    }

    /// Forward the original inbound event bytes to the dead-letter topic.
    pub async fn dead_letter(&self, reference_id: &str, raw_event: Bytes) -> bool {
        self.send(&self.config.dead_letter_topic, reference_id, raw_event)
            .await
    }

    /// Campaign analytics apply to acknowledgements of a recognized campaign
    /// sent to a known actor.
    pub fn campaign_eligible(&self, ack: &Acknowledgement) -> bool {
        let Some(campaign) = ack.campaign_name.as_deref() else {
            return false;
        };
        self.config
            .campaign_prefixes
            .iter()
            .any(|prefix| campaign.starts_with(prefix.as_str()))
            && ack.actor_id != 0
            && !ack.actor_type.is_empty()
    }

    /// Publish to the campaign stream when eligible. Returns whether anything was sent.
    pub async fn publish_campaign(&self, ack: &Acknowledgement) -> bool {
        if !self.campaign_eligible(ack) {
            return false;
        }
        let payload = match serde_json::to_vec(&AckEvent::new(ack, ack.state)) {
            Ok(p) => Bytes::from(p),
            Err(e) => {
                warn!(reference_id = %ack.reference_id, error = %e, "failed to encode campaign event");
                return false;
            }
        };
        self.send(&self.config.campaign_topic, &ack.reference_id, payload)
            .await
    }

    async fn send(&self, topic: &str, key: &str, payload: Bytes) -> bool {
        let attempts = self.config.publish_attempts.max(1);

        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(backoff(self.config.initial_backoff, attempt)).await;
                debug!(topic, key, attempt, "retrying publish");
            }

            match self.sink.publish(topic, key, payload.clone()).await {
                Ok(()) => {
                    counters::event_published(topic, "ok");
                    return true;
                }
                Err(e) => {
                    warn!(topic, key, attempt = attempt + 1, error = %e, "publish failed");
                }
            }
        }

        counters::event_published(topic, "failed");
        warn!(topic, key, attempts, "giving up on publish");
        false
    }
}

/// Backoff before `attempt` (1-based retry index).
pub fn backoff(initial: Duration, attempt: u32) -> Duration {
    initial.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
}
