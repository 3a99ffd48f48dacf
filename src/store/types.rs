//! Types for the acknowledgement store.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::{Channel, DerivedMessage};
use crate::vendor::VendorId;

/// Free-form attribute map. Merged, never replaced, on update.
pub type Attributes = serde_json::Map<String, serde_json::Value>;

/// Acknowledgement lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AckState {
    /// Row written, vendor has not accepted (or rejected) the request
    VendorUndelivered,
    /// Vendor accepted the request
    VendorDelivered,
    /// Vendor handed the message to the carrier / handset
    CustomerSent,
    /// Handset confirmed delivery
    CustomerDelivered,
    /// Recipient opened the message
    CustomerRead,
    /// Vendor reported non-delivery to the handset
    CustomerUndelivered,
    /// Inbound user reply; outside the outbound lifecycle
    IncomingReply,
}

impl AckState {
    pub const ALL: [AckState; 7] = [
        AckState::VendorUndelivered,
        AckState::VendorDelivered,
        AckState::CustomerSent,
        AckState::CustomerDelivered,
        AckState::CustomerRead,
        AckState::CustomerUndelivered,
        AckState::IncomingReply,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VendorUndelivered => "VENDOR_UNDELIVERED",
            Self::VendorDelivered => "VENDOR_DELIVERED",
            Self::CustomerSent => "CUSTOMER_SENT",
            Self::CustomerDelivered => "CUSTOMER_DELIVERED",
            Self::CustomerRead => "CUSTOMER_READ",
            Self::CustomerUndelivered => "CUSTOMER_UNDELIVERED",
            Self::IncomingReply => "INCOMING_REPLY",
        }
    }

    /// States after which no automatic retry is issued for the reference id.
    pub fn is_customer_terminal(&self) -> bool {
        matches!(
            self,
            Self::CustomerDelivered | Self::CustomerRead | Self::CustomerUndelivered
        )
    }

    /// States reported by the vendor webhook rather than the send response.
    pub fn is_customer_level(&self) -> bool {
        matches!(
            self,
            Self::CustomerSent
                | Self::CustomerDelivered
                | Self::CustomerRead
                | Self::CustomerUndelivered
        )
    }

    /// Position along the successful customer path, used to ignore
    /// out-of-order receipts (a DELIVERED arriving after READ).
    pub fn progress(&self) -> Option<u8> {
        match self {
            Self::CustomerSent => Some(1),
            Self::CustomerDelivered => Some(2),
            Self::CustomerRead => Some(3),
            _ => None,
        }
    }
}

impl fmt::Display for AckState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of contact the acknowledgement was addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContactType {
    Phone,
    FcmToken,
    Email,
}

impl ContactType {
    pub fn for_channel(channel: Channel) -> Self {
        match channel {
            Channel::Sms | Channel::Whatsapp => Self::Phone,
            Channel::AppNotification => Self::FcmToken,
            Channel::Email => Self::Email,
        }
    }
}

/// Durable record of one message's delivery lifecycle.
///
/// One row per `(reference_id, channel)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Acknowledgement {
    pub id: u64,
    pub actor_id: u64,
    pub actor_type: String,
    pub channel: Channel,
    pub reference_id: String,
    pub template_name: String,
    pub language: String,
    pub message: String,
    pub unicode: bool,
    pub vendor: VendorId,
    /// Empty until the vendor accepts the request.
    pub vendor_message_id: String,
    pub state: AckState,
    pub retry_count: u32,
    pub placeholders: HashMap<String, String>,
    pub attributes: Attributes,
    pub vendor_delivery_time: Option<DateTime<Utc>>,
    pub actor_delivery_time: Option<DateTime<Utc>>,
    pub contact_type: ContactType,
    pub contact_id: String,
    pub parent_reference_id: Option<String>,
    pub campaign_name: Option<String>,
    /// Optimistic concurrency counter; 1 after the first insert.
    pub version: u64,
    /// Partition key.
    pub created_at: DateTime<Utc>,
}

impl Acknowledgement {
    /// Pending row for a message about to be sent through `vendor`.
    pub fn pending(msg: &DerivedMessage, vendor: VendorId) -> Self {
        Self {
            id: 0,
            actor_id: msg.actor_id,
            actor_type: msg.actor_type.clone(),
            channel: msg.channel,
            reference_id: msg.reference_id.clone(),
            template_name: msg.template_name.clone(),
            language: msg.language.clone(),
            message: msg.content.clone(),
            unicode: msg.unicode,
            vendor,
            vendor_message_id: String::new(),
            state: AckState::VendorUndelivered,
            retry_count: msg.retry_count,
            placeholders: msg.placeholders.clone(),
            attributes: msg.attributes.clone(),
            vendor_delivery_time: None,
            actor_delivery_time: None,
            contact_type: ContactType::for_channel(msg.channel),
            contact_id: msg.contact_id().to_string(),
            parent_reference_id: msg.parent_reference_id.clone(),
            campaign_name: msg.campaign_name.clone(),
            version: 0,
            created_at: Utc::now(),
        }
    }

    /// Name of the day partition holding this row.
    pub fn partition(&self) -> String {
        partition_for(&self.created_at)
    }

    /// Reference id of the first send in a retry chain.
    pub fn root_reference_id(&self) -> &str {
        self.parent_reference_id
            .as_deref()
            .unwrap_or(&self.reference_id)
    }
}

/// Day partition name for a creation timestamp.
pub fn partition_for(created_at: &DateTime<Utc>) -> String {
    format!("acks_{}", created_at.format("%Y%m%d"))
}

/// Merge `delta` into `base`. A `null` value removes the key.
pub fn merge_attributes(base: &mut Attributes, delta: &Attributes) {
    for (key, value) in delta {
        if value.is_null() {
            base.remove(key);
        } else {
            base.insert(key.clone(), value.clone());
        }
    }
}

/// Vendor response applied to the row for `(reference_id, channel)`.
#[derive(Debug, Clone)]
pub struct VendorDeliveryUpdate {
    pub state: AckState,
    pub vendor_delivery_time: DateTime<Utc>,
    pub vendor_message_id: String,
    pub reference_id: String,
    pub attributes_delta: Attributes,
    pub channel: Channel,
}

/// Delivery details carried by a vendor webhook.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WebhookMeta {
    pub status: String,
    pub cause: Option<String>,
    pub fragment_count: Option<u32>,
}

impl WebhookMeta {
    /// Attribute entries recorded on the row.
    pub fn to_attributes(&self) -> Attributes {
        let mut attrs = Attributes::new();
        attrs.insert("webhookStatus".into(), self.status.clone().into());
        if let Some(cause) = &self.cause {
            attrs.insert("webhookCause".into(), cause.clone().into());
        }
        if let Some(count) = self.fragment_count {
            attrs.insert("fragmentCount".into(), count.into());
        }
        attrs
    }
}

/// Webhook outcome applied to the row for `(channel, vendor, vendor_message_id)`
/// at `expected_version`.
#[derive(Debug, Clone)]
pub struct ActorDeliveryUpdate {
    pub state: AckState,
    pub actor_delivery_time: DateTime<Utc>,
    pub channel: Channel,
    pub vendor: VendorId,
    pub vendor_message_id: String,
    pub meta: WebhookMeta,
    pub attributes_base: Attributes,
    pub expected_version: u64,
}

/// WhatsApp opt-in status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OptInStatus {
    OptIn,
    OptOut,
    NoAccnt,
}

impl OptInStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OptIn => "OPT_IN",
            Self::OptOut => "OPT_OUT",
            Self::NoAccnt => "NO_ACCNT",
        }
    }
}

/// Opt-in record of a WhatsApp user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhatsappOptInUser {
    pub phone_number: String,
    pub status: OptInStatus,
    pub updated_at: DateTime<Utc>,
}

impl WhatsappOptInUser {
    pub fn new(phone_number: impl Into<String>, status: OptInStatus) -> Self {
        Self {
            phone_number: phone_number.into(),
            status,
            updated_at: Utc::now(),
        }
    }
}

/// Store statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub total: u64,
    pub by_state: BTreeMap<String, u64>,
    pub opt_in_users: u64,
}

impl StoreStats {
    pub fn count(&mut self, state: AckState) {
        self.total += 1;
        *self.by_state.entry(state.as_str().to_string()).or_default() += 1;
    }
}

/// Store failure. Never crosses the store boundary; operations log and
/// report `false`/`None` instead.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("acknowledgement not found")]
    NotFound,
    #[error("version conflict: expected {expected}, found {found}")]
    VersionConflict { expected: u64, found: u64 },
    #[error("row already exists")]
    AlreadyExists,
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::VersionConflict { .. } | Self::AlreadyExists => "version_conflict",
            Self::Codec(_) => "codec",
            Self::Backend(_) => "backend",
        }
    }
}

impl From<fjall::Error> for StoreError {
    fn from(e: fjall::Error) -> Self {
        Self::Backend(e.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Backend(e.to_string())
    }
}
