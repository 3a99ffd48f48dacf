//! Persistent storage using fjall (pure Rust LSM-tree).
//!
//! Layout:
//! - `acks_YYYYMMDD`: acknowledgement rows, keyed `{reference_id}:{channel}`,
//!   in the partition named by the row's creation date
//! - `ack_index`: `{reference_id}:{channel}` -> day partition name
//! - `vendor_index`: `{channel}:{vendor}:{vendor_message_id}` -> row key
//! - `parent_index`: `{len}:{parent_reference_id}{reference_id}:{channel}` -> empty,
//!   the length prefix keeps one parent's scan from reaching another's children
//! - `whatsapp_optin`: phone number -> opt-in record
//! - `metadata`: id counter
//!
//! Compare-and-write runs under a store-wide mutex; reads are lock-free.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, TimeZone, Utc};
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};
use serde::{Deserialize, Serialize};

use crate::message::Channel;
use crate::telemetry::counters;
use crate::vendor::VendorId;

use super::types::*;
use super::{AckRows, AcknowledgementStore, OptInStore, Storage};

const NEXT_ID_KEY: &str = "next_ack_id";

// =============================================================================
// PersistentStorage
// =============================================================================

/// Persistent storage using fjall LSM-tree.
pub struct PersistentStorage {
    keyspace: Keyspace,
    ack_index: PartitionHandle,
    vendor_index: PartitionHandle,
    parent_index: PartitionHandle,
    opt_ins: PartitionHandle,
    metadata: PartitionHandle,
    /// Day partitions opened so far.
    days: RwLock<HashMap<String, PartitionHandle>>,
    write_lock: Mutex<()>,
}

// =============================================================================
// Serializable Types
// =============================================================================

/// On-disk row. Placeholders and attributes are stored as encoded text.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedAck {
    id: u64,
    actor_id: u64,
    actor_type: String,
    channel: Channel,
    reference_id: String,
    template_name: String,
    language: String,
    message: String,
    unicode: bool,
    vendor: VendorId,
    vendor_message_id: String,
    state: AckState,
    retry_count: u32,
    placeholders: String,
    attributes: String,
    vendor_delivery_epoch_ms: Option<i64>,
    actor_delivery_epoch_ms: Option<i64>,
    contact_type: ContactType,
    contact_id: String,
    parent_reference_id: Option<String>,
    campaign_name: Option<String>,
    version: u64,
    created_at_epoch_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedOptIn {
    phone_number: String,
    status: OptInStatus,
    updated_at_epoch_ms: i64,
}

fn from_epoch_ms(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

impl PersistedAck {
    fn encode(ack: &Acknowledgement) -> Result<Self, StoreError> {
        Ok(Self {
            id: ack.id,
            actor_id: ack.actor_id,
            actor_type: ack.actor_type.clone(),
            channel: ack.channel,
            reference_id: ack.reference_id.clone(),
            template_name: ack.template_name.clone(),
            language: ack.language.clone(),
            message: ack.message.clone(),
            unicode: ack.unicode,
            vendor: ack.vendor,
            vendor_message_id: ack.vendor_message_id.clone(),
            state: ack.state,
            retry_count: ack.retry_count,
            placeholders: serde_json::to_string(&ack.placeholders)?,
            attributes: serde_json::to_string(&ack.attributes)?,
            vendor_delivery_epoch_ms: ack.vendor_delivery_time.map(|t| t.timestamp_millis()),
            actor_delivery_epoch_ms: ack.actor_delivery_time.map(|t| t.timestamp_millis()),
            contact_type: ack.contact_type,
            contact_id: ack.contact_id.clone(),
            parent_reference_id: ack.parent_reference_id.clone(),
            campaign_name: ack.campaign_name.clone(),
            version: ack.version,
            created_at_epoch_ms: ack.created_at.timestamp_millis(),
        })
    }

    /// A corrupt placeholder or attribute blob is dropped, not the whole row.
    fn decode(self) -> Acknowledgement {
        let placeholders = serde_json::from_str(&self.placeholders).unwrap_or_else(|e| {
            counters::codec_error("placeholders");
            tracing::warn!(reference_id = %self.reference_id, error = %e, "dropping undecodable placeholders");
            HashMap::new()
        });
        let attributes = serde_json::from_str(&self.attributes).unwrap_or_else(|e| {
            counters::codec_error("attributes");
            tracing::warn!(reference_id = %self.reference_id, error = %e, "dropping undecodable attributes");
            Attributes::new()
        });

        Acknowledgement {
            id: self.id,
            actor_id: self.actor_id,
            actor_type: self.actor_type,
            channel: self.channel,
            reference_id: self.reference_id,
            template_name: self.template_name,
            language: self.language,
            message: self.message,
            unicode: self.unicode,
            vendor: self.vendor,
            vendor_message_id: self.vendor_message_id,
            state: self.state,
            retry_count: self.retry_count,
            placeholders,
            attributes,
            vendor_delivery_time: self.vendor_delivery_epoch_ms.and_then(from_epoch_ms),
            actor_delivery_time: self.actor_delivery_epoch_ms.and_then(from_epoch_ms),
            contact_type: self.contact_type,
            contact_id: self.contact_id,
            parent_reference_id: self.parent_reference_id,
            campaign_name: self.campaign_name,
            version: self.version,
            created_at: from_epoch_ms(self.created_at_epoch_ms).unwrap_or_else(Utc::now),
        }
    }
}

fn row_key(reference_id: &str, channel: Channel) -> String {
    format!("{}:{}", reference_id, channel.as_str())
}

fn parent_prefix(parent_reference_id: &str) -> String {
    format!("{}:{}", parent_reference_id.len(), parent_reference_id)
}

fn vendor_key(channel: Channel, vendor: VendorId, vendor_message_id: &str) -> String {
    format!("{}:{}:{}", channel.as_str(), vendor.as_str(), vendor_message_id)
}

// =============================================================================
// Implementation
// =============================================================================

impl PersistentStorage {
    /// Open or create persistent storage at the given path.
    pub async fn open(path: &Path) -> anyhow::Result<Arc<Self>> {
        std::fs::create_dir_all(path)?;

        let keyspace = Config::new(path).open()?;

        let ack_index = keyspace.open_partition("ack_index", PartitionCreateOptions::default())?;
        let vendor_index =
            keyspace.open_partition("vendor_index", PartitionCreateOptions::default())?;
        let parent_index =
            keyspace.open_partition("parent_index", PartitionCreateOptions::default())?;
        let opt_ins =
            keyspace.open_partition("whatsapp_optin", PartitionCreateOptions::default())?;
        let metadata = keyspace.open_partition("metadata", PartitionCreateOptions::default())?;

        let store = Arc::new(Self {
            keyspace,
            ack_index,
            vendor_index,
            parent_index,
            opt_ins,
            metadata,
            days: RwLock::new(HashMap::new()),
            write_lock: Mutex::new(()),
        });

        tracing::info!(
            path = %path.display(),
            acknowledgements = store.ack_index.len().unwrap_or(0),
            "persistent storage opened"
        );

        Ok(store)
    }

    /// Handle for a day partition, opening it on first use.
    fn day(&self, name: &str) -> Result<PartitionHandle, StoreError> {
        if let Some(handle) = self.days.read().ok().and_then(|d| d.get(name).cloned()) {
            return Ok(handle);
        }
        let handle = self
            .keyspace
            .open_partition(name, PartitionCreateOptions::default())?;
        if let Ok(mut days) = self.days.write() {
            days.insert(name.to_string(), handle.clone());
        }
        Ok(handle)
    }

    fn load_key(&self, key: &str) -> Result<Option<Acknowledgement>, StoreError> {
        let Some(partition) = self.ack_index.get(key)? else {
            return Ok(None);
        };
        let partition = std::str::from_utf8(&partition)
            .map_err(|e| StoreError::Backend(e.to_string()))?
            .to_string();
        let Some(value) = self.day(&partition)?.get(key)? else {
            return Ok(None);
        };
        let persisted: PersistedAck = serde_json::from_slice(&value)?;
        Ok(Some(persisted.decode()))
    }
}

impl AckRows for PersistentStorage {
    fn next_id(&self) -> Result<u64, StoreError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| StoreError::Backend("write lock poisoned".into()))?;
        let current = match self.metadata.get(NEXT_ID_KEY)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| StoreError::Backend("corrupt id counter".into()))?;
                u64::from_be_bytes(raw)
            }
            None => 1,
        };
        self.metadata
            .insert(NEXT_ID_KEY, (current + 1).to_be_bytes())?;
        Ok(current)
    }

    fn load(
        &self,
        reference_id: &str,
        channel: Channel,
    ) -> Result<Option<Acknowledgement>, StoreError> {
        self.load_key(&row_key(reference_id, channel))
    }

    fn load_by_vendor_id(
        &self,
        channel: Channel,
        vendor: VendorId,
        vendor_message_id: &str,
    ) -> Result<Option<Acknowledgement>, StoreError> {
        let Some(key) = self
            .vendor_index
            .get(vendor_key(channel, vendor, vendor_message_id))?
        else {
            return Ok(None);
        };
        let key = std::str::from_utf8(&key).map_err(|e| StoreError::Backend(e.to_string()))?;
        self.load_key(key)
    }

    fn compare_and_write(
        &self,
        expected: Option<u64>,
        next: &Acknowledgement,
    ) -> Result<(), StoreError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| StoreError::Backend("write lock poisoned".into()))?;

        let key = row_key(&next.reference_id, next.channel);
        let current = self.load_key(&key)?;
        match (expected, &current) {
            (None, Some(_)) => return Err(StoreError::AlreadyExists),
            (Some(_), None) => return Err(StoreError::NotFound),
            (Some(expected), Some(current)) if current.version != expected => {
                return Err(StoreError::VersionConflict {
                    expected,
                    found: current.version,
                })
            }
            _ => {}
        }

        // The row stays in the partition of its first creation date.
        let partition = current
            .as_ref()
            .map(|c| c.partition())
            .unwrap_or_else(|| next.partition());
        let value = serde_json::to_vec(&PersistedAck::encode(next)?)?;
        self.day(&partition)?.insert(&key, value)?;

        if current.is_none() {
            self.ack_index.insert(&key, partition.as_bytes())?;
            if let Some(parent) = &next.parent_reference_id {
                let parent_key = format!("{}{}", parent_prefix(parent), key);
                self.parent_index.insert(parent_key, b"")?;
            }
        }
        if !next.vendor_message_id.is_empty() {
            self.vendor_index.insert(
                vendor_key(next.channel, next.vendor, &next.vendor_message_id),
                key.as_bytes(),
            )?;
        }
        Ok(())
    }
}

impl AcknowledgementStore for PersistentStorage {
    fn insert(&self, ack: Acknowledgement) -> bool {
        super::upsert(self, ack)
    }

    fn update_vendor_delivery(&self, update: VendorDeliveryUpdate) -> bool {
        super::vendor_delivery(self, &update)
    }

    fn update_actor_delivery(&self, update: ActorDeliveryUpdate) -> bool {
        super::actor_delivery(self, &update)
    }

    fn get_by_reference_and_channel(
        &self,
        reference_id: &str,
        channel: Channel,
    ) -> Option<Acknowledgement> {
        super::lookup("get_by_reference", self.load(reference_id, channel))
    }

    fn get_by_vendor_message_id(
        &self,
        channel: Channel,
        vendor: VendorId,
        vendor_message_id: &str,
    ) -> Option<Acknowledgement> {
        super::lookup(
            "get_by_vendor_message_id",
            self.load_by_vendor_id(channel, vendor, vendor_message_id),
        )
    }

    fn count_by_parent_reference(&self, parent_reference_id: &str) -> usize {
        self.parent_index
            .prefix(parent_prefix(parent_reference_id))
            .filter(|item| item.is_ok())
            .count()
    }

    fn stats(&self) -> StoreStats {
        let mut stats = StoreStats::default();
        for item in self.ack_index.iter() {
            let Ok((key, _)) = item else { continue };
            let Ok(key) = std::str::from_utf8(&key) else { continue };
            if let Ok(Some(ack)) = self.load_key(key) {
                stats.count(ack.state);
            }
        }
        stats.opt_in_users = self.opt_ins.len().unwrap_or(0) as u64;
        stats
    }
}

impl OptInStore for PersistentStorage {
    fn get_opt_in(&self, phone_number: &str) -> Option<WhatsappOptInUser> {
        let value = match self.opt_ins.get(phone_number) {
            Ok(v) => v?,
            Err(e) => {
                tracing::error!(error = %e, "failed to read opt-in record");
                return None;
            }
        };
        let persisted: PersistedOptIn = serde_json::from_slice(&value).ok()?;
        Some(WhatsappOptInUser {
            phone_number: persisted.phone_number,
            status: persisted.status,
            updated_at: from_epoch_ms(persisted.updated_at_epoch_ms)?,
        })
    }

    fn upsert_opt_in(&self, user: WhatsappOptInUser) -> bool {
        let persisted = PersistedOptIn {
            phone_number: user.phone_number.clone(),
            status: user.status,
            updated_at_epoch_ms: user.updated_at.timestamp_millis(),
        };
        let result = serde_json::to_vec(&persisted)
            .map_err(StoreError::from)
            .and_then(|value| {
                self.opt_ins
                    .insert(&user.phone_number, value)
                    .map_err(StoreError::from)
            });
        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "failed to persist opt-in record");
                false
            }
        }
    }
}

impl Storage for PersistentStorage {
    fn flush(&self) -> anyhow::Result<()> {
        self.keyspace.persist(fjall::PersistMode::SyncAll)?;
        Ok(())
    }
}
