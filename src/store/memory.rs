//! In-memory storage implementation.
//!
//! Volatile storage for development and testing. All data is lost on restart.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use crate::message::Channel;
use crate::vendor::VendorId;

use super::types::*;
use super::{AckRows, AcknowledgementStore, OptInStore, Storage};

type AckKey = (String, Channel);
type VendorKey = (Channel, VendorId, String);

// =============================================================================
// MemoryStorage
// =============================================================================

/// In-memory storage implementation.
///
/// Rows and the vendor-id index share one lock so the compare-and-write and
/// the index update happen together.
pub struct MemoryStorage {
    rows: RwLock<Rows>,
    opt_ins: RwLock<HashMap<String, WhatsappOptInUser>>,
    next_id: AtomicU64,
}

#[derive(Default)]
struct Rows {
    acks: HashMap<AckKey, Acknowledgement>,
    by_vendor_id: HashMap<VendorKey, AckKey>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        debug!("creating in-memory storage");
        Self {
            rows: RwLock::new(Rows::default()),
            opt_ins: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Number of acknowledgement rows.
    pub fn len(&self) -> usize {
        self.read_rows().map(|r| r.acks.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_rows(&self) -> Result<RwLockReadGuard<'_, Rows>, StoreError> {
        self.rows
            .read()
            .map_err(|_| StoreError::Backend("row lock poisoned".into()))
    }

    fn write_rows(&self) -> Result<RwLockWriteGuard<'_, Rows>, StoreError> {
        self.rows
            .write()
            .map_err(|_| StoreError::Backend("row lock poisoned".into()))
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl AckRows for MemoryStorage {
    fn next_id(&self) -> Result<u64, StoreError> {
        Ok(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn load(
        &self,
        reference_id: &str,
        channel: Channel,
    ) -> Result<Option<Acknowledgement>, StoreError> {
        let rows = self.read_rows()?;
        Ok(rows.acks.get(&(reference_id.to_string(), channel)).cloned())
    }

    fn load_by_vendor_id(
        &self,
        channel: Channel,
        vendor: VendorId,
        vendor_message_id: &str,
    ) -> Result<Option<Acknowledgement>, StoreError> {
        let rows = self.read_rows()?;
        let key = (channel, vendor, vendor_message_id.to_string());
        Ok(rows
            .by_vendor_id
            .get(&key)
            .and_then(|ack_key| rows.acks.get(ack_key))
            .cloned())
    }

    fn compare_and_write(
        &self,
        expected: Option<u64>,
        next: &Acknowledgement,
    ) -> Result<(), StoreError> {
        let mut rows = self.write_rows()?;
        let key = (next.reference_id.clone(), next.channel);

        match (expected, rows.acks.get(&key)) {
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

        if !next.vendor_message_id.is_empty() {
            rows.by_vendor_id.insert(
                (next.channel, next.vendor, next.vendor_message_id.clone()),
                key.clone(),
            );
        }
        rows.acks.insert(key, next.clone());
        Ok(())
    }
}

impl AcknowledgementStore for MemoryStorage {
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
        self.read_rows()
            .map(|rows| {
                rows.acks
                    .values()
                    .filter(|a| a.parent_reference_id.as_deref() == Some(parent_reference_id))
                    .count()
            })
            .unwrap_or(0)
    }

    fn stats(&self) -> StoreStats {
        let mut stats = StoreStats::default();
        if let Ok(rows) = self.read_rows() {
            for ack in rows.acks.values() {
                stats.count(ack.state);
            }
        }
        stats.opt_in_users = self.opt_ins.read().map(|o| o.len() as u64).unwrap_or(0);
        stats
    }
}

impl OptInStore for MemoryStorage {
    fn get_opt_in(&self, phone_number: &str) -> Option<WhatsappOptInUser> {
        self.opt_ins.read().ok()?.get(phone_number).cloned()
    }

    fn upsert_opt_in(&self, user: WhatsappOptInUser) -> bool {
        match self.opt_ins.write() {
            Ok(mut opt_ins) => {
                opt_ins.insert(user.phone_number.clone(), user);
                true
            }
            Err(_) => false,
        }
    }
}

impl Storage for MemoryStorage {}
