//! Acknowledgement and opt-in storage.
//!
//! Every dispatch attempt is tracked by an [`Acknowledgement`] row keyed by
//! `(reference_id, channel)`. Writers coordinate only through the row's
//! `version`: each update names the version it read, and a write against a
//! stale version is rejected.
//!
//! ```text
//!   insert (upsert)          update_vendor_delivery        update_actor_delivery
//!        │                          │                              │
//!        ▼                          ▼                              ▼
//!  ┌───────────┐  load by (ref, channel) + CAS    load by (channel, vendor, vendor id) + CAS
//!  │  AckRows  │◄────────────────────────────────────────────────────────────
//!  └───────────┘
//!     │      │
//!     ▼      ▼
//!  Memory   Fjall (acks_YYYYMMDD partitions + indexes)
//! ```
//!
//! Store operations never propagate errors. Failures are logged, counted and
//! reported as `false` / `None`, so a broken store cannot crash dispatch.

mod factory;
mod memory;
mod persistent;
pub mod types;

pub use factory::create_storage;
pub use memory::MemoryStorage;
pub use persistent::PersistentStorage;
pub use types::*;

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::message::Channel;
use crate::telemetry::counters;
use crate::vendor::VendorId;

/// Conflicting vendor-delivery writes are re-read and re-applied this many times.
const VENDOR_UPDATE_ATTEMPTS: usize = 3;

// =============================================================================
// Store Traits
// =============================================================================

/// Persistence of the acknowledgement lifecycle.
pub trait AcknowledgementStore: Send + Sync {
    /// Insert a pending row, or update vendor identity, state and retry count
    /// of the existing row for the same `(reference_id, channel)`.
    fn insert(&self, ack: Acknowledgement) -> bool;

    /// Apply a vendor response. Merges the attribute delta and advances the
    /// version. Returns false when no row matches or the write lost a race.
    fn update_vendor_delivery(&self, update: VendorDeliveryUpdate) -> bool;

    /// Apply a webhook outcome at an expected version. No retry on conflict.
    fn update_actor_delivery(&self, update: ActorDeliveryUpdate) -> bool;

    fn get_by_reference_and_channel(
        &self,
        reference_id: &str,
        channel: Channel,
    ) -> Option<Acknowledgement>;

    fn get_by_vendor_message_id(
        &self,
        channel: Channel,
        vendor: VendorId,
        vendor_message_id: &str,
    ) -> Option<Acknowledgement>;

    /// Number of rows derived from `parent_reference_id`.
    fn count_by_parent_reference(&self, parent_reference_id: &str) -> usize;

    fn stats(&self) -> StoreStats;
}

/// WhatsApp opt-in records.
pub trait OptInStore: Send + Sync {
    fn get_opt_in(&self, phone_number: &str) -> Option<WhatsappOptInUser>;

    fn upsert_opt_in(&self, user: WhatsappOptInUser) -> bool;
}

/// Combined storage used by the service.
pub trait Storage: AcknowledgementStore + OptInStore {
    /// Whether the backend is usable. Drives admin readiness.
    fn is_ready(&self) -> bool {
        true
    }

    /// Flush pending writes to durable storage.
    fn flush(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Shared storage handle.
pub type SharedStorage = Arc<dyn Storage>;

// =============================================================================
// Row primitives shared by the backends
// =============================================================================

/// Raw row access a backend provides. The compare-and-write must be atomic
/// with respect to other writers of the same row.
pub(crate) trait AckRows {
    fn next_id(&self) -> Result<u64, StoreError>;

    fn load(&self, reference_id: &str, channel: Channel)
        -> Result<Option<Acknowledgement>, StoreError>;

    fn load_by_vendor_id(
        &self,
        channel: Channel,
        vendor: VendorId,
        vendor_message_id: &str,
    ) -> Result<Option<Acknowledgement>, StoreError>;

    /// Write `next` if the stored row is still at `expected` (`None`: absent).
    fn compare_and_write(
        &self,
        expected: Option<u64>,
        next: &Acknowledgement,
    ) -> Result<(), StoreError>;
}

fn track<T>(op: &'static str, result: Result<T, StoreError>) -> Option<T> {
    match result {
        Ok(v) => {
            counters::store_op(op, "ok");
            Some(v)
        }
        Err(StoreError::NotFound) => {
            counters::store_op(op, "not_found");
            None
        }
        Err(e @ (StoreError::VersionConflict { .. } | StoreError::AlreadyExists)) => {
            counters::store_op(op, e.kind());
            counters::version_conflict(op);
            warn!(op, error = %e, "acknowledgement write lost version race");
            None
        }
        Err(e) => {
            counters::store_op(op, e.kind());
            error!(op, error = %e, "acknowledgement store operation failed");
            None
        }
    }
}

pub(crate) fn upsert<R: AckRows>(rows: &R, ack: Acknowledgement) -> bool {
    let result = (|| {
        let mut last = StoreError::NotFound;
        for _ in 0..VENDOR_UPDATE_ATTEMPTS {
            let existing = rows.load(&ack.reference_id, ack.channel)?;
            let (expected, next) = match existing {
                Some(current) => {
                    let mut next = current.clone();
                    next.vendor = ack.vendor;
                    next.state = ack.state;
                    next.retry_count = ack.retry_count;
                    next.vendor_message_id = ack.vendor_message_id.clone();
                    next.version = current.version + 1;
                    (Some(current.version), next)
                }
                None => {
                    let mut next = ack.clone();
                    next.id = rows.next_id()?;
                    next.version = 1;
                    (None, next)
                }
            };
            match rows.compare_and_write(expected, &next) {
                Ok(()) => {
                    debug!(
                        reference_id = %next.reference_id,
                        channel = %next.channel,
                        vendor = %next.vendor,
                        version = next.version,
                        "acknowledgement upserted"
                    );
                    return Ok(());
                }
                Err(e @ (StoreError::VersionConflict { .. } | StoreError::AlreadyExists)) => {
                    last = e
                }
                Err(e) => return Err(e),
            }
        }
        Err(last)
    })();
    track("insert", result).is_some()
}

pub(crate) fn vendor_delivery<R: AckRows>(rows: &R, update: &VendorDeliveryUpdate) -> bool {
    let result = (|| {
        let mut last = StoreError::NotFound;
        for _ in 0..VENDOR_UPDATE_ATTEMPTS {
            let current = rows
                .load(&update.reference_id, update.channel)?
                .ok_or(StoreError::NotFound)?;
            let next = apply_vendor_delivery(&current, update);
            match rows.compare_and_write(Some(current.version), &next) {
                Ok(()) => return Ok(next.version),
                Err(e @ StoreError::VersionConflict { .. }) => {
                    debug!(
                        reference_id = %update.reference_id,
                        error = %e,
                        "vendor delivery update conflicted, re-reading"
                    );
                    last = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last)
    })();
    track("update_vendor_delivery", result).is_some()
}

pub(crate) fn actor_delivery<R: AckRows>(rows: &R, update: &ActorDeliveryUpdate) -> bool {
    let result = (|| {
        let current = rows
            .load_by_vendor_id(update.channel, update.vendor, &update.vendor_message_id)?
            .ok_or(StoreError::NotFound)?;
        if current.version != update.expected_version {
            return Err(StoreError::VersionConflict {
                expected: update.expected_version,
                found: current.version,
            });
        }
        let next = apply_actor_delivery(&current, update);
        rows.compare_and_write(Some(update.expected_version), &next)
    })();
    track("update_actor_delivery", result).is_some()
}

pub(crate) fn lookup<T>(op: &'static str, result: Result<Option<T>, StoreError>) -> Option<T> {
    track(op, result).flatten()
}

/// Vendor-level outcome never overwrites a webhook-reported customer state;
/// the vendor id and timestamp are still recorded.
fn apply_vendor_delivery(
    current: &Acknowledgement,
    update: &VendorDeliveryUpdate,
) -> Acknowledgement {
    let mut next = current.clone();
    if !current.state.is_customer_level() {
        next.state = update.state;
    }
    if !update.vendor_message_id.is_empty() {
        next.vendor_message_id = update.vendor_message_id.clone();
    }
    next.vendor_delivery_time = Some(update.vendor_delivery_time);
    merge_attributes(&mut next.attributes, &update.attributes_delta);
    next.version = current.version + 1;
    next
}

fn apply_actor_delivery(current: &Acknowledgement, update: &ActorDeliveryUpdate) -> Acknowledgement {
    let mut next = current.clone();
    let mut attributes = update.attributes_base.clone();
    merge_attributes(&mut attributes, &update.meta.to_attributes());
    next.attributes = attributes;
    next.state = update.state;
    next.actor_delivery_time = Some(update.actor_delivery_time);
    next.version = current.version + 1;
    next
}
