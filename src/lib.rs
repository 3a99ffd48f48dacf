//! dispatchd - multi-channel outbound message dispatch engine.
//!
//! Takes message-request events, derives channel-specific messages, selects a
//! delivery vendor, sends over HTTP and tracks each attempt through a persisted
//! acknowledgement record. Vendor delivery webhooks are reconciled against the
//! same records.

pub mod bootstrap;
pub mod config;
pub mod deriver;
pub mod dispatch;
pub mod events;
pub mod ingress;
pub mod message;
pub mod store;
pub mod telemetry;
pub mod vendor;
pub mod webhook;
