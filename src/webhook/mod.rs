//! Inbound vendor webhook reconciliation.
//!
//! Delivery-status callbacks are matched to acknowledgement rows by
//! `(channel, vendor, vendor_message_id)` and applied at the version read:
//!
//! ```text
//!  hard-bounce cause ──────────────► CUSTOMER_UNDELIVERED (+ WhatsApp NO_ACCNT demotion)
//!  SENT / DELIVERED / READ ────────► CUSTOMER_* (+ NO_ACCNT -> OPT_IN promotion)
//!  SUBMITTED / UNKNOWN / FAILED ───► SMS: re-dispatch via the alternate vendor,
//!                                    up to max_local_retries per root reference,
//!                                    then CUSTOMER_UNDELIVERED
//! ```
//!
//! Only non-delivered states are forwarded to the acknowledgement stream;
//! delivered and read snapshots leave through a separate path downstream.

mod payload;

pub use payload::{parse, WebhookError, WebhookEvent, WebhookStatus};

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::WebhookConfig;
use crate::dispatch::Dispatcher;
use crate::events::{AckEvent, EventEmitter};
use crate::message::{Channel, ChannelAttributes, DerivedMessage};
use crate::store::{
    AckState, Acknowledgement, ActorDeliveryUpdate, OptInStatus, SharedStorage, WebhookMeta,
    WhatsappOptInUser,
};
use crate::telemetry::{counters, AdminState};

/// Causes that end delivery for good.
const HARD_BOUNCE_CAUSES: &[&str] = &[
    "DND_FAIL",
    "DND_TIMEOUT",
    "BLOCKED",
    "UNKNOWN_SUBSCRIBER",
    "INVALID_RECIPIENT",
    "DEFERRED",
];

/// Causes meaning the number has no WhatsApp account.
const NO_ACCOUNT_CAUSES: &[&str] = &["UNKNOWN_SUBSCRIBER", "INVALID_RECIPIENT"];

/// What a webhook did to its acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    /// Row advanced to this state.
    Applied(AckState),
    /// A fresh SMS was dispatched under this reference id.
    Redispatched(String),
    /// No row carries the vendor message id.
    Orphan,
    /// The row is already at or past the reported state.
    Stale,
    /// In-flight status on a channel without a local retry path.
    Ignored,
    /// The row changed between read and write.
    Conflict,
}

enum Classification {
    Bounce { no_account: bool },
    Progress(AckState),
    InFlight,
}

/// Applies vendor delivery callbacks to acknowledgement rows.
pub struct InboundWebhookReconciler {
    store: SharedStorage,
    emitter: Arc<EventEmitter>,
    dispatcher: Arc<Dispatcher>,
    admin: Arc<AdminState>,
    config: WebhookConfig,
}

impl InboundWebhookReconciler {
    pub fn new(
        store: SharedStorage,
        emitter: Arc<EventEmitter>,
        dispatcher: Arc<Dispatcher>,
        admin: Arc<AdminState>,
        config: WebhookConfig,
    ) -> Self {
        Self {
            store,
            emitter,
            dispatcher,
            admin,
            config,
        }
    }

    #[instrument(
        skip_all,
        fields(
            channel = %event.channel,
            vendor = %event.vendor,
            vendor_message_id = %event.vendor_message_id,
            status = %event.raw_status,
        )
    )]
    pub async fn reconcile(&self, event: WebhookEvent) -> Reconciliation {
        self.admin.inc_webhooks();

        let Some(row) = self.store.get_by_vendor_message_id(
            event.channel,
            event.vendor,
            &event.vendor_message_id,
        ) else {
            counters::webhook_orphan(event.channel.label(), event.vendor.as_str());
            warn!("webhook for unknown vendor message id");
            return Reconciliation::Orphan;
        };

        let outcome = match classify(&event) {
            Classification::Bounce { no_account } => {
                if no_account && event.channel == Channel::Whatsapp {
                    self.mark_no_account(&row.contact_id);
                }
                if row.state.is_customer_terminal() {
                    Reconciliation::Stale
                } else {
                    self.apply(&row, &event, AckState::CustomerUndelivered).await
                }
            }
            Classification::Progress(state) => {
                if event.channel == Channel::Whatsapp {
                    self.promote_opt_in(&row.contact_id);
                }
                let behind = matches!(
                    (row.state.progress(), state.progress()),
                    (Some(current), Some(next)) if current >= next
                );
                if behind || row.state == AckState::CustomerUndelivered {
                    Reconciliation::Stale
                } else {
                    self.apply(&row, &event, state).await
                }
            }
            Classification::InFlight => self.in_flight(&row, &event).await,
        };

        debug!(outcome = ?outcome, "webhook reconciled");
        outcome
    }

    /// Parse a vendor body and reconcile every report in it.
    pub async fn handle(
        &self,
        vendor: crate::vendor::VendorId,
        body: &[u8],
    ) -> Result<Vec<Reconciliation>, WebhookError> {
        let events = parse(vendor, body)?;
        let mut outcomes = Vec::with_capacity(events.len());
        for event in events {
            outcomes.push(self.reconcile(event).await);
        }
        Ok(outcomes)
    }

    /// Submitted or unknown reports never move a row the customer side already
    /// reported on. A failure still can, until the row is customer-terminal.
    async fn in_flight(&self, row: &Acknowledgement, event: &WebhookEvent) -> Reconciliation {
        let failed = event.status == WebhookStatus::Failed;
        if row.state.is_customer_terminal() || (row.state.is_customer_level() && !failed) {
            return Reconciliation::Stale;
        }
        if row.channel != Channel::Sms {
            if event.status == WebhookStatus::Failed {
                return self.apply(row, event, AckState::CustomerUndelivered).await;
            }
            return Reconciliation::Ignored;
        }

        let root = row.root_reference_id().to_string();
        let attempts = self.store.count_by_parent_reference(&root);
        if attempts < self.config.max_local_retries {
            match self.dispatcher.send(redispatch(row, &root)) {
                Ok(reference_id) => {
                    info!(
                        root_reference_id = %root,
                        reference_id = %reference_id,
                        attempt = attempts + 1,
                        "re-dispatched SMS via alternate vendor"
                    );
                    return Reconciliation::Redispatched(reference_id);
                }
                Err(e) => {
                    warn!(root_reference_id = %root, error = %e, "local retry not submitted");
                }
            }
        } else {
            debug!(
                root_reference_id = %root,
                attempts,
                "local retries exhausted"
            );
        }

        self.apply(row, event, AckState::CustomerUndelivered).await
    }

    async fn apply(
        &self,
        row: &Acknowledgement,
        event: &WebhookEvent,
        state: AckState,
    ) -> Reconciliation {
        let update = ActorDeliveryUpdate {
            state,
            actor_delivery_time: event.delivered_at.unwrap_or_else(Utc::now),
            channel: row.channel,
            vendor: row.vendor,
            vendor_message_id: row.vendor_message_id.clone(),
            meta: WebhookMeta {
                status: event.raw_status.clone(),
                cause: event.cause.clone(),
                fragment_count: event.fragment_count,
            },
            attributes_base: row.attributes.clone(),
            expected_version: row.version,
        };

        if !self.store.update_actor_delivery(update) {
            warn!(
                reference_id = %row.reference_id,
                version = row.version,
                state = %state,
                "webhook update not applied"
            );
            return Reconciliation::Conflict;
        }
        counters::webhook_event(row.channel.label(), state.as_str());

        let updated = self
            .store
            .get_by_reference_and_channel(&row.reference_id, row.channel);
        let snapshot = updated.as_ref().unwrap_or(row);

        if !matches!(state, AckState::CustomerDelivered | AckState::CustomerRead) {
            self.emitter.publish(snapshot, state).await;
        }
        self.emitter.publish_campaign(snapshot).await;

        info!(
            reference_id = %row.reference_id,
            from = %row.state,
            to = %state,
            "acknowledgement advanced by webhook"
        );
        Reconciliation::Applied(state)
    }

    fn mark_no_account(&self, phone_number: &str) {
        let from = self
            .store
            .get_opt_in(phone_number)
            .map(|u| u.status.as_str())
            .unwrap_or("NONE");
        if self
            .store
            .upsert_opt_in(WhatsappOptInUser::new(phone_number, OptInStatus::NoAccnt))
        {
            counters::opt_in_transition(from, OptInStatus::NoAccnt.as_str());
            info!(phone_number, from, "WhatsApp user marked NO_ACCNT");
        }
    }

    fn promote_opt_in(&self, phone_number: &str) {
        let Some(user) = self.store.get_opt_in(phone_number) else {
            return;
        };
        if user.status != OptInStatus::NoAccnt {
            return;
        }
        if self
            .store
            .upsert_opt_in(WhatsappOptInUser::new(phone_number, OptInStatus::OptIn))
        {
            counters::opt_in_transition(OptInStatus::NoAccnt.as_str(), OptInStatus::OptIn.as_str());
            info!(phone_number, "WhatsApp user promoted back to OPT_IN");
        }
    }
}

fn classify(event: &WebhookEvent) -> Classification {
    if let Some(cause) = event.normalized_cause() {
        if HARD_BOUNCE_CAUSES.contains(&cause.as_str()) {
            return Classification::Bounce {
                no_account: NO_ACCOUNT_CAUSES.contains(&cause.as_str()),
            };
        }
    }
    if event.status.is_in_flight() {
        return Classification::InFlight;
    }
    Classification::Progress(match event.status {
        WebhookStatus::Delivered => AckState::CustomerDelivered,
        WebhookStatus::Read => AckState::CustomerRead,
        _ => AckState::CustomerSent,
    })
}

/// Fresh SMS carrying the row's content, pinned to the alternate vendor.
/// The row snapshot stands in for the raw event should the retry dead-letter.
fn redispatch(row: &Acknowledgement, root_reference_id: &str) -> DerivedMessage {
    let raw_event = serde_json::to_vec(&AckEvent::new(row, row.state))
        .map(Bytes::from)
        .unwrap_or_default();
    DerivedMessage {
        reference_id: Uuid::new_v4().to_string(),
        channel: Channel::Sms,
        vendor: Some(row.vendor.alternate()),
        content: row.message.clone(),
        unicode: row.unicode,
        language: row.language.clone(),
        template_name: row.template_name.clone(),
        placeholders: row.placeholders.clone(),
        attributes: row.attributes.clone(),
        retry_count: 0,
        campaign_name: row.campaign_name.clone(),
        parent_reference_id: Some(root_reference_id.to_string()),
        actor_id: row.actor_id,
        actor_type: row.actor_type.clone(),
        destination: ChannelAttributes::Sms {
            phone_number: row.contact_id.clone(),
        },
        raw_event,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OptInConfig, RetryConfig};
    use crate::dispatch::test_support::{harness, Harness};
    use crate::dispatch::MockReply;
    use crate::store::test_support::{pending_sms, vendor_update};
    use crate::store::{AcknowledgementStore, OptInStore, VendorDeliveryUpdate};
    use crate::vendor::VendorId;
    use std::time::Duration;

    fn reconciler(h: &Harness) -> InboundWebhookReconciler {
        let dispatcher = Dispatcher::new(h.ctx.clone(), &RetryConfig::default(), &OptInConfig::default());
        InboundWebhookReconciler::new(
            h.ctx.store.clone(),
            h.ctx.emitter.clone(),
            Arc::new(dispatcher),
            h.ctx.admin.clone(),
            WebhookConfig::default(),
        )
    }

    /// Row for `reference_id` accepted by gupshup as `vendor_message_id`.
    fn accepted(h: &Harness, reference_id: &str, vendor_message_id: &str) {
        assert!(h.ctx.store.insert(pending_sms(reference_id)));
        assert!(h
            .ctx
            .store
            .update_vendor_delivery(vendor_update(reference_id, vendor_message_id)));
    }

    fn event(vendor_message_id: &str, status: &str, cause: Option<&str>) -> WebhookEvent {
        WebhookEvent {
            channel: Channel::Sms,
            vendor: VendorId::Gupshup,
            vendor_message_id: vendor_message_id.into(),
            status: WebhookStatus::parse(status),
            raw_status: status.into(),
            cause: cause.map(str::to_string),
            delivered_at: None,
            fragment_count: Some(1),
        }
    }

    #[tokio::test]
    async fn test_sent_is_forwarded_delivered_is_not() {
        let h = harness(MockReply::ok("success | 919800000001 | gs-x"));
        let r = reconciler(&h);
        accepted(&h, "r1", "gs-1");

        assert_eq!(
            r.reconcile(event("gs-1", "SENT", None)).await,
            Reconciliation::Applied(AckState::CustomerSent)
        );
        assert_eq!(h.sink.on_topic("dispatch.acknowledgements").len(), 1);

        assert_eq!(
            r.reconcile(event("gs-1", "DELIVERED", None)).await,
            Reconciliation::Applied(AckState::CustomerDelivered)
        );
        assert_eq!(h.sink.on_topic("dispatch.acknowledgements").len(), 1);

        let row = h.store.get_by_reference_and_channel("r1", Channel::Sms).unwrap();
        assert_eq!(row.state, AckState::CustomerDelivered);
        assert_eq!(row.version, 4);
        assert_eq!(row.attributes["webhookStatus"], "DELIVERED");
    }

    #[tokio::test]
    async fn test_out_of_order_receipt_is_stale() {
        let h = harness(MockReply::ok(""));
        let r = reconciler(&h);
        accepted(&h, "r1", "gs-1");

        r.reconcile(event("gs-1", "READ", None)).await;
        assert_eq!(
            r.reconcile(event("gs-1", "DELIVERED", None)).await,
            Reconciliation::Stale
        );
        let row = h.store.get_by_reference_and_channel("r1", Channel::Sms).unwrap();
        assert_eq!(row.state, AckState::CustomerRead);
    }

    #[tokio::test]
    async fn test_orphan_webhook() {
        let h = harness(MockReply::ok(""));
        let r = reconciler(&h);
        assert_eq!(
            r.reconcile(event("nope", "DELIVERED", None)).await,
            Reconciliation::Orphan
        );
        assert_eq!(h.ctx.admin.webhooks_received(), 1);
    }

    #[tokio::test]
    async fn test_hard_bounce_is_terminal() {
        let h = harness(MockReply::ok(""));
        let r = reconciler(&h);
        accepted(&h, "r1", "gs-1");

        assert_eq!(
            r.reconcile(event("gs-1", "FAILED", Some("DND fail"))).await,
            Reconciliation::Applied(AckState::CustomerUndelivered)
        );
        assert_eq!(
            r.reconcile(event("gs-1", "FAILED", Some("BLOCKED"))).await,
            Reconciliation::Stale
        );
        assert_eq!(h.transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_in_flight_status_redispatches_then_gives_up() {
        let h = harness(MockReply::ok(
            r#"{"status":{"code":200,"desc":"Accepted"},"data":{"id":"kx-1"}}"#,
        ));
        let r = reconciler(&h);
        accepted(&h, "root", "gs-1");

        for attempt in 0..2 {
            match r.reconcile(event("gs-1", "SUBMITTED", None)).await {
                Reconciliation::Redispatched(reference_id) => {
                    let child = h
                        .store
                        .get_by_reference_and_channel(&reference_id, Channel::Sms)
                        .unwrap();
                    assert_eq!(child.parent_reference_id.as_deref(), Some("root"));
                    assert_eq!(child.vendor, VendorId::Karix);
                    assert_eq!(child.message, "Your code is 1234");
                }
                other => panic!("attempt {}: unexpected {:?}", attempt, other),
            }
        }
        assert!(h.transport.wait_for_calls(2, Duration::from_secs(2)).await);

        assert_eq!(
            r.reconcile(event("gs-1", "SUBMITTED", None)).await,
            Reconciliation::Applied(AckState::CustomerUndelivered)
        );
        assert_eq!(h.store.count_by_parent_reference("root"), 2);
    }

    #[tokio::test]
    async fn test_failure_after_sent_retries_then_undelivers() {
        let h = harness(MockReply::ok(
            r#"{"status":{"code":200,"desc":"Accepted"},"data":{"id":"kx-1"}}"#,
        ));
        let r = reconciler(&h);
        accepted(&h, "root", "gs-1");

        assert_eq!(
            r.reconcile(event("gs-1", "SENT", None)).await,
            Reconciliation::Applied(AckState::CustomerSent)
        );
        // a late submitted report cannot move the row back
        assert_eq!(
            r.reconcile(event("gs-1", "SUBMITTED", None)).await,
            Reconciliation::Stale
        );

        for _ in 0..2 {
            assert!(matches!(
                r.reconcile(event("gs-1", "FAILED", Some("EXPIRED"))).await,
                Reconciliation::Redispatched(_)
            ));
        }
        assert_eq!(
            r.reconcile(event("gs-1", "FAILED", Some("EXPIRED"))).await,
            Reconciliation::Applied(AckState::CustomerUndelivered)
        );

        let row = h.store.get_by_reference_and_channel("root", Channel::Sms).unwrap();
        assert_eq!(row.state, AckState::CustomerUndelivered);
        let acks = h.sink.on_topic("dispatch.acknowledgements");
        assert_eq!(acks.len(), 2);
        assert_eq!(acks[1].json().unwrap()["state"], "CUSTOMER_UNDELIVERED");

        assert_eq!(
            r.reconcile(event("gs-1", "FAILED", Some("EXPIRED"))).await,
            Reconciliation::Stale
        );
    }

    #[tokio::test]
    async fn test_whatsapp_failure_after_sent_is_undelivered() {
        let h = harness(MockReply::ok(""));
        let r = reconciler(&h);

        let mut ack = pending_sms("wa-1");
        ack.channel = Channel::Whatsapp;
        assert!(h.store.insert(ack));
        assert!(h.store.update_vendor_delivery(VendorDeliveryUpdate {
            channel: Channel::Whatsapp,
            ..vendor_update("wa-1", "gs-wa")
        }));

        let mut sent = event("gs-wa", "SENT", None);
        sent.channel = Channel::Whatsapp;
        r.reconcile(sent).await;

        let mut failed = event("gs-wa", "FAILED", Some("EXPIRED"));
        failed.channel = Channel::Whatsapp;
        assert_eq!(
            r.reconcile(failed).await,
            Reconciliation::Applied(AckState::CustomerUndelivered)
        );
        assert_eq!(h.transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_writer_conflict() {
        let h = harness(MockReply::ok(""));
        let r = reconciler(&h);
        accepted(&h, "r1", "gs-1");
        let row = h.store.get_by_reference_and_channel("r1", Channel::Sms).unwrap();

        // another writer advances the row after our read
        assert!(h.store.update_vendor_delivery(vendor_update("r1", "")));

        let outcome = r.apply(&row, &event("gs-1", "SENT", None), AckState::CustomerSent).await;
        assert_eq!(outcome, Reconciliation::Conflict);
    }

    #[tokio::test]
    async fn test_whatsapp_opt_in_transitions() {
        let h = harness(MockReply::ok(""));
        let r = reconciler(&h);

        let mut ack = pending_sms("wa-1");
        ack.channel = Channel::Whatsapp;
        assert!(h.store.insert(ack));
        assert!(h.store.update_vendor_delivery(VendorDeliveryUpdate {
            channel: Channel::Whatsapp,
            ..vendor_update("wa-1", "gs-wa")
        }));
        h.store
            .upsert_opt_in(WhatsappOptInUser::new("919800000001", OptInStatus::NoAccnt));

        let mut read = event("gs-wa", "VIEW", None);
        read.channel = Channel::Whatsapp;
        assert_eq!(
            r.reconcile(read).await,
            Reconciliation::Applied(AckState::CustomerRead)
        );
        assert_eq!(
            h.store.get_opt_in("919800000001").unwrap().status,
            OptInStatus::OptIn
        );
    }
}
