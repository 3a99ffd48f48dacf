//! Vendor webhook reconciliation and concurrent acknowledgement writers.

mod common;

use std::sync::{Arc, Barrier};
use std::thread;

use chrono::Utc;

use common::{event, fixture, Fixture, GUPSHUP_OK, PHONE};
use dispatchd::dispatch::MockReply;
use dispatchd::message::Channel;
use dispatchd::store::{
    AckState, AcknowledgementStore, ActorDeliveryUpdate, Attributes, MemoryStorage, OptInStatus,
    OptInStore, PersistentStorage, Storage, VendorDeliveryUpdate, WebhookMeta, WhatsappOptInUser,
};
use dispatchd::vendor::VendorId;
use dispatchd::webhook::Reconciliation;

const VENDOR_MESSAGE_ID: &str = "3456789012345";

/// Send a WhatsApp message to an opted-in user and wait for the vendor ack.
async fn delivered_whatsapp(f: &Fixture) -> String {
    f.store
        .upsert_opt_in(WhatsappOptInUser::new(PHONE, OptInStatus::OptIn));
    let reference_id = f.submit(event("WHATSAPP"));
    f.settle().await;
    reference_id
}

fn gupshup_report(status: &str, cause: Option<&str>) -> Vec<u8> {
    let mut report = serde_json::json!({
        "externalId": VENDOR_MESSAGE_ID,
        "eventType": status,
        "eventTs": 1767225600000i64,
        "noOfFrags": 1,
        "channel": "WHATSAPP",
    });
    if let Some(cause) = cause {
        report["cause"] = cause.into();
    }
    serde_json::to_vec(&report).unwrap()
}

#[tokio::test]
async fn test_unknown_subscriber_demotes_opt_in() {
    let f = fixture(MockReply::ok(GUPSHUP_OK));
    let reference_id = delivered_whatsapp(&f).await;

    let outcomes = f
        .state
        .reconciler
        .handle(
            VendorId::Gupshup,
            &gupshup_report("FAILED", Some("UNKNOWN_SUBSCRIBER")),
        )
        .await
        .unwrap();
    assert_eq!(
        outcomes,
        vec![Reconciliation::Applied(AckState::CustomerUndelivered)]
    );

    assert_eq!(
        f.store.get_opt_in(PHONE).unwrap().status,
        OptInStatus::NoAccnt
    );
    let row = f
        .store
        .get_by_reference_and_channel(&reference_id, Channel::Whatsapp)
        .unwrap();
    assert_eq!(row.state, AckState::CustomerUndelivered);
    assert_eq!(row.attributes["webhookCause"], "UNKNOWN_SUBSCRIBER");
    assert_eq!(row.actor_delivery_time.unwrap().timestamp(), 1_767_225_600);

    let acks = f.sink.on_topic("dispatch.acknowledgements");
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].json().unwrap()["state"], "CUSTOMER_UNDELIVERED");
    assert_eq!(f.sink.on_topic("dispatch.campaign-analytics").len(), 1);

    // terminal: no local retry, nothing else sent
    assert_eq!(f.transport.call_count(), 1);
}

#[tokio::test]
async fn test_read_receipt_promotes_no_account_user() {
    let f = fixture(MockReply::ok(GUPSHUP_OK));
    let reference_id = delivered_whatsapp(&f).await;
    f.store
        .upsert_opt_in(WhatsappOptInUser::new(PHONE, OptInStatus::NoAccnt));

    let outcomes = f
        .state
        .reconciler
        .handle(VendorId::Gupshup, &gupshup_report("VIEW", None))
        .await
        .unwrap();
    assert_eq!(outcomes, vec![Reconciliation::Applied(AckState::CustomerRead)]);

    assert_eq!(
        f.store.get_opt_in(PHONE).unwrap().status,
        OptInStatus::OptIn
    );
    let row = f
        .store
        .get_by_reference_and_channel(&reference_id, Channel::Whatsapp)
        .unwrap();
    assert_eq!(row.state, AckState::CustomerRead);
    assert_eq!(row.version, 3);

    // read receipts are emitted downstream by another path
    assert!(f.sink.on_topic("dispatch.acknowledgements").is_empty());
    assert_eq!(f.sink.on_topic("dispatch.campaign-analytics").len(), 1);
}

#[tokio::test]
async fn test_unknown_vendor_message_id_is_orphan() {
    let f = fixture(MockReply::ok(GUPSHUP_OK));

    let outcomes = f
        .state
        .reconciler
        .handle(VendorId::Gupshup, &gupshup_report("DELIVERED", None))
        .await
        .unwrap();
    assert_eq!(outcomes, vec![Reconciliation::Orphan]);
    assert_eq!(f.state.admin.webhooks_received(), 1);
}

fn actor_update(state: AckState, version: u64) -> ActorDeliveryUpdate {
    ActorDeliveryUpdate {
        state,
        actor_delivery_time: Utc::now(),
        channel: Channel::Whatsapp,
        vendor: VendorId::Gupshup,
        vendor_message_id: VENDOR_MESSAGE_ID.into(),
        meta: WebhookMeta {
            status: state.as_str().into(),
            cause: None,
            fragment_count: None,
        },
        attributes_base: Attributes::new(),
        expected_version: version,
    }
}

/// Two writers race on the same row at the same version.
fn race(store: Arc<dyn Storage>, reference_id: &str) {
    let before = store
        .get_by_reference_and_channel(reference_id, Channel::Whatsapp)
        .unwrap();
    let barrier = Arc::new(Barrier::new(2));

    let results: Vec<bool> = thread::scope(|scope| {
        let handles: Vec<_> = [AckState::CustomerDelivered, AckState::CustomerRead]
            .into_iter()
            .map(|state| {
                let store = store.clone();
                let barrier = barrier.clone();
                let version = before.version;
                scope.spawn(move || {
                    barrier.wait();
                    store.update_actor_delivery(actor_update(state, version))
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(results.iter().filter(|ok| **ok).count(), 1, "{:?}", results);
    let after = store
        .get_by_reference_and_channel(reference_id, Channel::Whatsapp)
        .unwrap();
    assert_eq!(after.version, before.version + 1);
}

#[tokio::test]
async fn test_concurrent_actor_updates_memory() {
    let f = fixture(MockReply::ok(GUPSHUP_OK));
    let reference_id = delivered_whatsapp(&f).await;
    let store: Arc<MemoryStorage> = f.store.clone();
    race(store, &reference_id);
}

#[tokio::test]
async fn test_concurrent_actor_updates_persistent() {
    let f = fixture(MockReply::ok(GUPSHUP_OK));
    let reference_id = delivered_whatsapp(&f).await;
    let accepted = f
        .store
        .get_by_reference_and_channel(&reference_id, Channel::Whatsapp)
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let store = PersistentStorage::open(dir.path()).await.unwrap();

    // replay the accepted row into the persistent backend
    let mut pending = accepted;
    pending.state = AckState::VendorUndelivered;
    pending.vendor_message_id = String::new();
    assert!(store.insert(pending));
    assert!(store.update_vendor_delivery(VendorDeliveryUpdate {
        state: AckState::VendorDelivered,
        vendor_delivery_time: Utc::now(),
        vendor_message_id: VENDOR_MESSAGE_ID.into(),
        reference_id: reference_id.clone(),
        attributes_delta: Attributes::new(),
        channel: Channel::Whatsapp,
    }));

    race(store, &reference_id);
}
