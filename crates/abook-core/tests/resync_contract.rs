//! Contract Test: Startup Synchronization & ID Stability
//!
//! Constraints verified:
//! - A record without an embedded id gets a fresh id written back
//! - A second full query over an unchanged store emits no create/update
//! - Contact ids survive restarts and reordered enumeration
//! - Cached contacts the full query never confirms are purged, once
//! - Malformed embedded ids are replaced, never trusted
//! - Well-formed ids written by other clients are kept as found

mod common;

use abook_core::model::{AppContactId, PropertyId, PropertyValue};
use abook_core::sync::{ControllerState, SyncEvent};
use abook_core::traits::{CachedContact, ContactCache};
use common::*;

fn is_create_or_update(event: &SyncEvent) -> bool {
    matches!(
        event,
        SyncEvent::ContactCreated { .. } | SyncEvent::ContactUpdated { .. }
    )
}

#[tokio::test]
async fn new_contact_from_native_store() {
    let store = FakeNativeStore::new();
    store.put("rec1", named("Alice"));
    let cache = CountingCache::new();

    let mut running = Running::start(&store, &cache);
    let events = running.wait_steady().await;

    let contacts = running.controller.contacts();
    assert_eq!(contacts.len(), 1);
    let alice = &contacts[0];
    assert!(alice.resolved);
    assert_eq!(alice.display_name(), Some("Alice"));

    // The minted id is bound and written back into the record
    let rec1 = abook_core::NativeRecordId::new("rec1");
    assert_eq!(running.controller.lookup(&rec1), Some(alice.id.clone()));
    let stored = store.record("rec1").unwrap();
    assert_eq!(stored.text(PropertyId::AppId), Some(alice.id.as_str()));
    assert_eq!(store.written(), vec![(rec1, PropertyId::AppId)]);

    assert!(events.contains(&SyncEvent::ContactCreated {
        id: alice.id.clone(),
        display_name: Some("Alice".to_string()),
    }));
    assert_eq!(running.controller.state(), ControllerState::Steady);

    running.stop().await;
    assert_eq!(cache.saves(), 1);
}

#[tokio::test]
async fn second_full_query_is_idempotent() {
    let store = FakeNativeStore::new();
    store.put("rec1", named("Alice"));
    store.put("rec2", named("Bob"));
    let cache = CountingCache::new();

    let mut first = Running::start(&store, &cache);
    let events = first.wait_steady().await;
    assert_eq!(count(&events, is_create_or_update), 2);
    let mut first_ids: Vec<AppContactId> =
        first.controller.contacts().into_iter().map(|c| c.id).collect();
    first.stop().await;

    let saves_after_first = cache.saves();
    let sets_after_first = store.set_calls();

    // Restart against the same store and cache, enumerating in reverse
    store.reverse_query(true);
    let mut second = Running::start(&store, &cache);
    let events = second.wait_steady().await;

    assert_eq!(count(&events, is_create_or_update), 0, "events: {:?}", events);
    assert!(events.contains(&SyncEvent::ContactsPurged { ids: vec![] }));
    assert_eq!(cache.saves(), saves_after_first, "unchanged contacts are not rewritten");
    assert_eq!(store.set_calls(), sets_after_first, "embedded ids are not rewritten");

    let mut second_ids: Vec<AppContactId> =
        second.controller.contacts().into_iter().map(|c| c.id).collect();
    first_ids.sort();
    second_ids.sort();
    assert_eq!(first_ids, second_ids, "ids are stable across restarts");
    assert!(second.controller.contacts().iter().all(|c| c.resolved));

    second.stop().await;
}

#[tokio::test]
async fn unresolved_contacts_are_purged() {
    let kept = AppContactId::mint();
    let stale = AppContactId::mint();
    let cache = CountingCache::with_contacts([
        CachedContact::new(kept.clone(), true, named_with_id("Alice", &kept)),
        CachedContact::new(stale.clone(), false, named_with_id("Ghost", &stale)),
    ]);

    let store = FakeNativeStore::new();
    store.put("rec1", named_with_id("Alice", &kept));

    let mut running = Running::start(&store, &cache);
    let events = running.wait_steady().await;

    assert!(events.contains(&SyncEvent::ContactsPurged {
        ids: vec![stale.clone()]
    }));
    assert_eq!(count(&events, is_create_or_update), 0);

    let contacts = running.controller.contacts();
    assert_eq!(contacts.len(), 1);
    assert_eq!(contacts[0].id, kept);
    assert!(contacts[0].resolved);
    assert!(contacts[0].favorite, "cached favorite flag survives");

    running.stop().await;

    assert_eq!(cache.list_ids().await.unwrap(), vec![kept]);
}

#[tokio::test]
async fn cached_contacts_start_unresolved() {
    let id = AppContactId::mint();
    let cache =
        CountingCache::with_contacts([CachedContact::new(id.clone(), false, named_with_id("Alice", &id))]);

    // The record is only delivered once the store is read
    let store = FakeNativeStore::new();
    store.put("rec1", named_with_id("Alice", &id));

    let mut running = Running::start(&store, &cache);
    match running.next_event().await {
        SyncEvent::Started { cached_contacts, .. } => assert_eq!(cached_contacts, 1),
        other => panic!("expected Started, got {:?}", other),
    }

    running.wait_steady().await;
    assert!(running.controller.contact(&id).unwrap().resolved);
    running.stop().await;
}

#[tokio::test]
async fn malformed_embedded_id_is_replaced() {
    let store = FakeNativeStore::new();
    store.put(
        "rec1",
        named("Alice").with(PropertyId::AppId, PropertyValue::text("not-a-contact-id")),
    );
    let cache = CountingCache::new();

    let mut running = Running::start(&store, &cache);
    running.wait_steady().await;

    let contacts = running.controller.contacts();
    assert_eq!(contacts.len(), 1);
    let written = store.record("rec1").unwrap();
    let id = written.text(PropertyId::AppId).unwrap();
    assert_ne!(id, "not-a-contact-id");
    assert_eq!(id, contacts[0].id.as_str());
    assert!(AppContactId::parse(id).is_some());

    running.stop().await;
}

#[tokio::test]
async fn upper_case_embedded_id_is_kept() {
    let upper = AppContactId::mint().as_str().to_uppercase();
    let store = FakeNativeStore::new();
    store.put(
        "rec1",
        named("Alice").with(PropertyId::AppId, PropertyValue::text(upper.as_str())),
    );
    let cache = CountingCache::new();

    let mut running = Running::start(&store, &cache);
    running.wait_steady().await;

    let contacts = running.controller.contacts();
    assert_eq!(contacts.len(), 1);
    assert_eq!(contacts[0].id.as_str(), upper);
    assert!(store.written().is_empty(), "the id is not rewritten");
    assert_eq!(store.record("rec1").unwrap().text(PropertyId::AppId), Some(upper.as_str()));

    running.stop().await;
}

#[tokio::test]
async fn incremental_notifications_after_steady() {
    let store = FakeNativeStore::new();
    let cache = CountingCache::new();

    let mut running = Running::start(&store, &cache);
    running.wait_steady().await;

    store.put("rec9", named("Carol"));
    store.notify("rec9", abook_core::ChangeKind::Inserted);

    match running.next_event().await {
        SyncEvent::ContactCreated { display_name, .. } => {
            assert_eq!(display_name.as_deref(), Some("Carol"))
        }
        other => panic!("expected ContactCreated, got {:?}", other),
    }

    // An edit in the native store shows up as an update
    let id = running
        .controller
        .lookup(&abook_core::NativeRecordId::new("rec9"))
        .unwrap();
    let mut props = store.record("rec9").unwrap();
    props.set(PropertyId::DisplayName, PropertyValue::text("Carol Smith"));
    store.put("rec9", props);
    store.notify("rec9", abook_core::ChangeKind::Updated);

    assert_eq!(
        running.next_event().await,
        SyncEvent::ContactUpdated { id: id.clone() }
    );
    assert_eq!(
        running.controller.contact(&id).unwrap().display_name(),
        Some("Carol Smith")
    );

    running.stop().await;
}
