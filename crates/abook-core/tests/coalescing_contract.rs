//! Contract Test: Notification Coalescing
//!
//! Constraints verified:
//! - Duplicate notifications within the quiet period cause one fetch
//! - Only the most recent kind per record is applied
//! - Different records drain in arrival order
//! - Every new notification re-arms the quiet period
//! - A failed property fetch drops the notification and the drain goes on

mod common;

use abook_core::coalescer::{Coalescer, NotificationSink};
use abook_core::model::{ChangeKind, NativeProperties, NativeRecordId};
use async_trait::async_trait;
use common::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Applied {
    Deleted(String),
    Properties(String, ChangeKind),
}

#[derive(Default)]
struct RecordingSink {
    applied: Mutex<Vec<Applied>>,
    drained: AtomicUsize,
}

impl RecordingSink {
    fn applied(&self) -> Vec<Applied> {
        self.applied.lock().unwrap().clone()
    }

    fn drained(&self) -> usize {
        self.drained.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn apply_deleted(&self, native_id: &NativeRecordId) {
        self.applied
            .lock()
            .unwrap()
            .push(Applied::Deleted(native_id.to_string()));
    }

    async fn apply_properties(
        &self,
        native_id: &NativeRecordId,
        kind: ChangeKind,
        _props: NativeProperties,
    ) {
        self.applied
            .lock()
            .unwrap()
            .push(Applied::Properties(native_id.to_string(), kind));
    }

    async fn queue_drained(&self) {
        self.drained.fetch_add(1, Ordering::SeqCst);
    }
}

fn setup(quiet_ms: u64) -> (FakeNativeStore, Arc<RecordingSink>, Coalescer) {
    let store = FakeNativeStore::new();
    for id in ["a", "b", "c", "rec1"] {
        store.put(id, named(id));
    }
    let sink = Arc::new(RecordingSink::default());
    let coalescer = Coalescer::new(
        Arc::new(store.clone()),
        sink.clone(),
        Duration::from_millis(quiet_ms),
    )
    .expect("inside a runtime");
    (store, sink, coalescer)
}

#[tokio::test]
async fn duplicate_update_is_fetched_once() {
    let (store, sink, coalescer) = setup(QUIET_MS);

    coalescer.add_notification(NativeRecordId::new("rec1"), ChangeKind::Updated);
    tokio::time::sleep(Duration::from_millis(10)).await;
    coalescer.add_notification(NativeRecordId::new("rec1"), ChangeKind::Updated);

    settle().await;

    assert_eq!(store.get_calls(), 1, "exactly one properties fetch");
    assert_eq!(
        sink.applied(),
        vec![Applied::Properties("rec1".into(), ChangeKind::Updated)]
    );
    assert_eq!(coalescer.stats().coalesced, 1);
    assert!(coalescer.is_settled());

    coalescer.shutdown().await;
}

#[tokio::test]
async fn last_kind_wins() {
    let (store, sink, coalescer) = setup(QUIET_MS);

    coalescer.add_notification(NativeRecordId::new("rec1"), ChangeKind::Inserted);
    coalescer.add_notification(NativeRecordId::new("rec1"), ChangeKind::Updated);
    coalescer.add_notification(NativeRecordId::new("rec1"), ChangeKind::Deleted);

    settle().await;

    assert_eq!(sink.applied(), vec![Applied::Deleted("rec1".into())]);
    assert_eq!(store.get_calls(), 0, "deletions skip the fetch");

    coalescer.shutdown().await;
}

#[tokio::test]
async fn records_drain_in_order_of_latest_notification() {
    let (_store, sink, coalescer) = setup(QUIET_MS);

    coalescer.add_notification(NativeRecordId::new("a"), ChangeKind::Inserted);
    coalescer.add_notification(NativeRecordId::new("b"), ChangeKind::Inserted);
    coalescer.add_notification(NativeRecordId::new("c"), ChangeKind::Inserted);
    coalescer.add_notification(NativeRecordId::new("a"), ChangeKind::Updated);

    let pending: Vec<String> = coalescer
        .pending()
        .into_iter()
        .map(|p| p.native_id.to_string())
        .collect();
    assert_eq!(pending, vec!["b", "c", "a"]);

    settle().await;

    assert_eq!(
        sink.applied(),
        vec![
            Applied::Properties("b".into(), ChangeKind::Inserted),
            Applied::Properties("c".into(), ChangeKind::Inserted),
            Applied::Properties("a".into(), ChangeKind::Updated),
        ]
    );
    assert_eq!(sink.drained(), 1);

    coalescer.shutdown().await;
}

#[tokio::test]
async fn new_notification_rearms_quiet_period() {
    let (store, sink, coalescer) = setup(100);

    coalescer.add_notification(NativeRecordId::new("a"), ChangeKind::Inserted);
    tokio::time::sleep(Duration::from_millis(60)).await;
    coalescer.add_notification(NativeRecordId::new("b"), ChangeKind::Inserted);
    tokio::time::sleep(Duration::from_millis(60)).await;

    // 120ms after the first notification but only 60ms after the last
    assert_eq!(store.get_calls(), 0, "drain must wait for a full quiet period");
    assert_eq!(coalescer.pending_len(), 2);

    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(store.get_calls(), 2);
    assert_eq!(sink.applied().len(), 2);

    coalescer.shutdown().await;
}

#[tokio::test]
async fn failed_fetch_is_dropped() {
    let (store, sink, coalescer) = setup(QUIET_MS);
    store.fail_get("a");

    coalescer.add_notification(NativeRecordId::new("a"), ChangeKind::Updated);
    coalescer.add_notification(NativeRecordId::new("b"), ChangeKind::Updated);

    settle().await;

    assert_eq!(
        sink.applied(),
        vec![Applied::Properties("b".into(), ChangeKind::Updated)]
    );
    let stats = coalescer.stats();
    assert_eq!(stats.fetch_failures, 1);
    assert_eq!(stats.processed, 1);
    assert!(coalescer.is_settled());

    coalescer.shutdown().await;
}

#[tokio::test]
async fn notifications_after_shutdown_are_ignored() {
    let (store, sink, coalescer) = setup(QUIET_MS);

    coalescer.shutdown().await;
    coalescer.add_notification(NativeRecordId::new("a"), ChangeKind::Inserted);

    settle().await;

    assert_eq!(store.get_calls(), 0);
    assert!(sink.applied().is_empty());
    assert!(coalescer.is_settled());
}
