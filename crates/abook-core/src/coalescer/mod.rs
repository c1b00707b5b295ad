//! Notification coalescer
//!
//! Native stores emit many change events per edit. The coalescer collects
//! them per backend, keeps only the most recent kind for every native id and
//! drains the queue once no new event has arrived for a quiet period.
//!
//! ## Flow
//!
//! ```text
//! add_notification(id, kind)          (any thread, non-blocking)
//!         │
//!         ▼
//! ┌──────────────────┐   quiet period elapsed   ┌──────────────────────┐
//! │  pending queue   │ ───────────────────────▶ │ drain, one at a time │
//! │ (one entry / id) │ ◀─── new event: re-arm ─ │                      │
//! └──────────────────┘                          └──────────────────────┘
//!                                                          │
//!                          deleted ──▶ sink.apply_deleted  │
//!                 inserted/updated ──▶ get_properties ──▶ sink.apply_properties
//!                                                          │
//!                                        queue empty ──▶ sink.queue_drained
//! ```
//!
//! A newer notification for an id replaces the pending one and moves it to
//! the back of the queue, so ids are drained in order of their latest event.
//!
//! ## Locking
//!
//! The queue lock is never held across an await and never taken while a
//! caller expects to acquire another lock afterwards.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::model::{ChangeKind, NativeProperties, NativeRecordId, PropertyId};
use crate::traits::NativeStore;

/// A queued change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingNotification {
    /// Record the change applies to
    pub native_id: NativeRecordId,
    /// Most recent kind received for this record
    pub kind: ChangeKind,
    /// When the most recent notification arrived
    pub enqueued_at: Instant,
}

/// Receiver of drained notifications
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// A record was deleted; no properties are fetched
    async fn apply_deleted(&self, native_id: &NativeRecordId);

    /// Current properties of an inserted or updated record
    async fn apply_properties(
        &self,
        native_id: &NativeRecordId,
        kind: ChangeKind,
        props: NativeProperties,
    );

    /// The queue ran empty after a drain
    async fn queue_drained(&self);
}

/// Counters describing coalescer activity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoalescerStats {
    /// Notifications received
    pub received: u64,
    /// Notifications that replaced a pending one
    pub coalesced: u64,
    /// Notifications handed to the sink
    pub processed: u64,
    /// Property fetches that failed (notification dropped)
    pub fetch_failures: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    order: VecDeque<NativeRecordId>,
    pending: HashMap<NativeRecordId, PendingNotification>,
    last_enqueue: Option<Instant>,
    in_flight: bool,
    worker_started: bool,
    stats: CoalescerStats,
}

impl QueueState {
    fn push(&mut self, native_id: NativeRecordId, kind: ChangeKind, now: Instant) {
        self.stats.received += 1;
        if self.pending.contains_key(&native_id) {
            self.stats.coalesced += 1;
            self.order.retain(|queued| queued != &native_id);
        }
        self.order.push_back(native_id.clone());
        self.pending.insert(
            native_id.clone(),
            PendingNotification {
                native_id,
                kind,
                enqueued_at: now,
            },
        );
        self.last_enqueue = Some(now);
    }

    fn pop(&mut self) -> Option<PendingNotification> {
        let native_id = self.order.pop_front()?;
        self.pending.remove(&native_id)
    }
}

struct Shared {
    queue: Mutex<QueueState>,
    wake: Notify,
    shutdown: AtomicBool,
}

/// Per-backend notification coalescer
///
/// The worker task is spawned on the first notification and runs until
/// [`Coalescer::shutdown`].
pub struct Coalescer {
    shared: Arc<Shared>,
    store: Arc<dyn NativeStore>,
    sink: Arc<dyn NotificationSink>,
    quiet_period: Duration,
    runtime: Handle,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Coalescer {
    /// Create a coalescer
    ///
    /// Must be called from within a tokio runtime; the worker is spawned on
    /// that runtime even when notifications arrive from foreign threads.
    pub fn new(
        store: Arc<dyn NativeStore>,
        sink: Arc<dyn NotificationSink>,
        quiet_period: Duration,
    ) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::Other(format!("Coalescer needs a tokio runtime: {}", e)))?;

        Ok(Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(QueueState::default()),
                wake: Notify::new(),
                shutdown: AtomicBool::new(false),
            }),
            store,
            sink,
            quiet_period,
            runtime,
            worker: Mutex::new(None),
        })
    }

    /// Queue a change notification
    ///
    /// Non-blocking and callable from any thread. Resets the quiet period.
    pub fn add_notification(&self, native_id: NativeRecordId, kind: ChangeKind) {
        if self.shared.shutdown.load(Ordering::SeqCst) {
            debug!("Coalescer stopped, ignoring {:?} for {}", kind, native_id);
            return;
        }

        let start_worker = {
            let mut queue = self.shared.queue.lock();
            trace!("Queued {:?} for {}", kind, native_id);
            queue.push(native_id, kind, Instant::now());
            !std::mem::replace(&mut queue.worker_started, true)
        };

        if start_worker {
            let handle = self.runtime.spawn(run_worker(
                Arc::clone(&self.shared),
                Arc::clone(&self.store),
                Arc::clone(&self.sink),
                self.quiet_period,
            ));
            *self.worker.lock() = Some(handle);
        }

        self.shared.wake.notify_one();
    }

    /// Whether nothing is queued or being processed
    pub fn is_settled(&self) -> bool {
        let queue = self.shared.queue.lock();
        queue.order.is_empty() && !queue.in_flight
    }

    /// Number of queued notifications
    pub fn pending_len(&self) -> usize {
        self.shared.queue.lock().order.len()
    }

    /// Snapshot of the queued notifications in drain order
    pub fn pending(&self) -> Vec<PendingNotification> {
        let queue = self.shared.queue.lock();
        queue
            .order
            .iter()
            .filter_map(|id| queue.pending.get(id).cloned())
            .collect()
    }

    /// Activity counters
    pub fn stats(&self) -> CoalescerStats {
        self.shared.queue.lock().stats.clone()
    }

    /// Stop the worker
    ///
    /// The notification being processed is finished; queued ones are
    /// discarded.
    pub async fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();

        let handle = self.worker.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!("Coalescer worker ended abnormally: {}", e);
        }
    }
}

impl Drop for Coalescer {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
    }
}

async fn run_worker(
    shared: Arc<Shared>,
    store: Arc<dyn NativeStore>,
    sink: Arc<dyn NotificationSink>,
    quiet_period: Duration,
) {
    debug!("Coalescer worker started");

    loop {
        // Wait until something is queued
        loop {
            if shared.shutdown.load(Ordering::SeqCst) {
                debug!("Coalescer worker stopped");
                return;
            }
            if !shared.queue.lock().order.is_empty() {
                break;
            }
            shared.wake.notified().await;
        }

        // Wait for a full quiet period without new notifications
        loop {
            if shared.shutdown.load(Ordering::SeqCst) {
                debug!("Coalescer worker stopped");
                return;
            }
            let deadline = match shared.queue.lock().last_enqueue {
                Some(last) => last + quiet_period,
                None => break,
            };
            if Instant::now() >= deadline {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = shared.wake.notified() => {}
            }
        }

        // Drain one notification at a time, in queue order
        let drain_started = Instant::now();
        let mut interrupted = false;
        loop {
            if shared.shutdown.load(Ordering::SeqCst) {
                debug!("Coalescer worker stopped");
                return;
            }

            let next = {
                let mut queue = shared.queue.lock();
                if queue.last_enqueue.is_some_and(|last| last > drain_started) {
                    interrupted = true;
                    None
                } else {
                    let next = queue.pop();
                    queue.in_flight = next.is_some();
                    next
                }
            };

            let Some(notification) = next else { break };
            process(store.as_ref(), sink.as_ref(), &shared, notification).await;
            shared.queue.lock().in_flight = false;
        }

        if interrupted {
            trace!("New notifications arrived during drain, waiting for quiet period again");
            continue;
        }

        sink.queue_drained().await;
    }
}

async fn process(
    store: &dyn NativeStore,
    sink: &dyn NotificationSink,
    shared: &Shared,
    notification: PendingNotification,
) {
    let PendingNotification {
        native_id, kind, ..
    } = notification;

    match kind {
        ChangeKind::Deleted => {
            sink.apply_deleted(&native_id).await;
        }
        ChangeKind::Inserted | ChangeKind::Updated => {
            match store.get_properties(&native_id, &PropertyId::ALL).await {
                Ok(values) => {
                    let props = NativeProperties::from_values(&PropertyId::ALL, values);
                    sink.apply_properties(&native_id, kind, props).await;
                }
                Err(e) => {
                    warn!(
                        "Failed to fetch properties of {} ({:?}), dropping notification: {}",
                        native_id, kind, e
                    );
                    shared.queue.lock().stats.fetch_failures += 1;
                    return;
                }
            }
        }
    }

    shared.queue.lock().stats.processed += 1;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_keeps_latest_kind_per_id() {
        let mut queue = QueueState::default();
        let now = Instant::now();
        queue.push(NativeRecordId::new("a"), ChangeKind::Inserted, now);
        queue.push(NativeRecordId::new("b"), ChangeKind::Updated, now);
        queue.push(NativeRecordId::new("a"), ChangeKind::Deleted, now);

        assert_eq!(queue.order.len(), 2);
        assert_eq!(queue.stats.received, 3);
        assert_eq!(queue.stats.coalesced, 1);

        let first = queue.pop().unwrap();
        assert_eq!(first.native_id, NativeRecordId::new("b"));
        let second = queue.pop().unwrap();
        assert_eq!(second.native_id, NativeRecordId::new("a"));
        assert_eq!(second.kind, ChangeKind::Deleted);
        assert!(queue.pop().is_none());
    }
}
