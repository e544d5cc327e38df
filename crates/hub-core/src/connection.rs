//! Connection Manager (C2, §4.2).
//!
//! Owns attached subscribers. The Subscription Registry never touches a
//! subscriber struct directly — it goes through this manager by id, which
//! keeps the ownership graph a tree instead of a web of back-pointers (see
//! the "Lifecycle-referenced sources" design note).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hub_common::model::GRACE_PERIOD;
use hub_common::Sink;
use parking_lot::RwLock;
use serde_json::json;
use uuid::Uuid;

/// Opaque subscriber id, unique for the process lifetime.
pub type SubscriberId = Uuid;

/// Called by the Connection Manager on grace-window expiry or restoration.
/// Implemented by the Subscription Registry, which is the only component
/// that owns a topic's subscriber-id set (§4.2, §3 I2).
#[async_trait]
pub trait GraceObserver: Send + Sync {
    /// `id` is the subscriber id that disconnected; `topics` is the snapshot
    /// of topics it held at disconnect time. Drop the stale id from each.
    async fn on_grace_expired(&self, id: SubscriberId, topics: Vec<String>);
    /// A subscriber re-attached within the grace window. Swap `old_id` for
    /// `new_id` in each of `topics`' subscriber set — restoration must not
    /// change set membership count, only which id occupies the slot, and
    /// must not re-fire first-join (§4.2, §3 `PendingDisconnect`).
    async fn on_restore(&self, old_id: SubscriberId, new_id: SubscriberId, topics: &[String]);
}

struct SubscriberRecord {
    user_id: String,
    sink: Arc<dyn Sink>,
    push_endpoint: RwLock<Option<String>>,
    subscribed_topics: RwLock<HashSet<String>>,
}

struct PendingDisconnect {
    original_connection_id: SubscriberId,
    subscriptions_snapshot: Vec<String>,
    timer: tokio::task::JoinHandle<()>,
}

/// Tracks attached subscribers, routes events to them, and runs the
/// reconnect grace window (§4.2, §3 `PendingDisconnect`).
pub struct ConnectionManager {
    subscribers: RwLock<HashMap<SubscriberId, Arc<SubscriberRecord>>>,
    /// Keyed by `userId`; invariant I8 is enforced by replacing (and
    /// cancelling) any existing entry before inserting a new one.
    pending: RwLock<HashMap<String, PendingDisconnect>>,
    grace_period: Duration,
    grace_observer: std::sync::OnceLock<Arc<dyn GraceObserver>>,
}

impl ConnectionManager {
    /// Create a new instance with the default 30s grace period.
    pub fn new() -> Arc<Self> {
        Self::with_grace_period(GRACE_PERIOD)
    }

    /// Create a new instance with an explicit grace period, mainly for tests.
    pub fn with_grace_period(grace_period: Duration) -> Arc<Self> {
        Arc::new(Self {
            subscribers: RwLock::new(HashMap::new()),
            pending: RwLock::new(HashMap::new()),
            grace_period,
            grace_observer: std::sync::OnceLock::new(),
        })
    }

    /// Bind the observer notified on grace-window expiry. Must be called
    /// exactly once during wiring, before any `detach` can race a timer firing.
    pub fn bind_grace_observer(&self, observer: Arc<dyn GraceObserver>) {
        let _ = self.grace_observer.set(observer);
    }

    /// Attach a new subscriber. If a pending disconnect exists for `user_id`,
    /// its timer is cancelled and its topic snapshot is returned so the
    /// caller can silently restore those subscriptions (§4.2) — restoration
    /// does not re-fire first-join.
    pub async fn attach(
        self: &Arc<Self>,
        user_id: impl Into<String>,
        sink: Arc<dyn Sink>,
    ) -> (SubscriberId, Vec<String>) {
        let user_id = user_id.into();
        let id = Uuid::new_v4();

        let restored = {
            let mut pending = self.pending.write();
            pending.remove(&user_id).map(|p| {
                p.timer.abort();
                (p.original_connection_id, p.subscriptions_snapshot)
            })
        };
        let topics = restored.as_ref().map(|(_, t)| t.clone()).unwrap_or_default();

        let record = Arc::new(SubscriberRecord {
            user_id,
            sink,
            push_endpoint: RwLock::new(None),
            subscribed_topics: RwLock::new(topics.iter().cloned().collect()),
        });

        self.subscribers.write().insert(id, record.clone());

        let _ = record
            .sink
            .write("connected", json!({ "connectionId": id, "message": "connected" }))
            .await;

        if let Some((old_id, topics)) = &restored {
            if let Some(observer) = self.grace_observer.get() {
                observer.on_restore(*old_id, id, topics).await;
            }
        }

        (id, topics)
    }

    /// Detach a subscriber. If it held any topics, arms a grace-window timer
    /// before those subscriptions are considered gone (§4.2, §3 I8).
    pub fn detach(self: &Arc<Self>, id: SubscriberId) {
        let record = {
            let mut subs = self.subscribers.write();
            subs.remove(&id)
        };
        let Some(record) = record else { return };

        let topics: Vec<String> = record.subscribed_topics.read().iter().cloned().collect();
        if topics.is_empty() {
            return;
        }

        let this = self.clone();
        let user_id = record.user_id.clone();
        let grace_topics = topics.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(this.grace_period).await;
            let observer = this.grace_observer.get().cloned();
            this.pending.write().remove(&user_id);
            if let Some(observer) = observer {
                observer.on_grace_expired(id, grace_topics).await;
            }
        });

        // Enforce I8: replace (and cancel) any existing pending-disconnect
        // for this user before installing the new one.
        let mut pending = self.pending.write();
        if let Some(previous) = pending.insert(
            record.user_id.clone(),
            PendingDisconnect {
                original_connection_id: id,
                subscriptions_snapshot: topics,
                timer,
            },
        ) {
            previous.timer.abort();
        }
    }

    /// Write one event to a single subscriber; on failure, silently detaches it.
    pub async fn route(self: &Arc<Self>, id: SubscriberId, event_name: &str, payload: serde_json::Value) {
        let sink = self.subscribers.read().get(&id).map(|r| r.sink.clone());
        let Some(sink) = sink else { return };
        if sink.write(event_name, payload).await.is_err() {
            self.detach(id);
        }
    }

    /// Write one event to every subscriber whose `userId` matches.
    pub async fn route_to_user(self: &Arc<Self>, user_id: &str, event_name: &str, payload: serde_json::Value) {
        let targets: Vec<SubscriberId> = self
            .subscribers
            .read()
            .iter()
            .filter(|(_, r)| r.user_id == user_id)
            .map(|(id, _)| *id)
            .collect();
        for id in targets {
            self.route(id, event_name, payload.clone()).await;
        }
    }

    /// Write one event to every attached subscriber.
    pub async fn broadcast_all(self: &Arc<Self>, event_name: &str, payload: serde_json::Value) {
        let targets: Vec<SubscriberId> = self.subscribers.read().keys().copied().collect();
        for id in targets {
            self.route(id, event_name, payload.clone()).await;
        }
    }

    /// Record the push-notification endpoint for a subscriber (used by
    /// external notification routing to avoid duplicate delivery to a
    /// device already streaming).
    pub fn set_push_endpoint(&self, id: SubscriberId, endpoint: impl Into<String>) {
        if let Some(record) = self.subscribers.read().get(&id) {
            *record.push_endpoint.write() = Some(endpoint.into());
        }
    }

    /// Every distinct push endpoint currently streaming for a user.
    pub fn active_endpoints_for_user(&self, user_id: &str) -> HashSet<String> {
        self.subscribers
            .read()
            .values()
            .filter(|r| r.user_id == user_id)
            .filter_map(|r| r.push_endpoint.read().clone())
            .collect()
    }

    /// Sink for one subscriber, used by the Transport layer to deliver
    /// topic broadcasts directly (§4.4).
    pub(crate) fn sink_of(&self, id: SubscriberId) -> Option<Arc<dyn Sink>> {
        self.subscribers.read().get(&id).map(|r| r.sink.clone())
    }

    /// The `userId` of a subscriber, used by per-topic filters (§4.4).
    pub fn user_id_of(&self, id: SubscriberId) -> Option<String> {
        self.subscribers.read().get(&id).map(|r| r.user_id.clone())
    }

    /// Add a topic to a subscriber's tracked set. Called by the Subscription
    /// Registry so invariant I2 holds. No-op if the subscriber is gone.
    pub(crate) fn add_topic(&self, id: SubscriberId, topic: &str) {
        if let Some(record) = self.subscribers.read().get(&id) {
            record.subscribed_topics.write().insert(topic.to_owned());
        }
    }

    /// Remove a topic from a subscriber's tracked set.
    pub(crate) fn remove_topic(&self, id: SubscriberId, topic: &str) {
        if let Some(record) = self.subscribers.read().get(&id) {
            record.subscribed_topics.write().remove(topic);
        }
    }

    /// Number of attached subscribers, for diagnostics/tests.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Detach every attached subscriber (§5 "Graceful shutdown"). Each
    /// detach still arms its normal grace window; this doesn't wait for it.
    pub fn detach_all(self: &Arc<Self>) {
        let ids: Vec<SubscriberId> = self.subscribers.read().keys().copied().collect();
        for id in ids {
            self.detach(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_common::model::SinkResult;
    use hub_common::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    struct RecordingSink {
        received: Mutex<Vec<(String, serde_json::Value)>>,
        fail: bool,
    }

    #[async_trait]
    impl Sink for RecordingSink {
        async fn write(&self, event_name: &str, payload: serde_json::Value) -> SinkResult {
            if self.fail {
                return Err(Error::SinkWriteFailed);
            }
            self.received
                .lock()
                .await
                .push((event_name.to_owned(), payload));
            Ok(())
        }
    }

    struct CountingObserver(Arc<AtomicUsize>);

    #[async_trait]
    impl GraceObserver for CountingObserver {
        async fn on_grace_expired(&self, _id: SubscriberId, _topics: Vec<String>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_restore(&self, _old_id: SubscriberId, _new_id: SubscriberId, _topics: &[String]) {}
    }

    #[tokio::test]
    async fn attach_emits_connected_event() {
        let mgr = ConnectionManager::new();
        let sink = Arc::new(RecordingSink {
            received: Mutex::new(vec![]),
            fail: false,
        });
        let (id, restored) = mgr.attach("alice", sink.clone()).await;
        assert!(restored.is_empty());
        let received = sink.received.lock().await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, "connected");
        assert_eq!(mgr.subscriber_count(), 1);
        drop(received);
        let _ = id;
    }

    #[tokio::test]
    async fn detach_without_topics_is_immediate() {
        let mgr = ConnectionManager::new();
        let sink = Arc::new(RecordingSink {
            received: Mutex::new(vec![]),
            fail: false,
        });
        let (id, _) = mgr.attach("alice", sink).await;
        mgr.detach(id);
        assert_eq!(mgr.subscriber_count(), 0);
        assert!(mgr.pending.read().is_empty());
    }

    #[tokio::test]
    async fn grace_restoration_cancels_timer_and_restores_topics() {
        let mgr = ConnectionManager::with_grace_period(Duration::from_millis(50));
        let count = Arc::new(AtomicUsize::new(0));
        mgr.bind_grace_observer(Arc::new(CountingObserver(count.clone())));

        let sink = Arc::new(RecordingSink {
            received: Mutex::new(vec![]),
            fail: false,
        });
        let (id, _) = mgr.attach("alice", sink.clone()).await;
        mgr.add_topic(id, "sonarr:abc");
        mgr.detach(id);

        // Re-attach before the grace window elapses.
        let (new_id, restored) = mgr.attach("alice", sink).await;
        assert_eq!(restored, vec!["sonarr:abc".to_string()]);
        assert_ne!(new_id, id);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0, "observer must not fire once cancelled");
    }

    #[tokio::test]
    async fn grace_expiry_invokes_observer_when_not_restored() {
        let mgr = ConnectionManager::with_grace_period(Duration::from_millis(20));
        let count = Arc::new(AtomicUsize::new(0));
        mgr.bind_grace_observer(Arc::new(CountingObserver(count.clone())));

        let sink = Arc::new(RecordingSink {
            received: Mutex::new(vec![]),
            fail: false,
        });
        let (id, _) = mgr.attach("alice", sink).await;
        mgr.add_topic(id, "sonarr:abc");
        mgr.detach(id);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_sink_write_triggers_detach() {
        let mgr = ConnectionManager::new();
        let sink = Arc::new(RecordingSink {
            received: Mutex::new(vec![]),
            fail: true,
        });
        // Attach succeeds despite the "connected" write failing silently below;
        // use a working sink for attach, then swap behavior via a second record.
        let working = Arc::new(RecordingSink {
            received: Mutex::new(vec![]),
            fail: false,
        });
        let (id, _) = mgr.attach("alice", working).await;
        // Force the sink to fail on the next route by detaching and reattaching
        // with a failing sink under the same id semantics.
        mgr.detach(id);
        let (id2, _) = mgr.attach("bob", sink).await;
        mgr.route(id2, "topic", serde_json::json!({})).await;
        assert_eq!(mgr.subscriber_count(), 0);
    }

}
