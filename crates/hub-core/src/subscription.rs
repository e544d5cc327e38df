//! Subscription Registry (C3, §4.3).
//!
//! Owns the topic → subscribers/cache mapping. Never touches a subscriber
//! struct directly, only ids, per the "Lifecycle-referenced sources" design
//! note. First-join/last-leave dispatch to whichever orchestrator owns a
//! topic (C5 poller or C6 realtime) through the `SourceOrchestrator` seam,
//! so this module never depends on either orchestrator's concrete type.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use hub_common::clock::now_sec;
use hub_common::topic::Topic;
use parking_lot::RwLock;
use serde_json::Value;

use crate::connection::{ConnectionManager, GraceObserver, SubscriberId};
use crate::plugin_registry::PluginRegistry;
use crate::transport::Transport;

/// The two source kinds a topic's subscription can be bound to (§3 `sourceHandle`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// No source currently bound; the subscriber set is empty.
    None,
    /// Bound to the Poller Orchestrator (C5).
    Poller,
    /// Bound to the Realtime Orchestrator (C6).
    Realtime,
}

/// Per-topic bookkeeping owned by the registry (§3 `Subscription`).
#[derive(Debug, Default)]
struct Subscription {
    subscribers: HashSet<SubscriberId>,
    cached_payload: Option<Value>,
    last_updated: i64,
    source: SourceKind,
}

impl Default for SourceKind {
    fn default() -> Self {
        SourceKind::None
    }
}

/// Lifecycle callback seam implemented by the Poller Orchestrator (C5) and
/// the Realtime Orchestrator (C6). The registry calls `start`/`stop`
/// symmetrically; what "stop" means (cancel immediately vs. arm an idle
/// timer) is each orchestrator's own business (§4.5 vs §4.6).
#[async_trait]
pub trait SourceOrchestrator: Send + Sync {
    /// First subscriber joined an empty topic. Takes `Arc<Self>` so
    /// implementations that spawn a self-referencing background task (the
    /// Poller Orchestrator's per-topic loop) can clone themselves into it.
    async fn start(self: Arc<Self>, topic: &str);
    /// Last subscriber left the topic.
    async fn stop(self: Arc<Self>, topic: &str);
}

/// Maps topic → subscribers + cached payload, and dispatches lifecycle
/// callbacks to the bound source orchestrator.
pub struct SubscriptionRegistry {
    subscriptions: RwLock<HashMap<String, Subscription>>,
    connections: Arc<ConnectionManager>,
    transport: Arc<Transport>,
    plugins: Arc<PluginRegistry>,
    poller: std::sync::OnceLock<Arc<dyn SourceOrchestrator>>,
    realtime: std::sync::OnceLock<Arc<dyn SourceOrchestrator>>,
}

impl SubscriptionRegistry {
    /// Construct a registry. `poller`/`realtime` orchestrators are bound
    /// afterward via `bind_poller`/`bind_realtime`, since C5/C6 themselves
    /// hold an `Arc<SubscriptionRegistry>` to call `broadcast` back in.
    pub fn new(
        connections: Arc<ConnectionManager>,
        transport: Arc<Transport>,
        plugins: Arc<PluginRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            subscriptions: RwLock::new(HashMap::new()),
            connections,
            transport,
            plugins,
            poller: std::sync::OnceLock::new(),
            realtime: std::sync::OnceLock::new(),
        })
    }

    /// Bind the Poller Orchestrator. Must be called exactly once during wiring.
    pub fn bind_poller(&self, orchestrator: Arc<dyn SourceOrchestrator>) {
        let _ = self.poller.set(orchestrator);
    }

    /// Bind the Realtime Orchestrator. Must be called exactly once during wiring.
    pub fn bind_realtime(&self, orchestrator: Arc<dyn SourceOrchestrator>) {
        let _ = self.realtime.set(orchestrator);
    }

    fn orchestrator_for(&self, kind: &str) -> (SourceKind, Option<Arc<dyn SourceOrchestrator>>) {
        if self.plugins.is_realtime(kind) {
            (SourceKind::Realtime, self.realtime.get().cloned())
        } else {
            (SourceKind::Poller, self.poller.get().cloned())
        }
    }

    /// Subscribe `subscriber_id` to `topic`. On an empty→one transition,
    /// starts the appropriate source. If cached state already exists, it is
    /// delivered immediately as a `full` event (through any registered
    /// filter) without waiting for a new upstream fetch (§4.3, scenario 1).
    pub async fn subscribe(&self, subscriber_id: SubscriberId, topic: &str) -> Result<(), hub_common::Error> {
        let parsed = Topic::parse(topic)?;
        let prefix = parsed.prefix().to_owned();

        let (became_first, cached, source_kind) = {
            let mut subs = self.subscriptions.write();
            let sub = subs.entry(topic.to_owned()).or_default();
            let became_first = sub.subscribers.is_empty();
            sub.subscribers.insert(subscriber_id);
            (became_first, sub.cached_payload.clone(), sub.source)
        };

        self.connections.add_topic(subscriber_id, topic);

        if became_first && source_kind == SourceKind::None {
            let (kind, orchestrator) = self.orchestrator_for(&prefix);
            {
                let mut subs = self.subscriptions.write();
                if let Some(sub) = subs.get_mut(topic) {
                    sub.source = kind;
                }
            }
            if let Some(orchestrator) = orchestrator {
                orchestrator.start(topic).await;
            }
        }

        if let Some(payload) = cached {
            self.transport
                .deliver_initial(subscriber_id, topic, &prefix, &payload)
                .await;
        }

        Ok(())
    }

    /// Unsubscribe `subscriber_id` from `topic`. On a one→empty transition,
    /// stops the bound source (§4.3, §4.5, §4.6).
    pub async fn unsubscribe(&self, subscriber_id: SubscriberId, topic: &str) {
        let (became_empty, kind_before_reset) = {
            let mut subs = self.subscriptions.write();
            let Some(sub) = subs.get_mut(topic) else { return };
            sub.subscribers.remove(&subscriber_id);
            let became_empty = sub.subscribers.is_empty();
            let kind_before_reset = sub.source;
            if became_empty {
                sub.source = SourceKind::None;
            }
            (became_empty, kind_before_reset)
        };

        self.connections.remove_topic(subscriber_id, topic);
        self.transport.evict_filtered_cache(subscriber_id, topic);

        if became_empty {
            let orchestrator = match kind_before_reset {
                SourceKind::Poller => self.poller.get().cloned(),
                SourceKind::Realtime => self.realtime.get().cloned(),
                SourceKind::None => None,
            };
            if let Some(orchestrator) = orchestrator {
                orchestrator.stop(topic).await;
            }
        }
    }

    /// Broadcast a new payload for `topic`, delegating envelope computation
    /// and delivery to the Transport (C4). The shared cache is replaced
    /// before delivery begins, satisfying the atomic-cache-swap ordering
    /// guarantee in §5.
    pub async fn broadcast(&self, topic: &str, payload: Value, force_full: bool) {
        let prefix = Topic::parse(topic)
            .map(|t| t.prefix().to_owned())
            .unwrap_or_default();

        let (subscribers, previous) = {
            let mut subs = self.subscriptions.write();
            let sub = subs.entry(topic.to_owned()).or_default();
            let previous = sub.cached_payload.clone();
            sub.cached_payload = Some(payload.clone());
            sub.last_updated = now_sec();
            (sub.subscribers.clone(), previous)
        };

        self.transport
            .broadcast(topic, &prefix, &subscribers, previous.as_ref(), &payload, force_full)
            .await;
    }

    /// Number of subscribers currently on a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscriptions
            .read()
            .get(topic)
            .map(|s| s.subscribers.len())
            .unwrap_or(0)
    }

    /// Whether a topic currently has any subscribers.
    pub fn has_subscribers(&self, topic: &str) -> bool {
        self.subscriber_count(topic) > 0
    }

    /// Every topic the registry currently has bookkeeping for (including
    /// topics idle during a realtime grace window with zero subscribers).
    pub fn active_topics(&self) -> Vec<String> {
        self.subscriptions.read().keys().cloned().collect()
    }
}

/// Drops the stale subscriber id from every topic in a grace-expired
/// snapshot, invoking last-leave for any topic that drops to zero (§4.2).
#[async_trait]
impl GraceObserver for SubscriptionRegistry {
    async fn on_grace_expired(&self, id: SubscriberId, topics: Vec<String>) {
        for topic in topics {
            self.unsubscribe(id, &topic).await;
        }
    }

    async fn on_restore(&self, old_id: SubscriberId, new_id: SubscriberId, topics: &[String]) {
        let mut subs = self.subscriptions.write();
        for topic in topics {
            if let Some(sub) = subs.get_mut(topic) {
                sub.subscribers.remove(&old_id);
                sub.subscribers.insert(new_id);
            }
        }
        drop(subs);
        for topic in topics {
            self.transport.evict_filtered_cache(old_id, topic);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_common::Sink;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullSink;
    #[async_trait]
    impl Sink for NullSink {
        async fn write(&self, _: &str, _: Value) -> hub_common::model::SinkResult {
            Ok(())
        }
    }

    struct CountingOrchestrator {
        starts: Arc<AtomicUsize>,
        stops: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SourceOrchestrator for CountingOrchestrator {
        async fn start(self: Arc<Self>, _: &str) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }
        async fn stop(self: Arc<Self>, _: &str) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn new_registry() -> (Arc<SubscriptionRegistry>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let connections = ConnectionManager::new();
        let transport = Transport::new(connections.clone());
        let plugins = Arc::new(PluginRegistry::new());
        let registry = SubscriptionRegistry::new(connections, transport, plugins);
        let starts = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));
        registry.bind_poller(Arc::new(CountingOrchestrator {
            starts: starts.clone(),
            stops: stops.clone(),
        }));
        (registry, starts, stops)
    }

    #[tokio::test]
    async fn first_subscribe_starts_source() {
        let (registry, starts, _stops) = new_registry();
        let id = SubscriberId::new_v4();
        registry.subscribe(id, "qbittorrent:abc").await.unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(registry.subscriber_count("qbittorrent:abc"), 1);
    }

    #[tokio::test]
    async fn second_subscribe_does_not_restart_source() {
        let (registry, starts, _stops) = new_registry();
        let a = SubscriberId::new_v4();
        let b = SubscriberId::new_v4();
        registry.subscribe(a, "qbittorrent:abc").await.unwrap();
        registry.subscribe(b, "qbittorrent:abc").await.unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(registry.subscriber_count("qbittorrent:abc"), 2);
    }

    #[tokio::test]
    async fn last_unsubscribe_stops_source() {
        let (registry, _starts, stops) = new_registry();
        let id = SubscriberId::new_v4();
        registry.subscribe(id, "qbittorrent:abc").await.unwrap();
        registry.unsubscribe(id, "qbittorrent:abc").await;
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert_eq!(registry.subscriber_count("qbittorrent:abc"), 0);
    }

    #[tokio::test]
    async fn new_subscriber_receives_cached_payload_without_new_poll() {
        let (registry, starts, _stops) = new_registry();
        let connections = ConnectionManager::new();
        let _ = connections; // separate manager unused; registry owns its own
        let a = SubscriberId::new_v4();
        registry.subscribe(a, "qbittorrent:abc").await.unwrap();
        registry
            .broadcast("qbittorrent:abc", json!({"torrents": []}), false)
            .await;

        let b = SubscriberId::new_v4();
        registry.subscribe(b, "qbittorrent:abc").await.unwrap();
        // Starting only once even though a second subscriber joined confirms
        // no extra upstream poll was triggered by the cache delivery.
        assert_eq!(starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn grace_restoration_swaps_id_without_double_counting() {
        use std::time::Duration;

        let connections = ConnectionManager::with_grace_period(Duration::from_millis(200));
        let transport = Transport::new(connections.clone());
        let plugins = Arc::new(PluginRegistry::new());
        let registry = SubscriptionRegistry::new(connections.clone(), transport, plugins);
        let starts = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));
        registry.bind_poller(Arc::new(CountingOrchestrator {
            starts: starts.clone(),
            stops: stops.clone(),
        }));
        connections.bind_grace_observer(registry.clone());

        let (old_id, _) = connections.attach("alice", Arc::new(NullSink)).await;
        registry.subscribe(old_id, "qbittorrent:abc").await.unwrap();
        assert_eq!(registry.subscriber_count("qbittorrent:abc"), 1);

        connections.detach(old_id);
        let (new_id, restored) = connections.attach("alice", Arc::new(NullSink)).await;
        assert_eq!(restored, vec!["qbittorrent:abc".to_string()]);

        // I2: the set still has exactly one member, and it's the new id, not
        // both — restoration swaps, it never grows the set.
        assert_eq!(registry.subscriber_count("qbittorrent:abc"), 1);
        assert_eq!(stops.load(Ordering::SeqCst), 0, "restoration must not stop the source");
        assert_eq!(starts.load(Ordering::SeqCst), 1, "restoration must not re-fire first-join");

        registry.unsubscribe(new_id, "qbittorrent:abc").await;
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        registry.unsubscribe(old_id, "qbittorrent:abc").await;
        assert_eq!(stops.load(Ordering::SeqCst), 1, "stale old id must already be gone, not re-stop the source");
    }
}
