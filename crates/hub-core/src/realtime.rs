//! Realtime Orchestrator (C6, §4.6).
//!
//! One state machine per realtime topic: Idle → Connecting/Connected →
//! Backoff → PollingFallback, with auto-recovery back to Connected. Unlike
//! the Poller Orchestrator's plain per-topic loop, state transitions here
//! are driven by callbacks the `RealtimeManager` invokes (`onConnect`,
//! `onDisconnect`, `onError`, `onUpdate`) rather than a fixed interval.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hub_common::clock::now_sec;
use hub_common::model::{reconnect_interval, WS_FAILURE_THRESHOLD, WS_RETRY_INTERVAL};
use hub_common::plugin::{PluginInstance, RealtimeManager};
use hub_common::storage::IntegrationInstances;
use hub_common::topic::Topic;
use parking_lot::RwLock;
use serde_json::{json, Value};

use crate::plugin_registry::PluginRegistry;
use crate::poller::PollerOrchestrator;
use crate::subscription::{SourceOrchestrator, SubscriptionRegistry};
use crate::transport::array_sentinel;

/// Which source is currently authoritative for a realtime topic (§3 `RealtimeState.mode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Websocket,
    Polling,
}

struct TopicState {
    manager: Arc<dyn RealtimeManager>,
    reconnect_attempts: u32,
    last_connected: Option<i64>,
    mode: Mode,
    instance_id: Option<String>,
    kind: String,
    backoff_timer: Option<tokio::task::JoinHandle<()>>,
    ws_retry_timer: Option<tokio::task::JoinHandle<()>>,
    idle_timer: Option<tokio::task::JoinHandle<()>>,
}

/// One entry of `RealtimeOrchestrator::health()`.
#[derive(Debug, Clone)]
pub struct RealtimeHealth {
    /// Topic string.
    pub topic: String,
    /// Integration type id.
    pub kind: String,
    /// `"connected" | "backoff" | "polling"`.
    pub status: &'static str,
    /// Consecutive reconnect attempts since the last successful connect.
    pub reconnect_attempts: u32,
    /// Unix seconds of the last successful connect, if any.
    pub last_connected: Option<i64>,
}

/// Maintains persistent upstream connections per realtime topic (§4.6).
pub struct RealtimeOrchestrator {
    plugins: Arc<PluginRegistry>,
    instances: Arc<dyn IntegrationInstances>,
    poller: Arc<PollerOrchestrator>,
    subscriptions: std::sync::OnceLock<Arc<SubscriptionRegistry>>,
    idle_timeout: Duration,
    states: Arc<RwLock<HashMap<String, TopicState>>>,
}

impl RealtimeOrchestrator {
    /// Construct an orchestrator. `poller` is used for the polling-fallback
    /// state; `bind_subscriptions` must be called before any topic starts.
    pub fn new(
        plugins: Arc<PluginRegistry>,
        instances: Arc<dyn IntegrationInstances>,
        poller: Arc<PollerOrchestrator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            plugins,
            instances,
            poller,
            subscriptions: std::sync::OnceLock::new(),
            idle_timeout: hub_common::model::IDLE_TIMEOUT,
            states: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Bind the Subscription Registry used to broadcast updates.
    pub fn bind_subscriptions(&self, subscriptions: Arc<SubscriptionRegistry>) {
        let _ = self.subscriptions.set(subscriptions);
    }

    async fn broadcast(&self, topic: &str, payload: Value, force_full: bool) {
        if let Some(subs) = self.subscriptions.get() {
            subs.broadcast(topic, payload, force_full).await;
        }
    }

    async fn fetch_instance(&self, topic: &Topic) -> Option<hub_common::model::IntegrationInstance> {
        match &topic.instance {
            Some(id) => self.instances.get_by_id(id).await.ok().flatten(),
            None => self.instances.first_enabled_by_type(&topic.kind).await.ok().flatten(),
        }
    }

    /// Called from a manager's `onUpdate` callback with the raw push
    /// payload; broadcasts forced-full with `_meta.source = "realtime"`
    /// (§4.6: "realtime sources do their own merging and dedupe would race").
    fn on_update(self: &Arc<Self>, topic: String, payload: Value) {
        let this = self.clone();
        tokio::spawn(async move {
            let wrapped = array_sentinel(payload);
            let merged = merge_meta(wrapped, json!({ "healthy": true, "source": "realtime" }));
            this.broadcast(&topic, merged, true).await;
        });
    }

    /// Called from a manager's `onConnect` callback.
    fn on_connect(self: &Arc<Self>, topic: String) {
        let this = self.clone();
        tokio::spawn(async move { this.handle_connect(topic).await });
    }

    async fn handle_connect(self: Arc<Self>, topic: String) {
        let (was_polling, was_recovery) = {
            let mut states = self.states.write();
            let Some(state) = states.get_mut(&topic) else { return };
            let was_polling = state.mode == Mode::Polling;
            // A reconnect after one or more failures (Backoff) or after
            // falling back to polling is a recovery; a reconnect_attempts
            // of 0 with no prior connection is the genuine first connect.
            let was_recovery = was_polling || state.reconnect_attempts > 0;
            state.mode = Mode::Websocket;
            state.reconnect_attempts = 0;
            state.last_connected = Some(now_sec());
            if let Some(t) = state.backoff_timer.take() {
                t.abort();
            }
            if was_polling {
                if let Some(t) = state.ws_retry_timer.take() {
                    t.abort();
                }
            }
            (was_polling, was_recovery)
        };

        if was_polling {
            self.poller.clone().stop(&topic).await;
        }

        if was_recovery {
            self.broadcast(&topic, json!({ "_meta": { "healthy": true, "recovered": true } }), true)
                .await;
        }
    }

    /// Called from a manager's `onDisconnect`/`onError` callback.
    fn on_failure(self: &Arc<Self>, topic: String, message: String) {
        let this = self.clone();
        tokio::spawn(async move { this.handle_failure(topic, message).await });
    }

    async fn handle_failure(self: Arc<Self>, topic: String, message: String) {
        let (attempts, mode) = {
            let mut states = self.states.write();
            let Some(state) = states.get_mut(&topic) else { return };
            state.reconnect_attempts += 1;
            (state.reconnect_attempts, state.mode)
        };

        if mode == Mode::Polling {
            // Errors while the poller is the active source are never
            // broadcast (§4.6 "Error broadcasting").
            return;
        }

        self.broadcast(
            &topic,
            json!({
                "_error": true,
                "_message": "Real-time connection lost, reconnecting...",
                "_meta": { "healthy": false, "reconnectAttempts": attempts },
            }),
            true,
        )
        .await;

        if attempts >= WS_FAILURE_THRESHOLD {
            self.enter_polling_fallback(topic, message).await;
            return;
        }

        let delay = reconnect_interval(attempts);
        let this = self.clone();
        let topic_for_timer = topic.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.reconnect(topic_for_timer).await;
        });
        if let Some(state) = self.states.write().get_mut(&topic) {
            if let Some(old) = state.backoff_timer.replace(timer) {
                old.abort();
            }
        }
    }

    async fn reconnect(self: Arc<Self>, topic: String) {
        let manager = self.states.read().get(&topic).map(|s| s.manager.clone());
        if let Some(manager) = manager {
            let _ = manager.connect().await;
        }
    }

    async fn enter_polling_fallback(self: Arc<Self>, topic: String, _message: String) {
        {
            let mut states = self.states.write();
            let Some(state) = states.get_mut(&topic) else { return };
            state.mode = Mode::Polling;
            if let Some(t) = state.backoff_timer.take() {
                t.abort();
            }
        }
        let manager = self.states.read().get(&topic).map(|s| s.manager.clone());
        if let Some(manager) = manager {
            manager.disconnect().await;
        }
        tracing::warn!(%topic, "realtime connection fell back to polling");
        self.poller.clone().start(&topic).await;

        let this = self.clone();
        let topic_for_timer = topic.clone();
        let timer = tokio::spawn(async move {
            loop {
                tokio::time::sleep(WS_RETRY_INTERVAL).await;
                this.reconnect(topic_for_timer.clone()).await;
            }
        });
        if let Some(state) = self.states.write().get_mut(&topic) {
            if let Some(old) = state.ws_retry_timer.replace(timer) {
                old.abort();
            }
        }
    }

    /// Find every topic bound to `instance_id` and restart their manager
    /// with fresh config (§4.6 `refreshConnection`).
    pub async fn refresh_connection(self: &Arc<Self>, instance_id: &str) {
        let topics: Vec<String> = self
            .states
            .read()
            .iter()
            .filter(|(_, s)| s.instance_id.as_deref() == Some(instance_id))
            .map(|(t, _)| t.clone())
            .collect();
        for topic in topics {
            self.clone().stop(&topic).await;
            self.clone().start(&topic).await;
        }
    }

    /// Diagnostics snapshot (§4.6 `health`).
    pub fn health(&self) -> Vec<RealtimeHealth> {
        self.states
            .read()
            .iter()
            .map(|(topic, s)| RealtimeHealth {
                topic: topic.clone(),
                kind: s.kind.clone(),
                status: match s.mode {
                    Mode::Websocket if s.reconnect_attempts == 0 => "connected",
                    Mode::Websocket => "backoff",
                    Mode::Polling => "polling",
                },
                reconnect_attempts: s.reconnect_attempts,
                last_connected: s.last_connected,
            })
            .collect()
    }
}

fn merge_meta(mut payload: Value, meta: Value) -> Value {
    if let Value::Object(map) = &mut payload {
        map.insert("_meta".to_owned(), meta);
        payload
    } else {
        json!({ "data": payload, "_meta": meta })
    }
}

#[async_trait]
impl SourceOrchestrator for RealtimeOrchestrator {
    async fn start(self: Arc<Self>, topic_str: &str) {
        // A pending idle-close timer being cancelled means we're reusing an
        // already-connected manager; don't recreate it (§4.6 "Idle hybrid").
        if let Some(state) = self.states.write().get_mut(topic_str) {
            if let Some(timer) = state.idle_timer.take() {
                timer.abort();
                return;
            }
        }

        let Ok(topic) = Topic::parse(topic_str) else { return };
        let Some(plugin) = self.plugins.get(&topic.kind) else { return };
        let Some(factory) = plugin.realtime.clone() else { return };
        let Some(instance) = self.fetch_instance(&topic).await else { return };
        let plugin_instance = PluginInstance::from(&instance);

        let this = self.clone();
        let topic_for_cb = topic_str.to_owned();
        let on_update_topic = topic_for_cb.clone();
        let on_update: Arc<dyn Fn(Value) + Send + Sync> = Arc::new(move |data| {
            this.on_update(on_update_topic.clone(), data);
        });
        let manager = (factory)(plugin_instance, on_update);

        self.states.write().insert(
            topic_str.to_owned(),
            TopicState {
                manager: manager.clone(),
                reconnect_attempts: 0,
                last_connected: None,
                mode: Mode::Websocket,
                instance_id: topic.instance.clone(),
                kind: topic.kind.clone(),
                backoff_timer: None,
                ws_retry_timer: None,
                idle_timer: None,
            },
        );

        match manager.connect().await {
            Ok(()) => self.on_connect(topic_str.to_owned()),
            Err(e) => self.on_failure(topic_str.to_owned(), e.to_string()),
        }
    }

    async fn stop(self: Arc<Self>, topic_str: &str) {
        // Last subscriber left: don't tear down immediately, arm the idle
        // window so brief tab-switch churn doesn't thrash the connection.
        let has_state = self.states.read().contains_key(topic_str);
        if !has_state {
            return;
        }
        let this = self.clone();
        let topic_owned = topic_str.to_owned();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(this.idle_timeout).await;
            this.discard(topic_owned).await;
        });
        if let Some(state) = self.states.write().get_mut(topic_str) {
            if let Some(old) = state.idle_timer.replace(timer) {
                old.abort();
            }
        }
    }
}

impl RealtimeOrchestrator {
    /// Disconnect every managed topic and tear down its state (§5 "Graceful
    /// shutdown"). Unlike `stop`, this discards immediately — no idle window.
    pub async fn shutdown(self: &Arc<Self>) {
        let topics: Vec<String> = self.states.read().keys().cloned().collect();
        for topic in topics {
            self.clone().discard(topic).await;
        }
    }

    async fn discard(self: Arc<Self>, topic: String) {
        let state = self.states.write().remove(&topic);
        let Some(state) = state else { return };
        if let Some(t) = state.backoff_timer {
            t.abort();
        }
        if let Some(t) = state.ws_retry_timer {
            t.abort();
        }
        state.manager.disconnect().await;
        if state.mode == Mode::Polling {
            self.poller.clone().stop(&topic).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionManager;
    use crate::transport::Transport;
    use hub_common::model::IntegrationInstance;
    use hub_common::Error;
    use hub_common::Sink;
    use serde_json::json as jsonmacro;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Mutex;

    struct NoopManager {
        connected: AtomicBool,
        fail: bool,
    }

    #[async_trait]
    impl RealtimeManager for NoopManager {
        async fn connect(&self) -> Result<(), Error> {
            if self.fail {
                return Err(Error::TransientUpstream("refused".to_owned()));
            }
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn disconnect(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    struct FakeInstances;
    #[async_trait]
    impl IntegrationInstances for FakeInstances {
        async fn get_by_id(&self, id: &String) -> Result<Option<IntegrationInstance>, Error> {
            Ok(Some(IntegrationInstance {
                id: id.clone(),
                kind: "plex".to_owned(),
                display_name: "Plex".to_owned(),
                enabled: true,
                config: jsonmacro!({}),
            }))
        }
        async fn get_by_type(&self, _: &str) -> Result<Vec<IntegrationInstance>, Error> {
            Ok(vec![])
        }
        async fn first_enabled_by_type(&self, kind: &str) -> Result<Option<IntegrationInstance>, Error> {
            Ok(Some(IntegrationInstance {
                id: "only".to_owned(),
                kind: kind.to_owned(),
                display_name: "Plex".to_owned(),
                enabled: true,
                config: jsonmacro!({}),
            }))
        }
    }

    fn bare_orchestrator() -> Arc<RealtimeOrchestrator> {
        let plugins = Arc::new(PluginRegistry::new());
        let instances: Arc<dyn IntegrationInstances> = Arc::new(FakeInstances);
        let poller = PollerOrchestrator::new(plugins.clone(), instances.clone());
        RealtimeOrchestrator::new(plugins, instances, poller)
    }

    #[tokio::test]
    async fn repeated_failures_trigger_polling_fallback() {
        let orchestrator = bare_orchestrator();
        let manager: Arc<dyn RealtimeManager> = Arc::new(NoopManager { connected: AtomicBool::new(false), fail: true });
        orchestrator.states.write().insert(
            "plex:xyz".to_owned(),
            TopicState {
                manager,
                reconnect_attempts: 0,
                last_connected: None,
                mode: Mode::Websocket,
                instance_id: Some("xyz".to_owned()),
                kind: "plex".to_owned(),
                backoff_timer: None,
                ws_retry_timer: None,
                idle_timer: None,
            },
        );

        for _ in 0..WS_FAILURE_THRESHOLD {
            orchestrator
                .clone()
                .handle_failure("plex:xyz".to_owned(), "refused".to_owned())
                .await;
        }

        let health = orchestrator.health();
        let entry = health.iter().find(|h| h.topic == "plex:xyz").unwrap();
        assert_eq!(entry.status, "polling");
    }

    #[tokio::test]
    async fn successful_connect_clears_reconnect_attempts() {
        let orchestrator = bare_orchestrator();
        let manager: Arc<dyn RealtimeManager> =
            Arc::new(NoopManager { connected: AtomicBool::new(false), fail: false });
        orchestrator.states.write().insert(
            "plex:xyz".to_owned(),
            TopicState {
                manager,
                reconnect_attempts: 3,
                last_connected: None,
                mode: Mode::Websocket,
                instance_id: Some("xyz".to_owned()),
                kind: "plex".to_owned(),
                backoff_timer: None,
                ws_retry_timer: None,
                idle_timer: None,
            },
        );

        orchestrator.clone().handle_connect("plex:xyz".to_owned()).await;

        let health = orchestrator.health();
        let entry = health.iter().find(|h| h.topic == "plex:xyz").unwrap();
        assert_eq!(entry.reconnect_attempts, 0);
        assert_eq!(entry.status, "connected");
    }

    struct RecordingSink {
        received: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl Sink for RecordingSink {
        async fn write(&self, event_name: &str, payload: Value) -> hub_common::model::SinkResult {
            self.received.lock().await.push((event_name.to_owned(), payload));
            Ok(())
        }
    }

    #[tokio::test]
    async fn backoff_recovery_emits_recovered_broadcast() {
        let plugins = Arc::new(PluginRegistry::new());
        let instances: Arc<dyn IntegrationInstances> = Arc::new(FakeInstances);
        let poller = PollerOrchestrator::new(plugins.clone(), instances.clone());
        let orchestrator = RealtimeOrchestrator::new(plugins.clone(), instances, poller);

        let connections = ConnectionManager::new();
        let transport = Transport::new(connections.clone());
        let subscriptions = SubscriptionRegistry::new(connections.clone(), transport, plugins);
        subscriptions.bind_realtime(orchestrator.clone());
        orchestrator.bind_subscriptions(subscriptions.clone());

        let sink = Arc::new(RecordingSink { received: Mutex::new(vec![]) });
        let (subscriber_id, _) = connections.attach("alice", sink.clone()).await;
        subscriptions.subscribe(subscriber_id, "plex:xyz").await.unwrap();

        let manager: Arc<dyn RealtimeManager> =
            Arc::new(NoopManager { connected: AtomicBool::new(false), fail: false });
        orchestrator.states.write().insert(
            "plex:xyz".to_owned(),
            TopicState {
                manager,
                // A positive reconnect_attempts simulates recovery out of
                // Backoff, as opposed to a first-ever connect.
                reconnect_attempts: 3,
                last_connected: None,
                mode: Mode::Websocket,
                instance_id: Some("xyz".to_owned()),
                kind: "plex".to_owned(),
                backoff_timer: None,
                ws_retry_timer: None,
                idle_timer: None,
            },
        );

        orchestrator.clone().handle_connect("plex:xyz".to_owned()).await;

        let received = sink.received.lock().await;
        let recovered = received.iter().any(|(_, payload)| {
            payload
                .get("_meta")
                .and_then(|m| m.get("recovered"))
                .and_then(Value::as_bool)
                == Some(true)
        });
        assert!(recovered, "expected a recovery broadcast after Backoff reconnect, got {received:?}");
    }
}
