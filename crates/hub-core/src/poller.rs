//! Poller Orchestrator (C5, §4.5).
//!
//! One independent task per active topic. State (consecutive errors,
//! current interval, fast-retry flag) is mirrored into a shared map so
//! `health()`/`trigger()` can observe and act on it without reaching into
//! the task itself; the task is the only writer of its own topic's entry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hub_common::clock::now_sec;
use hub_common::error::classify_upstream_error;
use hub_common::model::{
    backoff_interval, HealthStatus, FAST_RETRY_ATTEMPTS, FAST_RETRY_INTERVAL, GLOBAL_DEFAULT_INTERVAL,
};
use hub_common::plugin::{Plugin, PluginInstance, Poller};
use hub_common::storage::IntegrationInstances;
use hub_common::topic::Topic;
use hub_common::Error;
use parking_lot::RwLock;
use serde_json::{json, Value};

use crate::plugin_registry::PluginRegistry;
use crate::subscription::{SourceOrchestrator, SubscriptionRegistry};
use crate::transport::array_sentinel;

/// Built-in per-type/subtype default poll intervals (§4.5), consulted after
/// any plugin-declared interval and before the global default.
fn builtin_default_interval(kind: &str, subtype: Option<&str>) -> Option<Duration> {
    match (kind, subtype) {
        ("qbittorrent", _) => Some(Duration::from_secs(5)),
        ("glances", _) | ("customsystemstatus", _) => Some(Duration::from_secs(2)),
        ("sonarr", Some("queue")) | ("radarr", Some("queue")) => Some(Duration::from_secs(3)),
        ("sonarr", Some("calendar")) | ("radarr", Some("calendar")) => Some(Duration::from_secs(300)),
        ("sonarr", Some("missing")) | ("radarr", Some("missing")) => Some(Duration::from_secs(60)),
        ("sonarr", _) | ("radarr", _) => Some(Duration::from_secs(5)),
        ("overseerr", _) => Some(Duration::from_secs(60)),
        ("plex", _) => Some(Duration::from_secs(30)),
        ("monitor", _) => Some(Duration::from_secs(10)),
        _ => None,
    }
}

/// Seam to the Metric History Recorder (C7), bound after construction so C5
/// never needs C7's concrete type. Mirrors the `GraceObserver` pattern used
/// between C2 and C3.
pub trait MetricTap: Send + Sync {
    /// A poll (or realtime push) succeeded; hand the raw payload through.
    fn on_sse_data(&self, integration_id: &str, type_id: &str, payload: &Value);
    /// The topic gained its own SSE-equivalent source (poller running).
    fn on_sse_active(&self, integration_id: &str);
    /// The topic lost its source; C7 flushes the buffered samples for this
    /// instance and arms its own background poller. Takes `Arc<Self>` since
    /// arming the background timer needs to clone itself into a spawned task.
    fn on_sse_idle(self: Arc<Self>, integration_id: &str, type_id: &str);
}

#[derive(Debug, Clone)]
struct PollerState {
    consecutive_errors: u32,
    last_error: Option<String>,
    last_success: Option<i64>,
    current_interval: Duration,
    base_interval: Duration,
    fast_retry_mode: bool,
}

impl PollerState {
    fn new(base_interval: Duration) -> Self {
        Self {
            consecutive_errors: 0,
            last_error: None,
            last_success: None,
            current_interval: base_interval,
            base_interval,
            fast_retry_mode: false,
        }
    }
}

/// One entry of `PollerOrchestrator::health()`.
#[derive(Debug, Clone)]
pub struct PollerHealth {
    /// Topic string.
    pub topic: String,
    /// Coarse status derived from consecutive error count.
    pub status: HealthStatus,
    /// Unix seconds of the last successful poll, if any.
    pub last_success: Option<i64>,
    /// Current consecutive failure count.
    pub consecutive_errors: u32,
    /// Most recent error message, if any.
    pub last_error: Option<String>,
    /// Currently scheduled interval.
    pub current_interval: Duration,
}

/// Runs one independent poll loop per active topic (§4.5).
pub struct PollerOrchestrator {
    plugins: Arc<PluginRegistry>,
    instances: Arc<dyn IntegrationInstances>,
    subscriptions: std::sync::OnceLock<Arc<SubscriptionRegistry>>,
    metric_tap: std::sync::OnceLock<Arc<dyn MetricTap>>,
    interval_overrides: RwLock<HashMap<(String, Option<String>), Duration>>,
    states: RwLock<HashMap<String, PollerState>>,
    tasks: RwLock<HashMap<String, tokio::task::JoinHandle<()>>>,
}

impl PollerOrchestrator {
    /// Construct an orchestrator. `bind_subscriptions` must be called before
    /// any topic starts, since broadcasting requires it.
    pub fn new(plugins: Arc<PluginRegistry>, instances: Arc<dyn IntegrationInstances>) -> Arc<Self> {
        Arc::new(Self {
            plugins,
            instances,
            subscriptions: std::sync::OnceLock::new(),
            metric_tap: std::sync::OnceLock::new(),
            interval_overrides: RwLock::new(HashMap::new()),
            states: RwLock::new(HashMap::new()),
            tasks: RwLock::new(HashMap::new()),
        })
    }

    /// Bind the Subscription Registry used to broadcast poll results.
    pub fn bind_subscriptions(&self, subscriptions: Arc<SubscriptionRegistry>) {
        let _ = self.subscriptions.set(subscriptions);
    }

    /// Bind the Metric History Recorder tap (§4.7).
    pub fn bind_metric_tap(&self, tap: Arc<dyn MetricTap>) {
        let _ = self.metric_tap.set(tap);
    }

    /// Install a runtime override for a `(type, subtype)` pair's base
    /// interval, taking priority over every other resolution layer (§4.5 (a)).
    pub fn set_interval_override(&self, kind: impl Into<String>, subtype: Option<String>, interval: Duration) {
        self.interval_overrides.write().insert((kind.into(), subtype), interval);
    }

    fn resolve_base_interval(&self, topic: &Topic, plugin: Option<&Plugin>) -> Duration {
        if let Some(d) = self
            .interval_overrides
            .read()
            .get(&(topic.kind.clone(), topic.subtype.clone()))
        {
            return *d;
        }
        if let Some(plugin) = plugin {
            if let Some(subtype) = &topic.subtype {
                if let Some(sp) = plugin.subtype_pollers.get(subtype) {
                    return sp.interval;
                }
            }
            if let Some(poller) = &plugin.poller {
                return poller.interval();
            }
        }
        if let Some(d) = builtin_default_interval(&topic.kind, topic.subtype.as_deref()) {
            return d;
        }
        GLOBAL_DEFAULT_INTERVAL
    }

    fn resolve_poller(&self, topic: &Topic, plugin: &Plugin) -> Result<Arc<dyn Poller>, Error> {
        if let Some(subtype) = &topic.subtype {
            if let Some(sp) = plugin.subtype_pollers.get(subtype) {
                return Ok(sp.poller.clone());
            }
        }
        plugin
            .poller
            .clone()
            .ok_or_else(|| Error::TransientUpstream("No poller available".to_owned()))
    }

    async fn fetch_instance(&self, topic: &Topic) -> Result<hub_common::model::IntegrationInstance, Error> {
        match &topic.instance {
            Some(id) => self
                .instances
                .get_by_id(id)
                .await?
                .ok_or_else(|| Error::InstanceMissing(id.clone())),
            None => self
                .instances
                .first_enabled_by_type(&topic.kind)
                .await?
                .ok_or_else(|| Error::InstanceMissing(topic.kind.clone())),
        }
    }

    async fn poll_once(&self, topic: &Topic) -> Result<Option<Value>, Error> {
        let plugin = self
            .plugins
            .get(&topic.kind)
            .ok_or_else(|| Error::UnknownPluginType(topic.kind.clone()))?;
        let instance = self.fetch_instance(topic).await?;
        let plugin_instance = PluginInstance::from(&instance);
        let poller = self.resolve_poller(topic, &plugin)?;
        poller.poll(&plugin_instance, plugin.adapter.as_ref()).await
    }

    /// Normalize a raw error into one of the three classified kinds the
    /// orchestrator branches on, always re-running substring classification
    /// on message-bearing variants (§4.5, §7).
    fn classify(error: Error) -> Error {
        match error {
            Error::ConfigError(_) | Error::AuthError(_) => error,
            Error::TransientUpstream(m) => classify_upstream_error(m),
            Error::InstanceMissing(m) => Error::TransientUpstream(format!("Instance missing: {m}")),
            Error::UnknownPluginType(m) => {
                Error::TransientUpstream(format!("No poller registered for type {m}"))
            }
            other => Error::TransientUpstream(other.to_string()),
        }
    }

    async fn broadcast(&self, topic: &str, payload: Value, force_full: bool) {
        if let Some(subs) = self.subscriptions.get() {
            subs.broadcast(topic, payload, force_full).await;
        }
    }

    /// Run one poll, update shared state, and broadcast success/error
    /// envelopes. Returns `true` if the result was a short-circuit
    /// (ConfigError/AuthError) that should end the periodic loop.
    async fn poll_and_handle(&self, topic: &Topic) -> bool {
        let topic_str = topic.as_str().to_owned();
        let result = self.poll_once(topic).await;
        let was_recovering = self
            .states
            .read()
            .get(&topic_str)
            .map(|s| s.consecutive_errors > 0)
            .unwrap_or(false);

        match result {
            Ok(payload) => {
                let payload = payload.unwrap_or(Value::Null);
                let is_null = payload.is_null();
                if is_null {
                    return self.handle_error(topic, &topic_str, was_recovering, Error::TransientUpstream("Poll returned no data".to_owned())).await;
                }
                let base_interval = {
                    let mut states = self.states.write();
                    let state = states
                        .entry(topic_str.clone())
                        .or_insert_with(|| PollerState::new(self.resolve_base_interval(topic, self.plugins.get(&topic.kind).as_deref())));
                    state.consecutive_errors = 0;
                    state.fast_retry_mode = false;
                    state.current_interval = state.base_interval;
                    state.last_success = Some(now_sec());
                    state.last_error = None;
                    state.base_interval
                };
                let _ = base_interval;

                if was_recovering {
                    tracing::info!(topic = %topic_str, "poller recovered");
                }

                let wrapped = array_sentinel(payload);
                let merged = merge_meta(
                    wrapped,
                    json!({ "healthy": true, "lastPoll": now_sec(), "errorCount": 0 }),
                );
                self.broadcast(&topic_str, merged.clone(), false).await;

                if let Some(tap) = self.metric_tap.get() {
                    if let Some(instance_id) = &topic.instance {
                        tap.on_sse_data(instance_id, &topic.kind, &merged);
                    }
                }
                false
            }
            Err(e) => self.handle_error(topic, &topic_str, was_recovering, e).await,
        }
    }

    async fn handle_error(&self, topic: &Topic, topic_str: &str, _was_recovering: bool, error: Error) -> bool {
        let classified = Self::classify(error);
        match classified {
            Error::ConfigError(msg) => {
                self.broadcast(
                    topic_str,
                    json!({
                        "_error": true, "_message": msg, "_configError": true,
                        "_meta": {"healthy": false, "errorCount": 1, "lastError": msg},
                    }),
                    true,
                )
                .await;
                true
            }
            Error::AuthError(msg) => {
                self.broadcast(
                    topic_str,
                    json!({
                        "_error": true, "_message": msg, "_authError": true,
                        "_meta": {"healthy": false, "errorCount": 1, "lastError": msg},
                    }),
                    true,
                )
                .await;
                true
            }
            Error::TransientUpstream(msg) => {
                let (errors, interval, should_broadcast) = {
                    let mut states = self.states.write();
                    let state = states
                        .entry(topic_str.to_owned())
                        .or_insert_with(|| PollerState::new(self.resolve_base_interval(topic, self.plugins.get(&topic.kind).as_deref())));
                    state.consecutive_errors += 1;
                    state.last_error = Some(msg.clone());
                    let errors = state.consecutive_errors;
                    let interval = if errors < FAST_RETRY_ATTEMPTS {
                        state.fast_retry_mode = true;
                        FAST_RETRY_INTERVAL
                    } else {
                        state.fast_retry_mode = false;
                        backoff_interval(errors)
                    };
                    state.current_interval = interval;
                    (errors, interval, errors >= FAST_RETRY_ATTEMPTS)
                };
                if should_broadcast {
                    self.broadcast(
                        topic_str,
                        json!({
                            "_error": true, "_message": msg,
                            "_meta": {"healthy": false, "errorCount": errors, "lastError": msg},
                        }),
                        true,
                    )
                    .await;
                }
                let _ = interval;
                false
            }
            other => {
                tracing::warn!(topic = %topic_str, error = %other, "unclassified poll error");
                false
            }
        }
    }

    async fn current_interval(&self, topic_str: &str) -> Duration {
        self.states
            .read()
            .get(topic_str)
            .map(|s| s.current_interval)
            .unwrap_or(GLOBAL_DEFAULT_INTERVAL)
    }

    /// Run a single on-demand poll and broadcast if there are subscribers
    /// (§4.5 `trigger`). If the topic's periodic task had ended (short
    /// circuit) and this poll succeeds, the periodic loop resumes.
    pub async fn trigger(self: &Arc<Self>, topic_str: &str) {
        let Ok(topic) = Topic::parse(topic_str) else { return };
        let has_subscribers = self
            .subscriptions
            .get()
            .map(|s| s.has_subscribers(topic_str))
            .unwrap_or(false);
        if !has_subscribers {
            return;
        }
        let short_circuited = self.poll_and_handle(&topic).await;
        if !short_circuited && !self.tasks.read().contains_key(topic_str) {
            self.spawn_loop(topic_str.to_owned());
        }
    }

    /// Diagnostics snapshot (§4.5 `health`).
    pub fn health(&self) -> Vec<PollerHealth> {
        self.states
            .read()
            .iter()
            .map(|(topic, s)| PollerHealth {
                topic: topic.clone(),
                status: HealthStatus::from_errors(s.consecutive_errors),
                last_success: s.last_success,
                consecutive_errors: s.consecutive_errors,
                last_error: s.last_error.clone(),
                current_interval: s.current_interval,
            })
            .collect()
    }

    /// Stop every running topic loop (§5 "Graceful shutdown").
    pub async fn shutdown(self: &Arc<Self>) {
        let topics: Vec<String> = self.tasks.read().keys().cloned().collect();
        for topic in topics {
            self.clone().stop(&topic).await;
        }
    }

    fn spawn_loop(self: &Arc<Self>, topic_str: String) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let Ok(topic) = Topic::parse(&topic_str) else { return };
            loop {
                let short_circuited = this.poll_and_handle(&topic).await;
                if short_circuited {
                    this.tasks.write().remove(&topic_str);
                    return;
                }
                let interval = this.current_interval(&topic_str).await;
                tokio::time::sleep(interval).await;
            }
        });
        self.tasks.write().insert(topic_str, handle);
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
impl SourceOrchestrator for PollerOrchestrator {
    async fn start(self: Arc<Self>, topic_str: &str) {
        if self.tasks.read().contains_key(topic_str) {
            return;
        }
        let Ok(topic) = Topic::parse(topic_str) else { return };
        let plugin = self.plugins.get(&topic.kind);
        let base_interval = self.resolve_base_interval(&topic, plugin.as_deref());
        self.states
            .write()
            .insert(topic_str.to_owned(), PollerState::new(base_interval));

        if let (Some(tap), Some(plugin), Some(instance_id)) =
            (self.metric_tap.get(), plugin.as_ref(), &topic.instance)
        {
            if plugin.is_recordable() {
                tap.on_sse_active(instance_id);
            }
        }

        self.spawn_loop(topic_str.to_owned());
    }

    async fn stop(self: Arc<Self>, topic_str: &str) {
        if let Some(handle) = self.tasks.write().remove(topic_str) {
            handle.abort();
        }
        self.states.write().remove(topic_str);
        if let (Some(tap), Ok(topic)) = (self.metric_tap.get(), Topic::parse(topic_str)) {
            if let Some(instance_id) = &topic.instance {
                tap.clone().on_sse_idle(instance_id, &topic.kind);
            }
        }
    }
}
