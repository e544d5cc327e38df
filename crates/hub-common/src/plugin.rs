//! Plugin contract (§4.1, §6): the capability bundle each integration type
//! registers with the core. Adapters, pollers and realtime managers are the
//! seams where integration-specific code plugs in; the core only ever calls
//! through these traits.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Error;
use crate::model::IntegrationInstance;

/// The instance view handed to a plugin's poller/adapter calls.
#[derive(Debug, Clone)]
pub struct PluginInstance {
    /// Storage id of the instance.
    pub id: String,
    /// Opaque, type-specific configuration.
    pub config: Value,
}

impl From<&IntegrationInstance> for PluginInstance {
    fn from(instance: &IntegrationInstance) -> Self {
        PluginInstance {
            id: instance.id.clone(),
            config: instance.config.clone(),
        }
    }
}

/// Declares one numeric field a plugin can surface for the Metric History
/// Recorder (§4.7), and optionally how to probe an upstream for its own
/// history endpoint.
#[derive(Debug, Clone)]
pub struct MetricDefinition {
    /// Field name read out of the plugin's poll payload.
    pub key: String,
    /// Whether this metric should be recorded at all.
    pub recordable: bool,
    /// External history endpoint, if the upstream exposes one.
    pub history_probe: Option<HistoryProbe>,
}

/// Path and fixed parameters used to probe/query an upstream's own history
/// endpoint (§4.7).
#[derive(Debug, Clone)]
pub struct HistoryProbe {
    /// Path passed to the plugin adapter.
    pub path: String,
    /// Fixed query parameters merged with the caller's range.
    pub params: HashMap<String, String>,
}

/// Capability to perform authenticated HTTP against one integration instance
/// (§4.1, §6). Every call is suspending and must honor `timeout` (§5).
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Perform a GET request.
    async fn get(
        &self,
        instance: &PluginInstance,
        path: &str,
        timeout: Duration,
    ) -> Result<Value, Error>;

    /// Perform a POST request.
    async fn post(
        &self,
        instance: &PluginInstance,
        path: &str,
        body: Value,
        timeout: Duration,
    ) -> Result<Value, Error>;

    /// Perform an arbitrary-method request.
    async fn request(
        &self,
        instance: &PluginInstance,
        method: &str,
        path: &str,
        body: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, Error>;
}

/// Default adapter timeout (§5).
pub const DEFAULT_ADAPTER_TIMEOUT: Duration = Duration::from_secs(10);

/// A single poll attempt. Returns `Ok(None)` when the upstream legitimately
/// has nothing new; the orchestrator treats that as `"Poll returned no data"`
/// (§4.5).
#[async_trait]
pub trait Poller: Send + Sync {
    /// Base poll interval for this poller, absent a subtype/instance override.
    fn interval(&self) -> Duration;

    /// Execute one poll for the given instance.
    async fn poll(
        &self,
        instance: &PluginInstance,
        adapter: &dyn Adapter,
    ) -> Result<Option<Value>, Error>;
}

/// A persistent push connection to one integration instance (§4.6, §6).
#[async_trait]
pub trait RealtimeManager: Send + Sync {
    /// Establish the connection. The manager is expected to invoke the
    /// `onUpdate` callback it was constructed with on every server push, and
    /// to report disconnects/errors through the orchestrator's channel
    /// rather than this call's return value.
    async fn connect(&self) -> Result<(), Error>;

    /// Tear down the connection.
    async fn disconnect(&self);

    /// Whether the manager currently believes it is connected.
    fn is_connected(&self) -> bool;
}

/// Per-subtype poller override (§4.5).
pub struct SubtypePoller {
    /// Poll interval for this subtype.
    pub interval: Duration,
    /// The poller implementation.
    pub poller: Arc<dyn Poller>,
}

/// Factory for a `RealtimeManager` bound to one instance, given the update
/// callback the orchestrator wants invoked on every push (§4.1, §6).
pub type RealtimeFactory = Arc<
    dyn Fn(PluginInstance, Arc<dyn Fn(Value) + Send + Sync>) -> Arc<dyn RealtimeManager>
        + Send
        + Sync,
>;

/// Everything the Plugin Registry (C1) holds for one integration type.
pub struct Plugin {
    /// Integration type id, e.g. `"sonarr"`.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Broad category, e.g. `"media-management"`.
    pub category: String,
    /// Declared recordable metrics, if this is a system-status style plugin.
    pub metrics: Vec<MetricDefinition>,
    /// Capability to perform authenticated HTTP.
    pub adapter: Arc<dyn Adapter>,
    /// Main poller, used absent a subtype override.
    pub poller: Option<Arc<dyn Poller>>,
    /// Subtype-specific pollers, e.g. `"queue"` polling faster than the main type.
    pub subtype_pollers: HashMap<String, SubtypePoller>,
    /// Realtime manager factory, for push-capable integrations.
    pub realtime: Option<RealtimeFactory>,
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("category", &self.category)
            .field("metrics", &self.metrics.len())
            .field("has_poller", &self.poller.is_some())
            .field("subtype_pollers", &self.subtype_pollers.keys().collect::<Vec<_>>())
            .field("has_realtime", &self.realtime.is_some())
            .finish()
    }
}

impl Plugin {
    /// Whether this plugin declares any recordable metric, i.e. whether it
    /// is a system-status style integration eligible for the SSE tap (§4.7).
    pub fn is_recordable(&self) -> bool {
        self.metrics.iter().any(|m| m.recordable)
    }
}
