//! The topic-multiplexed streaming engine (§2): C1 Plugin Registry through
//! C8 Scheduler, wired together behind one `Hub` handle.
//!
//! Each component only depends on the ones beneath it in the control-flow
//! diagram (§2) through a narrow trait seam (`SourceOrchestrator`,
//! `GraceObserver`, `MetricTap`) bound once at boot via `OnceLock`, never
//! reached into directly. `Hub::new` performs that wiring; nothing here is
//! lazily initialized on first request (§9 "Global state").

pub mod connection;
pub mod metric_history;
pub mod plugin_registry;
pub mod poller;
pub mod realtime;
pub mod scheduler;
pub mod subscription;
pub mod transport;

use std::sync::Arc;

use hub_common::storage::{IntegrationInstances, MetricHistory, MetricHistorySources, SystemConfig};

pub use connection::{ConnectionManager, GraceObserver, SubscriberId};
pub use metric_history::{HistoryResult, MetricHistoryRecorder};
pub use plugin_registry::PluginRegistry;
pub use poller::{MetricTap, PollerHealth, PollerOrchestrator};
pub use realtime::{RealtimeHealth, RealtimeOrchestrator};
pub use scheduler::Scheduler;
pub use subscription::{SourceOrchestrator, SubscriptionRegistry};
pub use transport::{Envelope, TopicFilter, Transport};

/// Storage collaborators the core reads/writes through (§6). The host
/// application supplies concrete implementations; construction of `Hub`
/// borrows nothing else from storage.
pub struct HubStorage {
    /// Integration instance directory.
    pub instances: Arc<dyn IntegrationInstances>,
    /// Tiered metric-sample store.
    pub metric_history: Arc<dyn MetricHistory>,
    /// Per-metric source-of-truth tracking.
    pub metric_sources: Arc<dyn MetricHistorySources>,
    /// System-wide configuration, including history defaults.
    pub system_config: Arc<dyn SystemConfig>,
}

/// Cron schedules the host registers against the Scheduler at boot (§4.8,
/// §4.7 "Aggregation"/"Probing"). Standard `tokio-cron-scheduler` six-field
/// expressions (seconds first).
pub struct HubSchedule {
    /// Hourly compaction + retention sweep.
    pub aggregation_cron: String,
    /// Six-hour metric-source re-probe.
    pub reprobe_cron: String,
}

impl Default for HubSchedule {
    fn default() -> Self {
        Self {
            aggregation_cron: "0 0 * * * *".to_owned(),
            reprobe_cron: "0 0 */6 * * *".to_owned(),
        }
    }
}

pub(crate) const REPROBE_JOB_ID: &str = "metric-history-reprobe";
/// Hour-aligned, registered by `MetricHistoryRecorder::disable` in place of
/// the re-probe cron so stored data keeps aging out while recording is off.
pub(crate) const RETENTION_ONLY_JOB_ID: &str = "metric-history-retention-only";
pub(crate) const RETENTION_ONLY_CRON: &str = "0 0 * * * *";

/// The fully-wired core: every component named in §2, reachable from one
/// handle. Construct with `Hub::new`, register plugins through
/// `plugins_mut`/`register_plugin` before calling `start`, then call `start`
/// once at boot.
pub struct Hub {
    /// C1.
    pub plugins: Arc<PluginRegistry>,
    /// Integration instance directory, kept alongside the components that
    /// borrowed a clone of it so scheduled jobs (re-probe) can enumerate
    /// instances without reaching into C5/C6's private fields.
    pub instances: Arc<dyn IntegrationInstances>,
    /// C2.
    pub connections: Arc<ConnectionManager>,
    /// C4.
    pub transport: Arc<Transport>,
    /// C3.
    pub subscriptions: Arc<SubscriptionRegistry>,
    /// C5.
    pub poller: Arc<PollerOrchestrator>,
    /// C6.
    pub realtime: Arc<RealtimeOrchestrator>,
    /// C7.
    pub metric_history: Arc<MetricHistoryRecorder>,
    /// C8.
    pub scheduler: Arc<Scheduler>,
    schedule: HubSchedule,
}

impl Hub {
    /// Wire every component together. `plugins` must be fully registered
    /// before this call — the registry is immutable after init (§4.1,
    /// §9 "Global state").
    pub fn new(plugins: PluginRegistry, storage: HubStorage, schedule: HubSchedule) -> Arc<Self> {
        let plugins = Arc::new(plugins);
        let connections = ConnectionManager::new();
        let transport = Transport::new(connections.clone());
        let subscriptions = SubscriptionRegistry::new(connections.clone(), transport.clone(), plugins.clone());
        let poller = PollerOrchestrator::new(plugins.clone(), storage.instances.clone());
        let realtime = RealtimeOrchestrator::new(plugins.clone(), storage.instances.clone(), poller.clone());
        let scheduler = Scheduler::new();
        let metric_history = MetricHistoryRecorder::new(
            plugins.clone(),
            storage.metric_history,
            storage.metric_sources,
            storage.system_config,
            scheduler.clone(),
        );

        connections.bind_grace_observer(subscriptions.clone());
        subscriptions.bind_poller(poller.clone() as Arc<dyn SourceOrchestrator>);
        subscriptions.bind_realtime(realtime.clone() as Arc<dyn SourceOrchestrator>);
        poller.bind_subscriptions(subscriptions.clone());
        poller.bind_metric_tap(metric_history.clone() as Arc<dyn MetricTap>);
        realtime.bind_subscriptions(subscriptions.clone());

        Arc::new(Self {
            plugins,
            instances: storage.instances,
            connections,
            transport,
            subscriptions,
            poller,
            realtime,
            metric_history,
            scheduler,
            schedule,
        })
    }

    /// Boot-time start (§9 "Global state" init phase): starts the
    /// Scheduler's tick loop, enables the Metric History Recorder, and
    /// registers the aggregation and re-probe crons.
    pub async fn start(self: &Arc<Self>) -> Result<(), hub_common::Error> {
        self.scheduler.start().await?;
        self.metric_history.enable().await;

        let history = self.metric_history.clone();
        self.scheduler
            .register_job("metric-history-aggregation", &self.schedule.aggregation_cron, move || {
                let history = history.clone();
                async move { history.aggregate().await }
            })
            .await?;

        let history = self.metric_history.clone();
        let plugins = self.plugins.clone();
        let instances = self.instances.clone();
        self.scheduler
            .register_job(REPROBE_JOB_ID, &self.schedule.reprobe_cron, move || {
                let history = history.clone();
                let plugins = plugins.clone();
                let instances = instances.clone();
                async move {
                    for plugin in plugins.all() {
                        if !plugin.is_recordable() {
                            continue;
                        }
                        let Ok(by_type) = instances.get_by_type(&plugin.id).await else { continue };
                        for instance in by_type {
                            if !instance.enabled {
                                continue;
                            }
                            history.remember_instance(instance.id.clone(), (&instance).into());
                            history.probe_integration(&instance.id, &plugin.id).await;
                        }
                    }
                }
            })
            .await?;

        Ok(())
    }

    /// Graceful shutdown (§5): stop every poller/realtime task, disconnect
    /// realtime managers, flush C7's buffers, detach subscribers, and stop
    /// the scheduler. Order matters: sources are stopped before the
    /// scheduler so no in-flight tick races a half-torn-down component.
    pub async fn shutdown(self: &Arc<Self>) -> Result<(), hub_common::Error> {
        self.poller.shutdown().await;
        self.realtime.shutdown().await;
        self.connections.detach_all();
        self.metric_history.flush().await;
        self.metric_history.disable().await;
        self.scheduler.shutdown().await?;
        Ok(())
    }
}
