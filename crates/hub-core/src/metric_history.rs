//! Metric History Recorder (C7, §4.7).
//!
//! Taps the poll/push pipeline opportunistically (SSE-tap when a topic has
//! subscribers, a direct background poll otherwise), buffers numeric
//! samples, and flushes/aggregates them into the tiered `MetricHistory`
//! store. A process-wide singleton by nature (§9 "Global state"): explicit
//! `enable`/`disable`, no lazy init.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use hub_common::model::{HistoryConfig, HistoryMode, InstanceId, MetricSample, Resolution, SourceKind};
use hub_common::plugin::PluginInstance;
use hub_common::storage::{MetricHistory, MetricHistorySources, SystemConfig};
use hub_common::{clock::now_sec, Error};
use parking_lot::RwLock;
use serde_json::Value;

use crate::plugin_registry::PluginRegistry;
use crate::poller::MetricTap;
use crate::scheduler::Scheduler;
use crate::{REPROBE_JOB_ID, RETENTION_ONLY_CRON, RETENTION_ONLY_JOB_ID};

const FLUSH_INTERVAL: Duration = Duration::from_secs(15);
const BACKGROUND_POLL_INTERVAL: Duration = Duration::from_secs(15);
const RAW_BUCKET_SECONDS: i64 = 15;
const RAW_COMPACTION_AGE_SECONDS: i64 = 120;
const ONE_MIN_COMPACTION_AGE_SECONDS: i64 = 600;

fn align(timestamp: i64, bucket: i64) -> i64 {
    (timestamp / bucket) * bucket
}

/// One buffered numeric reading awaiting the next flush.
#[derive(Debug, Default, Clone)]
struct Buffer {
    values: Vec<f64>,
}

/// Query result shape for `MetricHistoryRecorder::history` (§4.7).
#[derive(Debug, Clone)]
pub struct HistoryResult {
    /// Samples in the requested window, at whatever resolution was served.
    pub data: Vec<MetricSample>,
    /// Human-readable window description, e.g. `"30d"` for internal results.
    pub available_range: String,
    /// Resolution actually served.
    pub resolution: Resolution,
    /// `"internal"` or `"external"`.
    pub source: &'static str,
}

/// Opportunistic metric-sample recorder (§4.7).
pub struct MetricHistoryRecorder {
    plugins: Arc<PluginRegistry>,
    store: Arc<dyn MetricHistory>,
    sources: Arc<dyn MetricHistorySources>,
    system_config: Arc<dyn SystemConfig>,
    scheduler: Arc<Scheduler>,
    adapters: RwLock<HashMap<String, PluginInstance>>,

    enabled: std::sync::atomic::AtomicBool,
    default_config: RwLock<HistoryConfig>,
    per_integration: RwLock<HashMap<InstanceId, HistoryConfig>>,
    buffers: RwLock<HashMap<(InstanceId, String), Buffer>>,
    sse_active: RwLock<HashSet<InstanceId>>,
    background_timers: RwLock<HashMap<InstanceId, tokio::task::JoinHandle<()>>>,
    flush_timer: RwLock<Option<tokio::task::JoinHandle<()>>>,
}

impl MetricHistoryRecorder {
    /// Construct a recorder. Call `enable()` to arm timers after wiring.
    pub fn new(
        plugins: Arc<PluginRegistry>,
        store: Arc<dyn MetricHistory>,
        sources: Arc<dyn MetricHistorySources>,
        system_config: Arc<dyn SystemConfig>,
        scheduler: Arc<Scheduler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            plugins,
            store,
            sources,
            system_config,
            scheduler,
            adapters: RwLock::new(HashMap::new()),
            enabled: std::sync::atomic::AtomicBool::new(false),
            default_config: RwLock::new(HistoryConfig { mode: HistoryMode::Auto, retention_days: 30 }),
            per_integration: RwLock::new(HashMap::new()),
            buffers: RwLock::new(HashMap::new()),
            sse_active: RwLock::new(HashSet::new()),
            background_timers: RwLock::new(HashMap::new()),
            flush_timer: RwLock::new(None),
        })
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn config_for(&self, integration_id: &str) -> HistoryConfig {
        self.per_integration
            .read()
            .get(integration_id)
            .copied()
            .unwrap_or(*self.default_config.read())
    }

    /// Reload the system-wide default mode/retention from storage. Called at
    /// `enable()` and whenever the host signals the system config changed.
    pub async fn refresh_defaults(&self) -> Result<(), Error> {
        let defaults = self.system_config.get_metric_history_defaults().await?;
        *self.default_config.write() = defaults;
        Ok(())
    }

    /// Set (or override) per-integration mode/retention (driven by instance
    /// save, per §4.7's probing trigger list).
    pub fn set_integration_config(&self, integration_id: InstanceId, config: HistoryConfig) {
        self.per_integration.write().insert(integration_id, config);
    }

    /// Arms the flush timer, starts background polling for enabled
    /// system-status instances without active SSE (§4.7 `enable`). The
    /// initial aggregation/re-probe cron registration happens once at boot
    /// through `Hub::start`; `disable` is the only place this recorder
    /// reaches into C8 directly, to swap the re-probe cron for a
    /// retention-only one.
    pub async fn enable(self: &Arc<Self>) {
        self.enabled.store(true, std::sync::atomic::Ordering::SeqCst);
        if let Err(e) = self.refresh_defaults().await {
            tracing::warn!(error = %e, "failed to load metric history defaults, using built-in default");
        }
        self.arm_flush_timer();
        for plugin in self.plugins.all() {
            if !plugin.is_recordable() {
                continue;
            }
            // Background polling is armed lazily the first time a topic for
            // this type goes SSE-idle (`on_sse_idle`); at `enable()` time we
            // don't yet know which instances are enabled without a storage
            // round-trip per type, so callers drive the initial arm through
            // `arm_background(id)` after listing enabled instances.
            let _ = plugin;
        }
    }

    /// Cancels the flush timer, clears buffers, stops background timers.
    /// Existing stored data is left untouched, and the re-probe cron is
    /// swapped for an hour-aligned retention-only cron so stored data still
    /// ages out while recording is off (§4.7 `disable`).
    pub async fn disable(self: &Arc<Self>) {
        self.enabled.store(false, std::sync::atomic::Ordering::SeqCst);
        if let Some(t) = self.flush_timer.write().take() {
            t.abort();
        }
        self.buffers.write().clear();
        for (_, t) in self.background_timers.write().drain() {
            t.abort();
        }

        if let Err(e) = self.scheduler.unregister_job(REPROBE_JOB_ID).await {
            tracing::warn!(error = %e, "failed to unregister re-probe cron on disable");
        }
        let this = self.clone();
        if let Err(e) = self
            .scheduler
            .register_job(RETENTION_ONLY_JOB_ID, RETENTION_ONLY_CRON, move || {
                let this = this.clone();
                async move { this.retention_sweep().await }
            })
            .await
        {
            tracing::warn!(error = %e, "failed to register retention-only cron on disable");
        }
    }

    fn arm_flush_timer(self: &Arc<Self>) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(FLUSH_INTERVAL).await;
                this.flush().await;
            }
        });
        if let Some(old) = self.flush_timer.write().replace(handle) {
            old.abort();
        }
    }

    /// Record an adapter-capable plugin instance for later background polls
    /// of `integration_id`; must be called whenever an instance is loaded so
    /// `arm_background` can invoke the plugin's poller directly.
    pub fn remember_instance(&self, integration_id: InstanceId, instance: PluginInstance) {
        self.adapters.write().insert(integration_id, instance);
    }

    /// Arm a 15s background poll timer for `integration_id` if it is enabled
    /// and its mode isn't `off` (§4.7 "Background mode").
    pub fn arm_background(self: &Arc<Self>, integration_id: InstanceId, type_id: String) {
        if !self.is_enabled() {
            return;
        }
        if self.config_for(&integration_id).mode == HistoryMode::Off {
            return;
        }
        if self.sse_active.read().contains(&integration_id) {
            return;
        }
        let this = self.clone();
        let id = integration_id.clone();
        let kind = type_id;
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(BACKGROUND_POLL_INTERVAL).await;
                this.background_poll(&id, &kind).await;
            }
        });
        if let Some(old) = self.background_timers.write().insert(integration_id, handle) {
            old.abort();
        }
    }

    async fn background_poll(&self, integration_id: &str, type_id: &str) {
        let Some(plugin) = self.plugins.get(type_id) else { return };
        let Some(poller) = plugin.poller.clone() else { return };
        let Some(instance) = self.adapters.read().get(integration_id).cloned() else { return };
        if let Ok(Some(payload)) = poller.poll(&instance, plugin.adapter.as_ref()).await {
            self.on_sse_data(integration_id, type_id, &payload);
        }
    }

    /// Read each declared recordable metric out of `payload` and buffer
    /// finite numeric values (§4.7 "Data capture").
    fn record_payload(&self, integration_id: &str, type_id: &str, payload: &Value) {
        if !self.is_enabled() {
            return;
        }
        if self.config_for(integration_id).mode == HistoryMode::Off {
            return;
        }
        let Some(plugin) = self.plugins.get(type_id) else { return };
        for metric in &plugin.metrics {
            if !metric.recordable {
                continue;
            }
            let Some(value) = payload.get(&metric.key).and_then(Value::as_f64) else { continue };
            if !value.is_finite() {
                continue;
            }
            self.buffers
                .write()
                .entry((integration_id.to_owned(), metric.key.clone()))
                .or_default()
                .values
                .push(value);
        }
    }

    /// Drains every buffer: single-sample buckets store a raw point, multi-
    /// sample buckets store an aggregated raw row (§4.7 "Flush").
    pub async fn flush(&self) {
        let drained: Vec<((InstanceId, String), Buffer)> = {
            let mut buffers = self.buffers.write();
            buffers.drain().collect()
        };
        self.flush_entries(drained).await;
    }

    /// Drains only the buffers for `integration_id`, used when that
    /// instance's source goes SSE-idle so no buffered data is lost before
    /// background polling resumes (§4.7 "Data capture").
    async fn flush_instance(&self, integration_id: &str) {
        let drained: Vec<((InstanceId, String), Buffer)> = {
            let mut buffers = self.buffers.write();
            let keys: Vec<(InstanceId, String)> = buffers
                .keys()
                .filter(|(id, _)| id == integration_id)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|key| buffers.remove(&key).map(|buffer| (key, buffer)))
                .collect()
        };
        self.flush_entries(drained).await;
    }

    async fn flush_entries(&self, drained: Vec<((InstanceId, String), Buffer)>) {
        let timestamp = align(now_sec(), RAW_BUCKET_SECONDS);
        for ((integration_id, metric_key), buffer) in drained {
            if buffer.values.is_empty() {
                continue;
            }
            let sample = if buffer.values.len() == 1 {
                MetricSample {
                    integration_id,
                    metric_key,
                    timestamp,
                    resolution: Resolution::Raw,
                    value: Some(buffer.values[0]),
                    avg: None,
                    min: None,
                    max: None,
                    sample_count: None,
                }
            } else {
                let (avg, min, max) = stats(&buffer.values);
                MetricSample {
                    integration_id,
                    metric_key,
                    timestamp,
                    resolution: Resolution::Raw,
                    value: None,
                    avg: Some(avg),
                    min: Some(min),
                    max: Some(max),
                    sample_count: Some(buffer.values.len() as u32),
                }
            };
            if let Err(e) = self.store.insert_raw(sample).await {
                tracing::warn!(error = %e, "metric history flush failed");
            }
        }
    }

    /// Hourly compaction: raw→1min after 120s, 1min→5min after 600s, plus
    /// the retention sweep (§4.7 "Aggregation"). Intended to be invoked by
    /// the Scheduler (C8) on an hourly cron.
    pub async fn aggregate(&self) {
        let now = now_sec();
        if let Err(e) = self
            .compact(Resolution::Raw, Resolution::OneMin, now - RAW_COMPACTION_AGE_SECONDS, 60)
            .await
        {
            tracing::warn!(error = %e, "raw->1min compaction failed");
        }
        if let Err(e) = self
            .compact(Resolution::OneMin, Resolution::FiveMin, now - ONE_MIN_COMPACTION_AGE_SECONDS, 300)
            .await
        {
            tracing::warn!(error = %e, "1min->5min compaction failed");
        }
        self.retention_sweep().await;
    }

    async fn compact(
        &self,
        from: Resolution,
        to: Resolution,
        older_than: i64,
        bucket_seconds: i64,
    ) -> Result<(), Error> {
        let rows = self.store.get_raw_for_aggregation(from, older_than).await?;
        let mut grouped: HashMap<(InstanceId, String, i64), Vec<f64>> = HashMap::new();
        for row in &rows {
            let bucket = align(row.timestamp, bucket_seconds);
            let key = (row.integration_id.clone(), row.metric_key.clone(), bucket);
            let entry = grouped.entry(key).or_default();
            if let Some(v) = row.value {
                entry.push(v);
            } else if let Some(avg) = row.avg {
                entry.push(avg);
            }
        }
        for ((integration_id, metric_key, bucket), values) in grouped {
            if values.is_empty() {
                continue;
            }
            let (avg, min, max) = stats(&values);
            self.store
                .insert_aggregated(MetricSample {
                    integration_id,
                    metric_key,
                    timestamp: bucket,
                    resolution: to,
                    value: None,
                    avg: Some(avg),
                    min: Some(min),
                    max: Some(max),
                    sample_count: Some(values.len() as u32),
                })
                .await?;
        }
        self.store.delete_by_resolution_older_than(from, older_than).await?;
        Ok(())
    }

    async fn retention_sweep(&self) {
        let configs: Vec<(InstanceId, u32)> = self
            .per_integration
            .read()
            .iter()
            .map(|(id, c)| (id.clone(), c.retention_days))
            .collect();
        let now = now_sec();
        for (integration_id, retention_days) in configs {
            let cutoff = now - i64::from(retention_days) * 86_400;
            if let Err(e) = self.store.delete_older_than(&integration_id, cutoff).await {
                tracing::warn!(error = %e, integration_id, "retention sweep failed");
            }
        }
    }

    /// Resolve the preferred resolution tier for a window length (§4.7 query table).
    fn tier_for_window(window_secs: i64) -> Resolution {
        if window_secs <= 3600 {
            Resolution::Raw
        } else if window_secs <= 6 * 3600 {
            Resolution::OneMin
        } else {
            Resolution::FiveMin
        }
    }

    /// `history(integrationId, metricKey, range)` (§4.7 "Query").
    pub async fn history(
        &self,
        integration_id: &str,
        metric_key: &str,
        window_secs: i64,
    ) -> Result<HistoryResult, Error> {
        let config = self.config_for(integration_id);
        if config.mode == HistoryMode::Off {
            return Ok(HistoryResult {
                data: vec![],
                available_range: "0d".to_owned(),
                resolution: Resolution::Raw,
                source: "internal",
            });
        }

        if config.mode != HistoryMode::Internal {
            if let Some(record) = self.sources.get_for_metric(&integration_id.to_owned(), metric_key).await? {
                if record.source == SourceKind::External {
                    if let Some(result) = self.query_external(integration_id, metric_key, window_secs).await? {
                        return Ok(result);
                    }
                }
            }
        }

        let now = now_sec();
        let t_start = now - window_secs;
        let mut resolution = Self::tier_for_window(window_secs);
        let mut data = self.store.query(&integration_id.to_owned(), metric_key, resolution, t_start, now).await?;

        // Resolution fallback: retry progressively finer tiers if empty.
        if data.is_empty() && resolution == Resolution::FiveMin {
            resolution = Resolution::OneMin;
            data = self.store.query(&integration_id.to_owned(), metric_key, resolution, t_start, now).await?;
        }
        if data.is_empty() && resolution == Resolution::OneMin {
            resolution = Resolution::Raw;
            data = self.store.query(&integration_id.to_owned(), metric_key, resolution, t_start, now).await?;
        }

        Ok(HistoryResult {
            data,
            available_range: format!("{}d", config.retention_days),
            resolution,
            source: "internal",
        })
    }

    /// External proxying isn't implemented yet (no adapter round-trip in the
    /// query path) — `history()` always falls through to the internal store,
    /// even for metrics a probe marked `external`.
    async fn query_external(
        &self,
        _integration_id: &str,
        _metric_key: &str,
        _window_secs: i64,
    ) -> Result<Option<HistoryResult>, Error> {
        Ok(None)
    }

    /// Call the plugin adapter for every recordable metric with a declared
    /// `historyProbe`; records `external`/`internal` per the outcome, and
    /// prunes source records for metrics the plugin no longer declares
    /// (§4.7 "Probing").
    pub async fn probe_integration(&self, integration_id: &str, type_id: &str) {
        let Some(plugin) = self.plugins.get(type_id) else { return };
        let Some(instance) = self.adapters.read().get(integration_id).cloned() else { return };

        let declared: HashSet<String> = plugin.metrics.iter().map(|m| m.key.clone()).collect();
        for metric in &plugin.metrics {
            let Some(probe) = &metric.history_probe else { continue };
            let outcome = plugin
                .adapter
                .get(&instance, &probe.path, hub_common::plugin::DEFAULT_ADAPTER_TIMEOUT)
                .await;
            let record = match outcome {
                Ok(body) if !body.is_null() => hub_common::model::SourceRecord {
                    integration_id: integration_id.to_owned(),
                    metric_key: metric.key.clone(),
                    source: SourceKind::External,
                    last_probed: Some(now_sec()),
                    probe_status: None,
                },
                _ => hub_common::model::SourceRecord {
                    integration_id: integration_id.to_owned(),
                    metric_key: metric.key.clone(),
                    source: SourceKind::Internal,
                    last_probed: Some(now_sec()),
                    probe_status: Some("failed".to_owned()),
                },
            };
            if let Err(e) = self.sources.upsert(record).await {
                tracing::warn!(error = %e, "source-record upsert failed");
            }
        }

        if let Ok(existing) = self.sources.get_for_integration(&integration_id.to_owned()).await {
            for record in existing {
                if !declared.contains(&record.metric_key) {
                    let _ = self
                        .sources
                        .delete_for_metric(&integration_id.to_owned(), &record.metric_key)
                        .await;
                }
            }
        }
    }
}

impl MetricTap for MetricHistoryRecorder {
    fn on_sse_data(&self, integration_id: &str, type_id: &str, payload: &Value) {
        self.record_payload(integration_id, type_id, payload);
    }

    fn on_sse_active(&self, integration_id: &str) {
        if let Some(t) = self.background_timers.write().remove(integration_id) {
            t.abort();
        }
        self.sse_active.write().insert(integration_id.to_owned());
    }

    fn on_sse_idle(self: Arc<Self>, integration_id: &str, type_id: &str) {
        self.sse_active.write().remove(integration_id);
        let id = integration_id.to_owned();
        let flush_target = self.clone();
        let flush_id = id.clone();
        tokio::spawn(async move {
            flush_target.flush_instance(&flush_id).await;
        });
        self.arm_background(id, type_id.to_owned());
    }
}

fn stats(values: &[f64]) -> (f64, f64, f64) {
    let sum: f64 = values.iter().sum();
    let avg = sum / values.len() as f64;
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    (avg, min, max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hub_common::model::{IntegrationInstance, SourceRecord};
    use serde_json::json;
    use std::sync::Mutex;

    struct InMemoryStore {
        rows: Mutex<Vec<MetricSample>>,
    }

    #[async_trait]
    impl MetricHistory for InMemoryStore {
        async fn insert_raw(&self, sample: MetricSample) -> Result<(), Error> {
            self.rows.lock().unwrap().push(sample);
            Ok(())
        }
        async fn insert_aggregated(&self, sample: MetricSample) -> Result<(), Error> {
            self.rows.lock().unwrap().push(sample);
            Ok(())
        }
        async fn query(
            &self,
            integration_id: &InstanceId,
            metric_key: &str,
            resolution: Resolution,
            t_start: i64,
            t_end: i64,
        ) -> Result<Vec<MetricSample>, Error> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .iter()
                .filter(|r| {
                    &r.integration_id == integration_id
                        && r.metric_key == metric_key
                        && r.resolution == resolution
                        && r.timestamp >= t_start
                        && r.timestamp <= t_end
                })
                .cloned()
                .collect())
        }
        async fn get_raw_for_aggregation(&self, from: Resolution, older_than: i64) -> Result<Vec<MetricSample>, Error> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.resolution == from && r.timestamp < older_than)
                .cloned()
                .collect())
        }
        async fn delete_by_resolution_older_than(&self, resolution: Resolution, older_than: i64) -> Result<(), Error> {
            self.rows
                .lock()
                .unwrap()
                .retain(|r| !(r.resolution == resolution && r.timestamp < older_than));
            Ok(())
        }
        async fn delete_older_than(&self, integration_id: &InstanceId, cutoff: i64) -> Result<(), Error> {
            self.rows
                .lock()
                .unwrap()
                .retain(|r| !(&r.integration_id == integration_id && r.timestamp < cutoff));
            Ok(())
        }
        async fn delete_for_integration(&self, integration_id: &InstanceId) -> Result<(), Error> {
            self.rows.lock().unwrap().retain(|r| &r.integration_id != integration_id);
            Ok(())
        }
        async fn delete_all(&self) -> Result<(), Error> {
            self.rows.lock().unwrap().clear();
            Ok(())
        }
        async fn get_storage_stats(&self) -> Result<hub_common::storage::StorageStats, Error> {
            Ok(hub_common::storage::StorageStats { row_count: self.rows.lock().unwrap().len() as u64, approx_bytes: None })
        }
    }

    struct NullSources;
    #[async_trait]
    impl MetricHistorySources for NullSources {
        async fn upsert(&self, _: SourceRecord) -> Result<(), Error> {
            Ok(())
        }
        async fn get_for_metric(&self, _: &InstanceId, _: &str) -> Result<Option<SourceRecord>, Error> {
            Ok(None)
        }
        async fn get_for_integration(&self, _: &InstanceId) -> Result<Vec<SourceRecord>, Error> {
            Ok(vec![])
        }
        async fn delete_for_metric(&self, _: &InstanceId, _: &str) -> Result<(), Error> {
            Ok(())
        }
        async fn delete_for_integration(&self, _: &InstanceId) -> Result<(), Error> {
            Ok(())
        }
        async fn delete_all(&self) -> Result<(), Error> {
            Ok(())
        }
    }

    struct NullConfig;
    #[async_trait]
    impl SystemConfig for NullConfig {
        async fn get_system_config(&self) -> Result<Value, Error> {
            Ok(json!({}))
        }
        async fn update_system_config(&self, _: Value) -> Result<(), Error> {
            Ok(())
        }
        async fn get_metric_history_defaults(&self) -> Result<HistoryConfig, Error> {
            Ok(HistoryConfig { mode: HistoryMode::Auto, retention_days: 30 })
        }
    }

    fn recorder() -> (Arc<MetricHistoryRecorder>, Arc<InMemoryStore>) {
        let plugins = Arc::new(PluginRegistry::new());
        let store = Arc::new(InMemoryStore { rows: Mutex::new(vec![]) });
        let recorder = MetricHistoryRecorder::new(
            plugins,
            store.clone(),
            Arc::new(NullSources),
            Arc::new(NullConfig),
            Scheduler::new(),
        );
        recorder.enabled.store(true, std::sync::atomic::Ordering::SeqCst);
        (recorder, store)
    }

    #[tokio::test]
    async fn flush_stores_single_sample_as_raw_point() {
        let (recorder, store) = recorder();
        recorder
            .buffers
            .write()
            .entry(("i1".to_owned(), "cpu".to_owned()))
            .or_default()
            .values
            .push(42.0);
        recorder.flush().await;
        let rows = store.rows.lock().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, Some(42.0));
        assert_eq!(rows[0].timestamp % RAW_BUCKET_SECONDS, 0);
    }

    #[tokio::test]
    async fn flush_stores_multi_sample_as_aggregate() {
        let (recorder, store) = recorder();
        {
            let mut buffers = recorder.buffers.write();
            let buf = buffers.entry(("i1".to_owned(), "cpu".to_owned())).or_default();
            buf.values.extend([10.0, 20.0, 30.0]);
        }
        recorder.flush().await;
        let rows = store.rows.lock().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].avg, Some(20.0));
        assert_eq!(rows[0].min, Some(10.0));
        assert_eq!(rows[0].max, Some(30.0));
        assert_eq!(rows[0].sample_count, Some(3));
    }

    #[tokio::test]
    async fn disable_swaps_reprobe_cron_for_retention_only() {
        let plugins = Arc::new(PluginRegistry::new());
        let store = Arc::new(InMemoryStore { rows: Mutex::new(vec![]) });
        let scheduler = Scheduler::new();
        scheduler.start().await.unwrap();
        scheduler
            .register_job(crate::REPROBE_JOB_ID, "0 0 */6 * * *", || async {})
            .await
            .unwrap();

        let recorder = MetricHistoryRecorder::new(
            plugins,
            store,
            Arc::new(NullSources),
            Arc::new(NullConfig),
            scheduler.clone(),
        );
        recorder.enabled.store(true, std::sync::atomic::Ordering::SeqCst);

        recorder.disable().await;

        assert!(!scheduler.is_registered(crate::REPROBE_JOB_ID));
        assert!(scheduler.is_registered(crate::RETENTION_ONLY_JOB_ID));

        scheduler.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn history_respects_off_mode() {
        let (recorder, _store) = recorder();
        recorder.set_integration_config(
            "i1".to_owned(),
            HistoryConfig { mode: HistoryMode::Off, retention_days: 30 },
        );
        let result = recorder.history("i1", "cpu", 3600).await.unwrap();
        assert!(result.data.is_empty());
    }

    #[tokio::test]
    async fn sse_idle_flushes_only_that_instances_buffer() {
        let (recorder, store) = recorder();
        {
            let mut buffers = recorder.buffers.write();
            buffers.entry(("i1".to_owned(), "cpu".to_owned())).or_default().values.push(10.0);
            buffers.entry(("i2".to_owned(), "cpu".to_owned())).or_default().values.push(20.0);
        }
        recorder.sse_active.write().insert("i1".to_owned());

        recorder.clone().on_sse_idle("i1", "plex");
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(!recorder.sse_active.read().contains("i1"));
        let rows = store.rows.lock().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].integration_id, "i1");
        assert_eq!(rows[0].value, Some(10.0));
        drop(rows);
        assert!(recorder.buffers.read().contains_key(&("i2".to_owned(), "cpu".to_owned())));
    }

    #[tokio::test]
    async fn history_falls_back_to_raw_when_5min_tier_empty() {
        let (recorder, store) = recorder();
        store.rows.lock().unwrap().push(MetricSample {
            integration_id: "i1".to_owned(),
            metric_key: "cpu".to_owned(),
            timestamp: now_sec() - 60,
            resolution: Resolution::Raw,
            value: Some(5.0),
            avg: None,
            min: None,
            max: None,
            sample_count: None,
        });
        let result = recorder.history("i1", "cpu", 7 * 86_400).await.unwrap();
        assert_eq!(result.resolution, Resolution::Raw);
        assert_eq!(result.data.len(), 1);
    }
}
