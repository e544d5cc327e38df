//! Storage contracts the core reads/writes through (§6). Persistence itself
//! is out of scope; implementations live in the host application.

use async_trait::async_trait;

use crate::error::Error;
use crate::model::{HistoryConfig, InstanceId, IntegrationInstance, MetricSample, Resolution, SourceRecord};

/// Integration instance directory (§6).
#[async_trait]
pub trait IntegrationInstances: Send + Sync {
    /// Look up one instance by id.
    async fn get_by_id(&self, id: &InstanceId) -> Result<Option<IntegrationInstance>, Error>;

    /// All instances of a given integration type.
    async fn get_by_type(&self, kind: &str) -> Result<Vec<IntegrationInstance>, Error>;

    /// The first enabled instance of a given type, used when a topic names
    /// no instance (§4.5).
    async fn first_enabled_by_type(
        &self,
        kind: &str,
    ) -> Result<Option<IntegrationInstance>, Error>;
}

/// Tiered metric-sample store (§6, §4.7).
#[async_trait]
pub trait MetricHistory: Send + Sync {
    /// Insert a single raw sample.
    async fn insert_raw(&self, sample: MetricSample) -> Result<(), Error>;

    /// Insert a pre-aggregated bucket.
    async fn insert_aggregated(&self, sample: MetricSample) -> Result<(), Error>;

    /// Query samples for `(integration, metric)` at a resolution, within `[t_start, t_end]`.
    async fn query(
        &self,
        integration_id: &InstanceId,
        metric_key: &str,
        resolution: Resolution,
        t_start: i64,
        t_end: i64,
    ) -> Result<Vec<MetricSample>, Error>;

    /// Rows at `from_resolution` older than `older_than` (unix seconds), for compaction.
    async fn get_raw_for_aggregation(
        &self,
        from_resolution: Resolution,
        older_than: i64,
    ) -> Result<Vec<MetricSample>, Error>;

    /// Delete every row at a resolution older than `older_than`.
    async fn delete_by_resolution_older_than(
        &self,
        resolution: Resolution,
        older_than: i64,
    ) -> Result<(), Error>;

    /// Delete rows for one integration older than `cutoff` (retention sweep).
    async fn delete_older_than(&self, integration_id: &InstanceId, cutoff: i64) -> Result<(), Error>;

    /// Delete all rows for one integration.
    async fn delete_for_integration(&self, integration_id: &InstanceId) -> Result<(), Error>;

    /// Delete every row in the store.
    async fn delete_all(&self) -> Result<(), Error>;

    /// Coarse row-count/size stats, for diagnostics.
    async fn get_storage_stats(&self) -> Result<StorageStats, Error>;
}

/// Coarse storage stats returned by `MetricHistory::get_storage_stats`.
#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    /// Total rows across all resolutions.
    pub row_count: u64,
    /// Approximate bytes on disk, if known.
    pub approx_bytes: Option<u64>,
}

/// Per-`(integration, metric)` source-of-truth tracking (§6, §4.7).
#[async_trait]
pub trait MetricHistorySources: Send + Sync {
    /// Insert or update the source record for a metric.
    async fn upsert(&self, record: SourceRecord) -> Result<(), Error>;

    /// Fetch the source record for one metric, if probed before.
    async fn get_for_metric(
        &self,
        integration_id: &InstanceId,
        metric_key: &str,
    ) -> Result<Option<SourceRecord>, Error>;

    /// Fetch every source record for one integration.
    async fn get_for_integration(
        &self,
        integration_id: &InstanceId,
    ) -> Result<Vec<SourceRecord>, Error>;

    /// Delete the source record for one metric.
    async fn delete_for_metric(
        &self,
        integration_id: &InstanceId,
        metric_key: &str,
    ) -> Result<(), Error>;

    /// Delete every source record for one integration.
    async fn delete_for_integration(&self, integration_id: &InstanceId) -> Result<(), Error>;

    /// Delete every source record in the store.
    async fn delete_all(&self) -> Result<(), Error>;
}

/// System-wide configuration, including the metric-history feature toggle (§6).
#[async_trait]
pub trait SystemConfig: Send + Sync {
    /// Read the current system config blob.
    async fn get_system_config(&self) -> Result<serde_json::Value, Error>;

    /// Replace the system config blob.
    async fn update_system_config(&self, config: serde_json::Value) -> Result<(), Error>;

    /// Default per-integration history mode/retention, used when an
    /// instance has no explicit override.
    async fn get_metric_history_defaults(&self) -> Result<HistoryConfig, Error>;
}
