//! In-memory storage adapters (§1 "database persistence" is explicitly out
//! of scope for the core; a host application supplies its own). These back
//! the standalone binary so it's runnable without a database — swap them
//! for real adapters in an embedding application.

use std::collections::HashMap;

use async_trait::async_trait;
use hub_common::model::{
    HistoryConfig, HistoryMode, InstanceId, IntegrationInstance, MetricSample, Resolution,
    SourceRecord,
};
use hub_common::storage::{IntegrationInstances, MetricHistory, MetricHistorySources, StorageStats, SystemConfig};
use hub_common::Error;
use parking_lot::RwLock;
use serde_json::Value;

/// In-memory integration instance directory, seeded at startup.
#[derive(Default)]
pub struct MemoryInstances {
    instances: RwLock<HashMap<InstanceId, IntegrationInstance>>,
}

impl MemoryInstances {
    /// Build a directory pre-populated with `seed`.
    pub fn seeded(seed: Vec<IntegrationInstance>) -> Self {
        let instances = seed.into_iter().map(|i| (i.id.clone(), i)).collect();
        Self {
            instances: RwLock::new(instances),
        }
    }
}

#[async_trait]
impl IntegrationInstances for MemoryInstances {
    async fn get_by_id(&self, id: &InstanceId) -> Result<Option<IntegrationInstance>, Error> {
        Ok(self.instances.read().get(id).cloned())
    }

    async fn get_by_type(&self, kind: &str) -> Result<Vec<IntegrationInstance>, Error> {
        Ok(self
            .instances
            .read()
            .values()
            .filter(|i| i.kind == kind)
            .cloned()
            .collect())
    }

    async fn first_enabled_by_type(&self, kind: &str) -> Result<Option<IntegrationInstance>, Error> {
        Ok(self
            .instances
            .read()
            .values()
            .find(|i| i.kind == kind && i.enabled)
            .cloned())
    }
}

/// In-memory tiered metric sample store.
#[derive(Default)]
pub struct MemoryMetricHistory {
    rows: RwLock<Vec<MetricSample>>,
}

#[async_trait]
impl MetricHistory for MemoryMetricHistory {
    async fn insert_raw(&self, sample: MetricSample) -> Result<(), Error> {
        self.rows.write().push(sample);
        Ok(())
    }

    async fn insert_aggregated(&self, sample: MetricSample) -> Result<(), Error> {
        self.rows.write().push(sample);
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
            .read()
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

    async fn get_raw_for_aggregation(
        &self,
        from_resolution: Resolution,
        older_than: i64,
    ) -> Result<Vec<MetricSample>, Error> {
        Ok(self
            .rows
            .read()
            .iter()
            .filter(|r| r.resolution == from_resolution && r.timestamp < older_than)
            .cloned()
            .collect())
    }

    async fn delete_by_resolution_older_than(&self, resolution: Resolution, older_than: i64) -> Result<(), Error> {
        self.rows
            .write()
            .retain(|r| !(r.resolution == resolution && r.timestamp < older_than));
        Ok(())
    }

    async fn delete_older_than(&self, integration_id: &InstanceId, cutoff: i64) -> Result<(), Error> {
        self.rows
            .write()
            .retain(|r| !(&r.integration_id == integration_id && r.timestamp < cutoff));
        Ok(())
    }

    async fn delete_for_integration(&self, integration_id: &InstanceId) -> Result<(), Error> {
        self.rows.write().retain(|r| &r.integration_id != integration_id);
        Ok(())
    }

    async fn delete_all(&self) -> Result<(), Error> {
        self.rows.write().clear();
        Ok(())
    }

    async fn get_storage_stats(&self) -> Result<StorageStats, Error> {
        let rows = self.rows.read();
        Ok(StorageStats {
            row_count: rows.len() as u64,
            approx_bytes: None,
        })
    }
}

/// In-memory per-`(integration, metric)` source-of-truth tracking.
#[derive(Default)]
pub struct MemoryMetricSources {
    records: RwLock<HashMap<(InstanceId, String), SourceRecord>>,
}

#[async_trait]
impl MetricHistorySources for MemoryMetricSources {
    async fn upsert(&self, record: SourceRecord) -> Result<(), Error> {
        self.records
            .write()
            .insert((record.integration_id.clone(), record.metric_key.clone()), record);
        Ok(())
    }

    async fn get_for_metric(&self, integration_id: &InstanceId, metric_key: &str) -> Result<Option<SourceRecord>, Error> {
        Ok(self
            .records
            .read()
            .get(&(integration_id.clone(), metric_key.to_owned()))
            .cloned())
    }

    async fn get_for_integration(&self, integration_id: &InstanceId) -> Result<Vec<SourceRecord>, Error> {
        Ok(self
            .records
            .read()
            .values()
            .filter(|r| &r.integration_id == integration_id)
            .cloned()
            .collect())
    }

    async fn delete_for_metric(&self, integration_id: &InstanceId, metric_key: &str) -> Result<(), Error> {
        self.records.write().remove(&(integration_id.clone(), metric_key.to_owned()));
        Ok(())
    }

    async fn delete_for_integration(&self, integration_id: &InstanceId) -> Result<(), Error> {
        self.records.write().retain(|(id, _), _| id != integration_id);
        Ok(())
    }

    async fn delete_all(&self) -> Result<(), Error> {
        self.records.write().clear();
        Ok(())
    }
}

/// In-memory system config blob plus metric-history defaults.
pub struct MemorySystemConfig {
    blob: RwLock<Value>,
    defaults: HistoryConfig,
}

impl Default for MemorySystemConfig {
    fn default() -> Self {
        Self {
            blob: RwLock::new(Value::Object(Default::default())),
            defaults: HistoryConfig {
                mode: HistoryMode::Auto,
                retention_days: 30,
            },
        }
    }
}

#[async_trait]
impl SystemConfig for MemorySystemConfig {
    async fn get_system_config(&self) -> Result<Value, Error> {
        Ok(self.blob.read().clone())
    }

    async fn update_system_config(&self, config: Value) -> Result<(), Error> {
        *self.blob.write() = config;
        Ok(())
    }

    async fn get_metric_history_defaults(&self) -> Result<HistoryConfig, Error> {
        Ok(self.defaults)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn instances_filter_by_type_and_enabled() {
        let store = MemoryInstances::seeded(vec![
            IntegrationInstance {
                id: "a".to_owned(),
                kind: "qbittorrent".to_owned(),
                display_name: "A".to_owned(),
                enabled: true,
                config: Value::Null,
            },
            IntegrationInstance {
                id: "b".to_owned(),
                kind: "qbittorrent".to_owned(),
                display_name: "B".to_owned(),
                enabled: false,
                config: Value::Null,
            },
        ]);
        assert_eq!(store.get_by_type("qbittorrent").await.unwrap().len(), 2);
        let first = store.first_enabled_by_type("qbittorrent").await.unwrap().unwrap();
        assert_eq!(first.id, "a");
    }

    #[tokio::test]
    async fn metric_history_round_trips_a_raw_sample() {
        let store = MemoryMetricHistory::default();
        store
            .insert_raw(MetricSample {
                integration_id: "a".to_owned(),
                metric_key: "dl".to_owned(),
                timestamp: 100,
                resolution: Resolution::Raw,
                value: Some(1.0),
                avg: None,
                min: None,
                max: None,
                sample_count: None,
            })
            .await
            .unwrap();
        let rows = store.query(&"a".to_owned(), "dl", Resolution::Raw, 0, 200).await.unwrap();
        assert_eq!(rows.len(), 1);
    }
}
