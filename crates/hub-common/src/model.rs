//! Data model shared between the core components and storage layer.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// Opaque id of an attached subscriber, unique for the process lifetime.
pub type SubscriberId = uuid::Uuid;

/// Opaque id of an integration instance, assigned by the storage layer.
pub type InstanceId = String;

/// Resolution tier of a stored metric sample (§3, §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// Raw samples, 15s aligned.
    Raw,
    /// One-minute aggregated buckets.
    OneMin,
    /// Five-minute aggregated buckets.
    FiveMin,
}

impl Resolution {
    /// The alignment boundary, in seconds, for timestamps at this resolution.
    pub fn bucket_seconds(self) -> i64 {
        match self {
            Resolution::Raw => 15,
            Resolution::OneMin => 60,
            Resolution::FiveMin => 300,
        }
    }
}

/// A stored metric sample, either a single value or a pre-aggregated bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    /// Integration the sample belongs to.
    pub integration_id: InstanceId,
    /// The recordable metric's declared key.
    pub metric_key: String,
    /// Unix seconds, aligned to `resolution.bucket_seconds()`.
    pub timestamp: i64,
    /// Storage tier.
    pub resolution: Resolution,
    /// A single raw value, mutually exclusive with the aggregate fields.
    pub value: Option<f64>,
    /// Aggregate fields, present when this row summarizes more than one sample.
    pub avg: Option<f64>,
    /// Minimum observed value in the bucket.
    pub min: Option<f64>,
    /// Maximum observed value in the bucket.
    pub max: Option<f64>,
    /// Number of raw samples folded into this bucket.
    pub sample_count: Option<u32>,
}

/// Where history for a given `(integration, metric)` pair should be served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Not yet probed.
    Pending,
    /// Recorded locally by the flush/aggregation pipeline.
    Internal,
    /// Proxied through the plugin adapter's `historyProbe`.
    External,
}

/// Per-`(integration, metric)` source record (§3, §4.7).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    /// Integration the record belongs to.
    pub integration_id: InstanceId,
    /// Metric key the record describes.
    pub metric_key: String,
    /// Whether history is served internally or proxied externally.
    pub source: SourceKind,
    /// Unix seconds of the last probe attempt, if any.
    pub last_probed: Option<i64>,
    /// Free-form status of the last probe, e.g. `"failed"`.
    pub probe_status: Option<String>,
}

/// Per-integration history recording mode (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HistoryMode {
    /// Recording is disabled for this integration.
    Off,
    /// Always record locally, never probe for an external source.
    Internal,
    /// Always proxy to the external source, never record locally.
    External,
    /// Probe once, then follow whatever `SourceKind` the probe determined.
    #[default]
    Auto,
}

/// Per-integration metric-history configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Recording mode.
    pub mode: HistoryMode,
    /// Days of history to retain before the retention sweep deletes it.
    pub retention_days: u32,
}

/// Read-only view of an integration instance as seen by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationInstance {
    /// Storage-assigned id.
    pub id: InstanceId,
    /// Integration type id, keys into the plugin registry.
    #[serde(rename = "type")]
    pub kind: String,
    /// Human-readable display name.
    pub display_name: String,
    /// Whether the instance is enabled.
    pub enabled: bool,
    /// Opaque, type-specific configuration.
    pub config: Value,
}

/// Default grace window honored by the Connection Manager (§4.2).
pub const GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Default idle window honored by the Realtime Orchestrator (§4.6).
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Global default poll interval used when no other override applies (§4.5).
pub const GLOBAL_DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

/// Fast-retry fixed interval (§4.5).
pub const FAST_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Consecutive fast-retry failures before transitioning to backoff (§4.5).
pub const FAST_RETRY_ATTEMPTS: u32 = 3;

/// Backoff base, doubled per extra error past the third (§4.5).
pub const BACKOFF_BASE: Duration = Duration::from_secs(15);

/// Backoff ceiling (§4.5).
pub const BACKOFF_MAX: Duration = Duration::from_secs(180);

/// Realtime reconnect initial delay (§4.6).
pub const RECONNECT_INITIAL: Duration = Duration::from_secs(1);

/// Realtime reconnect ceiling (§4.6).
pub const RECONNECT_MAX: Duration = Duration::from_secs(120);

/// Consecutive realtime failures before falling back to polling (§4.6).
pub const WS_FAILURE_THRESHOLD: u32 = 5;

/// Interval between background reattempts while in polling fallback (§4.6).
pub const WS_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// Computes the backoff interval for a given error count, per I5 in §3.
///
/// `errors` must be `>= 2` (the orchestrator only enters backoff after
/// `FAST_RETRY_ATTEMPTS` failures); lower counts saturate at `BACKOFF_BASE`.
pub fn backoff_interval(errors: u32) -> Duration {
    let exponent = errors.saturating_sub(2);
    let scaled = BACKOFF_BASE.saturating_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX));
    scaled.min(BACKOFF_MAX)
}

/// Computes the realtime reconnect delay for a given attempt count, per §4.6.
pub fn reconnect_interval(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1);
    let scaled =
        RECONNECT_INITIAL.saturating_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX));
    scaled.min(RECONNECT_MAX)
}

/// Coarse poller health classification (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// No consecutive errors.
    Healthy,
    /// Fewer than 3 consecutive errors.
    Warning,
    /// 3 or more consecutive errors.
    Degraded,
}

impl HealthStatus {
    /// Classify a consecutive-error count per §4.5's `health()` rule.
    pub fn from_errors(errors: u32) -> Self {
        if errors == 0 {
            HealthStatus::Healthy
        } else if errors < 3 {
            HealthStatus::Warning
        } else {
            HealthStatus::Degraded
        }
    }
}

/// Result of a `Sink::write` call.
pub type SinkResult = Result<(), Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_matches_invariant_i5() {
        // errors=3 -> exponent 1 -> 30s; errors=4 -> exponent 2 -> 60s
        assert_eq!(backoff_interval(3), Duration::from_secs(30));
        assert_eq!(backoff_interval(4), Duration::from_secs(60));
        assert_eq!(backoff_interval(20), BACKOFF_MAX);
    }

    #[test]
    fn reconnect_interval_matches_scenario_5() {
        assert_eq!(reconnect_interval(1), Duration::from_secs(1));
        assert_eq!(reconnect_interval(2), Duration::from_secs(2));
        assert_eq!(reconnect_interval(5), Duration::from_secs(16));
        assert_eq!(reconnect_interval(20), RECONNECT_MAX);
    }

    #[test]
    fn health_status_thresholds() {
        assert_eq!(HealthStatus::from_errors(0), HealthStatus::Healthy);
        assert_eq!(HealthStatus::from_errors(2), HealthStatus::Warning);
        assert_eq!(HealthStatus::from_errors(3), HealthStatus::Degraded);
    }
}
