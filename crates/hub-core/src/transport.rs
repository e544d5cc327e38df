//! Transport (C4, §4.4).
//!
//! Computes the broadcast envelope for a topic (full vs. RFC 6902 delta),
//! applies per-topic subscriber filters, and writes to sinks through the
//! Connection Manager. Holds no topic state of its own — the shared cache
//! and per-subscriber filtered cache live here only as bookkeeping maps
//! keyed by values the Subscription Registry hands in, since the Transport
//! must see every broadcast to maintain the per-subscriber filtered cache.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use hub_common::clock::now_ms;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;

use crate::connection::{ConnectionManager, SubscriberId};

/// Patch operations above this count force a full envelope (§4.4).
pub const DOWNGRADE_PATCH_COUNT: usize = 10;
/// Add/replace operations deeper than this many path segments force a full
/// envelope (§4.4).
pub const DOWNGRADE_PATH_DEPTH: usize = 3;

/// One broadcastable envelope, matching the wire shape in §6.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    /// Full state replacement.
    Full {
        /// The complete payload.
        data: Value,
        /// Milliseconds since the epoch.
        timestamp: i64,
    },
    /// RFC 6902 patch against the receiver's previously-delivered state.
    Delta {
        /// The patch operations.
        patches: json_patch::Patch,
        /// Milliseconds since the epoch.
        timestamp: i64,
    },
}

/// Wraps a top-level JSON array as `{items: [...]}` so it can be diffed
/// without corrupting shape for clients that also spread object properties
/// onto the payload (§4.4 "Array sentinel"). Non-array payloads pass through
/// unchanged. Callers (C5, C6) apply this before attaching `_meta`.
pub fn array_sentinel(payload: Value) -> Value {
    match payload {
        Value::Array(items) => serde_json::json!({ "items": items }),
        other => other,
    }
}

fn op_path(op: &json_patch::PatchOperation) -> &str {
    use json_patch::PatchOperation::*;
    match op {
        Add(o) => o.path.as_str(),
        Remove(o) => o.path.as_str(),
        Replace(o) => o.path.as_str(),
        Move(o) => o.path.as_str(),
        Copy(o) => o.path.as_str(),
        Test(o) => o.path.as_str(),
    }
}

fn op_depth(op: &json_patch::PatchOperation) -> usize {
    op_path(op).split('/').filter(|s| !s.is_empty()).count()
}

fn is_add_or_replace(op: &json_patch::PatchOperation) -> bool {
    matches!(
        op,
        json_patch::PatchOperation::Add(_) | json_patch::PatchOperation::Replace(_)
    )
}

fn should_downgrade(patch: &json_patch::Patch, force_full: bool) -> bool {
    if force_full {
        return true;
    }
    if patch.0.len() > DOWNGRADE_PATCH_COUNT {
        return true;
    }
    patch
        .0
        .iter()
        .any(|op| is_add_or_replace(op) && op_depth(op) > DOWNGRADE_PATH_DEPTH)
}

/// Computes the envelope for one recipient, given what that recipient last
/// saw (`previous`) and the new value it should converge to. Returns `None`
/// when the two are identical and this isn't a forced-full/first delivery —
/// the idempotence property in §8 ("two identical consecutive payloads
/// produce zero broadcasts").
pub fn compute_envelope(previous: Option<&Value>, new: &Value, force_full: bool) -> Option<Envelope> {
    let timestamp = now_ms();
    let Some(previous) = previous else {
        return Some(Envelope::Full { data: new.clone(), timestamp });
    };
    let patch = json_patch::diff(previous, new);
    if should_downgrade(&patch, force_full) {
        return Some(Envelope::Full { data: new.clone(), timestamp });
    }
    if patch.0.is_empty() {
        return None;
    }
    Some(Envelope::Delta { patches: patch, timestamp })
}

/// Per-topic-prefix subscriber filter (§4.4, §4.3). Registered keyed by
/// `Topic::prefix()`, i.e. the integration type.
pub trait TopicFilter: Send + Sync {
    /// Produce the per-user view of `data` for `topic`.
    fn filter(&self, user_id: &str, data: &Value, topic: &str) -> Value;
}

/// Serializes and delivers broadcast envelopes, applying per-topic filters
/// and maintaining the per-subscriber filtered cache (§9 design note).
pub struct Transport {
    connections: Arc<ConnectionManager>,
    filters: RwLock<HashMap<String, Arc<dyn TopicFilter>>>,
    filtered_cache: RwLock<HashMap<(SubscriberId, String), Value>>,
}

impl Transport {
    /// Construct a transport bound to a Connection Manager for delivery.
    pub fn new(connections: Arc<ConnectionManager>) -> Arc<Self> {
        Arc::new(Self {
            connections,
            filters: RwLock::new(HashMap::new()),
            filtered_cache: RwLock::new(HashMap::new()),
        })
    }

    /// Register (or replace) the filter for a topic prefix.
    pub fn register_filter(&self, prefix: impl Into<String>, filter: Arc<dyn TopicFilter>) {
        self.filters.write().insert(prefix.into(), filter);
    }

    /// Whether a filter is registered for a topic prefix.
    pub fn has_filter(&self, prefix: &str) -> bool {
        self.filters.read().contains_key(prefix)
    }

    fn filter_for(&self, prefix: &str) -> Option<Arc<dyn TopicFilter>> {
        self.filters.read().get(prefix).cloned()
    }

    /// Evict a subscriber's filtered-cache entry for a topic (called on
    /// unsubscribe, per the §9 design note).
    pub fn evict_filtered_cache(&self, subscriber_id: SubscriberId, topic: &str) {
        self.filtered_cache
            .write()
            .remove(&(subscriber_id, topic.to_owned()));
    }

    /// Broadcast `payload` (already unfiltered/shared) to `subscribers` of
    /// `topic` whose prefix is `prefix`. `previous_shared` is the topic's
    /// cached payload before this update, used for the unfiltered diff path.
    pub async fn broadcast(
        &self,
        topic: &str,
        prefix: &str,
        subscribers: &HashSet<SubscriberId>,
        previous_shared: Option<&Value>,
        payload: &Value,
        force_full: bool,
    ) {
        if subscribers.is_empty() {
            return;
        }
        if let Some(filter) = self.filter_for(prefix) {
            self.broadcast_filtered(topic, subscribers, filter, payload, force_full)
                .await;
            return;
        }
        let Some(envelope) = compute_envelope(previous_shared, payload, force_full) else {
            return;
        };
        let data = serde_json::to_value(&envelope).unwrap_or(Value::Null);
        for &id in subscribers {
            self.connections.route(id, topic, data.clone()).await;
        }
    }

    async fn broadcast_filtered(
        &self,
        topic: &str,
        subscribers: &HashSet<SubscriberId>,
        filter: Arc<dyn TopicFilter>,
        payload: &Value,
        force_full: bool,
    ) {
        for &id in subscribers {
            let Some(user_id) = self.connections.user_id_of(id) else { continue };
            let filtered = filter.filter(&user_id, payload, topic);
            let key = (id, topic.to_owned());
            let previous = self.filtered_cache.read().get(&key).cloned();
            let Some(envelope) = compute_envelope(previous.as_ref(), &filtered, force_full) else {
                continue;
            };
            self.filtered_cache.write().insert(key, filtered);
            let data = serde_json::to_value(&envelope).unwrap_or(Value::Null);
            self.connections.route(id, topic, data).await;
        }
    }

    /// Deliver `payload` to a single newly-joined subscriber as a `full`
    /// event (§4.3 first-join cache delivery), applying the prefix filter if
    /// one is registered and seeding that subscriber's filtered cache.
    pub async fn deliver_initial(&self, id: SubscriberId, topic: &str, prefix: &str, payload: &Value) {
        let data = if let Some(filter) = self.filter_for(prefix) {
            let user_id = self.connections.user_id_of(id).unwrap_or_default();
            let filtered = filter.filter(&user_id, payload, topic);
            self.filtered_cache
                .write()
                .insert((id, topic.to_owned()), filtered.clone());
            filtered
        } else {
            payload.clone()
        };
        let envelope = Envelope::Full { data, timestamp: now_ms() };
        let json = serde_json::to_value(&envelope).unwrap_or(Value::Null);
        self.connections.route(id, topic, json).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_update_is_always_full() {
        let env = compute_envelope(None, &json!({"a": 1}), false).unwrap();
        assert!(matches!(env, Envelope::Full { .. }));
    }

    #[test]
    fn identical_payload_yields_no_broadcast() {
        let payload = json!({"a": 1, "b": [1, 2, 3]});
        let env = compute_envelope(Some(&payload), &payload, false);
        assert!(env.is_none());
    }

    #[test]
    fn small_diff_yields_delta() {
        let before = json!({"sessions": [{"k": 1, "t": "A"}]});
        let after = json!({"sessions": [{"k": 1, "t": "A"}, {"k": 2, "t": "B"}]});
        let env = compute_envelope(Some(&before), &after, false).unwrap();
        assert!(matches!(env, Envelope::Delta { .. }));
    }

    #[test]
    fn forced_full_overrides_small_diff() {
        let before = json!({"a": 1});
        let after = json!({"a": 2});
        let env = compute_envelope(Some(&before), &after, true).unwrap();
        assert!(matches!(env, Envelope::Full { .. }));
    }

    #[test]
    fn deep_replace_downgrades_to_full() {
        let before = json!({"a": {"b": {"c": {"d": 1}}}});
        let after = json!({"a": {"b": {"c": {"d": 2}}}});
        let env = compute_envelope(Some(&before), &after, false).unwrap();
        assert!(matches!(env, Envelope::Full { .. }));
    }

    #[test]
    fn many_ops_downgrades_to_full() {
        let mut before_map = serde_json::Map::new();
        let mut after_map = serde_json::Map::new();
        for i in 0..15 {
            before_map.insert(format!("k{i}"), json!(i));
            after_map.insert(format!("k{i}"), json!(i + 1));
        }
        let env = compute_envelope(
            Some(&Value::Object(before_map)),
            &Value::Object(after_map),
            false,
        )
        .unwrap();
        assert!(matches!(env, Envelope::Full { .. }));
    }

    #[test]
    fn array_sentinel_wraps_top_level_arrays() {
        let wrapped = array_sentinel(json!([1, 2, 3]));
        assert_eq!(wrapped, json!({"items": [1, 2, 3]}));
        let unchanged = array_sentinel(json!({"a": 1}));
        assert_eq!(unchanged, json!({"a": 1}));
    }
}
