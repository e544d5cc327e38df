//! Plugin Registry (C1, §4.1).
//!
//! Process-wide, initialized once at boot and never mutated afterward —
//! matches the "Global state" design note: an explicit `init` phase, no lazy
//! initialization triggered by the first request.

use std::collections::HashMap;
use std::sync::Arc;

use hub_common::plugin::Plugin;

/// Holds immutable per-integration-type capability bundles.
#[derive(Debug, Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<Plugin>>,
}

impl PluginRegistry {
    /// An empty registry, populated via `register` during boot.
    pub fn new() -> Self {
        Self { plugins: HashMap::new() }
    }

    /// Register a plugin. Intended to be called only during boot wiring;
    /// there is no corresponding `unregister`.
    pub fn register(&mut self, plugin: Plugin) {
        self.plugins.insert(plugin.id.clone(), Arc::new(plugin));
    }

    /// Look up a plugin by integration type id.
    pub fn get(&self, type_id: &str) -> Option<Arc<Plugin>> {
        self.plugins.get(type_id).cloned()
    }

    /// Every registered plugin, in no particular order.
    pub fn all(&self) -> Vec<Arc<Plugin>> {
        self.plugins.values().cloned().collect()
    }

    /// Whether a type is registered and declares a realtime manager factory
    /// — the signal C3 uses to pick the realtime starter over the poller
    /// starter on first-join (§4.3).
    pub fn is_realtime(&self, type_id: &str) -> bool {
        self.plugins
            .get(type_id)
            .map(|p| p.realtime.is_some())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_common::plugin::{Adapter, PluginInstance};
    use async_trait::async_trait;
    use hub_common::Error;
    use serde_json::Value;
    use std::time::Duration;

    struct NullAdapter;

    #[async_trait]
    impl Adapter for NullAdapter {
        async fn get(&self, _: &PluginInstance, _: &str, _: Duration) -> Result<Value, Error> {
            unimplemented!()
        }
        async fn post(&self, _: &PluginInstance, _: &str, _: Value, _: Duration) -> Result<Value, Error> {
            unimplemented!()
        }
        async fn request(
            &self,
            _: &PluginInstance,
            _: &str,
            _: &str,
            _: Option<Value>,
            _: Duration,
        ) -> Result<Value, Error> {
            unimplemented!()
        }
    }

    fn bare_plugin(id: &str) -> Plugin {
        Plugin {
            id: id.to_owned(),
            name: id.to_owned(),
            category: "test".to_owned(),
            metrics: vec![],
            adapter: Arc::new(NullAdapter),
            poller: None,
            subtype_pollers: HashMap::new(),
            realtime: None,
        }
    }

    #[test]
    fn unknown_type_is_not_realtime() {
        let registry = PluginRegistry::new();
        assert!(!registry.is_realtime("sonarr"));
        assert!(registry.get("sonarr").is_none());
    }

    #[test]
    fn registers_and_looks_up_by_id() {
        let mut registry = PluginRegistry::new();
        registry.register(bare_plugin("sonarr"));
        assert!(registry.get("sonarr").is_some());
        assert_eq!(registry.all().len(), 1);
    }
}
