//! Shared fixtures for the reconciler integration tests.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use keystone_reconciler::{
    BackoffConfig, BundleProcessor, ControllerConfig, GroupKind, InMemoryStore, Object, ObjectKey, Resource,
    StoreAction, TransitionMetrics,
};
use serde_json::{json, Value};

pub const NAMESPACE: &str = "ns";

/// A ConfigMap resource with string data.
pub fn config_map(name: &str, data: Value) -> Resource {
    Resource::object(name, Object::new("v1", "ConfigMap", name).with_field("data", data))
}

/// A ConfigMap resource whose data fails validation.
pub fn invalid_config_map(name: &str) -> Resource {
    config_map(name, json!({"port": 5432}))
}

pub fn config_map_key(name: &str) -> ObjectKey {
    ObjectKey {
        group_kind: GroupKind::new("", "ConfigMap"),
        namespace: NAMESPACE.to_string(),
        name: name.to_string(),
    }
}

/// Config with short timeouts and deterministic backoff.
pub fn test_config() -> ControllerConfig {
    ControllerConfig {
        plugin_timeout_ms: 500,
        store_timeout_ms: 500,
        backoff: BackoffConfig::default()
            .with_jitter(false)
            .with_initial_delay_ms(100)
            .with_max_delay_ms(1_000),
        ..ControllerConfig::default()
    }
}

pub fn processor(store: &Arc<InMemoryStore>) -> BundleProcessor {
    BundleProcessor::builder()
        .with_store(store.clone())
        .with_cache(store.clone())
        .with_config(test_config())
        .build()
        .unwrap()
}

pub fn processor_with_metrics(store: &Arc<InMemoryStore>, metrics: TransitionMetrics) -> BundleProcessor {
    BundleProcessor::builder()
        .with_store(store.clone())
        .with_cache(store.clone())
        .with_config(test_config())
        .with_metrics(metrics)
        .build()
        .unwrap()
}

/// Object writes (create, update, delete) aimed at `name`.
pub fn object_writes_for(store: &InMemoryStore, name: &str) -> Vec<StoreAction> {
    store
        .actions()
        .into_iter()
        .filter(|a| a.is_object_write() && a.name() == name)
        .collect()
}

pub fn object_writes(store: &InMemoryStore) -> Vec<StoreAction> {
    store.actions().into_iter().filter(StoreAction::is_object_write).collect()
}
