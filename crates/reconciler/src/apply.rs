//! Create-or-update of resolved objects.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::debug;

use crate::error::ReconcileError;
use crate::store::{bounded, ObjectCache, ObjectStore};
use crate::types::{Bundle, Object};

/// What the applier did with an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyAction {
    Created,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApplyOutcome {
    /// The object as the store now has it.
    pub object: Object,
    pub action: ApplyAction,
}

pub struct Applier {
    store: Arc<dyn ObjectStore>,
    cache: Arc<dyn ObjectCache>,
    store_timeout: Duration,
}

impl Applier {
    pub fn new(store: Arc<dyn ObjectStore>, cache: Arc<dyn ObjectCache>, store_timeout: Duration) -> Self {
        Self {
            store,
            cache,
            store_timeout,
        }
    }

    /// Make the store hold `desired`, writing only when needed.
    ///
    /// # Errors
    ///
    /// `NotControlled` when an object with the same identity exists but
    /// belongs to someone else; otherwise the classified store error.
    pub async fn apply(&self, bundle: &Bundle, desired: Object) -> Result<ApplyOutcome, ReconcileError> {
        let observed = self
            .cache
            .get(&desired.group_kind(), desired.namespace(), desired.name());

        let Some(observed) = observed else {
            debug!(object = %desired.key(), "Creating object");
            let object = bounded(self.store_timeout, self.store.create(desired))
                .await
                .map_err(ReconcileError::from_store)?;
            return Ok(ApplyOutcome {
                object,
                action: ApplyAction::Created,
            });
        };

        if !bundle.controls(&observed) {
            return Err(ReconcileError::NotControlled {
                kind: observed.group_kind(),
                name: observed.metadata.name,
            });
        }

        if is_equivalent(&desired, &observed) {
            debug!(object = %desired.key(), "Object up to date");
            return Ok(ApplyOutcome {
                object: observed,
                action: ApplyAction::Unchanged,
            });
        }

        debug!(object = %desired.key(), "Updating object");
        let update = merge_for_update(desired, observed);
        let object = bounded(self.store_timeout, self.store.update(update))
            .await
            .map_err(ReconcileError::from_store)?;
        Ok(ApplyOutcome {
            object,
            action: ApplyAction::Updated,
        })
    }
}

/// Metadata of `desired` that the applier owns. Labels and annotations
/// added by other writers are kept on update, so only these keys count.
fn owned_metadata(desired: &Object) -> Value {
    let mut metadata = Map::new();
    if !desired.metadata.labels.is_empty() {
        metadata.insert("labels".to_string(), json!(desired.metadata.labels));
    }
    if !desired.metadata.annotations.is_empty() {
        metadata.insert("annotations".to_string(), json!(desired.metadata.annotations));
    }
    if !desired.metadata.owner_references.is_empty() {
        metadata.insert("ownerReferences".to_string(), json!(desired.metadata.owner_references));
    }
    json!({ "metadata": metadata })
}

/// The body without `status`, which belongs to the object's own controller.
fn spec_body(object: &Object) -> Value {
    Value::Object(
        object
            .body
            .iter()
            .filter(|(k, _)| k.as_str() != "status")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    )
}

/// Every field set in `desired` has an equal value in `observed`.
pub fn is_subset(desired: &Value, observed: &Value) -> bool {
    match (desired, observed) {
        (Value::Object(want), Value::Object(have)) => want
            .iter()
            .all(|(k, v)| have.get(k).is_some_and(|h| is_subset(v, h)) || (v.is_null() && !have.contains_key(k))),
        (Value::Array(want), Value::Array(have)) => {
            want.len() == have.len() && want.iter().zip(have).all(|(w, h)| is_subset(w, h))
        }
        (Value::Number(want), Value::Number(have)) => want.as_f64() == have.as_f64(),
        _ => desired == observed,
    }
}

/// Equal up to number representation and absent-vs-null fields.
pub fn is_same(a: &Value, b: &Value) -> bool {
    is_subset(a, b) && is_subset(b, a)
}

/// The body must match both ways so removed fields are written out; owned
/// metadata only has to be present.
fn is_equivalent(desired: &Object, observed: &Object) -> bool {
    desired.api_version == observed.api_version
        && is_same(&spec_body(desired), &spec_body(observed))
        && is_subset(&owned_metadata(desired), &observed.to_value())
}

/// Desired state with the observed identity and server-side metadata.
fn merge_for_update(mut desired: Object, observed: Object) -> Object {
    let meta = observed.metadata;
    desired.metadata.uid = meta.uid;
    desired.metadata.resource_version = meta.resource_version;
    desired.metadata.generation = meta.generation;
    if desired.metadata.finalizers.is_empty() {
        desired.metadata.finalizers = meta.finalizers;
    }
    for (k, v) in meta.labels {
        desired.metadata.labels.entry(k).or_insert(v);
    }
    for (k, v) in meta.annotations {
        desired.metadata.annotations.entry(k).or_insert(v);
    }
    desired
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::memory::{InMemoryStore, StoreAction};
    use crate::store::StoreError;

    fn setup() -> (Arc<InMemoryStore>, Applier, Bundle) {
        let store = Arc::new(InMemoryStore::new());
        let applier = Applier::new(store.clone(), store.clone(), Duration::from_secs(1));
        let bundle = store.insert_bundle(Bundle::new("ns", "app", Vec::new()));
        (store, applier, bundle)
    }

    fn desired(bundle: &Bundle, value: &str) -> Object {
        let mut object = Object::new("v1", "ConfigMap", "cm").with_field("data", json!({"key": value}));
        object.metadata.namespace = Some("ns".to_string());
        object.metadata.owner_references.push(bundle.owner_reference());
        object
    }

    #[test]
    fn test_subset_ignores_server_fields() {
        assert!(is_subset(
            &json!({"spec": {"replicas": 1}}),
            &json!({"spec": {"replicas": 1.0, "strategy": "RollingUpdate"}, "status": {}})
        ));
        assert!(!is_subset(&json!({"spec": {"replicas": 2}}), &json!({"spec": {"replicas": 1}})));
        assert!(!is_subset(&json!({"ports": [1, 2]}), &json!({"ports": [1]})));
    }

    #[test]
    fn test_same_detects_removed_keys() {
        assert!(is_same(&json!({"data": {"a": "1"}}), &json!({"data": {"a": "1"}})));
        assert!(is_same(&json!({"spec": {"replicas": 1, "paused": null}}), &json!({"spec": {"replicas": 1.0}})));
        assert!(!is_same(&json!({"data": {"a": "1"}}), &json!({"data": {"a": "1", "b": "2"}})));
    }

    #[tokio::test]
    async fn test_removed_key_triggers_update() {
        let (store, applier, bundle) = setup();
        let mut full = desired(&bundle, "a");
        full.body.insert("data".to_string(), json!({"key": "a", "extra": "x"}));
        applier.apply(&bundle, full).await.unwrap();

        let trimmed = applier.apply(&bundle, desired(&bundle, "a")).await.unwrap();
        assert_eq!(trimmed.action, ApplyAction::Updated);
        assert_eq!(trimmed.object.field("data"), Some(json!({"key": "a"})));
        assert!(matches!(store.actions().last(), Some(StoreAction::Update(_))));
    }

    #[tokio::test]
    async fn test_second_apply_is_a_no_op() {
        let (store, applier, bundle) = setup();
        let first = applier.apply(&bundle, desired(&bundle, "a")).await.unwrap();
        assert_eq!(first.action, ApplyAction::Created);

        let second = applier.apply(&bundle, desired(&bundle, "a")).await.unwrap();
        assert_eq!(second.action, ApplyAction::Unchanged);
        assert_eq!(
            store.actions().iter().filter(|a| a.is_object_write()).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_changed_object_is_updated_with_observed_version() {
        let (store, applier, bundle) = setup();
        let created = applier.apply(&bundle, desired(&bundle, "a")).await.unwrap().object;

        let updated = applier.apply(&bundle, desired(&bundle, "b")).await.unwrap();
        assert_eq!(updated.action, ApplyAction::Updated);
        assert_eq!(updated.object.metadata.uid, created.metadata.uid);
        assert_eq!(updated.object.field("data.key"), Some(json!("b")));
        assert!(matches!(store.actions().last(), Some(StoreAction::Update(_))));
    }

    #[tokio::test]
    async fn test_foreign_object_is_not_controlled() {
        let (store, applier, bundle) = setup();
        let mut foreign = Object::new("v1", "ConfigMap", "cm");
        foreign.metadata.namespace = Some("ns".to_string());
        store.insert_object(foreign);

        let err = applier.apply(&bundle, desired(&bundle, "a")).await.unwrap_err();
        assert!(matches!(err, ReconcileError::NotControlled { .. }));
        assert!(err.is_external());
        assert!(!err.is_retriable());
    }

    #[tokio::test]
    async fn test_store_failure_is_classified() {
        let (store, applier, bundle) = setup();
        store.fail_next("cm", StoreError::Forbidden("denied".to_string()));
        let err = applier.apply(&bundle, desired(&bundle, "a")).await.unwrap_err();
        assert!(matches!(err, ReconcileError::StoreRejected { .. }));
    }
}
