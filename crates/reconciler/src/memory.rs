//! In-memory store and cache.
//!
//! Behaves like a small API server: assigns uids and resource versions,
//! rejects stale writes, removes a deleting bundle once its last finalizer is
//! gone. Every call is recorded so tests can assert on the exact sequence of
//! writes, and failures can be injected per object name.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::store::{ObjectCache, ObjectKey, ObjectStore, StoreError};
use crate::types::{Bundle, BundleRef, GroupKind, Object};

/// One recorded store call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreAction {
    Create(ObjectKey),
    Update(ObjectKey),
    Delete(ObjectKey),
    UpdateBundle(BundleRef),
    UpdateBundleStatus(BundleRef),
}

impl StoreAction {
    /// Whether this call wrote an object (not a bundle).
    pub fn is_object_write(&self) -> bool {
        matches!(self, Self::Create(_) | Self::Update(_) | Self::Delete(_))
    }

    /// Name of the object or bundle the call targeted.
    pub fn name(&self) -> &str {
        match self {
            Self::Create(key) | Self::Update(key) | Self::Delete(key) => &key.name,
            Self::UpdateBundle(bundle) | Self::UpdateBundleStatus(bundle) => &bundle.name,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<ObjectKey, Object>,
    bundles: BTreeMap<BundleRef, Bundle>,
    actions: Vec<StoreAction>,
    failures: HashMap<String, VecDeque<StoreError>>,
    status_failures: VecDeque<StoreError>,
    revision: u64,
}

impl State {
    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }

    fn take_failure(&mut self, name: &str) -> Option<StoreError> {
        self.failures.get_mut(name).and_then(VecDeque::pop_front)
    }

    fn stamp_new(&mut self, meta: &mut crate::types::ObjectMeta) {
        let revision = self.next_revision();
        if meta.uid.is_none() {
            meta.uid = Some(format!("uid-{revision}"));
        }
        meta.resource_version = Some(revision);
        meta.generation = Some(meta.generation.unwrap_or(1));
    }
}

fn check_version(expected: Option<&str>, current: Option<&str>, what: &str) -> Result<(), StoreError> {
    match expected {
        Some(expected) if Some(expected) != current => Err(StoreError::Conflict(format!(
            "{what} has resourceVersion {current:?}, write expected {expected:?}"
        ))),
        _ => Ok(()),
    }
}

fn without_status(body: &serde_json::Map<String, Value>) -> serde_json::Map<String, Value> {
    body.iter()
        .filter(|(k, _)| k.as_str() != "status")
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Shared in-memory implementation of [`ObjectCache`] and [`ObjectStore`].
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Put a bundle straight into the store, as if a user created it.
    pub fn insert_bundle(&self, mut bundle: Bundle) -> Bundle {
        let mut state = self.write();
        state.stamp_new(&mut bundle.metadata);
        state.bundles.insert(bundle.bundle_ref(), bundle.clone());
        bundle
    }

    /// Put an object into the store, as if another actor created it.
    pub fn insert_object(&self, mut object: Object) -> Object {
        let mut state = self.write();
        state.stamp_new(&mut object.metadata);
        state.objects.insert(object.key(), object.clone());
        object
    }

    /// Replace the `status` of a stored object, as its own controller would.
    pub fn set_object_status(&self, key: &ObjectKey, status: Value) -> Option<Object> {
        let mut state = self.write();
        let revision = state.next_revision();
        let object = state.objects.get_mut(key)?;
        object.body.insert("status".to_string(), status);
        object.metadata.resource_version = Some(revision);
        Some(object.clone())
    }

    /// Set a field of a stored object's body.
    pub fn set_object_field(&self, key: &ObjectKey, field: &str, value: Value) -> Option<Object> {
        let mut state = self.write();
        let revision = state.next_revision();
        let object = state.objects.get_mut(key)?;
        object.body.insert(field.to_string(), value);
        object.metadata.resource_version = Some(revision);
        Some(object.clone())
    }

    /// Replace a bundle's resources, bumping its generation.
    pub fn replace_bundle_spec(&self, bundle: &BundleRef, spec: crate::types::BundleSpec) -> Option<Bundle> {
        let mut state = self.write();
        let revision = state.next_revision();
        let stored = state.bundles.get_mut(bundle)?;
        stored.spec = spec;
        stored.metadata.generation = Some(stored.metadata.generation.unwrap_or(0) + 1);
        stored.metadata.resource_version = Some(revision);
        Some(stored.clone())
    }

    /// Start deleting a bundle. It stays stored until its finalizers are gone.
    pub fn mark_bundle_deleted(&self, bundle: &BundleRef) -> Option<Bundle> {
        let mut state = self.write();
        let revision = state.next_revision();
        let stored = state.bundles.get_mut(bundle)?;
        stored.metadata.deletion_timestamp = Some(Utc::now());
        stored.metadata.resource_version = Some(revision);
        let snapshot = stored.clone();
        if snapshot.metadata.finalizers.is_empty() {
            state.bundles.remove(bundle);
        }
        Some(snapshot)
    }

    /// Fail the next create, update or delete of the object named `name`.
    pub fn fail_next(&self, name: impl Into<String>, err: StoreError) {
        self.write().failures.entry(name.into()).or_default().push_back(err);
    }

    /// Fail the next bundle status update.
    pub fn fail_status_update(&self, err: StoreError) {
        self.write().status_failures.push_back(err);
    }

    /// Every store call so far, in order.
    pub fn actions(&self) -> Vec<StoreAction> {
        self.read().actions.clone()
    }

    pub fn clear_actions(&self) {
        self.write().actions.clear();
    }

    pub fn object(&self, key: &ObjectKey) -> Option<Object> {
        self.read().objects.get(key).cloned()
    }

    pub fn objects(&self) -> Vec<Object> {
        self.read().objects.values().cloned().collect()
    }
}

impl ObjectCache for InMemoryStore {
    fn get(&self, group_kind: &GroupKind, namespace: &str, name: &str) -> Option<Object> {
        let key = ObjectKey {
            group_kind: group_kind.clone(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        };
        self.read().objects.get(&key).cloned()
    }

    fn get_bundle(&self, bundle: &BundleRef) -> Option<Bundle> {
        self.read().bundles.get(bundle).cloned()
    }

    fn controlled_by(&self, namespace: &str, uid: &str) -> Vec<Object> {
        self.read()
            .objects
            .values()
            .filter(|o| o.namespace() == namespace)
            .filter(|o| o.metadata.controller_ref().is_some_and(|owner| owner.uid == uid))
            .cloned()
            .collect()
    }

    fn bundles(&self) -> Vec<BundleRef> {
        self.read().bundles.keys().cloned().collect()
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn create(&self, mut object: Object) -> Result<Object, StoreError> {
        let mut state = self.write();
        let key = object.key();
        state.actions.push(StoreAction::Create(key.clone()));
        if let Some(err) = state.take_failure(&key.name) {
            return Err(err);
        }
        if state.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }
        object.metadata.uid = None;
        object.metadata.generation = None;
        state.stamp_new(&mut object.metadata);
        state.objects.insert(key, object.clone());
        Ok(object)
    }

    async fn update(&self, mut object: Object) -> Result<Object, StoreError> {
        let mut state = self.write();
        let key = object.key();
        state.actions.push(StoreAction::Update(key.clone()));
        if let Some(err) = state.take_failure(&key.name) {
            return Err(err);
        }
        let current = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        check_version(
            object.metadata.resource_version.as_deref(),
            current.metadata.resource_version.as_deref(),
            &key.to_string(),
        )?;

        let generation = current.metadata.generation.unwrap_or(1);
        object.metadata.generation = Some(
            if without_status(&object.body) == without_status(&current.body) {
                generation
            } else {
                generation + 1
            },
        );
        object.metadata.uid = current.metadata.uid;
        object.metadata.resource_version = Some(state.next_revision());
        // status belongs to the object's own controller
        match current.body.get("status") {
            Some(status) => object.body.insert("status".to_string(), status.clone()),
            None => object.body.remove("status"),
        };
        state.objects.insert(key, object.clone());
        Ok(object)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let mut state = self.write();
        state.actions.push(StoreAction::Delete(key.clone()));
        if let Some(err) = state.take_failure(&key.name) {
            return Err(err);
        }
        state
            .objects
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn update_bundle(&self, mut bundle: Bundle) -> Result<Bundle, StoreError> {
        let mut state = self.write();
        let bundle_ref = bundle.bundle_ref();
        state.actions.push(StoreAction::UpdateBundle(bundle_ref.clone()));
        let current = state
            .bundles
            .get(&bundle_ref)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(bundle_ref.to_string()))?;
        check_version(
            bundle.metadata.resource_version.as_deref(),
            current.metadata.resource_version.as_deref(),
            &format!("bundle {bundle_ref}"),
        )?;

        bundle.metadata.uid = current.metadata.uid.clone();
        bundle.metadata.deletion_timestamp = current.metadata.deletion_timestamp;
        bundle.metadata.generation = current.metadata.generation;
        bundle.status = current.status;
        if bundle.spec != current.spec {
            bundle.metadata.generation = Some(current.metadata.generation.unwrap_or(0) + 1);
        }
        bundle.metadata.resource_version = Some(state.next_revision());

        if bundle.is_deleting() && bundle.metadata.finalizers.is_empty() {
            state.bundles.remove(&bundle_ref);
        } else {
            state.bundles.insert(bundle_ref, bundle.clone());
        }
        Ok(bundle)
    }

    async fn update_bundle_status(&self, bundle: Bundle) -> Result<Bundle, StoreError> {
        let mut state = self.write();
        let bundle_ref = bundle.bundle_ref();
        state.actions.push(StoreAction::UpdateBundleStatus(bundle_ref.clone()));
        if let Some(err) = state.status_failures.pop_front() {
            return Err(err);
        }
        let revision = state.next_revision();
        let stored = state
            .bundles
            .get_mut(&bundle_ref)
            .ok_or_else(|| StoreError::NotFound(bundle_ref.to_string()))?;
        check_version(
            bundle.metadata.resource_version.as_deref(),
            stored.metadata.resource_version.as_deref(),
            &format!("bundle {bundle_ref}"),
        )?;
        stored.status = bundle.status;
        stored.metadata.resource_version = Some(revision);
        Ok(stored.clone())
    }
}
