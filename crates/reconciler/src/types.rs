//! Core types for the reconciler.
//!
//! Objects are kept unstructured: a typed envelope (`apiVersion`, `kind`,
//! `metadata`) around a free-form JSON body. Bundles and their resources are
//! typed since the engine interprets every field of them.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::status::BundleStatus;

/// API version of the Bundle type.
pub const BUNDLE_API_VERSION: &str = "keystone.io/v1";

/// Kind of the Bundle type.
pub const BUNDLE_KIND: &str = "Bundle";

/// Finalizer kept on a Bundle until every object it owns has been removed.
pub const FINALIZER_DELETE_RESOURCES: &str = "keystone.io/deleteResources";

/// Label stamped on every object produced for a Bundle.
pub const BUNDLE_NAME_LABEL: &str = "keystone.io/bundle";

/// Name of a resource, unique within its Bundle.
pub type ResourceName = String;

/// Name of a registered plugin.
pub type PluginName = String;

/// API group plus kind. Every per-kind registry is keyed by this.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKind {
    pub group: String,
    pub kind: String,
}

impl GroupKind {
    pub fn new(group: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            kind: kind.into(),
        }
    }

    /// Derive the group kind from an `apiVersion` such as `apps/v1` or `v1`.
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        let group = api_version
            .split_once('/')
            .map(|(group, _)| group)
            .unwrap_or_default();
        Self::new(group, kind)
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}.{}", self.kind, self.group)
        }
    }
}

/// Reference from an object to the object that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_owner_deletion: Option<bool>,
}

/// Object metadata. `uid`, `resourceVersion`, `generation` and
/// `deletionTimestamp` are managed by the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
}

impl ObjectMeta {
    /// Metadata with just a name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// The owner reference marked as controller, if any.
    pub fn controller_ref(&self) -> Option<&OwnerReference> {
        self.owner_references
            .iter()
            .find(|owner| owner.controller == Some(true))
    }
}

/// Unstructured external object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Object {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Everything else: `spec`, `data`, `status`, ...
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl Object {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            metadata: ObjectMeta::named(name),
            body: Map::new(),
        }
    }

    /// Builder-style body field setter.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.body.insert(key.into(), value);
        self
    }

    pub fn group_kind(&self) -> GroupKind {
        GroupKind::from_api_version(&self.api_version, &self.kind)
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or_default()
    }

    /// Identity of this object in the store.
    pub fn key(&self) -> ObjectKey {
        ObjectKey {
            group_kind: self.group_kind(),
            namespace: self.namespace().to_string(),
            name: self.metadata.name.clone(),
        }
    }

    /// JSON form of the whole object.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Look up a dotted field path such as `status.host` or `spec.ports.0.port`.
    pub fn field(&self, path: &str) -> Option<Value> {
        let value = self.to_value();
        lookup_path(&value, path).cloned()
    }

    /// `status` body field, if present.
    pub fn status(&self) -> Option<&Map<String, Value>> {
        self.body.get("status").and_then(Value::as_object)
    }

    /// `spec` body field, if present.
    pub fn spec(&self) -> Option<&Map<String, Value>> {
        self.body.get("spec").and_then(Value::as_object)
    }
}

/// Walk a dotted path through a JSON value. Numeric segments index arrays.
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(value, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

/// Identity of an object in the store: group kind, namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub group_kind: GroupKind,
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.group_kind, self.namespace, self.name)
    }
}

/// Identity of a Bundle: namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BundleRef {
    pub namespace: String,
    pub name: String,
}

impl BundleRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for BundleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Placeholder that reads a field of a direct dependency's applied object.
///
/// `!{name}` anywhere in the resource template is replaced by the value found
/// at `path` in the applied object of `resource`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reference {
    pub name: String,
    pub resource: ResourceName,
    pub path: String,
}

/// Plugin invocation producing the resource's object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginSpec {
    pub name: PluginName,
    pub object_name: String,
    #[serde(default)]
    pub spec: Value,
}

/// Either a literal object template or a plugin invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceSpec {
    Object(Object),
    Plugin(PluginSpec),
}

/// One node of a Bundle's dependency graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub name: ResourceName,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<ResourceName>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<Reference>,
    pub spec: ResourceSpec,
}

impl Resource {
    /// A resource with a literal object template.
    pub fn object(name: impl Into<ResourceName>, object: Object) -> Self {
        Self {
            name: name.into(),
            depends_on: Vec::new(),
            references: Vec::new(),
            spec: ResourceSpec::Object(object),
        }
    }

    /// A resource produced by a plugin.
    pub fn plugin(name: impl Into<ResourceName>, plugin: PluginSpec) -> Self {
        Self {
            name: name.into(),
            depends_on: Vec::new(),
            references: Vec::new(),
            spec: ResourceSpec::Plugin(plugin),
        }
    }

    #[must_use]
    pub fn depends_on(mut self, dependency: impl Into<ResourceName>) -> Self {
        self.depends_on.push(dependency.into());
        self
    }

    #[must_use]
    pub fn with_reference(
        mut self,
        name: impl Into<String>,
        resource: impl Into<ResourceName>,
        path: impl Into<String>,
    ) -> Self {
        self.references.push(Reference {
            name: name.into(),
            resource: resource.into(),
            path: path.into(),
        });
        self
    }
}

/// Desired set of resources of a Bundle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleSpec {
    #[serde(default)]
    pub resources: Vec<Resource>,
}

fn bundle_api_version() -> String {
    BUNDLE_API_VERSION.to_string()
}

fn bundle_kind() -> String {
    BUNDLE_KIND.to_string()
}

/// User-declared set of interdependent resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    #[serde(default = "bundle_api_version")]
    pub api_version: String,
    #[serde(default = "bundle_kind")]
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: BundleSpec,
    #[serde(default)]
    pub status: BundleStatus,
}

impl Bundle {
    /// A bundle carrying the cleanup finalizer.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, resources: Vec<Resource>) -> Self {
        Self {
            api_version: bundle_api_version(),
            kind: bundle_kind(),
            metadata: ObjectMeta {
                name: name.into(),
                namespace: Some(namespace.into()),
                finalizers: vec![FINALIZER_DELETE_RESOURCES.to_string()],
                ..ObjectMeta::default()
            },
            spec: BundleSpec { resources },
            status: BundleStatus::default(),
        }
    }

    pub fn bundle_ref(&self) -> BundleRef {
        BundleRef::new(
            self.metadata.namespace.clone().unwrap_or_default(),
            self.metadata.name.clone(),
        )
    }

    pub fn uid(&self) -> &str {
        self.metadata.uid.as_deref().unwrap_or_default()
    }

    pub fn has_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .iter()
            .any(|f| f == FINALIZER_DELETE_RESOURCES)
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Controller owner reference pointing at this bundle.
    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            name: self.metadata.name.clone(),
            uid: self.uid().to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    /// Whether `object` is controlled by this bundle.
    pub fn controls(&self, object: &Object) -> bool {
        object
            .metadata
            .controller_ref()
            .is_some_and(|owner| owner.kind == self.kind && owner.uid == self.uid())
    }
}
