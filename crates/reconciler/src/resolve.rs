//! Spec resolution: turns a resource declaration into the object to apply.
//!
//! Steps, in order:
//! 1. read every reference from the applied objects of direct dependencies
//! 2. substitute `!{name}` placeholders (or run the plugin)
//! 3. stamp namespace, controller owner reference and bundle label
//! 4. run the per-kind object processor

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::debug;

use crate::error::ReconcileError;
use crate::plugin::{PluginContext, PluginRegistry, ProcessResult};
use crate::processor::{ProcessError, ProcessorRegistry};
use crate::types::{Bundle, Object, PluginSpec, Resource, ResourceName, ResourceSpec, BUNDLE_NAME_LABEL};

const PLACEHOLDER_OPEN: &str = "!{";
const PLACEHOLDER_CLOSE: char = '}';

pub struct SpecResolver {
    processors: Arc<ProcessorRegistry>,
    plugins: Arc<PluginRegistry>,
    plugin_timeout: Duration,
}

impl SpecResolver {
    pub fn new(processors: Arc<ProcessorRegistry>, plugins: Arc<PluginRegistry>, plugin_timeout: Duration) -> Self {
        Self {
            processors,
            plugins,
            plugin_timeout,
        }
    }

    /// Produce the desired object for `resource`.
    ///
    /// `outputs` maps each direct dependency to its applied object; nothing
    /// else is visible to the resource.
    pub async fn resolve(
        &self,
        bundle: &Bundle,
        resource: &Resource,
        outputs: &HashMap<ResourceName, Object>,
    ) -> Result<Object, ReconcileError> {
        let values = reference_values(resource, outputs)?;

        let object = match &resource.spec {
            ResourceSpec::Object(template) => {
                let raw = serde_json::to_value(template)
                    .map_err(|e| ReconcileError::schema(format!("template does not serialize: {e}")))?;
                let substituted = substitute(raw, &values)?;
                serde_json::from_value(substituted)
                    .map_err(|e| ReconcileError::schema(format!("substituted template is not an object: {e}")))?
            }
            ResourceSpec::Plugin(plugin) => {
                let spec = substitute(plugin.spec.clone(), &values)?;
                self.run_plugin(bundle, plugin, spec, outputs).await?
            }
        };

        let object = stamp_ownership(bundle, object)?;
        self.processors.process(object).map_err(|e| match e {
            ProcessError::Invalid(violations) => ReconcileError::schema(violations.join("; ")),
            ProcessError::Lookup(reason) => ReconcileError::Catalog { reason },
        })
    }

    async fn run_plugin(
        &self,
        bundle: &Bundle,
        invocation: &PluginSpec,
        spec: Value,
        outputs: &HashMap<ResourceName, Object>,
    ) -> Result<Object, ReconcileError> {
        let container = self
            .plugins
            .get(&invocation.name)
            .ok_or_else(|| ReconcileError::UnknownPlugin {
                plugin: invocation.name.clone(),
            })?;

        let violations = container.validate_spec(&spec);
        if !violations.is_empty() {
            return Err(ReconcileError::schema(violations.join("; ")));
        }

        let context = PluginContext {
            bundle: bundle.bundle_ref(),
            object_name: invocation.object_name.clone(),
            spec,
            dependencies: outputs.clone(),
        };
        let plugin = Arc::clone(&container.plugin);
        let mut handle = tokio::spawn(async move { plugin.process(context).await });

        debug!(plugin = %invocation.name, bundle = %bundle.bundle_ref(), "Running plugin");
        let joined = match tokio::time::timeout(self.plugin_timeout, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                handle.abort();
                return Err(ReconcileError::plugin_execution(
                    &invocation.name,
                    format!("timed out after {:?}", self.plugin_timeout),
                ));
            }
        };

        let result = joined
            .map_err(|e| ReconcileError::plugin_execution(&invocation.name, format!("task failed: {e}")))?
            .map_err(|e| ReconcileError::plugin_execution(&invocation.name, e.to_string()))?;

        let object = match result {
            ProcessResult::Success(object) => object,
            ProcessResult::Failure(reason) => {
                return Err(ReconcileError::PluginSpec {
                    plugin: invocation.name.clone(),
                    reason,
                })
            }
        };

        let declared = &container.description;
        if object.kind != declared.kind || object.api_version != declared.api_version {
            return Err(ReconcileError::PluginSpec {
                plugin: invocation.name.clone(),
                reason: format!(
                    "produced {}/{}, declared {}/{}",
                    object.api_version, object.kind, declared.api_version, declared.kind
                ),
            });
        }

        let mut object = object;
        if object.metadata.name.is_empty() {
            object.metadata.name = invocation.object_name.clone();
        }
        Ok(object)
    }
}

/// Read the value of every declared reference.
fn reference_values(
    resource: &Resource,
    outputs: &HashMap<ResourceName, Object>,
) -> Result<HashMap<String, Value>, ReconcileError> {
    resource
        .references
        .iter()
        .map(|reference| {
            if !resource.depends_on.contains(&reference.resource) {
                return Err(ReconcileError::reference(format!(
                    "reference {:?} points at {:?} which is not a dependency",
                    reference.name, reference.resource
                )));
            }
            let object = outputs.get(&reference.resource).ok_or_else(|| {
                ReconcileError::reference(format!(
                    "reference {:?}: resource {:?} has no applied object",
                    reference.name, reference.resource
                ))
            })?;
            let value = object.field(&reference.path).ok_or_else(|| {
                ReconcileError::reference(format!(
                    "reference {:?}: field {:?} not found in resource {:?}",
                    reference.name, reference.path, reference.resource
                ))
            })?;
            Ok((reference.name.clone(), value))
        })
        .collect()
}

/// Replace placeholders in every string of `value`.
///
/// A string that is exactly one placeholder takes the referenced value as is;
/// placeholders inside longer strings must resolve to scalars.
pub fn substitute(value: Value, values: &HashMap<String, Value>) -> Result<Value, ReconcileError> {
    match value {
        Value::String(s) => substitute_str(&s, values),
        Value::Array(items) => items
            .into_iter()
            .map(|item| substitute(item, values))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .into_iter()
            .map(|(k, v)| substitute(v, values).map(|v| (k, v)))
            .collect::<Result<Map<_, _>, _>>()
            .map(Value::Object),
        other => Ok(other),
    }
}

fn lookup<'v>(name: &str, values: &'v HashMap<String, Value>) -> Result<&'v Value, ReconcileError> {
    values
        .get(name)
        .ok_or_else(|| ReconcileError::reference(format!("placeholder {name:?} does not name a reference")))
}

fn substitute_str(s: &str, values: &HashMap<String, Value>) -> Result<Value, ReconcileError> {
    if let Some(name) = s
        .strip_prefix(PLACEHOLDER_OPEN)
        .and_then(|rest| rest.strip_suffix(PLACEHOLDER_CLOSE))
        .filter(|name| !name.contains(PLACEHOLDER_CLOSE))
    {
        return lookup(name, values).cloned();
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find(PLACEHOLDER_OPEN) {
        out.push_str(&rest[..start]);
        let after = &rest[start + PLACEHOLDER_OPEN.len()..];
        let Some(end) = after.find(PLACEHOLDER_CLOSE) else {
            return Err(ReconcileError::reference(format!("unterminated placeholder in {s:?}")));
        };
        let name = &after[..end];
        match lookup(name, values)? {
            Value::String(text) => out.push_str(text),
            scalar @ (Value::Number(_) | Value::Bool(_)) => out.push_str(&scalar.to_string()),
            _ => {
                return Err(ReconcileError::reference(format!(
                    "placeholder {name:?} inside {s:?} must resolve to a string, number or boolean"
                )))
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

fn stamp_ownership(bundle: &Bundle, mut object: Object) -> Result<Object, ReconcileError> {
    if object.metadata.name.is_empty() {
        return Err(ReconcileError::schema("metadata.name: required"));
    }
    let namespace = bundle.metadata.namespace.clone().unwrap_or_default();
    match object.metadata.namespace.as_deref() {
        None | Some("") => object.metadata.namespace = Some(namespace),
        Some(ns) if ns == namespace => {}
        Some(ns) => {
            return Err(ReconcileError::schema(format!(
                "metadata.namespace: {ns:?} differs from the bundle namespace {namespace:?}"
            )))
        }
    }

    let owner = bundle.owner_reference();
    object
        .metadata
        .owner_references
        .retain(|r| r.controller != Some(true) && r.uid != owner.uid);
    object.metadata.owner_references.push(owner);
    object
        .metadata
        .labels
        .insert(BUNDLE_NAME_LABEL.to_string(), bundle.metadata.name.clone());
    Ok(object)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::plugin::{Plugin, PluginDescription, PluginError};
    use async_trait::async_trait;
    use serde_json::json;

    fn values() -> HashMap<String, Value> {
        HashMap::from([
            ("host".to_string(), json!("db.local")),
            ("port".to_string(), json!(5432)),
            ("ports".to_string(), json!([1, 2])),
        ])
    }

    #[test]
    fn test_exact_placeholder_keeps_json_type() {
        assert_eq!(substitute(json!("!{port}"), &values()).unwrap(), json!(5432));
        assert_eq!(substitute(json!("!{ports}"), &values()).unwrap(), json!([1, 2]));
    }

    #[test]
    fn test_embedded_placeholder_splices_text() {
        let value = substitute(json!({"url": ["postgres://!{host}:!{port}/app"]}), &values()).unwrap();
        assert_eq!(value, json!({"url": ["postgres://db.local:5432/app"]}));
    }

    #[test]
    fn test_embedded_placeholder_rejects_non_scalar() {
        let err = substitute(json!("ports=!{ports}"), &values()).unwrap_err();
        assert!(matches!(err, ReconcileError::ReferenceResolution { .. }));
    }

    #[test]
    fn test_unknown_placeholder_is_reference_error() {
        let err = substitute(json!("!{missing}"), &values()).unwrap_err();
        assert!(matches!(err, ReconcileError::ReferenceResolution { .. }));
        assert!(err.is_external());
        assert!(!err.is_retriable());
    }

    fn bundle() -> Bundle {
        let mut bundle = Bundle::new("ns", "app", Vec::new());
        bundle.metadata.uid = Some("bundle-uid".to_string());
        bundle
    }

    fn resolver(plugins: PluginRegistry, timeout: Duration) -> SpecResolver {
        SpecResolver::new(
            Arc::new(ProcessorRegistry::with_builtins(None).unwrap()),
            Arc::new(plugins),
            timeout,
        )
    }

    #[tokio::test]
    async fn test_resolve_reads_dependency_field_and_stamps_owner() {
        let template = Object::new("v1", "ConfigMap", "settings").with_field("data", json!({"url": "http://!{host}"}));
        let resource = Resource::object("settings", template)
            .depends_on("db")
            .with_reference("host", "db", "status.host");
        let db = Object::new("v1", "Service", "db").with_field("status", json!({"host": "10.0.0.1"}));
        let outputs = HashMap::from([("db".to_string(), db)]);

        let object = resolver(PluginRegistry::default(), Duration::from_secs(1))
            .resolve(&bundle(), &resource, &outputs)
            .await
            .unwrap();

        assert_eq!(object.field("data.url"), Some(json!("http://10.0.0.1")));
        assert_eq!(object.namespace(), "ns");
        assert_eq!(object.metadata.labels.get(BUNDLE_NAME_LABEL).map(String::as_str), Some("app"));
        assert!(bundle().controls(&object));
    }

    #[tokio::test]
    async fn test_missing_field_is_terminal_reference_error() {
        let resource = Resource::object("b", Object::new("v1", "ConfigMap", "b").with_field("data", json!({"x": "!{x}"})))
            .depends_on("a")
            .with_reference("x", "a", "status.absent");
        let outputs = HashMap::from([("a".to_string(), Object::new("v1", "ConfigMap", "a"))]);

        let err = resolver(PluginRegistry::default(), Duration::from_secs(1))
            .resolve(&bundle(), &resource, &outputs)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::ReferenceResolution { .. }));
    }

    #[tokio::test]
    async fn test_reference_to_non_dependency_rejected() {
        let resource = Resource::object("b", Object::new("v1", "ConfigMap", "b")).with_reference("x", "a", "metadata.name");
        let outputs = HashMap::from([("a".to_string(), Object::new("v1", "ConfigMap", "a"))]);
        let err = resolver(PluginRegistry::default(), Duration::from_secs(1))
            .resolve(&bundle(), &resource, &outputs)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::ReferenceResolution { .. }));
    }

    struct Sleepy;

    #[async_trait]
    impl Plugin for Sleepy {
        fn describe(&self) -> PluginDescription {
            PluginDescription {
                name: "sleepy".to_string(),
                api_version: "v1".to_string(),
                kind: "ConfigMap".to_string(),
                spec_schema: Some(json!({"type": "object", "properties": {"fail": {"type": "boolean"}}})),
            }
        }

        async fn process(&self, context: PluginContext) -> Result<ProcessResult, PluginError> {
            if context.spec.get("fail") == Some(&json!(true)) {
                return Ok(ProcessResult::Failure("cannot build".to_string()));
            }
            if context.spec.get("wrongKind") == Some(&json!(true)) {
                return Ok(ProcessResult::Success(Object::new("v1", "Secret", context.object_name)));
            }
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(ProcessResult::Success(Object::new("v1", "ConfigMap", context.object_name)))
        }
    }

    fn plugin_resource(spec: Value) -> Resource {
        Resource::plugin(
            "generated",
            PluginSpec {
                name: "sleepy".to_string(),
                object_name: "generated".to_string(),
                spec,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_plugin_timeout_is_retriable_internal() {
        let plugins = PluginRegistry::new(vec![Arc::new(Sleepy)]).unwrap();
        let err = resolver(plugins, Duration::from_millis(100))
            .resolve(&bundle(), &plugin_resource(json!({})), &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::PluginExecution { .. }));
        assert!(err.is_retriable());
        assert!(!err.is_external());
    }

    #[tokio::test]
    async fn test_plugin_failure_and_schema_errors_are_terminal() {
        let plugins = PluginRegistry::new(vec![Arc::new(Sleepy)]).unwrap();
        let resolver = resolver(plugins, Duration::from_secs(1));

        let failure = resolver
            .resolve(&bundle(), &plugin_resource(json!({"fail": true})), &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(failure, ReconcileError::PluginSpec { .. }));

        let invalid = resolver
            .resolve(&bundle(), &plugin_resource(json!({"fail": "yes"})), &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(invalid, ReconcileError::SchemaValidation { .. }));
    }

    #[tokio::test]
    async fn test_plugin_producing_undeclared_kind_is_terminal() {
        let plugins = PluginRegistry::new(vec![Arc::new(Sleepy)]).unwrap();
        let err = resolver(plugins, Duration::from_secs(1))
            .resolve(&bundle(), &plugin_resource(json!({"wrongKind": true})), &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::PluginSpec { ref reason, .. } if reason.contains("v1/Secret")));
        assert!(err.is_external());
        assert!(!err.is_retriable());
    }

    #[tokio::test]
    async fn test_unknown_plugin_rejected() {
        let err = resolver(PluginRegistry::default(), Duration::from_secs(1))
            .resolve(&bundle(), &plugin_resource(json!({})), &HashMap::new())
            .await
            .unwrap_err();
        assert_eq!(err, ReconcileError::UnknownPlugin { plugin: "sleepy".to_string() });
    }
}
