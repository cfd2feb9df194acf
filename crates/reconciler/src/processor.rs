//! Per-kind object processors.
//!
//! A processor checks and normalises a resolved object before it is applied.
//! Kinds without a processor pass through unchanged.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;

use crate::catalog::{PlanReference, ServiceCatalog};
use crate::error::RegistryError;
use crate::schema;
use crate::types::{GroupKind, Object};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessError {
    /// Constraint violations in the object itself.
    #[error("{}", .0.join("; "))]
    Invalid(Vec<String>),

    /// A collaborator lookup failed; worth retrying.
    #[error("{0}")]
    Lookup(String),
}

impl ProcessError {
    pub fn invalid(violation: impl Into<String>) -> Self {
        Self::Invalid(vec![violation.into()])
    }
}

pub trait ObjectProcessor: Send + Sync {
    fn process(&self, object: Object) -> Result<Object, ProcessError>;
}

/// Processors keyed by group kind. Built once at startup.
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    processors: HashMap<GroupKind, Arc<dyn ObjectProcessor>>,
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("kinds", &self.processors.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in processors. `ServiceInstance` is only
    /// covered when a catalog is given.
    pub fn with_builtins(catalog: Option<Arc<dyn ServiceCatalog>>) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        registry.register(GroupKind::new("", "ConfigMap"), Arc::new(StringDataProcessor::config_map()))?;
        registry.register(GroupKind::new("", "Secret"), Arc::new(StringDataProcessor::secret()))?;
        registry.register(GroupKind::new("apps", "Deployment"), Arc::new(DeploymentProcessor))?;
        if let Some(catalog) = catalog {
            registry.register(
                GroupKind::new("servicecatalog.k8s.io", "ServiceInstance"),
                Arc::new(ServiceInstanceProcessor::new(catalog)),
            )?;
        }
        Ok(registry)
    }

    pub fn register(
        &mut self,
        kind: GroupKind,
        processor: Arc<dyn ObjectProcessor>,
    ) -> Result<(), RegistryError> {
        if self.processors.contains_key(&kind) {
            return Err(RegistryError::DuplicateProcessor { kind });
        }
        self.processors.insert(kind, processor);
        Ok(())
    }

    pub fn process(&self, object: Object) -> Result<Object, ProcessError> {
        match self.processors.get(&object.group_kind()) {
            Some(processor) => processor.process(object),
            None => Ok(object),
        }
    }
}

/// `ConfigMap` and `Secret`: every value under the data fields must be a string.
#[derive(Debug)]
pub struct StringDataProcessor {
    fields: &'static [&'static str],
}

impl StringDataProcessor {
    pub const fn config_map() -> Self {
        Self { fields: &["data"] }
    }

    pub const fn secret() -> Self {
        Self {
            fields: &["data", "stringData"],
        }
    }
}

impl ObjectProcessor for StringDataProcessor {
    fn process(&self, object: Object) -> Result<Object, ProcessError> {
        let mut violations = Vec::new();
        for field in self.fields {
            match object.body.get(*field) {
                None | Some(Value::Null) => {}
                Some(Value::Object(entries)) => violations.extend(
                    entries
                        .iter()
                        .filter(|(_, v)| !v.is_string())
                        .map(|(k, v)| format!("{field}.{k}: expected string, given {}", type_name(v))),
                ),
                Some(other) => violations.push(format!("{field}: expected object, given {}", type_name(other))),
            }
        }
        if violations.is_empty() {
            Ok(object)
        } else {
            Err(ProcessError::Invalid(violations))
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// `Deployment`: requires a pod template, defaults replicas to 1.
#[derive(Debug)]
pub struct DeploymentProcessor;

impl ObjectProcessor for DeploymentProcessor {
    fn process(&self, mut object: Object) -> Result<Object, ProcessError> {
        let spec = object
            .body
            .get_mut("spec")
            .and_then(Value::as_object_mut)
            .ok_or_else(|| ProcessError::invalid("spec: required"))?;

        if !spec.get("template").is_some_and(Value::is_object) {
            return Err(ProcessError::invalid("spec.template: required"));
        }
        match spec.get("replicas") {
            None | Some(Value::Null) => {
                spec.insert("replicas".to_string(), json!(1));
            }
            Some(Value::Number(n)) if n.as_u64().is_some() => {}
            Some(other) => {
                return Err(ProcessError::invalid(format!(
                    "spec.replicas: expected non-negative integer, given {}",
                    type_name(other)
                )))
            }
        }
        Ok(object)
    }
}

/// `ServiceInstance`: parameters must satisfy the plan's schema.
pub struct ServiceInstanceProcessor {
    catalog: Arc<dyn ServiceCatalog>,
}

impl ServiceInstanceProcessor {
    pub fn new(catalog: Arc<dyn ServiceCatalog>) -> Self {
        Self { catalog }
    }
}

impl ObjectProcessor for ServiceInstanceProcessor {
    fn process(&self, object: Object) -> Result<Object, ProcessError> {
        let spec = object
            .spec()
            .ok_or_else(|| ProcessError::invalid("spec: required"))?;
        let reference = PlanReference::from_spec(spec).map_err(ProcessError::invalid)?;
        let plan = self
            .catalog
            .find_plan(&reference)
            .map_err(|e| ProcessError::Lookup(e.to_string()))?;

        let Some(plan_schema) = plan.parameters_schema.as_ref() else {
            return Ok(object);
        };
        let validator = schema::compile(plan_schema)
            .map_err(|e| ProcessError::Lookup(format!("plan {:?} has an invalid schema: {e}", plan.external_name)))?;

        let parameters = spec.get("parameters").cloned().unwrap_or_else(|| json!({}));
        let violations = schema::violations(&validator, &parameters);
        if violations.is_empty() {
            Ok(object)
        } else {
            Err(ProcessError::Invalid(violations))
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::panic)]

    use super::*;
    use crate::catalog::{InMemoryCatalog, ServicePlan};

    fn registry() -> ProcessorRegistry {
        let catalog = InMemoryCatalog::new(vec![ServicePlan {
            class_external_name: "database".to_string(),
            class_external_id: "class-1".to_string(),
            external_name: "small".to_string(),
            external_id: "plan-1".to_string(),
            parameters_schema: Some(json!({
                "type": "object",
                "properties": {"testSchema": {"type": "boolean"}}
            })),
        }]);
        ProcessorRegistry::with_builtins(Some(Arc::new(catalog))).unwrap()
    }

    fn instance(parameters: Value) -> Object {
        Object::new("servicecatalog.k8s.io/v1beta1", "ServiceInstance", "si").with_field(
            "spec",
            json!({
                "clusterServiceClassExternalID": "class-1",
                "clusterServicePlanExternalID": "plan-1",
                "parameters": parameters
            }),
        )
    }

    #[test]
    fn test_config_map_rejects_non_string_values() {
        let object = Object::new("v1", "ConfigMap", "cm").with_field("data", json!({"a": "ok", "b": 3}));
        let err = registry().process(object).unwrap_err();
        assert_eq!(
            err,
            ProcessError::Invalid(vec!["data.b: expected string, given number".to_string()])
        );
    }

    #[test]
    fn test_deployment_defaults_replicas() {
        let object = Object::new("apps/v1", "Deployment", "web")
            .with_field("spec", json!({"template": {"spec": {}}}));
        let processed = registry().process(object).unwrap();
        assert_eq!(processed.field("spec.replicas"), Some(json!(1)));
    }

    #[test]
    fn test_deployment_requires_template() {
        let object = Object::new("apps/v1", "Deployment", "web").with_field("spec", json!({}));
        assert_eq!(
            registry().process(object).unwrap_err(),
            ProcessError::invalid("spec.template: required")
        );
    }

    #[test]
    fn test_service_instance_parameters_checked_against_plan() {
        assert!(registry().process(instance(json!({"testSchema": true}))).is_ok());

        let err = registry().process(instance(json!({"testSchema": "invalid"}))).unwrap_err();
        match err {
            ProcessError::Invalid(violations) => {
                assert_eq!(violations.len(), 1);
                assert!(violations[0].starts_with("testSchema: "), "{violations:?}");
            }
            other => panic!("expected invalid parameters, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_plan_is_lookup_error() {
        let mut object = instance(json!({}));
        object.body.insert(
            "spec".to_string(),
            json!({"clusterServiceClassExternalID": "class-1", "clusterServicePlanExternalID": "nope"}),
        );
        assert!(matches!(registry().process(object), Err(ProcessError::Lookup(_))));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = registry();
        let err = registry
            .register(GroupKind::new("apps", "Deployment"), Arc::new(DeploymentProcessor))
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateProcessor { .. }));
    }

    #[test]
    fn test_unknown_kind_passes_through() {
        let object = Object::new("example.com/v1", "Widget", "w").with_field("spec", json!({"x": 1}));
        assert_eq!(registry().process(object.clone()).unwrap(), object);
    }
}
