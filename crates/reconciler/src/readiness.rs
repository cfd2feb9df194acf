//! Readiness of applied objects.
//!
//! Kinds with a registered checker are asked directly. Custom kinds (group
//! containing a dot and no checker) may declare readiness through
//! annotations on their CustomResourceDefinition. Everything else is ready as
//! soon as it is applied.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{ReconcileError, RegistryError};
use crate::types::{lookup_path, GroupKind, Object};

/// CRD annotation naming the field path that signals readiness.
pub const READY_FIELD_PATH_ANNOTATION: &str = "keystone.io/readyFieldPath";

/// CRD annotation holding the value the ready field must have.
pub const READY_FIELD_VALUE_ANNOTATION: &str = "keystone.io/readyFieldValue";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckError {
    pub message: String,
    pub retriable: bool,
    pub external: bool,
}

impl CheckError {
    /// The object reports a failure it will not recover from.
    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retriable: false,
            external: true,
        }
    }

    /// Something the check needs has not been observed yet.
    pub fn retriable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retriable: true,
            external: false,
        }
    }
}

impl From<CheckError> for ReconcileError {
    fn from(e: CheckError) -> Self {
        Self::Readiness {
            message: e.message,
            retriable: e.retriable,
            external: e.external,
        }
    }
}

pub trait StatusChecker: Send + Sync {
    fn is_ready(&self, object: &Object) -> Result<bool, CheckError>;
}

/// Lookup of observed CustomResourceDefinitions by the kind they define.
pub trait CrdLookup: Send + Sync {
    fn crd_for(&self, kind: &GroupKind) -> Option<Object>;
}

fn condition<'a>(object: &'a Object, condition_type: &str) -> Option<&'a serde_json::Map<String, Value>> {
    object
        .status()?
        .get("conditions")?
        .as_array()?
        .iter()
        .filter_map(Value::as_object)
        .find(|c| c.get("type").and_then(Value::as_str) == Some(condition_type))
}

fn condition_is(object: &Object, condition_type: &str, status: &str) -> bool {
    condition(object, condition_type).is_some_and(|c| c.get("status").and_then(Value::as_str) == Some(status))
}

fn int_at(object: &Object, path: &str) -> Option<i64> {
    object.field(path).and_then(|v| v.as_i64())
}

/// `Deployment`: rolled out once the latest generation is observed and every
/// desired replica is updated and available.
#[derive(Debug)]
pub struct DeploymentChecker;

impl StatusChecker for DeploymentChecker {
    fn is_ready(&self, object: &Object) -> Result<bool, CheckError> {
        if let Some(progressing) = condition(object, "Progressing") {
            if progressing.get("status").and_then(Value::as_str) == Some("False")
                && progressing.get("reason").and_then(Value::as_str) == Some("ProgressDeadlineExceeded")
            {
                let message = progressing.get("message").and_then(Value::as_str).unwrap_or_default();
                return Err(CheckError::terminal(format!("deployment exceeded its progress deadline: {message}")));
            }
        }

        let generation = object.metadata.generation.unwrap_or(0);
        if int_at(object, "status.observedGeneration").unwrap_or(0) < generation {
            return Ok(false);
        }
        let desired = int_at(object, "spec.replicas").unwrap_or(1);
        let updated = int_at(object, "status.updatedReplicas").unwrap_or(0);
        let available = int_at(object, "status.availableReplicas").unwrap_or(0);
        Ok(updated >= desired && available >= desired)
    }
}

/// Service catalog objects: `Ready=True` is ready, `Failed=True` is final.
#[derive(Debug)]
pub struct ServiceCatalogChecker;

impl StatusChecker for ServiceCatalogChecker {
    fn is_ready(&self, object: &Object) -> Result<bool, CheckError> {
        if let Some(failed) = condition(object, "Failed").filter(|c| c.get("status").and_then(Value::as_str) == Some("True")) {
            let reason = failed.get("reason").and_then(Value::as_str).unwrap_or_default();
            let message = failed.get("message").and_then(Value::as_str).unwrap_or_default();
            return Err(CheckError::terminal(format!("{}: {reason}: {message}", object.kind)));
        }
        Ok(condition_is(object, "Ready", "True"))
    }
}

/// `CustomResourceDefinition`: ready once established.
#[derive(Debug)]
pub struct CrdChecker;

impl StatusChecker for CrdChecker {
    fn is_ready(&self, object: &Object) -> Result<bool, CheckError> {
        Ok(condition_is(object, "Established", "True"))
    }
}

/// Readiness per the `readyFieldPath`/`readyFieldValue` annotations of a CRD.
fn ready_by_crd(object: &Object, crd: &Object) -> Result<bool, CheckError> {
    let annotations = &crd.metadata.annotations;
    let (Some(path), Some(expected)) = (
        annotations.get(READY_FIELD_PATH_ANNOTATION),
        annotations.get(READY_FIELD_VALUE_ANNOTATION),
    ) else {
        return Ok(true);
    };

    let value = object.to_value();
    Ok(match lookup_path(&value, path) {
        Some(Value::String(actual)) => actual == expected,
        Some(other) => other.to_string() == *expected,
        None => false,
    })
}

/// Checkers keyed by group kind. Built once at startup.
#[derive(Clone, Default)]
pub struct ReadinessEvaluator {
    checkers: HashMap<GroupKind, Arc<dyn StatusChecker>>,
    crds: Option<Arc<dyn CrdLookup>>,
}

impl std::fmt::Debug for ReadinessEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadinessEvaluator")
            .field("kinds", &self.checkers.keys().collect::<Vec<_>>())
            .field("crd_lookup", &self.crds.is_some())
            .finish()
    }
}

impl ReadinessEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Result<Self, RegistryError> {
        let mut evaluator = Self::new();
        evaluator.register(GroupKind::new("apps", "Deployment"), Arc::new(DeploymentChecker))?;
        evaluator.register(
            GroupKind::new("servicecatalog.k8s.io", "ServiceInstance"),
            Arc::new(ServiceCatalogChecker),
        )?;
        evaluator.register(
            GroupKind::new("servicecatalog.k8s.io", "ServiceBinding"),
            Arc::new(ServiceCatalogChecker),
        )?;
        evaluator.register(
            GroupKind::new("apiextensions.k8s.io", "CustomResourceDefinition"),
            Arc::new(CrdChecker),
        )?;
        Ok(evaluator)
    }

    #[must_use]
    pub fn with_crd_lookup(mut self, crds: Arc<dyn CrdLookup>) -> Self {
        self.crds = Some(crds);
        self
    }

    pub fn register(&mut self, kind: GroupKind, checker: Arc<dyn StatusChecker>) -> Result<(), RegistryError> {
        if self.checkers.contains_key(&kind) {
            return Err(RegistryError::DuplicateChecker { kind });
        }
        self.checkers.insert(kind, checker);
        Ok(())
    }

    pub fn evaluate(&self, object: &Object) -> Result<bool, CheckError> {
        let kind = object.group_kind();
        if let Some(checker) = self.checkers.get(&kind) {
            return checker.is_ready(object);
        }
        match &self.crds {
            Some(crds) if kind.group.contains('.') => {
                let crd = crds
                    .crd_for(&kind)
                    .ok_or_else(|| CheckError::retriable(format!("CustomResourceDefinition for {kind} not observed yet")))?;
                ready_by_crd(object, &crd)
            }
            _ => Ok(true),
        }
    }
}
