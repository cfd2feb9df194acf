//! Error types for the reconciler crate.
//!
//! Every failure carries a classification: *external* errors are caused by
//! user input and are reported in status, *retriable* errors are worth
//! another attempt with backoff.

use std::fmt;

use thiserror::Error;

use crate::store::StoreError;
use crate::types::{GroupKind, PluginName, ResourceName};

/// Failure of a single resource (or of the whole graph) within a pass.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    #[error("duplicate resource name {name:?}")]
    DuplicateName { name: ResourceName },

    #[error("resource {resource:?} depends on unknown resource {dependency:?}")]
    UnknownDependency {
        resource: ResourceName,
        dependency: ResourceName,
    },

    #[error("cycle detected in dependency graph involving resource {name:?}")]
    Cycle { name: ResourceName },

    #[error("failed to resolve reference: {reason}")]
    ReferenceResolution { reason: String },

    #[error("spec failed validation against schema: {reason}")]
    SchemaValidation { reason: String },

    #[error("plugin {plugin:?} rejected the spec: {reason}")]
    PluginSpec { plugin: PluginName, reason: String },

    #[error("plugin {plugin:?} failed: {reason}")]
    PluginExecution { plugin: PluginName, reason: String },

    #[error("no plugin named {plugin:?} is registered")]
    UnknownPlugin { plugin: PluginName },

    #[error("service catalog lookup failed: {reason}")]
    Catalog { reason: String },

    #[error("conflict writing object: {reason}")]
    StoreConflict { reason: String },

    #[error("object rejected by the store: {reason}")]
    StoreRejected { reason: String },

    #[error("store unavailable: {reason}")]
    StoreTransport { reason: String },

    #[error("object {kind} {name:?} exists and is not controlled by this bundle")]
    NotControlled { kind: GroupKind, name: String },

    #[error("{message}")]
    Readiness {
        message: String,
        retriable: bool,
        external: bool,
    },

    #[error("failed to update bundle status: {reason}")]
    StatusUpdate { reason: String },
}

impl ReconcileError {
    pub fn reference(reason: impl Into<String>) -> Self {
        Self::ReferenceResolution {
            reason: reason.into(),
        }
    }

    pub fn schema(reason: impl Into<String>) -> Self {
        Self::SchemaValidation {
            reason: reason.into(),
        }
    }

    pub fn plugin_execution(plugin: impl Into<PluginName>, reason: impl Into<String>) -> Self {
        Self::PluginExecution {
            plugin: plugin.into(),
            reason: reason.into(),
        }
    }

    /// Caused by the user's input rather than the environment.
    pub fn is_external(&self) -> bool {
        match self {
            Self::Readiness { external, .. } => *external,
            Self::PluginExecution { .. }
            | Self::Catalog { .. }
            | Self::StoreConflict { .. }
            | Self::StoreTransport { .. }
            | Self::StatusUpdate { .. } => false,
            _ => true,
        }
    }

    /// Worth retrying with backoff.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Readiness { retriable, .. } => *retriable,
            Self::PluginExecution { .. }
            | Self::Catalog { .. }
            | Self::StoreConflict { .. }
            | Self::StoreTransport { .. }
            | Self::StatusUpdate { .. } => true,
            _ => false,
        }
    }

    /// Classify a store failure for an object write.
    ///
    /// `NotFound` only happens on update (the object vanished after it was
    /// observed) and is rejected like any other invalid write.
    pub fn from_store(err: StoreError) -> Self {
        let reason = err.to_string();
        match err {
            StoreError::Conflict(_) | StoreError::AlreadyExists(_) => Self::StoreConflict { reason },
            StoreError::NotFound(_) | StoreError::Forbidden(_) | StoreError::Invalid(_) => {
                Self::StoreRejected { reason }
            }
            StoreError::Transport(_) | StoreError::Timeout(_) => Self::StoreTransport { reason },
        }
    }
}

/// Outcome error of a whole bundle pass.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BundleError {
    #[error(transparent)]
    Graph(ReconcileError),

    /// One or more resources failed. Names are in topological order.
    #[error("error processing resource(s): [{}]", QuotedNames(.0))]
    Resources(Vec<(ResourceName, ReconcileError)>),

    #[error("failed to update bundle status: {0}")]
    StatusUpdate(String),

    #[error("failed to update bundle finalizers: {0}")]
    Finalizer(String),

    #[error("failed to delete objects of bundle: {0}")]
    Cleanup(String),
}

struct QuotedNames<'a>(&'a [(ResourceName, ReconcileError)]);

impl fmt::Display for QuotedNames<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, _)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{name:?}")?;
        }
        Ok(())
    }
}

impl BundleError {
    /// External only if every underlying failure is external.
    pub fn is_external(&self) -> bool {
        match self {
            Self::Graph(e) => e.is_external(),
            Self::Resources(failures) => failures.iter().all(|(_, e)| e.is_external()),
            Self::StatusUpdate(_) | Self::Finalizer(_) | Self::Cleanup(_) => false,
        }
    }

    /// Retriable if any underlying failure is retriable.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Graph(e) => e.is_retriable(),
            Self::Resources(failures) => failures.iter().any(|(_, e)| e.is_retriable()),
            Self::StatusUpdate(_) | Self::Finalizer(_) | Self::Cleanup(_) => true,
        }
    }

    /// Message used for the bundle-level Error condition.
    pub fn condition_message(&self) -> String {
        match self {
            Self::Resources(failures) => match failures.as_slice() {
                [(name, err)] => format!("error processing resource {name:?}: {err}"),
                _ => self.to_string(),
            },
            _ => self.to_string(),
        }
    }
}

/// Startup registration failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("plugin with name {name:?} is registered more than once")]
    DuplicatePlugin { name: PluginName },

    #[error("plugin {name:?} declares an invalid spec schema: {reason}")]
    InvalidSchema { name: PluginName, reason: String },

    #[error("object processor for {kind} is registered more than once")]
    DuplicateProcessor { kind: GroupKind },

    #[error("status checker for {kind} is registered more than once")]
    DuplicateChecker { kind: GroupKind },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_resources_error_lists_every_name() {
        let err = BundleError::Resources(vec![
            ("si1".to_string(), ReconcileError::schema("x")),
            ("si2".to_string(), ReconcileError::schema("y")),
        ]);
        assert_eq!(err.to_string(), r#"error processing resource(s): ["si1" "si2"]"#);
        assert!(err.is_external());
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_mixed_failures_are_retriable_and_internal() {
        let err = BundleError::Resources(vec![
            ("a".to_string(), ReconcileError::schema("bad")),
            (
                "b".to_string(),
                ReconcileError::from_store(StoreError::Timeout(Duration::from_secs(1))),
            ),
        ]);
        assert!(!err.is_external());
        assert!(err.is_retriable());
    }

    #[test]
    fn test_store_error_classification() {
        let conflict = ReconcileError::from_store(StoreError::Conflict("rv".to_string()));
        assert!(conflict.is_retriable());
        assert!(!conflict.is_external());

        let forbidden = ReconcileError::from_store(StoreError::Forbidden("rbac".to_string()));
        assert!(!forbidden.is_retriable());
        assert!(forbidden.is_external());

        let transport = ReconcileError::from_store(StoreError::Transport("eof".to_string()));
        assert!(transport.is_retriable());
        assert!(!transport.is_external());
    }

    #[test]
    fn test_single_failure_condition_message_names_resource() {
        let err = BundleError::Resources(vec![("a".to_string(), ReconcileError::schema("bad"))]);
        assert_eq!(
            err.condition_message(),
            r#"error processing resource "a": spec failed validation against schema: bad"#
        );
    }

    #[test]
    fn test_readiness_classification_follows_flags() {
        let err = ReconcileError::Readiness {
            message: "deadline exceeded".to_string(),
            retriable: false,
            external: true,
        };
        assert!(err.is_external());
        assert!(!err.is_retriable());
        assert_eq!(err.to_string(), "deadline exceeded");
    }
}
