//! Dependency-ordered reconciliation of Bundles.
//!
//! A Bundle declares a set of resources and the dependencies between them.
//! Each pass of the engine:
//!
//! 1. builds and validates the dependency graph
//! 2. resolves every resource (reference injection, plugins, per-kind checks)
//! 3. creates or updates the resulting objects in dependency order
//! 4. evaluates readiness and writes the aggregate status back
//!
//! # Key Concepts
//!
//! ## Passes
//!
//! A resource is only processed once all its direct dependencies are Ready;
//! otherwise it is Blocked. Failures are classified as external (user input)
//! or internal, and as retriable or terminal. Retriable passes are retried
//! with per-bundle backoff; terminal ones wait for the next trigger.
//!
//! ## Coordination
//!
//! [`Coordinator`] runs a pool of workers over a keyed [`WorkQueue`]: a bundle
//! is never processed by two workers at once, and triggers arriving during a
//! pass collapse into one follow-up pass.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use keystone_reconciler::{Bundle, BundleProcessor, InMemoryStore};
//!
//! let store = Arc::new(InMemoryStore::new());
//! let processor = BundleProcessor::builder()
//!     .with_store(store.clone())
//!     .with_cache(store.clone())
//!     .build()?;
//! let bundle = store.insert_bundle(Bundle::new("default", "app", resources));
//! let outcome = processor.process_bundle(&bundle).await;
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod apply;
pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod graph;
pub mod memory;
pub mod metrics;
pub mod orchestrator;
pub mod plugin;
pub mod processor;
pub mod queue;
pub mod readiness;
pub mod resolve;
pub mod schema;
pub mod status;
pub mod store;
pub mod types;

// Re-export main types
pub use apply::{ApplyAction, ApplyOutcome, Applier};
pub use catalog::{InMemoryCatalog, PlanReference, ServiceCatalog, ServicePlan};
pub use config::{BackoffConfig, ControllerConfig};
pub use coordinator::Coordinator;
pub use error::{BundleError, ReconcileError, RegistryError};
pub use graph::ResourceGraph;
pub use memory::{InMemoryStore, StoreAction};
pub use metrics::TransitionMetrics;
pub use orchestrator::{BundleProcessor, BundleProcessorBuilder, PassOutcome, ResourceOutcome};
pub use plugin::{Plugin, PluginContext, PluginDescription, PluginError, PluginRegistry, ProcessResult};
pub use processor::{ObjectProcessor, ProcessError, ProcessorRegistry};
pub use queue::WorkQueue;
pub use readiness::{CheckError, CrdLookup, ReadinessEvaluator, StatusChecker};
pub use resolve::SpecResolver;
pub use status::{BundleStatus, Condition, ConditionStatus, ConditionType, ResourceState, ResourceStatus};
pub use store::{ObjectCache, ObjectKey, ObjectStore, StoreError};
pub use types::{
    Bundle, BundleRef, BundleSpec, GroupKind, Object, ObjectMeta, OwnerReference, PluginSpec, Reference,
    Resource, ResourceName, ResourceSpec,
};
