//! Bundle orchestrator: one reconciliation pass over a bundle.
//!
//! Nodes run in dependency order, independent nodes concurrently up to a
//! limit. A node only starts once each of its direct dependencies reached a
//! final state for the pass; if any of them is not Ready the node is Blocked
//! without being resolved or applied. Failures never stop unrelated branches.
//! Status is written once, after every node settled, and only if it changed.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use itertools::Itertools;
use tracing::{debug, info, warn};

use crate::apply::{ApplyAction, Applier};
use crate::catalog::ServiceCatalog;
use crate::config::ControllerConfig;
use crate::error::{BundleError, ReconcileError};
use crate::graph::ResourceGraph;
use crate::metrics::TransitionMetrics;
use crate::plugin::{Plugin, PluginRegistry};
use crate::processor::ProcessorRegistry;
use crate::readiness::{CrdLookup, ReadinessEvaluator};
use crate::resolve::SpecResolver;
use crate::status::{
    bundle_conditions, resource_conditions, transitions, BundleState, BundleStatus, ResourceState,
    ResourceStatus,
};
use crate::store::{bounded, ObjectCache, ObjectStore, StoreError};
use crate::types::{Bundle, Object, Resource, ResourceName, FINALIZER_DELETE_RESOURCES};

/// Final per-pass result of one resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceOutcome {
    pub name: ResourceName,
    /// Object as applied (or observed unchanged), when the apply step ran.
    pub applied: Option<Object>,
    pub action: Option<ApplyAction>,
    pub state: ResourceState,
}

impl ResourceOutcome {
    fn failed(name: &str, applied: Option<Object>, action: Option<ApplyAction>, err: ReconcileError) -> Self {
        Self {
            name: name.to_string(),
            applied,
            action,
            state: ResourceState::Error(err),
        }
    }
}

/// Result of a pass.
#[derive(Debug, Clone)]
pub struct PassOutcome {
    /// Every failure of the pass was caused by user input.
    pub external: bool,
    /// Another pass may succeed without new input.
    pub retriable: bool,
    pub error: Option<BundleError>,
    /// The bundle after the pass, as last written or observed.
    pub bundle: Bundle,
    pub status_written: bool,
    /// Per-resource results in topological order.
    pub resources: Vec<ResourceOutcome>,
}

impl PassOutcome {
    fn new(bundle: Bundle, error: Option<BundleError>, resources: Vec<ResourceOutcome>) -> Self {
        Self {
            external: error.as_ref().is_some_and(BundleError::is_external),
            retriable: error.as_ref().is_some_and(BundleError::is_retriable),
            error,
            bundle,
            status_written: false,
            resources,
        }
    }

    pub fn resource(&self, name: &str) -> Option<&ResourceOutcome> {
        self.resources.iter().find(|r| r.name == name)
    }
}

/// Bookkeeping for the node scheduler of one pass.
struct Schedule {
    pending: Vec<usize>,
    position: Vec<usize>,
    /// (topological position, node) of nodes whose dependencies all settled.
    ready: BTreeSet<(usize, usize)>,
    outcomes: Vec<Option<ResourceOutcome>>,
}

impl Schedule {
    fn new(graph: &ResourceGraph<'_>) -> Self {
        let n = graph.len();
        let mut position = vec![0; n];
        for (pos, &node) in graph.order().iter().enumerate() {
            position[node] = pos;
        }
        let pending: Vec<usize> = (0..n).map(|i| graph.dependencies(i).len()).collect();
        let ready = (0..n)
            .filter(|&i| pending[i] == 0)
            .map(|i| (position[i], i))
            .collect();
        Self {
            pending,
            position,
            ready,
            outcomes: (0..n).map(|_| None).collect(),
        }
    }

    fn settle(&mut self, graph: &ResourceGraph<'_>, node: usize, outcome: ResourceOutcome) {
        self.outcomes[node] = Some(outcome);
        for dependent in graph.dependents(node) {
            self.pending[dependent] -= 1;
            if self.pending[dependent] == 0 {
                self.ready.insert((self.position[dependent], dependent));
            }
        }
    }

    fn outcome(&self, node: usize) -> Option<&ResourceOutcome> {
        self.outcomes[node].as_ref()
    }
}

pub struct BundleProcessor {
    cache: Arc<dyn ObjectCache>,
    store: Arc<dyn ObjectStore>,
    resolver: SpecResolver,
    applier: Applier,
    readiness: ReadinessEvaluator,
    metrics: Option<TransitionMetrics>,
    max_concurrent_resources: usize,
    store_timeout: Duration,
}

impl BundleProcessor {
    pub fn builder() -> BundleProcessorBuilder {
        BundleProcessorBuilder::new()
    }

    /// Run one pass over `bundle`.
    pub async fn process_bundle(&self, bundle: &Bundle) -> PassOutcome {
        let bundle_ref = bundle.bundle_ref();
        if bundle.is_deleting() {
            info!(bundle = %bundle_ref, "Bundle is being deleted, cleaning up objects");
            return self.cleanup(bundle).await;
        }

        let mut bundle = bundle.clone();
        if !bundle.has_finalizer() {
            debug!(bundle = %bundle_ref, "Adding finalizer");
            bundle.metadata.finalizers.push(FINALIZER_DELETE_RESOURCES.to_string());
            match bounded(self.store_timeout, self.store.update_bundle(bundle.clone())).await {
                Ok(updated) => bundle = updated,
                Err(e) => {
                    warn!(bundle = %bundle_ref, error = %e, "Failed to add finalizer");
                    return PassOutcome::new(bundle, Some(BundleError::Finalizer(e.to_string())), Vec::new());
                }
            }
        }

        info!(bundle = %bundle_ref, resources = bundle.spec.resources.len(), "Processing bundle");

        let (state, resources, error) = match ResourceGraph::build(&bundle.spec.resources) {
            Err(e) => {
                warn!(bundle = %bundle_ref, error = %e, "Invalid dependency graph");
                let state = BundleState::Error {
                    message: e.to_string(),
                    retriable: e.is_retriable(),
                };
                (state, Vec::new(), Some(BundleError::Graph(e)))
            }
            Ok(graph) => {
                let resources = self.run_graph(&bundle, &graph).await;
                let (state, error) = aggregate(&resources);
                (state, resources, error)
            }
        };

        let mut outcome = PassOutcome::new(bundle.clone(), error, resources);
        let status = build_status(&bundle, &state, &outcome.resources);
        if status.equivalent(&bundle.status) {
            debug!(bundle = %bundle_ref, "Status unchanged");
        } else {
            self.write_status(&mut outcome, status).await;
        }

        match &outcome.error {
            None => info!(bundle = %bundle_ref, ready = outcome.bundle.status.is_ready, "Bundle processed"),
            Some(e) => warn!(
                bundle = %bundle_ref,
                error = %e,
                external = outcome.external,
                retriable = outcome.retriable,
                "Bundle processed with errors"
            ),
        }
        outcome
    }

    async fn write_status(&self, outcome: &mut PassOutcome, mut status: BundleStatus) {
        let bundle_ref = outcome.bundle.bundle_ref();
        let previous = outcome.bundle.status.clone();
        status.stamp_transitions(&previous, Utc::now());

        let mut update = outcome.bundle.clone();
        update.status = status;
        match bounded(self.store_timeout, self.store.update_bundle_status(update)).await {
            Ok(written) => {
                info!(bundle = %bundle_ref, ready = written.status.is_ready, "Status updated");
                if let Some(metrics) = &self.metrics {
                    metrics.record(&bundle_ref, &transitions(&previous, &written.status));
                }
                outcome.bundle = written;
                outcome.status_written = true;
            }
            Err(e) => {
                warn!(bundle = %bundle_ref, error = %e, "Failed to update status");
                outcome.external = false;
                outcome.retriable = true;
                if outcome.error.is_none() {
                    outcome.error = Some(BundleError::StatusUpdate(e.to_string()));
                }
            }
        }
    }

    async fn run_graph(&self, bundle: &Bundle, graph: &ResourceGraph<'_>) -> Vec<ResourceOutcome> {
        let mut schedule = Schedule::new(graph);
        let mut in_flight = FuturesUnordered::new();

        loop {
            while in_flight.len() < self.max_concurrent_resources {
                let Some((_, node)) = schedule.ready.pop_first() else {
                    break;
                };
                let resource = graph.resource(node);
                let dependencies = graph.dependencies(node);

                let blocked_on: Vec<ResourceName> = dependencies
                    .iter()
                    .filter(|&&d| !schedule.outcome(d).is_some_and(|o| o.state.is_ready()))
                    .map(|&d| graph.resource(d).name.clone())
                    .collect();
                if !blocked_on.is_empty() {
                    debug!(bundle = %bundle.bundle_ref(), resource = %resource.name, blocked_on = ?blocked_on, "Resource blocked");
                    let outcome = ResourceOutcome {
                        name: resource.name.clone(),
                        applied: None,
                        action: None,
                        state: ResourceState::Blocked(blocked_on),
                    };
                    schedule.settle(graph, node, outcome);
                    continue;
                }

                let inputs: HashMap<ResourceName, Object> = dependencies
                    .iter()
                    .filter_map(|&d| {
                        let outcome = schedule.outcome(d)?;
                        Some((outcome.name.clone(), outcome.applied.clone()?))
                    })
                    .collect();
                in_flight.push(async move { (node, self.process_resource(bundle, resource, inputs).await) });
            }

            match in_flight.next().await {
                Some((node, outcome)) => schedule.settle(graph, node, outcome),
                None => break,
            }
        }

        graph
            .order()
            .iter()
            .filter_map(|&node| schedule.outcomes[node].take())
            .collect()
    }

    async fn process_resource(
        &self,
        bundle: &Bundle,
        resource: &Resource,
        inputs: HashMap<ResourceName, Object>,
    ) -> ResourceOutcome {
        let bundle_ref = bundle.bundle_ref();
        let name = resource.name.as_str();

        let desired = match self.resolver.resolve(bundle, resource, &inputs).await {
            Ok(desired) => desired,
            Err(e) => {
                warn!(bundle = %bundle_ref, resource = name, error = %e, "Failed to resolve resource");
                return ResourceOutcome::failed(name, None, None, e);
            }
        };

        let kind = desired.group_kind();
        let applied = match self.applier.apply(bundle, desired).await {
            Ok(applied) => applied,
            Err(e) => {
                warn!(bundle = %bundle_ref, resource = name, kind = %kind, error = %e, "Failed to apply resource");
                return ResourceOutcome::failed(name, None, None, e);
            }
        };
        debug!(bundle = %bundle_ref, resource = name, kind = %kind, action = ?applied.action, "Resource applied");

        let state = match self.readiness.evaluate(&applied.object) {
            Ok(true) => ResourceState::Ready,
            Ok(false) => ResourceState::InProgress,
            Err(e) => {
                warn!(bundle = %bundle_ref, resource = name, error = %e.message, "Readiness check failed");
                ResourceState::Error(e.into())
            }
        };
        debug!(bundle = %bundle_ref, resource = name, state = ?state, "Resource evaluated");
        ResourceOutcome {
            name: name.to_string(),
            applied: Some(applied.object),
            action: Some(applied.action),
            state,
        }
    }

    /// Delete every object the bundle controls, then release its finalizer.
    async fn cleanup(&self, bundle: &Bundle) -> PassOutcome {
        let bundle_ref = bundle.bundle_ref();
        let namespace = bundle_ref.namespace.as_str();

        let mut failures = Vec::new();
        for object in self.cache.controlled_by(namespace, bundle.uid()) {
            let key = object.key();
            debug!(bundle = %bundle_ref, object = %key, "Deleting object");
            match bounded(self.store_timeout, self.store.delete(&key)).await {
                Ok(()) | Err(StoreError::NotFound(_)) => {}
                Err(e) => failures.push(format!("{key}: {e}")),
            }
        }
        if !failures.is_empty() {
            let error = BundleError::Cleanup(failures.join("; "));
            warn!(bundle = %bundle_ref, error = %error, "Failed to delete objects");
            return PassOutcome::new(bundle.clone(), Some(error), Vec::new());
        }

        let remaining = self.cache.controlled_by(namespace, bundle.uid());
        if !remaining.is_empty() {
            debug!(bundle = %bundle_ref, remaining = remaining.len(), "Waiting for objects to go away");
            let mut outcome = PassOutcome::new(bundle.clone(), None, Vec::new());
            outcome.retriable = true;
            return outcome;
        }

        if !bundle.has_finalizer() {
            return PassOutcome::new(bundle.clone(), None, Vec::new());
        }
        let mut update = bundle.clone();
        update.metadata.finalizers.retain(|f| f != FINALIZER_DELETE_RESOURCES);
        match bounded(self.store_timeout, self.store.update_bundle(update)).await {
            Ok(updated) => {
                info!(bundle = %bundle_ref, "Objects deleted, finalizer removed");
                PassOutcome::new(updated, None, Vec::new())
            }
            Err(StoreError::NotFound(_)) => PassOutcome::new(bundle.clone(), None, Vec::new()),
            Err(e) => PassOutcome::new(bundle.clone(), Some(BundleError::Finalizer(e.to_string())), Vec::new()),
        }
    }
}

/// Worst outcome wins: Error, then InProgress, then Ready.
fn aggregate(resources: &[ResourceOutcome]) -> (BundleState, Option<BundleError>) {
    let failures: Vec<(ResourceName, ReconcileError)> = resources
        .iter()
        .filter_map(|r| r.state.error().map(|e| (r.name.clone(), e.clone())))
        .collect();

    if !failures.is_empty() {
        let failed = failures.iter().map(|(name, _)| name).join(", ");
        debug!(failed = %failed, "Resources failed");
        let error = BundleError::Resources(failures);
        let state = BundleState::Error {
            message: error.condition_message(),
            retriable: error.is_retriable(),
        };
        return (state, Some(error));
    }
    if resources.iter().all(|r| r.state.is_ready()) {
        (BundleState::Ready, None)
    } else {
        (BundleState::InProgress, None)
    }
}

/// Status for the pass; resources listed in declaration order.
fn build_status(bundle: &Bundle, state: &BundleState, resources: &[ResourceOutcome]) -> BundleStatus {
    let by_name: HashMap<&str, &ResourceOutcome> = resources.iter().map(|r| (r.name.as_str(), r)).collect();
    let resource_statuses = bundle
        .spec
        .resources
        .iter()
        .filter_map(|r| by_name.get(r.name.as_str()))
        .map(|outcome| ResourceStatus {
            name: outcome.name.clone(),
            conditions: resource_conditions(&outcome.state),
        })
        .collect();

    BundleStatus {
        observed_generation: bundle.metadata.generation,
        conditions: bundle_conditions(state),
        resource_statuses,
        is_ready: matches!(state, BundleState::Ready),
    }
}

/// Builder for [`BundleProcessor`].
#[derive(Default)]
pub struct BundleProcessorBuilder {
    store: Option<Arc<dyn ObjectStore>>,
    cache: Option<Arc<dyn ObjectCache>>,
    config: ControllerConfig,
    plugins: Vec<Arc<dyn Plugin>>,
    processors: Option<ProcessorRegistry>,
    readiness: Option<ReadinessEvaluator>,
    catalog: Option<Arc<dyn ServiceCatalog>>,
    crds: Option<Arc<dyn CrdLookup>>,
    metrics: Option<TransitionMetrics>,
}

impl BundleProcessorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn ObjectCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Replace the built-in processors.
    #[must_use]
    pub fn with_processors(mut self, processors: ProcessorRegistry) -> Self {
        self.processors = Some(processors);
        self
    }

    /// Replace the built-in status checkers.
    #[must_use]
    pub fn with_readiness(mut self, readiness: ReadinessEvaluator) -> Self {
        self.readiness = Some(readiness);
        self
    }

    #[must_use]
    pub fn with_catalog(mut self, catalog: Arc<dyn ServiceCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    #[must_use]
    pub fn with_crd_lookup(mut self, crds: Arc<dyn CrdLookup>) -> Self {
        self.crds = Some(crds);
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: TransitionMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the processor.
    ///
    /// # Errors
    ///
    /// Invalid configuration, a missing store or cache, or a registration
    /// conflict (such as two plugins with the same name).
    pub fn build(self) -> keystone_core::Result<BundleProcessor> {
        use keystone_core::Error;

        self.config.validate()?;
        let store = self.store.ok_or_else(|| Error::invalid_config("object store is required"))?;
        let cache = self.cache.ok_or_else(|| Error::invalid_config("object cache is required"))?;

        let plugins = PluginRegistry::new(self.plugins).map_err(|e| Error::invalid_config(e.to_string()))?;
        let processors = match self.processors {
            Some(processors) => processors,
            None => ProcessorRegistry::with_builtins(self.catalog).map_err(|e| Error::invalid_config(e.to_string()))?,
        };
        let mut readiness = match self.readiness {
            Some(readiness) => readiness,
            None => ReadinessEvaluator::with_builtins().map_err(|e| Error::invalid_config(e.to_string()))?,
        };
        if let Some(crds) = self.crds {
            readiness = readiness.with_crd_lookup(crds);
        }

        let store_timeout = self.config.store_timeout();
        Ok(BundleProcessor {
            resolver: SpecResolver::new(Arc::new(processors), Arc::new(plugins), self.config.plugin_timeout()),
            applier: Applier::new(Arc::clone(&store), Arc::clone(&cache), store_timeout),
            cache,
            store,
            readiness,
            metrics: self.metrics,
            max_concurrent_resources: self.config.max_concurrent_resources,
            store_timeout,
        })
    }
}
