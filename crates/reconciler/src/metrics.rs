//! Condition transition counters.

use prometheus::{IntCounterVec, Opts, Registry};

use crate::status::Transition;
use crate::types::BundleRef;

#[derive(Debug, Clone)]
pub struct TransitionMetrics {
    bundle_transitions: IntCounterVec,
    resource_transitions: IntCounterVec,
}

impl TransitionMetrics {
    /// Counters prefixed with `namespace` (for example `keystone`).
    pub fn new(namespace: &str) -> prometheus::Result<Self> {
        let bundle_transitions = IntCounterVec::new(
            Opts::new("bundle_transitions_total", "Condition transitions of bundles")
                .namespace(namespace.to_string()),
            &["namespace", "name", "type", "reason"],
        )?;
        let resource_transitions = IntCounterVec::new(
            Opts::new(
                "bundle_resource_transitions_total",
                "Condition transitions of bundle resources",
            )
            .namespace(namespace.to_string()),
            &["namespace", "name", "resource", "type", "reason"],
        )?;
        Ok(Self {
            bundle_transitions,
            resource_transitions,
        })
    }

    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.bundle_transitions.clone()))?;
        registry.register(Box::new(self.resource_transitions.clone()))?;
        Ok(())
    }

    /// Count one increment per changed condition.
    pub fn record(&self, bundle: &BundleRef, transitions: &[Transition]) {
        for transition in transitions {
            let condition_type = transition.condition_type.as_str();
            match &transition.resource {
                None => self
                    .bundle_transitions
                    .with_label_values(&[
                        bundle.namespace.as_str(),
                        bundle.name.as_str(),
                        condition_type,
                        transition.reason.as_str(),
                    ])
                    .inc(),
                Some(resource) => self
                    .resource_transitions
                    .with_label_values(&[
                        bundle.namespace.as_str(),
                        bundle.name.as_str(),
                        resource.as_str(),
                        condition_type,
                        transition.reason.as_str(),
                    ])
                    .inc(),
            }
        }
    }

    pub fn bundle_count(&self, bundle: &BundleRef, condition_type: &str, reason: &str) -> u64 {
        self.bundle_transitions
            .with_label_values(&[bundle.namespace.as_str(), bundle.name.as_str(), condition_type, reason])
            .get()
    }

    pub fn resource_count(&self, bundle: &BundleRef, resource: &str, condition_type: &str, reason: &str) -> u64 {
        self.resource_transitions
            .with_label_values(&[
                bundle.namespace.as_str(),
                bundle.name.as_str(),
                resource,
                condition_type,
                reason,
            ])
            .get()
    }
}
