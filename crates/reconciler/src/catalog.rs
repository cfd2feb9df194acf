//! Read-only service catalog lookups.
//!
//! `ServiceInstance` objects name a class and a plan either by external name
//! or by external id. The plan carries the JSON Schema used to check the
//! instance parameters.

use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePlan {
    pub class_external_name: String,
    pub class_external_id: String,
    pub external_name: String,
    pub external_id: String,
    /// Schema for `spec.parameters` of instances using this plan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters_schema: Option<Value>,
}

/// How a `ServiceInstance` names its class and plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanReference {
    ByName { class: String, plan: String },
    ById { class: String, plan: String },
}

impl PlanReference {
    /// Read the plan reference out of a `ServiceInstance` spec.
    pub fn from_spec(spec: &Map<String, Value>) -> Result<Self, String> {
        let field = |key: &str| spec.get(key).and_then(Value::as_str).map(str::to_string);

        match (
            field("clusterServiceClassExternalName"),
            field("clusterServicePlanExternalName"),
            field("clusterServiceClassExternalID"),
            field("clusterServicePlanExternalID"),
        ) {
            (Some(class), Some(plan), None, None) => Ok(Self::ByName { class, plan }),
            (None, None, Some(class), Some(plan)) => Ok(Self::ById { class, plan }),
            _ => Err(
                "exactly one of external name or external id must be set for both class and plan"
                    .to_string(),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("service class {0:?} not found")]
    UnknownClass(String),

    #[error("service plan {plan:?} of class {class:?} not found")]
    UnknownPlan { class: String, plan: String },
}

pub trait ServiceCatalog: Send + Sync {
    fn find_plan(&self, reference: &PlanReference) -> Result<ServicePlan, CatalogError>;
}

/// Catalog backed by a plan list.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    plans: RwLock<Vec<ServicePlan>>,
}

impl InMemoryCatalog {
    pub fn new(plans: Vec<ServicePlan>) -> Self {
        Self {
            plans: RwLock::new(plans),
        }
    }

    pub fn add_plan(&self, plan: ServicePlan) {
        self.plans
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(plan);
    }
}

impl ServiceCatalog for InMemoryCatalog {
    fn find_plan(&self, reference: &PlanReference) -> Result<ServicePlan, CatalogError> {
        let plans = self.plans.read().unwrap_or_else(PoisonError::into_inner);
        let (class, plan, by_name) = match reference {
            PlanReference::ByName { class, plan } => (class, plan, true),
            PlanReference::ById { class, plan } => (class, plan, false),
        };

        let class_matches = |p: &&ServicePlan| {
            if by_name {
                &p.class_external_name == class
            } else {
                &p.class_external_id == class
            }
        };
        if !plans.iter().any(|p| class_matches(&p)) {
            return Err(CatalogError::UnknownClass(class.clone()));
        }

        plans
            .iter()
            .filter(class_matches)
            .find(|p| {
                if by_name {
                    &p.external_name == plan
                } else {
                    &p.external_id == plan
                }
            })
            .cloned()
            .ok_or_else(|| CatalogError::UnknownPlan {
                class: class.clone(),
                plan: plan.clone(),
            })
    }
}
