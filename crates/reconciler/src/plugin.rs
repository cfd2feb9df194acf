//! Plugins: user-supplied producers of objects.
//!
//! A plugin declares the kind it produces and a JSON Schema for its input
//! spec. The registry compiles every schema once and rejects duplicate names.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use jsonschema::Validator;
use serde_json::Value;
use thiserror::Error;

use crate::error::RegistryError;
use crate::schema;
use crate::types::{BundleRef, Object, PluginName, ResourceName};

#[derive(Debug, Clone, PartialEq)]
pub struct PluginDescription {
    pub name: PluginName,
    /// Version and kind of the objects this plugin produces.
    pub api_version: String,
    pub kind: String,
    /// Schema for the plugin spec; `None` accepts anything.
    pub spec_schema: Option<Value>,
}

/// Input handed to a plugin run.
#[derive(Debug, Clone)]
pub struct PluginContext {
    pub bundle: BundleRef,
    pub object_name: String,
    pub spec: Value,
    /// Applied objects of the resource's direct dependencies.
    pub dependencies: HashMap<ResourceName, Object>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessResult {
    Success(Object),
    /// The spec is valid but the plugin cannot build an object from it.
    Failure(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PluginError {
    #[error("{0}")]
    Internal(String),
}

#[async_trait]
pub trait Plugin: Send + Sync {
    fn describe(&self) -> PluginDescription;

    async fn process(&self, context: PluginContext) -> Result<ProcessResult, PluginError>;
}

/// A registered plugin with its compiled spec schema.
pub struct PluginContainer {
    pub plugin: Arc<dyn Plugin>,
    pub description: PluginDescription,
    validator: Option<Validator>,
}

impl PluginContainer {
    fn new(plugin: Arc<dyn Plugin>) -> Result<Self, RegistryError> {
        let description = plugin.describe();
        let validator = description
            .spec_schema
            .as_ref()
            .map(schema::compile)
            .transpose()
            .map_err(|reason| RegistryError::InvalidSchema {
                name: description.name.clone(),
                reason,
            })?;
        Ok(Self {
            plugin,
            description,
            validator,
        })
    }

    /// Violations of the declared spec schema.
    pub fn validate_spec(&self, spec: &Value) -> Vec<String> {
        self.validator
            .as_ref()
            .map(|validator| schema::violations(validator, spec))
            .unwrap_or_default()
    }
}

#[derive(Default)]
pub struct PluginRegistry {
    plugins: HashMap<PluginName, PluginContainer>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.plugins.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PluginRegistry {
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> Result<Self, RegistryError> {
        let mut registry = Self::default();
        for plugin in plugins {
            let container = PluginContainer::new(plugin)?;
            let name = container.description.name.clone();
            if registry.plugins.contains_key(&name) {
                return Err(RegistryError::DuplicatePlugin { name });
            }
            registry.plugins.insert(name, container);
        }
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<&PluginContainer> {
        self.plugins.get(name)
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}
