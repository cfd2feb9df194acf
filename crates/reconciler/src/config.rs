//! Controller configuration.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use keystone_core::Error;

/// Configuration for the bundle controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControllerConfig {
    /// Number of worker tasks processing bundles.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Resources of one bundle processed at the same time.
    #[serde(default = "default_max_concurrent_resources")]
    pub max_concurrent_resources: usize,

    #[serde(default = "default_plugin_timeout_ms")]
    pub plugin_timeout_ms: u64,

    /// Upper bound for every store call.
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    /// Only reconcile bundles in this namespace.
    #[serde(default)]
    pub namespace: Option<String>,

    /// Prefix of the exported metrics.
    #[serde(default = "default_app_name")]
    pub app_name: String,

    #[serde(default)]
    pub backoff: BackoffConfig,
}

const fn default_workers() -> usize {
    2
}

const fn default_max_concurrent_resources() -> usize {
    4
}

const fn default_plugin_timeout_ms() -> u64 {
    10_000
}

const fn default_store_timeout_ms() -> u64 {
    30_000
}

fn default_app_name() -> String {
    "keystone".to_string()
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_concurrent_resources: default_max_concurrent_resources(),
            plugin_timeout_ms: default_plugin_timeout_ms(),
            store_timeout_ms: default_store_timeout_ms(),
            namespace: None,
            app_name: default_app_name(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl ControllerConfig {
    pub const fn plugin_timeout(&self) -> Duration {
        Duration::from_millis(self.plugin_timeout_ms)
    }

    pub const fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid.
    pub fn validate(&self) -> keystone_core::Result<()> {
        if self.workers == 0 {
            return Err(Error::invalid_config("workers must be at least 1"));
        }
        if self.max_concurrent_resources == 0 {
            return Err(Error::invalid_config("max_concurrent_resources must be at least 1"));
        }
        if self.plugin_timeout_ms == 0 || self.store_timeout_ms == 0 {
            return Err(Error::invalid_config("timeouts must be greater than zero"));
        }
        if self.app_name.is_empty() {
            return Err(Error::invalid_config("app_name must not be empty"));
        }
        self.backoff.validate()
    }
}

/// Per-bundle retry backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackoffConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Caps exponential growth.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Add up to 25% jitter to each delay.
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

const fn default_initial_delay_ms() -> u64 {
    500
}

const fn default_max_delay_ms() -> u64 {
    60_000
}

const fn default_multiplier() -> f64 {
    2.0
}

const fn default_jitter() -> bool {
    true
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl BackoffConfig {
    #[must_use]
    pub const fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    #[must_use]
    pub const fn with_initial_delay_ms(mut self, delay: u64) -> Self {
        self.initial_delay_ms = delay;
        self
    }

    #[must_use]
    pub const fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Delay before retry number `failures` (1-indexed). Never above the cap,
    /// jitter included.
    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.initial_delay_ms as f64
            * self
                .multiplier
                .powi(i32::try_from(failures - 1).unwrap_or(i32::MAX));
        let max_ms = self.max_delay_ms as f64;

        let delay_ms = if self.jitter {
            let jitter_factor = 1.0 + rand::thread_rng().gen_range(0.0..0.25);
            base_ms.min(max_ms) * jitter_factor
        } else {
            base_ms
        };

        Duration::from_millis(delay_ms.min(max_ms) as u64)
    }

    fn validate(&self) -> keystone_core::Result<()> {
        if self.initial_delay_ms == 0 {
            return Err(Error::invalid_config("backoff.initial_delay_ms must be greater than zero"));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(Error::invalid_config(
                "backoff.max_delay_ms must not be below backoff.initial_delay_ms",
            ));
        }
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err(Error::invalid_config("backoff.multiplier must be at least 1.0"));
        }
        Ok(())
    }
}
