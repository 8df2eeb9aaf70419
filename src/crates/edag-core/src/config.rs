//! Executor configuration
//!
//! [`ExecutorConfig`] holds executor-wide settings; [`RunOptions`] holds the
//! per-run switches of [`Executor::execute`](crate::Executor::execute).
//! Both deserialize with defaults for every missing field, so a host can load
//! them from whatever document it already has.
//!
//! ```rust
//! use edag_core::ExecutorConfig;
//!
//! let config = ExecutorConfig::from_yaml_str("max_concurrency: 4\nunrestricted: true\n").unwrap();
//! assert_eq!(config.max_concurrency, Some(4));
//! assert!(config.unrestricted);
//! assert!(!config.retain_results);
//! ```

use crate::error::{GraphError, Result};
use serde::{Deserialize, Serialize};

/// Executor-wide settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Upper bound on deferred units running at the same time
    pub max_concurrency: Option<usize>,

    /// Default visibility policy for runs
    pub unrestricted: bool,

    /// Default retention policy for runs
    pub retain_results: bool,
}

impl ExecutorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }

    pub fn with_unrestricted(mut self, unrestricted: bool) -> Self {
        self.unrestricted = unrestricted;
        self
    }

    pub fn with_retain_results(mut self, retain: bool) -> Self {
        self.retain_results = retain;
        self
    }

    pub fn from_yaml_str(source: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_value(value: serde_json::Value) -> Result<Self> {
        let config: Self = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == Some(0) {
            return Err(GraphError::Configuration(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Per-run options carrying this configuration's defaults.
    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            retain_results: self.retain_results,
            unrestricted: self.unrestricted,
        }
    }
}

/// Switches for a single run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Keep the run's results in the executor's store after it returns
    pub retain_results: bool,

    /// Let every node see the whole result store instead of its direct
    /// predecessors' latest results
    pub unrestricted: bool,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retain(mut self) -> Self {
        self.retain_results = true;
        self
    }

    pub fn unrestricted(mut self) -> Self {
        self.unrestricted = true;
        self
    }
}

impl From<&ExecutorConfig> for RunOptions {
    fn from(config: &ExecutorConfig) -> Self {
        config.run_options()
    }
}
