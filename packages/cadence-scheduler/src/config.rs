use crate::error::ConfigError;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CHAIN: &str = "default";

/// Settings for a [`TaskManager`](crate::TaskManager).
///
/// ## Field semantics
/// - `name`: used in logs and snapshots
/// - `default_chain`: chain for tasks that never called `set_task_chain`; always created
/// - `parallel_chains`: run each chain's pass on its own scoped thread
/// - `chains`: chains created up front; others are created on first use
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub name: String,
    pub default_chain: String,
    pub parallel_chains: bool,
    pub chains: Vec<ChainConfig>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            name: "TaskManager".to_string(),
            default_chain: DEFAULT_CHAIN.to_string(),
            parallel_chains: false,
            chains: Vec::new(),
        }
    }
}

impl ManagerConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_chain(mut self, chain: ChainConfig) -> Self {
        self.chains.push(chain);
        self
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel_chains = parallel;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_chain.is_empty() {
            return Err(ConfigError::Invalid("default_chain must not be empty".into()));
        }
        for (i, chain) in self.chains.iter().enumerate() {
            chain.validate()?;
            if self.chains[..i].iter().any(|c| c.name == chain.name) {
                return Err(ConfigError::Invalid(format!(
                    "chain {} is configured twice",
                    chain.name
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainConfig {
    pub name: String,
    /// Seconds of clock time one pass may use; `None` means unbounded.
    #[serde(default)]
    pub frame_budget: Option<f64>,
}

impl ChainConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            frame_budget: None,
        }
    }

    pub fn with_frame_budget(mut self, seconds: f64) -> Self {
        self.frame_budget = Some(seconds);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Invalid("chain name must not be empty".into()));
        }
        match self.frame_budget {
            Some(budget) if !(budget > 0.0) => Err(ConfigError::Invalid(format!(
                "chain {} has non-positive frame_budget {budget}",
                self.name
            ))),
            _ => Ok(()),
        }
    }
}
