//! Runtime configuration for a sync context.
//!
//! Every context sharing one store must agree on `tree`, `state_key` and
//! `signal_prefix`; the remaining fields are local to the context.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::{StockQuantity, StockState};

pub const DEFAULT_TREE: &str = "inventory";
pub const DEFAULT_STATE_KEY: &str = "inventory-state";
pub const DEFAULT_SIGNAL_PREFIX: &str = "inventory-update-";
pub const DEFAULT_GRACE_PERIOD_MS: u64 = 500;

/// How a context decides between seeding and adopting on cold start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BootstrapPolicy {
    /// Read, and write the desired state if the read was empty. Two contexts
    /// starting together can both seed; the later write wins.
    #[default]
    LastWriteWins,
    /// Seed through an atomic compare-and-swap from "absent". Exactly one
    /// context seeds, every other context adopts.
    CompareAndSet,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub tree: String,
    pub state_key: String,
    pub signal_prefix: String,
    pub grace_period_ms: u64,
    pub bootstrap_policy: BootstrapPolicy,
    pub initial_inventory: BTreeMap<String, StockQuantity>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let initial_inventory = [("1", 10), ("2", 50), ("3", 25), ("4", 15), ("5", 7)]
            .into_iter()
            .map(|(id, qty)| (id.to_string(), qty))
            .collect();

        Self {
            tree: DEFAULT_TREE.to_string(),
            state_key: DEFAULT_STATE_KEY.to_string(),
            signal_prefix: DEFAULT_SIGNAL_PREFIX.to_string(),
            grace_period_ms: DEFAULT_GRACE_PERIOD_MS,
            bootstrap_policy: BootstrapPolicy::default(),
            initial_inventory,
        }
    }
}

impl SyncConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.signal_prefix.is_empty() {
            return Err(ConfigError::EmptySignalPrefix);
        }
        // keys derived from the state key must never fall under the signal
        // prefix, or peers would try to decode them as signals
        if self.state_key.starts_with(&self.signal_prefix)
            || self.signal_prefix.starts_with(&self.state_key)
        {
            return Err(ConfigError::StateKeyCollision(self.state_key.clone()));
        }
        if self.grace_period_ms == 0 {
            return Err(ConfigError::ZeroGracePeriod);
        }
        Ok(())
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn initial_state(&self) -> StockState {
        self.initial_inventory
            .iter()
            .map(|(id, qty)| (id.as_str(), *qty))
            .collect()
    }
}
