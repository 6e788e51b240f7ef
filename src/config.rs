//! Configuration management for throttlers.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::error::{Result, ThrottleError};

/// Template used to build the throttler of every key.
///
/// All rates are in events per second. Omitted fields deserialize to zero.
///
/// `lower_bound <= starting_rate <= upper_bound` is a precondition the caller
/// must uphold; it is not enforced. When it is violated, `incr` and `decr`
/// still clamp according to their own rules and never panic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateConfig {
    /// Initial rate of a new key. Zero blocks the key until the first `incr`,
    /// so it should not be relied on as a steady state.
    pub starting_rate: u64,

    /// Maximum number of events admitted at once.
    pub burst: u64,

    /// Floor for the rate. A floor of zero means a key that reaches it never
    /// admits again unless something raises its rate.
    pub lower_bound: u64,

    /// Ceiling for the rate.
    pub upper_bound: u64,

    /// Step applied by `incr`, usually after a successful operation.
    pub increment: u64,

    /// Step applied by `decr`, usually after a failed operation. Also the
    /// threshold at or below which `decr` snaps straight to the floor.
    pub decrement: u64,
}

impl RateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| ThrottleError::Config(format!("Failed to parse rate config: {}", e)))
    }

    /// Whether `lower_bound <= starting_rate <= upper_bound` holds.
    pub fn has_valid_bounds(&self) -> bool {
        self.lower_bound <= self.starting_rate && self.starting_rate <= self.upper_bound
    }
}
