//! Clock configuration
//!
//! Every field has a default, so an empty TOML document is a valid config.

use crate::error::{ClockError, ConfigError};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    /// Initial sampling interval. `0` disables sampling.
    pub tick: f64,
    /// Recheck interval for pending conditions while `tick` is `0`. Only the
    /// watch list is checked on it; sampling stays off. `0` disables it.
    pub condition_tick: f64,
    /// Upper bound on steps per `run`.
    pub max_steps: u64,
    /// Upper bound on actions executed at a single instant.
    pub max_events_per_instant: u64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            tick: 0.0,
            condition_tick: 0.01,
            max_steps: 1_000_000,
            max_events_per_instant: 100_000,
        }
    }
}

impl ClockConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: ClockConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_tick(mut self, tick: f64) -> Self {
        self.tick = tick;
        self
    }

    pub fn validate(&self) -> Result<(), ClockError> {
        for value in [self.tick, self.condition_tick] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(ClockError::InvalidTime(value));
            }
        }
        Ok(())
    }
}
