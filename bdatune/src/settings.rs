//! Runtime settings of the tuner.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunable timeouts and limits of [`BdaTuner`](crate::BdaTuner).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunerSettings {
    /// How long a size snapshot waits for the first sample.
    pub sample_wait_ms: u64,
    /// Timeout of one graph state poll while starting.
    pub state_poll_timeout_ms: u64,
    /// Upper bound of state polls per start attempt.
    pub max_state_polls: u32,
    /// Samples held before new ones are dropped.
    pub max_queued_samples: usize,
    /// Register built graphs with the diagnostic registry.
    pub register_diagnostics: bool,
}

impl Default for TunerSettings {
    fn default() -> Self {
        Self {
            sample_wait_ms: 2000,
            state_poll_timeout_ms: 100,
            max_state_polls: 50,
            max_queued_samples: 16384,
            register_diagnostics: true,
        }
    }
}

impl TunerSettings {
    pub fn sample_wait(&self) -> Duration {
        Duration::from_millis(self.sample_wait_ms)
    }

    pub fn state_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.state_poll_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = TunerSettings::default();
        assert_eq!(settings.sample_wait(), Duration::from_secs(2));
        assert_eq!(settings.state_poll_timeout(), Duration::from_millis(100));
        assert!(settings.register_diagnostics);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let settings: TunerSettings = toml::from_str("max_state_polls = 3").unwrap();
        assert_eq!(settings.max_state_polls, 3);
        assert_eq!(settings.max_queued_samples, 16384);
    }
}
