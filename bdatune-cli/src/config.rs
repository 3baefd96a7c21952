//! Configuration file and tune parameter table.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use toml::Value;

use bdatune::platform::loopback::LoopbackConfig;
use bdatune::TunerSettings;
use bdatune_types::{ConfigSource, ConfigurationError, NetworkStandard};

/// Default configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "bdatune.toml";

/// Key of the network standard inside the `[tune]` table.
pub const STANDARD_KEY: &str = "standard";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid override {0:?}, expected KEY=VALUE")]
    Override(String),

    #[error("Invalid network standard {0:?}")]
    Standard(String),
}

/// Configuration file format.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    /// Flat `dvb-*` parameters plus `standard`.
    #[serde(default)]
    pub tune: toml::Table,
    #[serde(default)]
    pub tuner: TunerSettings,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub loopback: LoopbackConfig,
}

#[derive(Debug, Deserialize, Default)]
pub struct LoggingSection {
    pub log_dir: Option<String>,
    pub retention_days: Option<u64>,
    pub level: Option<String>,
}

pub fn load_config(path: &Path) -> Result<ConfigFile, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Tune parameters from the `[tune]` table with command-line overrides.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TuneTable {
    values: toml::Table,
}

impl TuneTable {
    pub fn new(values: toml::Table) -> Self {
        Self { values }
    }

    /// Apply `KEY=VALUE` overrides. Later entries win.
    pub fn apply_overrides(&mut self, overrides: &[String]) -> Result<(), ConfigError> {
        for entry in overrides {
            let (key, value) = entry
                .split_once('=')
                .filter(|(key, _)| !key.trim().is_empty())
                .ok_or_else(|| ConfigError::Override(entry.clone()))?;
            self.values
                .insert(key.trim().to_string(), Value::String(value.trim().to_string()));
        }
        Ok(())
    }

    /// Network standard named by the table, if any.
    pub fn standard(&self) -> Result<Option<NetworkStandard>, ConfigError> {
        match self.string(STANDARD_KEY) {
            Some(name) => name
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::Standard(name)),
            None => Ok(None),
        }
    }
}

impl ConfigSource for TuneTable {
    fn integer(&self, key: &str) -> Result<Option<i64>, ConfigurationError> {
        match self.values.get(key) {
            None => Ok(None),
            Some(Value::Integer(value)) => Ok(Some(*value)),
            Some(Value::String(raw)) if raw.trim().is_empty() => Ok(None),
            Some(Value::String(raw)) => raw.trim().parse::<i64>().map(Some).map_err(|_| {
                ConfigurationError::InvalidValue {
                    key: key.to_string(),
                    value: raw.clone(),
                }
            }),
            Some(other) => Err(ConfigurationError::InvalidValue {
                key: key.to_string(),
                value: other.to_string(),
            }),
        }
    }

    fn string(&self, key: &str) -> Option<String> {
        match self.values.get(key)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Integer(i) => Some(i.to_string()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bdatune_types::{keys, TuneParameters};

    const SAMPLE: &str = r#"
[tune]
standard = "dvb-s"
dvb-frequency = 11778000
dvb-srate = "27500"
dvb-polarisation = "V"
dvb-longitude = -50

[tuner]
max_state_polls = 10

[logging]
retention_days = 3

[loopback]
packets_per_sample = 14

[[loopback.tuners]]
name = "Busy Tuner"
busy = true

[[loopback.tuners]]
name = "Spare Tuner"
"#;

    #[test]
    fn test_parse_config_file() {
        let config: ConfigFile = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.tuner.max_state_polls, 10);
        assert_eq!(config.tuner.sample_wait_ms, 2000);
        assert_eq!(config.logging.retention_days, Some(3));
        assert_eq!(config.loopback.packets_per_sample, 14);
        assert_eq!(config.loopback.tuners.len(), 2);
        assert!(config.loopback.tuners[0].busy);
        assert!(!config.loopback.tuners[1].busy);
        assert_eq!(config.loopback.receivers.len(), 1);

        let table = TuneTable::new(config.tune);
        assert_eq!(table.standard().unwrap(), Some(NetworkStandard::DvbS));

        let params = TuneParameters::from_source(&table).unwrap();
        assert_eq!(params.frequency, Some(11_778_000));
        assert_eq!(params.symbol_rate, Some(27_500));
        assert_eq!(params.polarisation.as_deref(), Some("V"));
        assert_eq!(params.longitude, Some(-50));
        assert_eq!(params.bandwidth, None);
    }

    #[test]
    fn test_overrides_take_precedence() {
        let config: ConfigFile = toml::from_str(SAMPLE).unwrap();
        let mut table = TuneTable::new(config.tune);
        table
            .apply_overrides(&[
                format!("{}=12188000", keys::FREQUENCY),
                "standard = dvb-t".to_string(),
            ])
            .unwrap();
        assert_eq!(table.integer(keys::FREQUENCY).unwrap(), Some(12_188_000));
        assert_eq!(table.standard().unwrap(), Some(NetworkStandard::DvbT));
    }

    #[test]
    fn test_malformed_values() {
        let mut table = TuneTable::default();
        assert!(matches!(
            table.apply_overrides(&["dvb-frequency".to_string()]),
            Err(ConfigError::Override(_))
        ));
        assert!(matches!(
            table.apply_overrides(&["=5".to_string()]),
            Err(ConfigError::Override(_))
        ));

        table.apply_overrides(&["dvb-guard=eight".to_string()]).unwrap();
        assert!(matches!(
            table.integer(keys::GUARD),
            Err(ConfigurationError::InvalidValue { .. })
        ));

        table.apply_overrides(&["standard=isdb-t".to_string()]).unwrap();
        assert!(matches!(table.standard(), Err(ConfigError::Standard(_))));
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: ConfigFile = toml::from_str("").unwrap();
        assert_eq!(config.tuner, TunerSettings::default());
        assert_eq!(config.loopback, LoopbackConfig::default());
        assert!(TuneTable::new(config.tune).standard().unwrap().is_none());
    }
}
