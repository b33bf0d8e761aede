use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

use crate::speedtest::Command;

pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:9801";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unable to read file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to unmarshal config: {0}")]
    ParseJson(#[from] serde_json::Error),
    #[error("unable to parse TOML config: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExporterConfig {
    pub command: Command,

    /// Servers to test, in the order they are tested each cycle.
    pub servers: Vec<i32>,

    /// How often to run the speed tests. This should be greater than the time
    /// it takes to test every server.
    #[serde(
        deserialize_with = "deserialize_tick",
        serialize_with = "serialize_tick"
    )]
    pub tick: Duration,

    #[serde(default = "default_listen_address")]
    pub listen_address: String,
}

fn default_listen_address() -> String {
    DEFAULT_LISTEN_ADDRESS.to_string()
}

/// Parses durations such as `"30m"`, `"1h30m"` or `"90s"`.
pub fn parse_tick(value: &str) -> Result<Duration, ConfigError> {
    let tick = humantime::parse_duration(value.trim())
        .map_err(|e| ConfigError::Invalid(format!("invalid duration {value:?}: {e}")))?;
    if tick.is_zero() {
        return Err(ConfigError::Invalid(format!(
            "tick must be greater than zero, got {value:?}"
        )));
    }
    Ok(tick)
}

fn deserialize_tick<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_tick(&raw).map_err(serde::de::Error::custom)
}

fn serialize_tick<S>(tick: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&humantime::format_duration(*tick).to_string())
}

impl ExporterConfig {
    /// Reads the config file at `path`. Files ending in `.toml` are parsed as
    /// TOML, everything else as JSON.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "Attempting to load config.");

        let contents = fs::read_to_string(path).map_err(|source| {
            error!(path = %path.display(), error = %source, "Failed to read config file.");
            ConfigError::Read {
                path: path.display().to_string(),
                source,
            }
        })?;

        let is_toml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        let config = if is_toml {
            Self::from_toml_str(&contents)
        } else {
            Self::from_json_str(&contents)
        }
        .inspect_err(|e| {
            error!(path = %path.display(), error = %e, "Failed to parse config file.");
        })?;

        info!(config = ?config, "Loaded config successfully.");
        Ok(config)
    }

    pub fn from_json_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.command.name.trim().is_empty() {
            return Err(ConfigError::Invalid("command name is empty".to_string()));
        }
        if self.servers.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one server must be configured".to_string(),
            ));
        }
        Ok(())
    }
}
