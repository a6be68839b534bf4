use courier_core::policy::Policy;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Clone, Debug, Deserialize)]
pub struct CourierConfig {
    /// Local account identifiers the daemon can send from.
    #[serde(default)]
    pub accounts: Vec<String>,
    pub channel: ChannelConfig,
    #[serde(default)]
    pub policy: Policy,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ChannelConfig {
    pub client_name: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io")]
    Io,
    #[error("parse")]
    Parse,
}

pub fn load_config(path: &Path) -> Result<CourierConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|_| ConfigError::Io)?;
    toml::from_str(&content).map_err(|_| ConfigError::Parse)
}
