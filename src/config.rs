use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::Deserialize;

use crate::index::RedisConfig;
use crate::limit::RateLimitConfig;
use crate::storage::StorageConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Daemon configuration, loaded from a JSON file. The storage section is
/// mandatory (enforced at startup); every limiter knob is optional and a
/// zero value disables the matching limiter.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    pub storage: Option<StorageConfig>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default)]
    pub redis: Option<RedisConfig>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let file = File::open(path)?;
        let cfg = serde_json::from_reader(BufReader::new(file))?;
        Ok(cfg)
    }
}
