//! Configuration loader for YAML files and environment overrides
//!
//! Loading goes file -> YAML parse -> environment overrides -> validation.
//! Overrides use `FNBOX_*` variables so a deployment can adjust limits
//! without editing the file.

use crate::config::types::EngineConfig;
use crate::errors::ConfigError;
use std::env;
use std::path::Path;
use tokio::fs;

pub const ENV_CONTAINER_PREFIX: &str = "FNBOX_CONTAINER_PREFIX";
pub const ENV_MEMORY_LIMIT: &str = "FNBOX_MEMORY_LIMIT";
pub const ENV_CPU_QUOTA: &str = "FNBOX_CPU_QUOTA";
pub const ENV_PULL_IMAGES: &str = "FNBOX_PULL_IMAGES";
pub const ENV_DEFAULT_TIMEOUT: &str = "FNBOX_DEFAULT_TIMEOUT";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a YAML file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<EngineConfig, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).await.map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_str(&content)
    }

    /// Load configuration from a YAML string
    pub fn from_str(content: &str) -> Result<EngineConfig, ConfigError> {
        let mut config: EngineConfig = if content.trim().is_empty() {
            EngineConfig::default()
        } else {
            serde_yaml::from_str(content)?
        };
        Self::apply_overrides(&mut config, |key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a file.
    pub fn from_env() -> Result<EngineConfig, ConfigError> {
        Self::from_str("")
    }

    pub fn apply_overrides<F>(config: &mut EngineConfig, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(prefix) = lookup(ENV_CONTAINER_PREFIX) {
            config.container_prefix = prefix;
        }
        if let Some(limit) = lookup(ENV_MEMORY_LIMIT) {
            config.memory_limit = limit;
        }
        if let Some(quota) = lookup(ENV_CPU_QUOTA) {
            config.cpu_quota = quota.trim().parse().map_err(|_| {
                ConfigError::invalid("cpu_quota", format!("cannot parse '{}' from {}", quota, ENV_CPU_QUOTA))
            })?;
        }
        if let Some(pull) = lookup(ENV_PULL_IMAGES) {
            config.pull_images = parse_flag(&pull).ok_or_else(|| {
                ConfigError::invalid("pull_images", format!("cannot parse '{}' from {}", pull, ENV_PULL_IMAGES))
            })?;
        }
        if let Some(timeout) = lookup(ENV_DEFAULT_TIMEOUT) {
            config.default_timeout_secs = timeout.trim().parse().map_err(|_| {
                ConfigError::invalid(
                    "default_timeout_secs",
                    format!("cannot parse '{}' from {}", timeout, ENV_DEFAULT_TIMEOUT),
                )
            })?;
        }
        Ok(())
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
