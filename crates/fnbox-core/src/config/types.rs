//! Engine configuration types
//!
//! Every field has a default, so an empty YAML document is a valid
//! configuration. The defaults mirror a conservative single-host deployment:
//! half a core and 512 MB per sandbox, no network, launchers under `/tmp`.

use crate::errors::ConfigError;
use crate::language::Language;
use crate::runtime::ResourceLimits;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Prefix of the deterministic sandbox name, followed by the function id.
    #[serde(default = "default_container_prefix")]
    pub container_prefix: String,
    /// Memory ceiling, e.g. `512m`, `1g`, or a plain byte count.
    #[serde(default = "default_memory_limit")]
    pub memory_limit: String,
    /// CPU quota as a fraction of one core.
    #[serde(default = "default_cpu_quota")]
    pub cpu_quota: f64,
    #[serde(default = "default_cpu_period")]
    pub cpu_period: i64,
    /// Directory inside the sandbox receiving launchers.
    #[serde(default = "default_launcher_dir")]
    pub launcher_dir: String,
    /// Used when a function record carries a zero timeout.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Extra time granted on top of the in-sandbox timeout before the engine
    /// kills the invocation itself.
    #[serde(default = "default_timeout_grace_secs")]
    pub timeout_grace_secs: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: i32,
    #[serde(default = "default_true")]
    pub pull_images: bool,
    #[serde(default = "default_true")]
    pub network_disabled: bool,
    /// Per-language image overrides.
    #[serde(default)]
    pub images: HashMap<Language, String>,
}

fn default_container_prefix() -> String {
    "function_".to_string()
}

fn default_memory_limit() -> String {
    "512m".to_string()
}

fn default_cpu_quota() -> f64 {
    0.5
}

fn default_cpu_period() -> i64 {
    100_000
}

fn default_launcher_dir() -> String {
    "/tmp".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_timeout_grace_secs() -> u64 {
    5
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_stop_timeout_secs() -> i32 {
    2
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            container_prefix: default_container_prefix(),
            memory_limit: default_memory_limit(),
            cpu_quota: default_cpu_quota(),
            cpu_period: default_cpu_period(),
            launcher_dir: default_launcher_dir(),
            default_timeout_secs: default_timeout_secs(),
            timeout_grace_secs: default_timeout_grace_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            stop_timeout_secs: default_stop_timeout_secs(),
            pull_images: default_true(),
            network_disabled: default_true(),
            images: HashMap::new(),
        }
    }
}

// Docker refuses memory limits below 6 MB.
const MIN_MEMORY_BYTES: i64 = 6 * 1024 * 1024;

impl EngineConfig {
    pub fn image_for(&self, language: Language) -> String {
        self.images
            .get(&language)
            .cloned()
            .unwrap_or_else(|| language.default_image().to_string())
    }

    pub fn memory_limit_bytes(&self) -> Result<i64, ConfigError> {
        parse_memory_limit(&self.memory_limit)
    }

    pub fn resource_limits(&self) -> Result<ResourceLimits, ConfigError> {
        Ok(ResourceLimits::new(
            self.memory_limit_bytes()?,
            self.cpu_quota,
            self.cpu_period,
        ))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.container_prefix.is_empty()
            || !self.container_prefix.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
            || !self
                .container_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        {
            return Err(ConfigError::invalid(
                "container_prefix",
                format!(
                    "'{}' must start with a letter or digit and contain only [A-Za-z0-9_.-]",
                    self.container_prefix
                ),
            ));
        }

        if self.memory_limit_bytes()? < MIN_MEMORY_BYTES {
            return Err(ConfigError::invalid(
                "memory_limit",
                format!("'{}' is below the 6m minimum", self.memory_limit),
            ));
        }

        if !(self.cpu_quota > 0.0 && self.cpu_quota <= 64.0) {
            return Err(ConfigError::invalid(
                "cpu_quota",
                format!("{} must be in (0, 64]", self.cpu_quota),
            ));
        }

        // Docker accepts CFS periods between 1ms and 1s.
        if !(1_000..=1_000_000).contains(&self.cpu_period) {
            return Err(ConfigError::invalid(
                "cpu_period",
                format!("{} must be between 1000 and 1000000 microseconds", self.cpu_period),
            ));
        }

        if !self.launcher_dir.starts_with('/') {
            return Err(ConfigError::invalid(
                "launcher_dir",
                format!("'{}' must be an absolute path", self.launcher_dir),
            ));
        }

        if self.default_timeout_secs == 0 {
            return Err(ConfigError::invalid("default_timeout_secs", "must be positive"));
        }

        for (language, image) in &self.images {
            if image.trim().is_empty() {
                return Err(ConfigError::invalid(
                    "images",
                    format!("empty image for {}", language),
                ));
            }
        }

        Ok(())
    }
}

/// Parses `512m`, `1g`, `64MB`, `1048576` into bytes.
pub fn parse_memory_limit(value: &str) -> Result<i64, ConfigError> {
    let normalized = value.trim().to_ascii_lowercase();
    let without_b = normalized.strip_suffix('b').unwrap_or(&normalized);
    let (digits, multiplier) = match without_b.chars().last() {
        Some('k') => (&without_b[..without_b.len() - 1], 1024),
        Some('m') => (&without_b[..without_b.len() - 1], 1024 * 1024),
        Some('g') => (&without_b[..without_b.len() - 1], 1024 * 1024 * 1024),
        _ => (without_b, 1),
    };

    digits
        .trim()
        .parse::<i64>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .filter(|n| *n > 0)
        .ok_or_else(|| {
            ConfigError::invalid("memory_limit", format!("cannot parse '{}'", value))
        })
}
