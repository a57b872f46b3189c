//! Configuration loader for YAML files and environment overrides
//!
//! Layering is defaults, then the optional YAML file, then `SANDBOX_*`
//! environment variables. Every entry point finishes with validation.

use crate::config::types::SandboxConfig;
use crate::errors::SandboxError;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::fs;

pub const ENV_IMAGE: &str = "SANDBOX_IMAGE";
pub const ENV_CPU_LIMIT: &str = "SANDBOX_CPU_LIMIT";
pub const ENV_MEMORY_LIMIT: &str = "SANDBOX_MEMORY_LIMIT";
pub const ENV_DEFAULT_TIMEOUT: &str = "SANDBOX_DEFAULT_TIMEOUT";
pub const ENV_MAX_TIMEOUT: &str = "SANDBOX_MAX_TIMEOUT";
pub const ENV_USER: &str = "SANDBOX_USER";
pub const ENV_PIDS_LIMIT: &str = "SANDBOX_PIDS_LIMIT";
pub const ENV_WORKSPACE_ROOT: &str = "SANDBOX_WORKSPACE_ROOT";

/// Configuration loader with environment resolution
pub struct ConfigLoader;

impl ConfigLoader {
    /// Defaults plus environment overrides
    pub fn from_env() -> Result<SandboxConfig, SandboxError> {
        let mut config = SandboxConfig::default();
        Self::apply_env_overrides(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file, then apply environment overrides
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<SandboxConfig, SandboxError> {
        let path = path.as_ref();

        let content = fs::read_to_string(path).await.map_err(|e| {
            SandboxError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        log::debug!("Loaded sandbox configuration from {}", path.display());
        Self::from_str(&content)
    }

    /// Load configuration from a YAML string, then apply environment overrides
    pub fn from_str(content: &str) -> Result<SandboxConfig, SandboxError> {
        let mut config: SandboxConfig = if content.trim().is_empty() {
            SandboxConfig::default()
        } else {
            serde_yaml::from_str(content)
                .map_err(|e| SandboxError::Config(format!("Failed to parse YAML config: {}", e)))?
        };

        Self::apply_env_overrides(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(config: &mut SandboxConfig) -> Result<(), SandboxError> {
        if let Some(image) = read_var(ENV_IMAGE) {
            config.image = image;
        }
        if let Some(cpu) = parse_var::<f64>(ENV_CPU_LIMIT)? {
            config.cpu_limit = cpu;
        }
        if let Some(memory) = read_var(ENV_MEMORY_LIMIT) {
            config.memory_limit = memory;
        }
        if let Some(timeout) = parse_var::<u64>(ENV_DEFAULT_TIMEOUT)? {
            config.default_timeout = timeout;
        }
        if let Some(timeout) = parse_var::<u64>(ENV_MAX_TIMEOUT)? {
            config.max_timeout = timeout;
        }
        if let Some(user) = read_var(ENV_USER) {
            config.user = user;
        }
        if let Some(pids) = parse_var::<i64>(ENV_PIDS_LIMIT)? {
            config.pids_limit = pids;
        }
        if let Some(root) = read_var(ENV_WORKSPACE_ROOT) {
            config.workspace_root = Some(PathBuf::from(root));
        }
        Ok(())
    }
}

fn read_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_var<T: FromStr>(name: &str) -> Result<Option<T>, SandboxError>
where
    T::Err: std::fmt::Display,
{
    match read_var(name) {
        Some(raw) => raw.parse::<T>().map(Some).map_err(|e| {
            SandboxError::Config(format!("Invalid value '{}' for {}: {}", raw, name, e))
        }),
        None => Ok(None),
    }
}
