//! Configuration type definitions for the sandbox
//!
//! Everything here is process-wide policy consumed by the container launcher.
//! None of it is part of the per-request API, so a caller can never ask for
//! more CPU, memory or privileges than the operator configured.

use crate::errors::SandboxError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Docker refuses memory limits below this.
pub const MIN_MEMORY_BYTES: i64 = 6 * 1024 * 1024;

/// Hard ceiling on any configured `max_timeout`.
pub const TIMEOUT_CEILING: u64 = 3600;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SandboxConfig {
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: f64,
    #[serde(default = "default_memory_limit")]
    pub memory_limit: String,
    #[serde(default = "default_timeout")]
    pub default_timeout: u64,
    #[serde(default = "default_max_timeout")]
    pub max_timeout: u64,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,
    #[serde(default = "default_true")]
    pub readonly_rootfs: bool,
    #[serde(default = "default_tmpfs_size")]
    pub tmpfs_size: String,
    /// Parent directory for run workspaces; the system temp dir when unset.
    /// Must be visible to the Docker daemon at the same path.
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,
    #[serde(default = "default_container_workdir")]
    pub container_workdir: String,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default = "default_max_artifact_bytes")]
    pub max_artifact_bytes: usize,
}

fn default_image() -> String {
    "aurea-sandbox:latest".to_string()
}

fn default_cpu_limit() -> f64 {
    1.0
}

fn default_memory_limit() -> String {
    "512m".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_max_timeout() -> u64 {
    300
}

fn default_user() -> String {
    "sandbox".to_string()
}

fn default_pids_limit() -> i64 {
    256
}

fn default_true() -> bool {
    true
}

fn default_tmpfs_size() -> String {
    "64m".to_string()
}

fn default_container_workdir() -> String {
    "/workspace".to_string()
}

fn default_max_output_bytes() -> usize {
    1024 * 1024
}

fn default_max_artifact_bytes() -> usize {
    1024 * 1024
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            cpu_limit: default_cpu_limit(),
            memory_limit: default_memory_limit(),
            default_timeout: default_timeout(),
            max_timeout: default_max_timeout(),
            user: default_user(),
            pids_limit: default_pids_limit(),
            readonly_rootfs: true,
            tmpfs_size: default_tmpfs_size(),
            workspace_root: None,
            container_workdir: default_container_workdir(),
            max_output_bytes: default_max_output_bytes(),
            max_artifact_bytes: default_max_artifact_bytes(),
        }
    }
}

impl SandboxConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), SandboxError> {
        if self.image.trim().is_empty() {
            return Err(SandboxError::Config("Sandbox image cannot be empty".to_string()));
        }

        if !self.cpu_limit.is_finite() || self.cpu_limit <= 0.0 {
            return Err(SandboxError::Config(format!(
                "cpu_limit must be a positive number of cores, got {}",
                self.cpu_limit
            )));
        }

        let memory = self.memory_bytes()?;
        if memory < MIN_MEMORY_BYTES {
            return Err(SandboxError::Config(format!(
                "memory_limit '{}' is below the 6m minimum",
                self.memory_limit
            )));
        }
        self.tmpfs_bytes()?;

        if self.max_timeout == 0 || self.max_timeout > TIMEOUT_CEILING {
            return Err(SandboxError::Config(format!(
                "max_timeout must be between 1 and {} seconds, got {}",
                TIMEOUT_CEILING, self.max_timeout
            )));
        }

        if self.default_timeout == 0 || self.default_timeout > self.max_timeout {
            return Err(SandboxError::Config(format!(
                "default_timeout must be between 1 and max_timeout ({}), got {}",
                self.max_timeout, self.default_timeout
            )));
        }

        let user = self.user.trim();
        if user.is_empty() || user == "root" || user == "0" || user.starts_with("0:") {
            return Err(SandboxError::Config(format!(
                "Sandbox user must be a non-root user, got '{}'",
                self.user
            )));
        }

        if self.pids_limit <= 0 {
            return Err(SandboxError::Config("pids_limit must be greater than 0".to_string()));
        }

        if !self.container_workdir.starts_with('/') {
            return Err(SandboxError::Config(format!(
                "container_workdir must be an absolute path, got '{}'",
                self.container_workdir
            )));
        }

        if self.max_output_bytes == 0 {
            return Err(SandboxError::Config("max_output_bytes must be greater than 0".to_string()));
        }

        if self.max_artifact_bytes == 0 {
            return Err(SandboxError::Config("max_artifact_bytes must be greater than 0".to_string()));
        }

        Ok(())
    }

    pub fn memory_bytes(&self) -> Result<i64, SandboxError> {
        parse_size(&self.memory_limit)
            .map_err(|e| SandboxError::Config(format!("Invalid memory_limit: {}", e)))
    }

    pub fn tmpfs_bytes(&self) -> Result<i64, SandboxError> {
        parse_size(&self.tmpfs_size)
            .map_err(|e| SandboxError::Config(format!("Invalid tmpfs_size: {}", e)))
    }

    /// CPU limit in the billionths-of-a-core unit the Docker API expects.
    pub fn nano_cpus(&self) -> i64 {
        (self.cpu_limit * 1_000_000_000.0).round() as i64
    }
}

/// Parse a Docker style size such as `512m`, `1g`, `64MB` or `1048576`.
pub fn parse_size(value: &str) -> Result<i64, String> {
    let re = Regex::new(r"(?i)^\s*(\d+)\s*([bkmg]?)b?\s*$").map_err(|e| e.to_string())?;
    let caps = re
        .captures(value)
        .ok_or_else(|| format!("'{}' is not a size (expected e.g. 512m or 1g)", value))?;

    let amount: i64 = caps[1]
        .parse()
        .map_err(|_| format!("'{}' is out of range", value))?;
    let multiplier: i64 = match caps[2].to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" => 1024,
        "m" => 1024 * 1024,
        "g" => 1024 * 1024 * 1024,
        other => return Err(format!("unknown size unit '{}'", other)),
    };

    let bytes = amount
        .checked_mul(multiplier)
        .ok_or_else(|| format!("'{}' is out of range", value))?;
    if bytes == 0 {
        return Err(format!("'{}' must be greater than zero", value));
    }
    Ok(bytes)
}
