//! Error types for the execution pipeline
//!
//! Errors are split by who is at fault. [`SandboxError`] is the boundary
//! taxonomy: a rejected request, or an infrastructure stage that failed.
//! A user program that crashes, exits non-zero or runs out of time is not an
//! error at all; it is reported through a normal `ExecutionResult`.
//! [`RuntimeError`] wraps failures of the container runtime client and is
//! translated into the stage-specific `SandboxError` by the coordinator.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SandboxError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Unsupported language: '{0}'")]
    UnsupportedLanguage(String),
    #[error("Workspace error: {0}")]
    Workspace(String),
    #[error("Container launch failed: {0}")]
    ContainerLaunch(String),
    #[error("Runner error: {0}")]
    Runner(String),
    #[error("Image build failed: {0}")]
    ImageBuild(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SandboxError {
    /// Stable identifier of the error kind, suitable for a response body.
    pub fn kind(&self) -> &'static str {
        match self {
            SandboxError::Validation(_) | SandboxError::UnsupportedLanguage(_) => "validation_error",
            SandboxError::Workspace(_) => "workspace_error",
            SandboxError::ContainerLaunch(_) => "container_launch_error",
            SandboxError::Runner(_) => "runner_error",
            SandboxError::ImageBuild(_) => "image_build_error",
            SandboxError::Config(_) => "config_error",
        }
    }

    /// True when the request itself was at fault and nothing was allocated.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SandboxError::Validation(_) | SandboxError::UnsupportedLanguage(_)
        )
    }
}

// Specific error for the container runtime client
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Bollard (Docker client) error: {0}")]
    BollardError(#[from] bollard::errors::Error),
    #[error("I/O error during container operation: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Container {container} is not running")]
    NotRunning { container: String },
    #[error("Container runtime error: {0}")]
    Other(String),
}
