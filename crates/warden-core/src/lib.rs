//! Isolated execution of untrusted code in ephemeral containers.
//!
//! A [`Sandbox`] accepts an [`ExecutionRequest`] (source text, a language
//! identifier and optional auxiliary files), runs it inside a throwaway,
//! network-less, resource-limited container and returns an
//! [`ExecutionResult`] with the captured output, exit status and timing.
//!
//! # Architecture Overview
//!
//! Each run is a strictly sequential pipeline owned by the run coordinator:
//!
//! - **Language mapping**: language identifier to source filename and argv
//! - **Workspace building**: a fresh temporary directory holding every input file
//! - **Container launch**: bind-mounted workspace, no network, CPU/memory/pid limits
//! - **Supervision**: the command raced against its wall-clock budget
//! - **Artifact collection**: files the program created or changed
//! - **Cleanup**: container and workspace released on every exit path
//!
//! Runs share nothing but the container runtime client, so any number of
//! them may be driven concurrently from independent tasks.

pub mod artifacts;
pub mod cleanup;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod language;
pub mod request;
pub mod runtime;
pub mod supervisor;
pub mod workspace;

pub use config::{ConfigLoader, SandboxConfig};
pub use coordinator::{HealthReport, RunState, Sandbox};
pub use errors::{RuntimeError, SandboxError};
pub use language::{Language, LanguageSpec};
pub use request::{ExecutionRequest, ExecutionResult};
pub use runtime::docker::DockerRuntime;
pub use runtime::ContainerRuntime;

#[cfg(test)]
pub mod test_utils;
