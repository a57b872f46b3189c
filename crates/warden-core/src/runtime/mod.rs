//! Container runtime seam.
//!
//! The coordinator only talks to containers through [`ContainerRuntime`].
//! One client is shared by every concurrent run; implementations must not
//! keep per-run mutable state. Isolation settings that are security
//! invariants (no network, dropped capabilities, no privilege escalation)
//! are not part of [`ContainerSpec`] and cannot be relaxed by callers.

use crate::errors::RuntimeError;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::Stream;
use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;

pub mod docker;
pub mod image;

pub const MANAGED_LABEL: &str = "warden.managed";
pub const RUN_ID_LABEL: &str = "warden.run_id";

/// Everything needed to create one run's container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Host directory bind-mounted at `workdir`.
    pub workspace: PathBuf,
    pub workdir: String,
    pub mount_readonly: bool,
    pub user: String,
    pub nano_cpus: i64,
    pub memory_bytes: i64,
    pub pids_limit: i64,
    pub readonly_rootfs: bool,
    pub tmpfs_bytes: i64,
    pub labels: HashMap<String, String>,
}

/// Opaque reference to a created container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
}

/// A command to run inside a launched container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub command: Vec<String>,
    pub env: Vec<String>,
    pub workdir: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    Stdout(Bytes),
    Stderr(Bytes),
}

pub type OutputStream = Pin<Box<dyn Stream<Item = Result<OutputChunk, RuntimeError>> + Send>>;

/// A started command: its id for exit-status lookup and its output.
/// The stream ends when the process exits.
pub struct ExecSession {
    pub exec_id: String,
    pub output: OutputStream,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Version string reported by the runtime
    async fn version(&self) -> Result<String, RuntimeError>;

    /// Whether `image` is present locally
    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError>;

    /// Create and start an idle container for one run
    async fn launch(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError>;

    /// Start a command inside the container and attach to its output
    async fn exec(
        &self,
        container: &ContainerHandle,
        invocation: &Invocation,
    ) -> Result<ExecSession, RuntimeError>;

    /// Exit code of a finished command; `None` while it is still running
    async fn exec_exit_code(&self, exec_id: &str) -> Result<Option<i64>, RuntimeError>;

    /// Kill every process in the container immediately
    async fn kill(&self, container: &ContainerHandle) -> Result<(), RuntimeError>;

    /// Force-remove the container and its anonymous volumes
    async fn remove(&self, container: &ContainerHandle) -> Result<(), RuntimeError>;

    /// Containers carrying [`MANAGED_LABEL`], running or not
    async fn list_managed(&self) -> Result<Vec<ContainerHandle>, RuntimeError>;

    /// Build `tag` from a gzip tar build context
    async fn build_image(
        &self,
        context: Vec<u8>,
        dockerfile: &str,
        tag: &str,
    ) -> Result<(), RuntimeError>;
}
