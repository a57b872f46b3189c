//! Guaranteed release of a run's container and workspace.
//!
//! The coordinator releases both explicitly, container first, once the
//! pipeline has produced its result or error. Both steps are always
//! attempted; a failure in one is logged and does not skip the other.
//!
//! If the coordinator's future is dropped before it gets that far, the
//! owned resources release themselves: a [`Workspace`] removes its
//! directory on drop, and a [`ContainerLease`] spawns a forced removal on
//! the current tokio runtime.

use crate::errors::SandboxError;
use crate::runtime::{ContainerHandle, ContainerRuntime};
use crate::workspace::Workspace;
use std::sync::Arc;

/// Exclusive ownership of one run's container.
pub struct ContainerLease {
    runtime: Arc<dyn ContainerRuntime>,
    handle: Option<ContainerHandle>,
}

impl ContainerLease {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, handle: ContainerHandle) -> Self {
        Self {
            runtime,
            handle: Some(handle),
        }
    }

    /// Force-remove the container. Removal kills whatever is still running.
    pub async fn release(mut self) -> Result<(), SandboxError> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        self.runtime.remove(&handle).await.map_err(|e| {
            SandboxError::Runner(format!("Could not remove container {}: {}", handle.name, e))
        })
    }
}

impl Drop for ContainerLease {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                let runtime = self.runtime.clone();
                log::warn!("Container {} abandoned, removing in background", handle.name);
                rt.spawn(async move {
                    if let Err(e) = runtime.remove(&handle).await {
                        log::error!("Background removal of {} failed: {}", handle.name, e);
                    }
                });
            }
            Err(_) => log::error!(
                "Container {} abandoned outside a tokio runtime; remove it with `warden sweep`",
                handle.name
            ),
        }
    }
}

/// What the cleanup pass managed to release.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// `None` when the run never got a container.
    pub container_removed: Option<bool>,
    /// `None` when the run never got a workspace.
    pub workspace_removed: Option<bool>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.container_removed != Some(false) && self.workspace_removed != Some(false)
    }
}

/// Release in reverse order of acquisition. Never fails; problems are
/// logged and reflected in the report.
pub async fn release(
    run_id: &str,
    container: Option<ContainerLease>,
    workspace: Option<Workspace>,
) -> CleanupReport {
    let mut report = CleanupReport::default();

    if let Some(lease) = container {
        let removed = match lease.release().await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Run {}: {}", run_id, e);
                false
            }
        };
        report.container_removed = Some(removed);
    }

    if let Some(workspace) = workspace {
        let removed = match workspace.remove().await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Run {}: {}", run_id, e);
                false
            }
        };
        report.workspace_removed = Some(removed);
    }

    report
}

/// Force-remove every container that carries the managed label.
pub async fn sweep(runtime: &dyn ContainerRuntime) -> Result<usize, SandboxError> {
    let leftovers = runtime
        .list_managed()
        .await
        .map_err(|e| SandboxError::Runner(format!("Could not list containers: {}", e)))?;

    let mut removed = 0;
    for handle in leftovers {
        match runtime.remove(&handle).await {
            Ok(()) => {
                log::info!("Removed leftover container {}", handle.name);
                removed += 1;
            }
            Err(e) => log::warn!("Could not remove leftover container {}: {}", handle.name, e),
        }
    }
    Ok(removed)
}
