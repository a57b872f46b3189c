//! Run coordination: one request in, one result out.
//!
//! [`Sandbox::execute`] owns a run from validation to cleanup. The stages
//! run strictly in order (workspace, container, supervised execution,
//! artifacts) and, whatever happens in them, cleanup runs exactly once
//! before the call returns. `Sandbox` is cheap to share: it holds only the
//! immutable policy and the shared runtime client, so concurrent calls are
//! fully independent pipelines.

use crate::artifacts;
use crate::cleanup::{self, ContainerLease};
use crate::config::SandboxConfig;
use crate::errors::{RuntimeError, SandboxError};
use crate::request::{ExecutionPlan, ExecutionRequest, ExecutionResult};
use crate::runtime::image::pack_build_context;
use crate::runtime::{
    docker::DockerRuntime, ContainerRuntime, ContainerSpec, Invocation, MANAGED_LABEL,
    RUN_ID_LABEL,
};
use crate::supervisor::Supervisor;
use crate::workspace::{Workspace, WorkspaceSnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

/// Lifecycle of a run. States only ever move forward; `Errored` may be
/// entered from any earlier state and every run ends in `CleanedUp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RunState {
    Created,
    WorkspaceReady,
    ContainerRunning,
    Executed,
    Errored,
    CleanedUp,
}

/// Transient per-run resources. Never shared and never outlives `execute`.
struct Run {
    id: String,
    state: RunState,
    workspace: Option<Workspace>,
    container: Option<ContainerLease>,
}

impl Run {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            state: RunState::Created,
            workspace: None,
            container: None,
        }
    }

    fn advance(&mut self, next: RunState) {
        if next <= self.state {
            log::error!(
                "Run {}: refusing backward transition {:?} -> {:?}",
                self.id,
                self.state,
                next
            );
            return;
        }
        log::debug!("Run {}: {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthReport {
    pub status: String,
    pub sandbox_available: bool,
    pub docker_version: Option<String>,
    pub image_available: bool,
    pub checked_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Sandbox {
    config: Arc<SandboxConfig>,
    runtime: Arc<dyn ContainerRuntime>,
}

impl Sandbox {
    pub fn new(
        config: SandboxConfig,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Result<Self, SandboxError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            runtime,
        })
    }

    /// Build a sandbox on the local Docker daemon
    pub fn connect(config: SandboxConfig) -> Result<Self, SandboxError> {
        let runtime = DockerRuntime::connect().map_err(|e| {
            SandboxError::ContainerLaunch(format!("Could not connect to Docker: {}", e))
        })?;
        Self::new(config, Arc::new(runtime))
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Execute one request end to end.
    ///
    /// Validation failures are returned before anything is allocated. A
    /// program that fails or times out yields `Ok` with `success == false`;
    /// `Err` means the sandbox itself could not do its job.
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, SandboxError> {
        let plan = request.validate(&self.config).map_err(|e| {
            log::info!("Rejected execution request: {}", e);
            e
        })?;

        let mut run = Run::new();
        log::info!(
            "Run {} started: language={} timeout={}s files={} readonly={} capture_artifacts={}",
            run.id,
            plan.language,
            plan.timeout_secs,
            plan.files.len(),
            plan.readonly,
            plan.capture_artifacts
        );

        let outcome = self.drive(&mut run, &request.code, &plan).await;
        if let Err(e) = &outcome {
            log::error!("Run {} failed after {:?}: {}", run.id, run.state, e);
            run.advance(RunState::Errored);
        }

        let report = cleanup::release(&run.id, run.container.take(), run.workspace.take()).await;
        run.advance(RunState::CleanedUp);
        if !report.is_clean() {
            log::warn!("Run {} left resources behind: {:?}", run.id, report);
        }

        if let Ok(result) = &outcome {
            log::info!(
                "Run {} finished: success={} exit_code={:?} timed_out={} time={:.3}s artifacts={}",
                result.run_id,
                result.success,
                result.exit_code,
                result.timed_out,
                result.execution_time,
                result.artifacts.len()
            );
        }
        outcome
    }

    async fn drive(
        &self,
        run: &mut Run,
        code: &str,
        plan: &ExecutionPlan,
    ) -> Result<ExecutionResult, SandboxError> {
        let workspace = run
            .workspace
            .insert(Workspace::create(self.config.workspace_root.as_deref())?);
        let snapshot = workspace.materialize(plan, code).await?;
        let workspace_path = workspace.path().to_path_buf();
        run.advance(RunState::WorkspaceReady);

        let spec = self.container_spec(&run.id, &workspace_path, plan)?;
        let handle = self
            .runtime
            .launch(&spec)
            .await
            .map_err(|e| SandboxError::ContainerLaunch(e.to_string()))?;
        run.container = Some(ContainerLease::new(self.runtime.clone(), handle.clone()));
        run.advance(RunState::ContainerRunning);

        let invocation = Invocation {
            command: plan.spec.command.clone(),
            env: plan.spec.env.clone(),
            workdir: self.config.container_workdir.clone(),
        };
        let outcome = Supervisor::new(self.runtime.as_ref(), self.config.max_output_bytes)
            .run(&run.id, &handle, &invocation, plan.timeout())
            .await?;
        run.advance(RunState::Executed);

        let artifacts = if plan.capture_artifacts && !plan.readonly {
            self.collect_artifacts(&run.id, &handle, &workspace_path, &snapshot)
                .await?
        } else {
            BTreeMap::new()
        };

        Ok(ExecutionResult {
            run_id: run.id.clone(),
            success: outcome.success(),
            exit_code: outcome.exit_code,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            execution_time: outcome.elapsed.as_secs_f64(),
            timed_out: outcome.timed_out,
            timeout: plan.timeout_secs,
            artifacts,
        })
    }

    async fn collect_artifacts(
        &self,
        run_id: &str,
        handle: &crate::runtime::ContainerHandle,
        workspace: &Path,
        snapshot: &WorkspaceSnapshot,
    ) -> Result<BTreeMap<String, String>, SandboxError> {
        // Stop stray background processes so the workspace holds still
        match self.runtime.kill(handle).await {
            Ok(()) | Err(RuntimeError::NotRunning { .. }) => {}
            Err(e) => log::warn!("Run {}: could not stop container before collection: {}", run_id, e),
        }
        artifacts::collect(workspace, snapshot, self.config.max_artifact_bytes).await
    }

    fn container_spec(
        &self,
        run_id: &str,
        workspace: &Path,
        plan: &ExecutionPlan,
    ) -> Result<ContainerSpec, SandboxError> {
        let mut labels = HashMap::new();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        labels.insert(RUN_ID_LABEL.to_string(), run_id.to_string());

        Ok(ContainerSpec {
            name: format!("warden-{}", run_id),
            image: self.config.image.clone(),
            workspace: workspace.to_path_buf(),
            workdir: self.config.container_workdir.clone(),
            mount_readonly: plan.readonly,
            user: self.config.user.clone(),
            nano_cpus: self.config.nano_cpus(),
            memory_bytes: self.config.memory_bytes()?,
            pids_limit: self.config.pids_limit,
            readonly_rootfs: self.config.readonly_rootfs,
            tmpfs_bytes: self.config.tmpfs_bytes()?,
            labels,
        })
    }

    /// Runtime reachability and image presence. Never fails.
    pub async fn health(&self) -> HealthReport {
        let docker_version = match self.runtime.version().await {
            Ok(version) => Some(version),
            Err(e) => {
                log::warn!("Container runtime unavailable: {}", e);
                None
            }
        };
        let sandbox_available = docker_version.is_some();

        let image_available = if sandbox_available {
            match self.runtime.image_exists(&self.config.image).await {
                Ok(present) => present,
                Err(e) => {
                    log::warn!("Could not inspect image {}: {}", self.config.image, e);
                    false
                }
            }
        } else {
            false
        };

        HealthReport {
            status: if sandbox_available && image_available {
                "healthy".to_string()
            } else {
                "degraded".to_string()
            },
            sandbox_available,
            docker_version,
            image_available,
            checked_at: Utc::now(),
        }
    }

    /// Rebuild the execution image from `dockerfile`, tagged `tag` or the
    /// configured image name. Returns the tag that was built.
    pub async fn build_image(
        &self,
        dockerfile: &Path,
        tag: Option<&str>,
    ) -> Result<String, SandboxError> {
        let tag = tag.unwrap_or(&self.config.image).to_string();

        if !dockerfile.is_file() {
            return Err(SandboxError::ImageBuild(format!(
                "Dockerfile not found: {}",
                dockerfile.display()
            )));
        }
        let dockerfile_name = dockerfile
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| SandboxError::ImageBuild("Invalid Dockerfile path".to_string()))?;
        let context_dir = match dockerfile.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => Path::new(".").to_path_buf(),
        };

        log::info!(
            "Building image {} from {}",
            tag,
            dockerfile.display()
        );
        let context = tokio::task::spawn_blocking(move || pack_build_context(&context_dir))
            .await
            .map_err(|e| SandboxError::ImageBuild(format!("Context packing task failed: {}", e)))?
            .map_err(|e| SandboxError::ImageBuild(format!("Could not pack build context: {}", e)))?;

        self.runtime
            .build_image(context, &dockerfile_name, &tag)
            .await
            .map_err(|e| SandboxError::ImageBuild(e.to_string()))?;

        let present = self
            .runtime
            .image_exists(&tag)
            .await
            .map_err(|e| SandboxError::ImageBuild(e.to_string()))?;
        if !present {
            return Err(SandboxError::ImageBuild(format!(
                "Image {} is missing after a successful build",
                tag
            )));
        }

        log::info!("Successfully built image {}", tag);
        Ok(tag)
    }

    /// Remove containers left behind by earlier processes.
    pub async fn sweep(&self) -> Result<usize, SandboxError> {
        cleanup::sweep(self.runtime.as_ref()).await
    }
}
