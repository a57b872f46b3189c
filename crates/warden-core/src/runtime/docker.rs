// src/runtime/docker.rs
use async_trait::async_trait;
use bollard::container::LogOutput; // For LogOutput::StdOut, LogOutput::StdErr
use bollard::exec::{StartExecOptions, StartExecResults};
use bollard::models::{ContainerCreateBody, ExecConfig, HostConfig};
use bollard::query_parameters::{
    BuildImageOptions as BollardBuildImageOptionsQuery,
    CreateContainerOptions as BollardCreateContainerOptionsQuery,
    KillContainerOptions as BollardKillContainerOptionsQuery,
    ListContainersOptions as BollardListContainersOptionsQuery,
    RemoveContainerOptions as BollardRemoveContainerOptionsQuery,
    StartContainerOptions as BollardStartContainerOptionsQuery,
};
use bollard::Docker;
use bytes::Bytes;
use futures_util::future;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::default::Default;

use super::{
    ContainerHandle, ContainerRuntime, ContainerSpec, ExecSession, Invocation, OutputChunk,
    MANAGED_LABEL,
};
use crate::errors::RuntimeError;

/// Keeps the container alive between launch and the supervised exec.
const IDLE_ENTRYPOINT: &str = "sleep";
const IDLE_ARG: &str = "infinity";

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    fn container_body(spec: &ContainerSpec) -> ContainerCreateBody {
        let mode = if spec.mount_readonly { "ro" } else { "rw" };
        let bind = format!("{}:{}:{}", spec.workspace.display(), spec.workdir, mode);

        let tmpfs = if spec.readonly_rootfs {
            let mut tmpfs = HashMap::new();
            tmpfs.insert(
                "/tmp".to_string(),
                format!("rw,noexec,nosuid,size={}", spec.tmpfs_bytes),
            );
            Some(tmpfs)
        } else {
            None
        };

        ContainerCreateBody {
            image: Some(spec.image.clone()),
            entrypoint: Some(vec![IDLE_ENTRYPOINT.to_string()]),
            cmd: Some(vec![IDLE_ARG.to_string()]),
            working_dir: Some(spec.workdir.clone()),
            user: Some(spec.user.clone()),
            labels: Some(spec.labels.clone()),
            network_disabled: Some(true),
            attach_stdout: Some(false),
            attach_stderr: Some(false),
            tty: Some(false),
            host_config: Some(HostConfig {
                binds: Some(vec![bind]),
                network_mode: Some("none".to_string()),
                nano_cpus: Some(spec.nano_cpus),
                memory: Some(spec.memory_bytes),
                memory_swap: Some(spec.memory_bytes),
                pids_limit: Some(spec.pids_limit),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                privileged: Some(false),
                readonly_rootfs: Some(spec.readonly_rootfs),
                tmpfs,
                init: Some(true),
                auto_remove: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn version(&self) -> Result<String, RuntimeError> {
        let version = self.docker.version().await?;
        Ok(version.version.unwrap_or_else(|| "unknown".to_string()))
    }

    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(RuntimeError::BollardError(e)),
        }
    }

    async fn launch(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError> {
        let options = Some(BollardCreateContainerOptionsQuery {
            name: Some(spec.name.clone()),
            ..Default::default()
        });

        let container = self
            .docker
            .create_container(options, Self::container_body(spec))
            .await?;
        let handle = ContainerHandle {
            id: container.id,
            name: spec.name.clone(),
        };

        if let Err(e) = self
            .docker
            .start_container(&handle.id, None::<BollardStartContainerOptionsQuery>)
            .await
        {
            // Created but never started: nobody else holds the handle yet
            if let Err(remove_err) = self.remove(&handle).await {
                log::warn!(
                    "Could not remove unstarted container {}: {}",
                    handle.name,
                    remove_err
                );
            }
            return Err(RuntimeError::BollardError(e));
        }

        Ok(handle)
    }

    async fn exec(
        &self,
        container: &ContainerHandle,
        invocation: &Invocation,
    ) -> Result<ExecSession, RuntimeError> {
        let exec = self
            .docker
            .create_exec(
                &container.id,
                ExecConfig {
                    cmd: Some(invocation.command.clone()),
                    env: Some(invocation.env.clone()),
                    working_dir: Some(invocation.workdir.clone()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(false),
                    ..Default::default()
                },
            )
            .await?;

        let started = self
            .docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    ..Default::default()
                }),
            )
            .await?;

        match started {
            StartExecResults::Attached { output, .. } => {
                let output = output.filter_map(|item| {
                    future::ready(match item {
                        Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                            Some(Ok(OutputChunk::Stdout(message)))
                        }
                        Ok(LogOutput::StdErr { message }) => Some(Ok(OutputChunk::Stderr(message))),
                        Ok(LogOutput::StdIn { .. }) => None,
                        Err(e) => Some(Err(RuntimeError::BollardError(e))),
                    })
                });
                Ok(ExecSession {
                    exec_id: exec.id,
                    output: Box::pin(output),
                })
            }
            StartExecResults::Detached => Err(RuntimeError::Other(format!(
                "exec {} in {} started detached",
                exec.id, container.name
            ))),
        }
    }

    async fn exec_exit_code(&self, exec_id: &str) -> Result<Option<i64>, RuntimeError> {
        let inspect = self.docker.inspect_exec(exec_id).await?;
        if inspect.running.unwrap_or(false) {
            return Ok(None);
        }
        Ok(inspect.exit_code)
    }

    async fn kill(&self, container: &ContainerHandle) -> Result<(), RuntimeError> {
        match self
            .docker
            .kill_container(&container.id, None::<BollardKillContainerOptionsQuery>)
            .await
        {
            Ok(()) => Ok(()),
            // 409: already stopped
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => Err(RuntimeError::NotRunning {
                container: container.name.clone(),
            }),
            Err(e) => Err(RuntimeError::BollardError(e)),
        }
    }

    async fn remove(&self, container: &ContainerHandle) -> Result<(), RuntimeError> {
        match self
            .docker
            .remove_container(
                &container.id,
                Some(BollardRemoveContainerOptionsQuery {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            // Already gone counts as removed
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(RuntimeError::BollardError(e)),
        }
    }

    async fn list_managed(&self) -> Result<Vec<ContainerHandle>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{}=true", MANAGED_LABEL)]);

        let containers = self
            .docker
            .list_containers(Some(BollardListContainersOptionsQuery {
                all: true,
                filters: Some(filters),
                ..Default::default()
            }))
            .await?;

        Ok(containers
            .into_iter()
            .filter_map(|summary| {
                let id = summary.id?;
                let name = summary
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_else(|| id.clone());
                Some(ContainerHandle { id, name })
            })
            .collect())
    }

    async fn build_image(
        &self,
        context: Vec<u8>,
        dockerfile: &str,
        tag: &str,
    ) -> Result<(), RuntimeError> {
        let options = BollardBuildImageOptionsQuery {
            dockerfile: dockerfile.to_string(),
            t: Some(tag.to_string()),
            rm: true,
            ..Default::default()
        };

        let mut build_stream =
            self.docker
                .build_image(options, None, Some(bollard::body_full(Bytes::from(context))));

        while let Some(info) = build_stream.next().await {
            let info = info?;
            if let Some(detail) = info.error_detail {
                return Err(RuntimeError::Other(
                    detail
                        .message
                        .unwrap_or_else(|| "image build failed".to_string()),
                ));
            }
            if let Some(line) = info.stream {
                let line = line.trim_end();
                if !line.is_empty() {
                    log::debug!("build {}: {}", tag, line);
                }
            }
        }

        Ok(())
    }
}
