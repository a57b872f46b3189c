//! Scripted in-memory container runtime for tests.
//!
//! Every exec plays back the same [`ScriptedExec`]; the runtime records
//! launches, kills and removals so tests can assert that nothing is left
//! behind. Files a script "writes" land in the workspace bound into the
//! container, and fail the way a read-only mount would when the workspace
//! is mounted read-only.

use crate::errors::RuntimeError;
use crate::runtime::{
    ContainerHandle, ContainerRuntime, ContainerSpec, ExecSession, Invocation, OutputChunk,
    MANAGED_LABEL,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct ScriptedExec {
    chunks: Vec<OutputChunk>,
    exit_code: Option<i64>,
    exit_delay: Duration,
    exit_lookup_fails: bool,
    hang: bool,
    stream_error: bool,
    writes: Vec<(String, String)>,
}

impl ScriptedExec {
    pub fn exits(code: i64) -> Self {
        Self {
            chunks: Vec::new(),
            exit_code: Some(code),
            exit_delay: Duration::ZERO,
            exit_lookup_fails: false,
            hang: false,
            stream_error: false,
            writes: Vec::new(),
        }
    }

    /// Never finishes on its own
    pub fn hangs() -> Self {
        Self {
            hang: true,
            exit_code: None,
            ..Self::exits(0)
        }
    }

    pub fn stdout(mut self, text: &str) -> Self {
        self.chunks
            .push(OutputChunk::Stdout(Bytes::copy_from_slice(text.as_bytes())));
        self
    }

    pub fn stderr(mut self, text: &str) -> Self {
        self.chunks
            .push(OutputChunk::Stderr(Bytes::copy_from_slice(text.as_bytes())));
        self
    }

    pub fn stream_error(mut self) -> Self {
        self.stream_error = true;
        self
    }

    /// The process keeps running after its output stream closed
    pub fn exit_status_unavailable(mut self) -> Self {
        self.exit_code = None;
        self
    }

    /// Exit status is only published `delay` after the exec started
    pub fn exit_status_after(mut self, delay: Duration) -> Self {
        self.exit_delay = delay;
        self
    }

    pub fn exit_status_lookup_fails(mut self) -> Self {
        self.exit_lookup_fails = true;
        self
    }

    pub fn writes(mut self, name: &str, content: &str) -> Self {
        self.writes.push((name.to_string(), content.to_string()));
        self
    }
}

#[derive(Default)]
struct MockState {
    specs: HashMap<String, ContainerSpec>,
    live: HashSet<String>,
    launched: Vec<String>,
    killed: Vec<String>,
    removed: Vec<String>,
    exit_codes: HashMap<String, (Option<i64>, Instant)>,
    images: HashSet<String>,
    builds: Vec<(String, String)>,
}

pub struct MockRuntime {
    script: ScriptedExec,
    state: Mutex<MockState>,
    next_id: AtomicUsize,
    fail_launch: bool,
    fail_exec: bool,
    fail_remove: bool,
    fail_build: bool,
    available: bool,
}

impl MockRuntime {
    pub fn new(script: ScriptedExec) -> Self {
        Self {
            script,
            state: Mutex::new(MockState::default()),
            next_id: AtomicUsize::new(1),
            fail_launch: false,
            fail_exec: false,
            fail_remove: false,
            fail_build: false,
            available: true,
        }
    }

    pub fn fail_launch(mut self) -> Self {
        self.fail_launch = true;
        self
    }

    pub fn fail_exec(mut self) -> Self {
        self.fail_exec = true;
        self
    }

    pub fn fail_remove(mut self) -> Self {
        self.fail_remove = true;
        self
    }

    pub fn fail_build(mut self) -> Self {
        self.fail_build = true;
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn with_image(self, image: &str) -> Self {
        self.state.lock().unwrap().images.insert(image.to_string());
        self
    }

    /// Pretend a container from an earlier process is still around
    pub fn with_leftover(self, id: &str) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.live.insert(id.to_string());
            state.specs.insert(id.to_string(), leftover_spec(id));
        }
        self
    }

    pub fn launched(&self) -> Vec<String> {
        self.state.lock().unwrap().launched.clone()
    }

    pub fn specs(&self) -> Vec<ContainerSpec> {
        let state = self.state.lock().unwrap();
        state
            .launched
            .iter()
            .filter_map(|id| state.specs.get(id).cloned())
            .collect()
    }

    pub fn killed(&self) -> Vec<String> {
        self.state.lock().unwrap().killed.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.state.lock().unwrap().removed.clone()
    }

    pub fn live(&self) -> usize {
        self.state.lock().unwrap().live.len()
    }

    pub fn builds(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().builds.clone()
    }

    fn unavailable_error(&self) -> RuntimeError {
        RuntimeError::Other("runtime unavailable".to_string())
    }
}

fn leftover_spec(id: &str) -> ContainerSpec {
    let mut labels = HashMap::new();
    labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
    ContainerSpec {
        name: format!("warden-{}", id),
        image: "aurea-sandbox:latest".to_string(),
        workspace: std::env::temp_dir(),
        workdir: "/workspace".to_string(),
        mount_readonly: false,
        user: "sandbox".to_string(),
        nano_cpus: 1,
        memory_bytes: 1,
        pids_limit: 1,
        readonly_rootfs: true,
        tmpfs_bytes: 1,
        labels,
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn version(&self) -> Result<String, RuntimeError> {
        if self.available {
            Ok("mock-1.0".to_string())
        } else {
            Err(self.unavailable_error())
        }
    }

    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        if !self.available {
            return Err(self.unavailable_error());
        }
        Ok(self.state.lock().unwrap().images.contains(image))
    }

    async fn launch(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError> {
        if self.fail_launch || !self.available {
            return Err(RuntimeError::Other("refusing to start container".to_string()));
        }
        let id = format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut state = self.state.lock().unwrap();
        state.specs.insert(id.clone(), spec.clone());
        state.live.insert(id.clone());
        state.launched.push(id.clone());
        Ok(ContainerHandle {
            id,
            name: spec.name.clone(),
        })
    }

    async fn exec(
        &self,
        container: &ContainerHandle,
        _invocation: &Invocation,
    ) -> Result<ExecSession, RuntimeError> {
        if self.fail_exec {
            return Err(RuntimeError::Other("exec create failed".to_string()));
        }
        let spec = {
            let state = self.state.lock().unwrap();
            if !state.live.contains(&container.id) {
                return Err(RuntimeError::NotRunning {
                    container: container.name.clone(),
                });
            }
            state
                .specs
                .get(&container.id)
                .cloned()
                .ok_or_else(|| RuntimeError::Other("unknown container".to_string()))?
        };

        let mut chunks = self.script.chunks.clone();
        let mut exit_code = self.script.exit_code;
        for (name, content) in &self.script.writes {
            if spec.mount_readonly {
                chunks.push(OutputChunk::Stderr(Bytes::from(format!(
                    "OSError: [Errno 30] Read-only file system: '{}'\n",
                    name
                ))));
                exit_code = Some(1);
                break;
            }
            std::fs::write(spec.workspace.join(name), content)?;
        }

        let exec_id = format!("exec-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.state
            .lock()
            .unwrap()
            .exit_codes
            .insert(exec_id.clone(), (exit_code, Instant::now() + self.script.exit_delay));

        let mut items: Vec<Result<OutputChunk, RuntimeError>> = chunks.into_iter().map(Ok).collect();
        if self.script.stream_error {
            items.push(Err(RuntimeError::Other("connection reset".to_string())));
        }

        let output = if self.script.hang {
            stream::iter(items).chain(stream::pending()).boxed()
        } else {
            stream::iter(items).boxed()
        };

        Ok(ExecSession { exec_id, output })
    }

    async fn exec_exit_code(&self, exec_id: &str) -> Result<Option<i64>, RuntimeError> {
        if self.script.exit_lookup_fails {
            return Err(RuntimeError::Other("no such exec".to_string()));
        }
        let state = self.state.lock().unwrap();
        Ok(match state.exit_codes.get(exec_id) {
            Some((code, ready_at)) if Instant::now() >= *ready_at => *code,
            _ => None,
        })
    }

    async fn kill(&self, container: &ContainerHandle) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.killed.push(container.id.clone());
        if state.live.contains(&container.id) {
            Ok(())
        } else {
            Err(RuntimeError::NotRunning {
                container: container.name.clone(),
            })
        }
    }

    async fn remove(&self, container: &ContainerHandle) -> Result<(), RuntimeError> {
        if self.fail_remove {
            return Err(RuntimeError::Other("removal refused".to_string()));
        }
        let mut state = self.state.lock().unwrap();
        state.live.remove(&container.id);
        state.removed.push(container.id.clone());
        Ok(())
    }

    async fn list_managed(&self) -> Result<Vec<ContainerHandle>, RuntimeError> {
        let state = self.state.lock().unwrap();
        let mut handles: Vec<ContainerHandle> = state
            .live
            .iter()
            .filter_map(|id| {
                state.specs.get(id).and_then(|spec| {
                    spec.labels.get(MANAGED_LABEL).map(|_| ContainerHandle {
                        id: id.clone(),
                        name: spec.name.clone(),
                    })
                })
            })
            .collect();
        handles.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(handles)
    }

    async fn build_image(
        &self,
        context: Vec<u8>,
        dockerfile: &str,
        tag: &str,
    ) -> Result<(), RuntimeError> {
        if self.fail_build || context.is_empty() {
            return Err(RuntimeError::Other("build step failed".to_string()));
        }
        let mut state = self.state.lock().unwrap();
        state.builds.push((dockerfile.to_string(), tag.to_string()));
        state.images.insert(tag.to_string());
        Ok(())
    }
}
