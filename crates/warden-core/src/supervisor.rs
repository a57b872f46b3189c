//! Supervised execution of the user program.
//!
//! The program's output stream is drained concurrently with a deadline.
//! A closed stream only means the process closed its stdio, so the exit
//! status is then polled under the same deadline. If the deadline elapses
//! first, at either stage, the container is killed on the spot and whatever
//! output arrived so far is returned. Runtime failures are reported as [`SandboxError::Runner`] and
//! never confused with the program exiting non-zero.

use crate::errors::{RuntimeError, SandboxError};
use crate::runtime::{ContainerHandle, ContainerRuntime, Invocation, OutputChunk, OutputStream};
use futures_util::stream::StreamExt;
use std::time::{Duration, Instant};

const EXIT_STATUS_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
    pub timed_out: bool,
}

impl ExecutionOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Byte-capped buffer for one output stream. Bytes past the cap are
/// dropped, but the stream keeps being drained so the process never blocks
/// on a full pipe.
#[derive(Debug, Default)]
struct CappedBuffer {
    bytes: Vec<u8>,
    dropped: usize,
}

impl CappedBuffer {
    fn push(&mut self, chunk: &[u8], cap: usize) {
        let room = cap.saturating_sub(self.bytes.len());
        let take = room.min(chunk.len());
        self.bytes.extend_from_slice(&chunk[..take]);
        self.dropped += chunk.len() - take;
    }

    fn into_string(self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

#[derive(Debug)]
struct OutputCapture {
    cap: usize,
    stdout: CappedBuffer,
    stderr: CappedBuffer,
}

impl OutputCapture {
    fn new(cap: usize) -> Self {
        Self {
            cap,
            stdout: CappedBuffer::default(),
            stderr: CappedBuffer::default(),
        }
    }

    async fn drain(&mut self, output: &mut OutputStream) -> Result<(), RuntimeError> {
        while let Some(chunk) = output.next().await {
            match chunk? {
                OutputChunk::Stdout(bytes) => self.stdout.push(&bytes, self.cap),
                OutputChunk::Stderr(bytes) => self.stderr.push(&bytes, self.cap),
            }
        }
        Ok(())
    }
}

pub struct Supervisor<'a> {
    runtime: &'a dyn ContainerRuntime,
    max_output_bytes: usize,
}

impl<'a> Supervisor<'a> {
    pub fn new(runtime: &'a dyn ContainerRuntime, max_output_bytes: usize) -> Self {
        Self {
            runtime,
            max_output_bytes,
        }
    }

    /// Run `invocation` inside `container`, bounded by `timeout`.
    pub async fn run(
        &self,
        run_id: &str,
        container: &ContainerHandle,
        invocation: &Invocation,
        timeout: Duration,
    ) -> Result<ExecutionOutcome, SandboxError> {
        let session = self
            .runtime
            .exec(container, invocation)
            .await
            .map_err(|e| SandboxError::Runner(format!("Could not start program: {}", e)))?;

        let started = Instant::now();
        let mut capture = OutputCapture::new(self.max_output_bytes);
        let mut output = session.output;

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let drained = tokio::select! {
            res = capture.drain(&mut output) => Some(res),
            _ = &mut deadline => None,
        };
        drop(output);

        let exit_code = match drained {
            Some(Ok(())) => tokio::select! {
                code = self.wait_exit_code(&session.exec_id) => Some(code?),
                _ = &mut deadline => None,
            },
            Some(Err(e)) => {
                return Err(SandboxError::Runner(format!(
                    "Output stream failed mid-run: {}",
                    e
                )))
            }
            None => None,
        };
        let elapsed = started.elapsed();

        let timed_out = exit_code.is_none();
        if timed_out {
            log::warn!(
                "Run {} exceeded its {}s budget, killing container {}",
                run_id,
                timeout.as_secs(),
                container.name
            );
            self.terminate(run_id, container).await;
        }

        if capture.stdout.dropped > 0 || capture.stderr.dropped > 0 {
            log::warn!(
                "Run {} output truncated at {} bytes (dropped {} stdout, {} stderr)",
                run_id,
                self.max_output_bytes,
                capture.stdout.dropped,
                capture.stderr.dropped
            );
        }

        Ok(ExecutionOutcome {
            exit_code,
            stdout: capture.stdout.into_string(),
            stderr: capture.stderr.into_string(),
            elapsed,
            timed_out,
        })
    }

    /// Poll until the runtime reports the process as exited. Only the
    /// caller's deadline bounds this.
    async fn wait_exit_code(&self, exec_id: &str) -> Result<i64, SandboxError> {
        loop {
            match self.runtime.exec_exit_code(exec_id).await {
                Ok(Some(code)) => return Ok(code),
                Ok(None) => tokio::time::sleep(EXIT_STATUS_POLL_INTERVAL).await,
                Err(e) => {
                    return Err(SandboxError::Runner(format!(
                        "Could not read exit status: {}",
                        e
                    )))
                }
            }
        }
    }

    /// Kill the container so nothing keeps running past the budget. The
    /// cleanup manager force-removes it afterwards even if this fails.
    async fn terminate(&self, run_id: &str, container: &ContainerHandle) {
        match self.runtime.kill(container).await {
            Ok(()) | Err(RuntimeError::NotRunning { .. }) => {}
            Err(e) => log::warn!(
                "Run {}: kill of {} failed, relying on forced removal: {}",
                run_id,
                container.name,
                e
            ),
        }
    }
}
