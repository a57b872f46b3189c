//! Per-run workspace directories.
//!
//! A [`Workspace`] is a fresh temporary directory that is bind-mounted into
//! the container. It owns its [`TempDir`], so the directory is removed when
//! the workspace is dropped even if the run is abandoned mid-flight; the
//! cleanup manager calls [`Workspace::remove`] to do it explicitly and log
//! failures.

use crate::errors::SandboxError;
use crate::request::{checked_relative_path, ExecutionPlan};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tempfile::{Builder, TempDir};
use tokio::fs;
use tokio::io::AsyncWriteExt;

const WORKSPACE_PREFIX: &str = "warden-run-";

/// Digests of every file the builder wrote, keyed by relative path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkspaceSnapshot {
    digests: BTreeMap<PathBuf, [u8; 32]>,
}

impl WorkspaceSnapshot {
    pub fn record(&mut self, relative: PathBuf, content: &[u8]) {
        self.digests.insert(relative, digest(content));
    }

    /// True when `relative` was written by the builder with exactly `content`.
    pub fn is_unchanged(&self, relative: &Path, content: &[u8]) -> bool {
        self.digests
            .get(relative)
            .map(|d| *d == digest(content))
            .unwrap_or(false)
    }

    pub fn contains(&self, relative: &Path) -> bool {
        self.digests.contains_key(relative)
    }

    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }
}

pub fn digest(content: &[u8]) -> [u8; 32] {
    Sha256::digest(content).into()
}

#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    /// Allocate a uniquely named directory under `root` (or the system temp dir).
    pub fn create(root: Option<&Path>) -> Result<Self, SandboxError> {
        let mut builder = Builder::new();
        builder.prefix(WORKSPACE_PREFIX);

        let dir = match root {
            Some(root) => {
                std::fs::create_dir_all(root).map_err(|e| {
                    SandboxError::Workspace(format!(
                        "Could not create workspace root {}: {}",
                        root.display(),
                        e
                    ))
                })?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
        .map_err(|e| {
            SandboxError::Workspace(format!("Could not create temporary directory: {}", e))
        })?;

        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write the source file and every auxiliary file of the plan.
    pub async fn materialize(
        &self,
        plan: &ExecutionPlan,
        code: &str,
    ) -> Result<WorkspaceSnapshot, SandboxError> {
        let mut snapshot = WorkspaceSnapshot::default();

        self.write_file(Path::new(plan.spec.filename), code.as_bytes())
            .await?;
        snapshot.record(PathBuf::from(plan.spec.filename), code.as_bytes());

        for (relative, content) in &plan.files {
            self.write_file(relative, content.as_bytes()).await?;
            snapshot.record(relative.clone(), content.as_bytes());
        }

        // The container user is not the host user that owns the directory
        self.set_mode(self.path(), if plan.readonly { 0o755 } else { 0o777 })
            .await?;

        log::debug!(
            "Materialized {} file(s) in workspace {}",
            snapshot.len(),
            self.path().display()
        );
        Ok(snapshot)
    }

    async fn write_file(&self, relative: &Path, content: &[u8]) -> Result<(), SandboxError> {
        // Plans are validated already; re-check so the builder never trusts its caller
        let relative = checked_relative_path(&relative.to_string_lossy())
            .map_err(|e| SandboxError::Workspace(e.to_string()))?;
        let target = self.path().join(&relative);

        if let Some(parent) = target.parent() {
            if parent != self.path() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    SandboxError::Workspace(format!(
                        "Could not create directory for {}: {}",
                        relative.display(),
                        e
                    ))
                })?;
                self.set_mode(parent, 0o777).await?;
            }
        }

        let mut file = fs::File::create(&target).await.map_err(|e| {
            SandboxError::Workspace(format!("Could not create {}: {}", relative.display(), e))
        })?;
        file.write_all(content).await.map_err(|e| {
            SandboxError::Workspace(format!("Could not write {}: {}", relative.display(), e))
        })?;
        file.flush().await.map_err(|e| {
            SandboxError::Workspace(format!("Could not flush {}: {}", relative.display(), e))
        })?;
        self.set_mode(&target, 0o644).await
    }

    #[cfg(unix)]
    async fn set_mode(&self, path: &Path, mode: u32) -> Result<(), SandboxError> {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .await
            .map_err(|e| {
                SandboxError::Workspace(format!(
                    "Could not set permissions on {}: {}",
                    path.display(),
                    e
                ))
            })
    }

    #[cfg(not(unix))]
    async fn set_mode(&self, _path: &Path, _mode: u32) -> Result<(), SandboxError> {
        Ok(())
    }

    /// Delete the directory tree now, reporting failure instead of ignoring it.
    pub async fn remove(self) -> Result<(), SandboxError> {
        let path = self.path().to_path_buf();
        tokio::task::spawn_blocking(move || self.dir.close())
            .await
            .map_err(|e| SandboxError::Workspace(format!("Workspace removal task failed: {}", e)))?
            .map_err(|e| {
                SandboxError::Workspace(format!("Could not remove {}: {}", path.display(), e))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use crate::request::ExecutionRequest;
    use tempfile::tempdir;

    fn plan(request: &ExecutionRequest) -> ExecutionPlan {
        request.validate(&SandboxConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_materialize_source_and_files() {
        let root = tempdir().unwrap();
        let workspace = Workspace::create(Some(root.path())).unwrap();
        assert!(workspace.path().starts_with(root.path()));
        assert!(workspace
            .path()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(WORKSPACE_PREFIX));

        let request = ExecutionRequest::new("python", "print('hi')")
            .with_file("data.txt", "42")
            .with_file("pkg/util.py", "X = 1");
        let snapshot = workspace.materialize(&plan(&request), &request.code).await.unwrap();

        assert_eq!(snapshot.len(), 3);
        assert_eq!(
            std::fs::read_to_string(workspace.path().join("main.py")).unwrap(),
            "print('hi')"
        );
        assert_eq!(
            std::fs::read_to_string(workspace.path().join("data.txt")).unwrap(),
            "42"
        );
        assert_eq!(
            std::fs::read_to_string(workspace.path().join("pkg/util.py")).unwrap(),
            "X = 1"
        );
        assert!(snapshot.is_unchanged(Path::new("pkg/util.py"), b"X = 1"));
        assert!(!snapshot.is_unchanged(Path::new("pkg/util.py"), b"X = 2"));
        assert!(!snapshot.contains(Path::new("out.txt")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_permissions_follow_readonly_flag() {
        use std::os::unix::fs::PermissionsExt;

        let writable = Workspace::create(None).unwrap();
        let request = ExecutionRequest::new("bash", "echo hi");
        writable.materialize(&plan(&request), &request.code).await.unwrap();
        let mode = std::fs::metadata(writable.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o777);

        let readonly = Workspace::create(None).unwrap();
        let request = request.readonly(true);
        readonly.materialize(&plan(&request), &request.code).await.unwrap();
        let mode = std::fs::metadata(readonly.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        let file_mode = std::fs::metadata(readonly.path().join("main.sh"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(file_mode & 0o777, 0o644);
    }

    #[tokio::test]
    async fn test_traversal_never_written() {
        let root = tempdir().unwrap();
        let workspace = Workspace::create(Some(root.path())).unwrap();

        // A plan built by hand, bypassing request validation
        let mut plan = plan(&ExecutionRequest::new("python", "pass"));
        plan.files.push((PathBuf::from("../escaped.txt"), "x".to_string()));

        let result = workspace.materialize(&plan, "pass").await;
        assert!(matches!(result, Err(SandboxError::Workspace(_))));
        assert!(!root.path().join("escaped.txt").exists());
    }

    #[tokio::test]
    async fn test_remove_deletes_tree() {
        let workspace = Workspace::create(None).unwrap();
        let path = workspace.path().to_path_buf();
        let request = ExecutionRequest::new("python", "pass").with_file("a/b/c.txt", "deep");
        workspace.materialize(&plan(&request), &request.code).await.unwrap();

        workspace.remove().await.unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_drop_deletes_directory() {
        let workspace = Workspace::create(None).unwrap();
        let path = workspace.path().to_path_buf();
        drop(workspace);
        assert!(!path.exists());
    }

    #[test]
    fn test_unwritable_root_is_workspace_error() {
        let file = tempfile::NamedTempFile::new().unwrap();
        // A regular file cannot be a workspace root
        let result = Workspace::create(Some(&file.path().join("nested")));
        assert!(matches!(result, Err(SandboxError::Workspace(_))));
    }
}
