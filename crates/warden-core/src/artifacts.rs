//! Collect files the program created or changed in its workspace.
//!
//! The workspace is written by untrusted code, so the walk never follows
//! symbolic links and only reads regular files. A link to `/etc/shadow`
//! planted inside the container therefore never exposes a host file.
//! Sizes are taken from metadata before anything is opened, and reads are
//! bounded by what is left of the budget, so a sparse multi-gigabyte file
//! costs the host nothing.

use crate::errors::SandboxError;
use crate::workspace::WorkspaceSnapshot;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// Upper bound on directory entries visited per collection.
pub const MAX_WALK_ENTRIES: usize = 10_000;

/// Return new or modified files under `root`, keyed by `/`-joined relative
/// path, stopping once `max_bytes` of content has been collected.
pub async fn collect(
    root: &Path,
    snapshot: &WorkspaceSnapshot,
    max_bytes: usize,
) -> Result<BTreeMap<String, String>, SandboxError> {
    let root = root.to_path_buf();
    let snapshot = snapshot.clone();
    tokio::task::spawn_blocking(move || collect_blocking(&root, &snapshot, max_bytes))
        .await
        .map_err(|e| SandboxError::Workspace(format!("Artifact collection task failed: {}", e)))?
}

fn collect_blocking(
    root: &Path,
    snapshot: &WorkspaceSnapshot,
    max_bytes: usize,
) -> Result<BTreeMap<String, String>, SandboxError> {
    let mut files = Vec::new();
    walk(root, root, &mut files, &mut 0)?;
    files.sort();

    let mut artifacts = BTreeMap::new();
    let mut total = 0usize;
    for (relative, size) in files {
        let remaining = max_bytes - total;

        // Sizes come from metadata so oversized (possibly sparse) files are never opened
        if size > remaining as u64 {
            if snapshot.contains(&relative) {
                log::debug!("Not comparing input {} ({} bytes)", relative.display(), size);
            } else {
                log::warn!(
                    "Skipping artifact {} ({} bytes): {} bytes of the artifact budget left",
                    relative.display(),
                    size,
                    remaining
                );
            }
            continue;
        }

        let content = match read_bounded(&root.join(&relative), remaining) {
            Ok(content) => content,
            Err(e) => {
                log::warn!("Skipping unreadable artifact {}: {}", relative.display(), e);
                continue;
            }
        };
        if content.len() > remaining {
            log::warn!(
                "Skipping artifact {}: grew past the artifact budget while being read",
                relative.display()
            );
            continue;
        }

        if snapshot.is_unchanged(&relative, &content) {
            continue;
        }
        total += content.len();

        artifacts.insert(
            artifact_key(&relative),
            String::from_utf8_lossy(&content).into_owned(),
        );
    }

    Ok(artifacts)
}

/// Read at most `limit + 1` bytes, so callers can tell an overflowing file
/// apart from one that fits exactly.
fn read_bounded(path: &Path, limit: usize) -> io::Result<Vec<u8>> {
    let file = File::open(path)?;
    let mut content = Vec::new();
    file.take(limit as u64 + 1).read_to_end(&mut content)?;
    Ok(content)
}

fn walk(
    root: &Path,
    dir: &Path,
    files: &mut Vec<(PathBuf, u64)>,
    visited: &mut usize,
) -> Result<(), SandboxError> {
    let entries = fs::read_dir(dir).map_err(|e| {
        SandboxError::Workspace(format!("Could not list {}: {}", dir.display(), e))
    })?;

    for entry in entries {
        *visited += 1;
        if *visited > MAX_WALK_ENTRIES {
            log::warn!(
                "Artifact walk stopped after {} entries in {}",
                MAX_WALK_ENTRIES,
                root.display()
            );
            return Ok(());
        }

        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("Skipping unreadable entry in {}: {}", dir.display(), e);
                continue;
            }
        };
        // DirEntry::metadata() does not follow symlinks
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(_) => continue,
        };

        let path = entry.path();
        if metadata.is_dir() {
            if let Err(e) = walk(root, &path, files, visited) {
                log::warn!("Skipping unreadable directory {}: {}", path.display(), e);
            }
        } else if metadata.is_file() {
            if let Ok(relative) = path.strip_prefix(root) {
                files.push((relative.to_path_buf(), metadata.len()));
            }
        }
    }
    Ok(())
}

fn artifact_key(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
