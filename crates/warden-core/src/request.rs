//! Request and result schemas exchanged with the boundary layer.
//!
//! [`ExecutionRequest::validate`] is the only gate between untrusted input
//! and resource allocation: everything it accepts can be materialised
//! without escaping the workspace, and everything it rejects is rejected
//! before a directory or container exists.

use crate::config::SandboxConfig;
use crate::errors::SandboxError;
use crate::language::{Language, LanguageSpec};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

/// Upper bound on auxiliary files per request.
pub const MAX_AUX_FILES: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionRequest {
    pub code: String,
    pub language: String,
    /// Wall-clock budget in seconds; the configured default when absent.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub files: HashMap<String, String>,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub capture_artifacts: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResult {
    pub run_id: String,
    pub success: bool,
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
    /// Seconds spent in the contained process only.
    pub execution_time: f64,
    pub timed_out: bool,
    pub timeout: u64,
    #[serde(default)]
    pub artifacts: BTreeMap<String, String>,
}

/// A request that passed validation, with everything resolved that the
/// pipeline needs.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub language: Language,
    pub spec: LanguageSpec,
    pub timeout_secs: u64,
    /// Auxiliary files keyed by their checked relative path.
    pub files: Vec<(PathBuf, String)>,
    pub readonly: bool,
    pub capture_artifacts: bool,
}

impl ExecutionPlan {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ExecutionRequest {
    pub fn new(language: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            language: language.into(),
            timeout: None,
            files: HashMap::new(),
            readonly: false,
            capture_artifacts: false,
        }
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    pub fn with_file(mut self, name: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.insert(name.into(), content.into());
        self
    }

    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    pub fn capture_artifacts(mut self, capture: bool) -> Self {
        self.capture_artifacts = capture;
        self
    }

    /// Check the request against policy and resolve it into a plan.
    pub fn validate(&self, config: &SandboxConfig) -> Result<ExecutionPlan, SandboxError> {
        if self.code.is_empty() {
            return Err(SandboxError::Validation("code cannot be empty".to_string()));
        }

        let language: Language = self.language.parse()?;
        let spec = language.spec();

        let timeout_secs = match self.timeout {
            Some(0) => {
                return Err(SandboxError::Validation(
                    "timeout must be greater than 0".to_string(),
                ))
            }
            Some(t) if t > config.max_timeout => {
                return Err(SandboxError::Validation(format!(
                    "timeout must be at most {} seconds, got {}",
                    config.max_timeout, t
                )))
            }
            Some(t) => t,
            None => config.default_timeout,
        };

        if self.files.len() > MAX_AUX_FILES {
            return Err(SandboxError::Validation(format!(
                "at most {} files may be supplied, got {}",
                MAX_AUX_FILES,
                self.files.len()
            )));
        }

        let mut files = Vec::with_capacity(self.files.len());
        for (name, content) in &self.files {
            let path = checked_relative_path(name)?;
            if path == Path::new(spec.filename) {
                return Err(SandboxError::Validation(format!(
                    "file '{}' collides with the {} source file",
                    name, language
                )));
            }
            files.push((path, content.clone()));
        }
        files.sort_by(|a, b| a.0.cmp(&b.0));
        check_layout(&files, Path::new(spec.filename))?;

        Ok(ExecutionPlan {
            language,
            spec,
            timeout_secs,
            files,
            readonly: self.readonly,
            capture_artifacts: self.capture_artifacts,
        })
    }
}

/// Reject two names for the same file and any file that would have to be a
/// directory for another one to exist.
fn check_layout(files: &[(PathBuf, String)], source: &Path) -> Result<(), SandboxError> {
    let mut paths: Vec<&Path> = files.iter().map(|(path, _)| path.as_path()).collect();
    paths.push(source);
    // Component-wise order puts every path directly before its descendants
    paths.sort();

    for pair in paths.windows(2) {
        let (first, second) = (pair[0], pair[1]);
        if first == second {
            return Err(SandboxError::Validation(format!(
                "file '{}' is given more than once",
                first.display()
            )));
        }
        if second.starts_with(first) {
            return Err(SandboxError::Validation(format!(
                "file '{}' conflicts with '{}', which would have to be a directory",
                second.display(),
                first.display()
            )));
        }
    }
    Ok(())
}

/// Accept only relative paths made of normal components.
pub fn checked_relative_path(name: &str) -> Result<PathBuf, SandboxError> {
    let reject = |reason: &str| {
        Err(SandboxError::Validation(format!(
            "invalid file name '{}': {}",
            name, reason
        )))
    };

    if name.is_empty() {
        return reject("empty");
    }
    if name.contains('\0') {
        return reject("contains a NUL byte");
    }
    if name.contains('\\') {
        return reject("contains a backslash");
    }

    let path = Path::new(name);
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir => return reject("path traversal is not allowed"),
            Component::RootDir | Component::Prefix(_) => {
                return reject("absolute paths are not allowed")
            }
        }
    }

    if normalized.as_os_str().is_empty() {
        return reject("does not name a file");
    }
    Ok(normalized)
}
