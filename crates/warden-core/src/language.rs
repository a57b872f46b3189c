//! Language identifier to source filename and invocation command.

use crate::errors::SandboxError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Languages the execution image ships an interpreter for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    JavaScript,
    Bash,
}

/// How a language is materialised and started inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageSpec {
    pub filename: &'static str,
    pub command: Vec<String>,
    pub env: Vec<String>,
}

const COMMON_ENV: &[&str] = &["HOME=/tmp"];

impl Language {
    pub const ALL: [Language; 3] = [Language::Python, Language::JavaScript, Language::Bash];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::Bash => "bash",
        }
    }

    pub fn source_filename(&self) -> &'static str {
        match self {
            Language::Python => "main.py",
            Language::JavaScript => "main.js",
            Language::Bash => "main.sh",
        }
    }

    pub fn spec(&self) -> LanguageSpec {
        let filename = self.source_filename();
        let (interpreter, extra_env): (&str, &[&str]) = match self {
            // Unbuffered so output written before a kill is still captured
            Language::Python => (
                "python3",
                &["PYTHONUNBUFFERED=1", "PYTHONDONTWRITEBYTECODE=1"],
            ),
            Language::JavaScript => ("node", &[]),
            Language::Bash => ("bash", &[]),
        };

        LanguageSpec {
            filename,
            command: vec![interpreter.to_string(), filename.to_string()],
            env: COMMON_ENV
                .iter()
                .chain(extra_env.iter())
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl FromStr for Language {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "python" | "python3" | "py" => Ok(Language::Python),
            "javascript" | "js" | "node" | "nodejs" => Ok(Language::JavaScript),
            "bash" | "shell" | "sh" => Ok(Language::Bash),
            _ => Err(SandboxError::UnsupportedLanguage(s.to_string())),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
