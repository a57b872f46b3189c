//! Command-line front end for the warden execution sandbox.
//!
//! Runs a single program in a locked-down container and prints the result
//! as JSON, and carries the operational chores around that: building the
//! execution image, checking daemon health and sweeping leftover
//! containers.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::LevelFilter;
use std::path::{Path, PathBuf};
use warden_core::{ConfigLoader, ExecutionRequest, Sandbox, SandboxConfig, SandboxError};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Warden - run untrusted code in an isolated container")]
struct Cli {
    #[clap(subcommand)]
    command: Commands,

    #[clap(long, short, help = "YAML configuration file; SANDBOX_* variables override it")]
    config: Option<PathBuf>,

    #[clap(long, short, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute a program and print the result as JSON
    Run {
        #[clap(long, short = 'L', required_unless_present = "request")]
        language: Option<String>,

        #[clap(long, conflicts_with_all = ["source", "request"])]
        code: Option<String>,

        #[clap(long, help = "Read the program from a file", conflicts_with = "request")]
        source: Option<PathBuf>,

        #[clap(long, help = "Read a complete JSON execution request from a file")]
        request: Option<PathBuf>,

        #[clap(long, short)]
        timeout: Option<u64>,

        #[clap(long = "file", value_name = "NAME=PATH", help = "Add an auxiliary file to the workspace")]
        files: Vec<String>,

        #[clap(long)]
        readonly: bool,

        #[clap(long)]
        capture_artifacts: bool,
    },
    /// Build the execution image
    BuildImage {
        #[clap(long, default_value = "Dockerfile")]
        dockerfile: PathBuf,

        #[clap(long, help = "Image tag (defaults to the configured image)")]
        tag: Option<String>,
    },
    /// Report daemon and image availability
    Health,
    /// Remove containers left behind by earlier runs
    Sweep,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level_filter = cli.log_level.parse().unwrap_or(LevelFilter::Info);
    env_logger::Builder::new()
        .filter_level(log_level_filter)
        .init();

    let config = load_config(cli.config.as_deref()).await?;
    let sandbox = Sandbox::connect(config)?;

    match cli.command {
        Commands::Run {
            language,
            code,
            source,
            request,
            timeout,
            files,
            readonly,
            capture_artifacts,
        } => {
            let request = match request {
                Some(path) => read_request(&path, language, timeout).await?,
                None => {
                    let code = match (code, source) {
                        (Some(code), _) => code,
                        (None, Some(path)) => read_text(&path).await?,
                        (None, None) => anyhow::bail!("one of --code, --source or --request is required"),
                    };
                    let mut request = ExecutionRequest::new(language.unwrap_or_default(), code)
                        .readonly(readonly)
                        .capture_artifacts(capture_artifacts);
                    if let Some(timeout) = timeout {
                        request = request.with_timeout(timeout);
                    }
                    for spec in &files {
                        let (name, path) = parse_file_arg(spec)?;
                        request = request.with_file(name, read_text(&path).await?);
                    }
                    request
                }
            };
            run(&sandbox, request).await
        }
        Commands::BuildImage { dockerfile, tag } => {
            let tag = sandbox.build_image(&dockerfile, tag.as_deref()).await?;
            println!("Built image {}", tag);
            Ok(())
        }
        Commands::Health => {
            let report = sandbox.health().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Sweep => {
            let removed = sandbox.sweep().await?;
            println!("Removed {} leftover container(s).", removed);
            Ok(())
        }
    }
}

async fn load_config(path: Option<&Path>) -> Result<SandboxConfig> {
    let config = match path {
        Some(path) => {
            log::info!("Loading configuration from file: {}", path.display());
            ConfigLoader::from_file(path).await?
        }
        None => ConfigLoader::from_env()?,
    };
    Ok(config)
}

async fn run(sandbox: &Sandbox, request: ExecutionRequest) -> Result<()> {
    match sandbox.execute(request).await {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Err(e) => {
            println!("{}", serde_json::to_string_pretty(&error_body(&e))?);
            std::process::exit(exit_code(&e));
        }
    }
}

fn error_body(error: &SandboxError) -> serde_json::Value {
    serde_json::json!({
        "error": error.kind(),
        "message": error.to_string(),
    })
}

fn exit_code(error: &SandboxError) -> i32 {
    if error.is_validation() {
        2
    } else {
        1
    }
}

async fn read_request(
    path: &Path,
    language: Option<String>,
    timeout: Option<u64>,
) -> Result<ExecutionRequest> {
    let content = read_text(path).await?;
    let mut request: ExecutionRequest = serde_json::from_str(&content)
        .with_context(|| format!("Invalid execution request in {}", path.display()))?;
    if let Some(language) = language {
        request.language = language;
    }
    if timeout.is_some() {
        request.timeout = timeout;
    }
    Ok(request)
}

async fn read_text(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))
}

fn parse_file_arg(spec: &str) -> Result<(String, PathBuf)> {
    match spec.split_once('=') {
        Some((name, path)) if !name.is_empty() && !path.is_empty() => {
            Ok((name.to_string(), PathBuf::from(path)))
        }
        _ => anyhow::bail!("Invalid --file '{}', expected NAME=PATH", spec),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_file_arg() {
        let (name, path) = parse_file_arg("data/input.csv=./local.csv").unwrap();
        assert_eq!(name, "data/input.csv");
        assert_eq!(path, PathBuf::from("./local.csv"));

        assert!(parse_file_arg("no-separator").is_err());
        assert!(parse_file_arg("=path").is_err());
        assert!(parse_file_arg("name=").is_err());
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "warden",
            "run",
            "--language",
            "python",
            "--code",
            "print(1)",
            "--timeout",
            "5",
            "--file",
            "a.txt=/tmp/a.txt",
            "--capture-artifacts",
        ])
        .unwrap();

        match cli.command {
            Commands::Run {
                language,
                code,
                timeout,
                files,
                capture_artifacts,
                readonly,
                ..
            } => {
                assert_eq!(language.as_deref(), Some("python"));
                assert_eq!(code.as_deref(), Some("print(1)"));
                assert_eq!(timeout, Some(5));
                assert_eq!(files, vec!["a.txt=/tmp/a.txt".to_string()]);
                assert!(capture_artifacts);
                assert!(!readonly);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_cli_requires_language_without_request() {
        assert!(Cli::try_parse_from(["warden", "run", "--code", "x"]).is_err());
        assert!(Cli::try_parse_from(["warden", "run", "--request", "req.json"]).is_ok());
        assert!(Cli::try_parse_from(["warden", "run", "-L", "bash", "--code", "x", "--source", "y"]).is_err());
    }

    #[tokio::test]
    async fn test_read_request_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("req.json");
        std::fs::write(
            &path,
            r#"{"code": "print(1)", "language": "python", "files": {"a.txt": "x"}}"#,
        )
        .unwrap();

        let request = read_request(&path, None, Some(7)).await.unwrap();
        assert_eq!(request.language, "python");
        assert_eq!(request.timeout, Some(7));
        assert_eq!(request.files.get("a.txt").map(String::as_str), Some("x"));

        let request = read_request(&path, Some("bash".to_string()), None).await.unwrap();
        assert_eq!(request.language, "bash");
        assert_eq!(request.timeout, None);
    }

    #[test]
    fn test_error_body() {
        let err = SandboxError::UnsupportedLanguage("ruby".to_string());
        let body = error_body(&err);
        assert_eq!(body["error"], "validation_error");
        assert_eq!(exit_code(&err), 2);
        assert_eq!(exit_code(&SandboxError::Runner("x".to_string())), 1);
    }
}
