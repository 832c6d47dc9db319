//! Package queries and installs through the server's interpreter.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{error, info};

pub const QUERY_TIMEOUT: Duration = Duration::from_secs(10);
pub const INSTALL_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, thiserror::Error)]
pub enum PipError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} timed out after {secs}s")]
    Timeout { program: String, secs: u64 },
    #[error("pip failed: {0}")]
    Failed(String),
}

struct ToolOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

async fn run(program: &Path, args: &[&str], timeout: Duration) -> Result<ToolOutput, PipError> {
    let name = program.to_string_lossy().into_owned();
    let mut cmd = Command::new(program);
    cmd.args(args)
        .env("PIP_DISABLE_PIP_VERSION_CHECK", "1")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    crate::sys::hide_console(&mut cmd);

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(source)) => return Err(PipError::Spawn { program: name, source }),
        Err(_) => {
            return Err(PipError::Timeout {
                program: name,
                secs: timeout.as_secs(),
            });
        }
    };
    Ok(ToolOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// The `pip` executable living next to the interpreter's environment.
pub fn pip_executable(python: &Path) -> PathBuf {
    let env_root = python
        .parent()
        .and_then(Path::parent)
        .unwrap_or_else(|| Path::new("."));
    if cfg!(windows) {
        env_root.join("Scripts").join("pip.exe")
    } else {
        env_root.join("bin").join("pip")
    }
}

/// `v<version>` from `pip show` output.
pub fn parse_show_version(stdout: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        let version = line.strip_prefix("Version:")?.trim();
        (!version.is_empty()).then(|| format!("v{version}"))
    })
}

/// Installed version of `package`, `None` when it is not installed.
pub async fn package_version(
    python: &Path,
    package: &str,
    timeout: Duration,
) -> Result<Option<String>, PipError> {
    info!(package, "querying installed version");
    let out = run(python, &["-m", "pip", "show", package], timeout).await?;
    if out.success {
        return Ok(parse_show_version(&out.stdout));
    }

    let pip = pip_executable(python);
    if pip.is_file() {
        let out = run(&pip, &["show", package], timeout).await?;
        if out.success {
            return Ok(parse_show_version(&out.stdout));
        }
    }
    Ok(None)
}

/// Interpreter version with the `Python ` prefix stripped.
pub async fn python_version(python: &Path, timeout: Duration) -> Result<String, PipError> {
    let out = run(python, &["--version"], timeout).await?;
    if !out.success {
        return Err(PipError::Failed(out.stderr.trim().to_string()));
    }
    // Python 2 printed its version on stderr.
    let text = if out.stdout.trim().is_empty() {
        out.stderr
    } else {
        out.stdout
    };
    let text = text.trim();
    Ok(text.strip_prefix("Python ").unwrap_or(text).to_string())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstallResult {
    pub success: bool,
    pub updated: bool,
    pub up_to_date: bool,
    pub version: Option<String>,
    pub error: Option<String>,
}

impl std::fmt::Display for InstallResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let version = self.version.as_deref().unwrap_or("unknown version");
        match (self.success, self.updated, self.up_to_date) {
            (false, _, _) => write!(f, "{}", self.error.as_deref().unwrap_or("install failed")),
            (true, true, _) => write!(f, "updated to {version}"),
            (true, false, true) => write!(f, "already up to date ({version})"),
            (true, false, false) => write!(f, "installed {version}"),
        }
    }
}

/// Classify successful `pip install` output into (updated, up_to_date).
pub fn classify_install_output(stdout: &str) -> (bool, bool) {
    let updated = [
        "Successfully installed",
        "Installing collected packages",
        "Successfully upgraded",
    ]
    .iter()
    .any(|marker| stdout.contains(marker));
    let up_to_date = !updated && stdout.contains("Requirement already satisfied");
    (updated, up_to_date)
}

pub async fn install_or_update(
    python: &Path,
    package: &str,
    index_url: Option<&str>,
    upgrade: bool,
) -> InstallResult {
    let pip = pip_executable(python);
    let (program, mut args): (PathBuf, Vec<&str>) = if pip.is_file() {
        (pip, vec!["install"])
    } else {
        (python.to_path_buf(), vec!["-m", "pip", "install"])
    };
    if upgrade {
        args.push("-U");
    }
    args.push(package);
    if let Some(index) = index_url.map(str::trim).filter(|i| !i.is_empty()) {
        args.extend(["-i", index]);
    }
    info!(program = %program.display(), args = %args.join(" "), "running pip");

    let out = match run(&program, &args, INSTALL_TIMEOUT).await {
        Ok(out) => out,
        Err(e) => {
            error!(error = %e, package, "pip install failed to run");
            return InstallResult {
                error: Some(e.to_string()),
                ..InstallResult::default()
            };
        }
    };
    if !out.success {
        let message = format!("pip install failed: {}", out.stderr.trim());
        error!(package, "{message}");
        return InstallResult {
            error: Some(message),
            ..InstallResult::default()
        };
    }

    let (updated, up_to_date) = classify_install_output(&out.stdout);
    let version = package_version(python, package, QUERY_TIMEOUT)
        .await
        .ok()
        .flatten();
    info!(package, updated, up_to_date, "pip install finished");
    InstallResult {
        success: true,
        updated,
        up_to_date,
        version,
        error: None,
    }
}
