use crate::config::{ComputeMode, LauncherConfig};
use crate::git::ExecutableBinding;
use crate::identity::{ENTRY_POINT, STANDALONE_FLAG};
use crate::probe::DEFAULT_PORT;
use crate::process::StartError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const EMBEDDED_PYTHON_DIR: &str = "python_embeded";
const AUTO_LAUNCH: &str = "--auto-launch";
const DISABLE_AUTO_LAUNCH: &str = "--disable-auto-launch";

/// Everything needed to spawn the server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: PathBuf,
}

impl std::fmt::Display for LaunchSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut words = vec![self.program.to_string_lossy().into_owned()];
        words.extend(self.args.iter().cloned());
        write!(f, "{}", shell_words::join(words))
    }
}

fn embedded_python(repo_root: &Path) -> Option<PathBuf> {
    let name = if cfg!(windows) { "python.exe" } else { "python" };
    let candidate = repo_root.parent()?.join(EMBEDDED_PYTHON_DIR).join(name);
    candidate.is_file().then_some(candidate)
}

/// Configured interpreter if it exists, then the embedded one next to the
/// repository, then whatever `python` is on `PATH`.
pub fn resolve_python(config: &LauncherConfig) -> Result<PathBuf, StartError> {
    let repo_root = config.repo_root();
    if let Some(configured) = &config.paths.python {
        if configured.is_file() {
            return Ok(configured.clone());
        }
        return embedded_python(&repo_root)
            .ok_or_else(|| StartError::ExecutableMissing(configured.clone()));
    }
    if let Some(embedded) = embedded_python(&repo_root) {
        return Ok(embedded);
    }
    Ok(PathBuf::from(if cfg!(windows) { "python" } else { "python3" }))
}

/// Tokenise user-supplied extra arguments, tolerating unbalanced quotes.
pub fn split_extra_args(extra: &str) -> Vec<String> {
    let extra = extra.trim();
    if extra.is_empty() {
        return Vec::new();
    }
    shell_words::split(extra)
        .unwrap_or_else(|_| extra.split_whitespace().map(str::to_string).collect())
}

pub fn build_args(config: &LauncherConfig, entry_point: &Path) -> Vec<String> {
    let launch = &config.launch;
    let mut args = vec!["-s".to_string(), entry_point.to_string_lossy().into_owned()];
    if cfg!(windows) {
        args.push(STANDALONE_FLAG.to_string());
    }
    match launch.compute_mode {
        ComputeMode::Cpu => args.push("--cpu".to_string()),
        ComputeMode::Gpu => {
            if let Some(flag) = launch.vram_flag.as_deref().filter(|f| !f.trim().is_empty()) {
                args.push(flag.trim().to_string());
            }
        }
    }
    if launch.fast {
        args.push("--fast".to_string());
    }
    if launch.listen_all {
        args.extend(["--listen".to_string(), "0.0.0.0".to_string()]);
    }
    if launch.port != DEFAULT_PORT {
        args.extend(["--port".to_string(), launch.port.to_string()]);
    }
    if launch.cors {
        args.extend(["--enable-cors-header".to_string(), "*".to_string()]);
    }
    if launch.disable_custom_nodes {
        args.push("--disable-all-custom-nodes".to_string());
    }
    if launch.disable_api_nodes {
        args.push("--disable-api-nodes".to_string());
    }

    let extra = split_extra_args(&launch.extra_args);
    if let Some(flag) = launch.attention_flag.as_deref().map(str::trim)
        && !flag.is_empty()
        && !extra.iter().any(|a| a == flag)
    {
        args.push(flag.to_string());
    }
    let has_auto_launch = extra
        .iter()
        .any(|a| a == AUTO_LAUNCH || a == DISABLE_AUTO_LAUNCH);
    args.extend(extra);
    if !has_auto_launch {
        args.push(if launch.auto_launch_browser {
            AUTO_LAUNCH.to_string()
        } else {
            DISABLE_AUTO_LAUNCH.to_string()
        });
    }
    args
}

pub fn build_env(config: &LauncherConfig, binding: &ExecutableBinding) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    if let Some(endpoint) = config.mirrors.hf_endpoint.as_deref().map(str::trim)
        && !endpoint.is_empty()
    {
        env.insert("HF_ENDPOINT".to_string(), endpoint.to_string());
    }
    if let Some(endpoint) = config.proxy_rule().github_endpoint() {
        env.insert("GITHUB_ENDPOINT".to_string(), endpoint);
    }
    if binding.is_concrete()
        && let Some(git) = binding.program()
    {
        env.insert(
            "GIT_PYTHON_GIT_EXECUTABLE".to_string(),
            git.to_string_lossy().into_owned(),
        );
        if let Some(bin) = git.parent() {
            let mut dirs = vec![bin.to_path_buf()];
            if let Some(current) = std::env::var_os("PATH") {
                dirs.extend(std::env::split_paths(&current));
            }
            if let Ok(joined) = std::env::join_paths(dirs) {
                env.insert("PATH".to_string(), joined.to_string_lossy().into_owned());
            }
        }
    }
    env
}

pub fn build(config: &LauncherConfig, binding: &ExecutableBinding) -> Result<LaunchSpec, StartError> {
    let cwd = config.repo_root();
    let entry_point = cwd.join(ENTRY_POINT);
    if !entry_point.is_file() {
        return Err(StartError::ExecutableMissing(entry_point));
    }
    let program = resolve_python(config)?;
    Ok(LaunchSpec {
        program,
        args: build_args(config, &entry_point),
        env: build_env(config, binding),
        cwd,
    })
}
