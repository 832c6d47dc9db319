//! Decides whether an OS process is the managed server, independent of
//! who started it.

use crate::sockets;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tracing::debug;

pub const ENTRY_POINT: &str = "main.py";
pub const STANDALONE_FLAG: &str = "--windows-standalone-build";
const REPO_SEGMENT: &str = "/comfyui/";

/// What we could learn about a process from the OS.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessDescription {
    pub pid: u32,
    pub cmdline: Vec<String>,
    pub cwd: Option<PathBuf>,
}

fn normalize(text: &str) -> String {
    text.replace('\\', "/").to_lowercase()
}

/// Pure classification of a described process against the repository root.
///
/// The entry point must appear in the command line, together with one of:
/// a `/comfyui/` path segment, the repository root itself, the standalone
/// startup flag, or a working directory equal to the repository root.
pub fn classify(desc: &ProcessDescription, repo_root: &Path) -> bool {
    if desc.pid == std::process::id() || Some(desc.pid) == crate::sys::parent_pid() {
        return false;
    }

    let joined = normalize(&desc.cmdline.join(" "));
    let has_entry_point = desc.cmdline.iter().any(|arg| {
        let arg = normalize(arg);
        arg == ENTRY_POINT || arg.ends_with(&format!("/{ENTRY_POINT}"))
    });
    if !has_entry_point {
        return false;
    }

    if joined.contains(REPO_SEGMENT) || joined.contains(&STANDALONE_FLAG.to_lowercase()) {
        return true;
    }

    let root = normalize(&repo_root.to_string_lossy());
    let root = root.trim_end_matches('/');
    if root.is_empty() {
        return false;
    }
    let root_segment = format!("{root}/");
    if joined.contains(&root_segment) {
        return true;
    }

    desc.cwd
        .as_ref()
        .map(|cwd| normalize(&cwd.to_string_lossy()).trim_end_matches('/') == root)
        .unwrap_or(false)
}

/// Read command line and working directory of `pid`, preferring the
/// process-introspection API and falling back to the OS dump tool when it
/// yields nothing (missing permission or unsupported platform).
pub fn describe(pid: u32) -> Option<ProcessDescription> {
    let mut system = System::new();
    let sys_pid = Pid::from_u32(pid);
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[sys_pid]),
        true,
        ProcessRefreshKind::nothing()
            .with_cmd(UpdateKind::Always)
            .with_cwd(UpdateKind::Always),
    );

    let from_api = system.process(sys_pid).map(|p| ProcessDescription {
        pid,
        cmdline: p
            .cmd()
            .iter()
            .map(|s| s.to_string_lossy().into_owned())
            .collect(),
        cwd: p.cwd().map(Path::to_path_buf),
    });

    match from_api {
        Some(desc) if !desc.cmdline.is_empty() => Some(desc),
        other => {
            let cmdline = dump_cmdline(pid)?;
            debug!(pid, "command line taken from dump tool");
            Some(ProcessDescription {
                pid,
                cmdline,
                cwd: other.and_then(|d| d.cwd),
            })
        }
    }
}

#[cfg(unix)]
fn dump_cmdline(pid: u32) -> Option<Vec<String>> {
    let output = std::process::Command::new("ps")
        .args(["-o", "args=", "-p", &pid.to_string()])
        .stdin(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .output()
        .ok()?;
    let text = String::from_utf8_lossy(&output.stdout);
    let line = text.trim();
    if !output.status.success() || line.is_empty() {
        return None;
    }
    Some(line.split_whitespace().map(str::to_string).collect())
}

#[cfg(windows)]
fn dump_cmdline(pid: u32) -> Option<Vec<String>> {
    let mut cmd = std::process::Command::new("wmic");
    cmd.args([
        "process",
        "where",
        &format!("ProcessId={pid}"),
        "get",
        "CommandLine",
        "/value",
    ])
    .stdin(std::process::Stdio::null())
    .stderr(std::process::Stdio::null());
    crate::sys::hide_console_std(&mut cmd);
    let output = cmd.output().ok()?;
    let text = String::from_utf8_lossy(&output.stdout);
    let line = text
        .lines()
        .find_map(|l| l.trim().strip_prefix("CommandLine="))?
        .trim();
    if line.is_empty() {
        return None;
    }
    Some(line.split_whitespace().map(str::to_string).collect())
}

// ---------------------------------------------------------------------------
// Inspector seam
// ---------------------------------------------------------------------------

/// OS evidence the supervisor uses for processes it does not own.
pub trait ProcessInspector: Send + Sync {
    fn candidate_pids(&self, port: u16) -> BTreeSet<u32>;
    fn is_target(&self, pid: u32) -> bool;
}

pub struct SystemInspector {
    repo_root: PathBuf,
}

impl SystemInspector {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }
}

impl ProcessInspector for SystemInspector {
    fn candidate_pids(&self, port: u16) -> BTreeSet<u32> {
        sockets::find_candidate_pids(port)
    }

    fn is_target(&self, pid: u32) -> bool {
        match describe(pid) {
            Some(desc) => classify(&desc, &self.repo_root),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(pid: u32, args: &[&str]) -> ProcessDescription {
        ProcessDescription {
            pid,
            cmdline: args.iter().map(|s| s.to_string()).collect(),
            cwd: None,
        }
    }

    const FOREIGN_PID: u32 = u32::MAX - 1;

    #[test]
    fn test_portable_layout_is_target() {
        let d = desc(
            FOREIGN_PID,
            &["python.exe", r"D:\ComfyUI_windows\ComfyUI\main.py", "--port", "8188"],
        );
        assert!(classify(&d, Path::new(r"D:\elsewhere")));
    }

    #[test]
    fn test_repo_root_path_is_target() {
        let d = desc(FOREIGN_PID, &["python3", "/srv/sd/server/main.py", "--listen"]);
        assert!(classify(&d, Path::new("/srv/sd/server")));
        assert!(classify(&d, Path::new("/srv/sd/server/")));
    }

    #[test]
    fn test_standalone_flag_is_target() {
        let d = desc(FOREIGN_PID, &["python", "main.py", STANDALONE_FLAG]);
        assert!(classify(&d, Path::new("/nowhere")));
    }

    #[test]
    fn test_relative_entry_point_with_matching_cwd() {
        let mut d = desc(FOREIGN_PID, &["python3", "main.py"]);
        d.cwd = Some(PathBuf::from("/opt/server"));
        assert!(classify(&d, Path::new("/opt/server")));
        assert!(!classify(&d, Path::new("/opt/other")));
    }

    #[test]
    fn test_missing_entry_point_is_not_target() {
        let d = desc(FOREIGN_PID, &["python3", "/home/u/comfyui/other.py"]);
        assert!(!classify(&d, Path::new("/home/u/comfyui")));
    }

    #[test]
    fn test_unbounded_segment_is_not_target() {
        // "mycomfyui-backup" shares the substring but not the path segment.
        let d = desc(FOREIGN_PID, &["python3", "/data/mycomfyui-backup/main.py"]);
        assert!(!classify(&d, Path::new("/srv/comfy")));
    }

    #[test]
    fn test_root_prefix_sibling_is_not_target() {
        let d = desc(FOREIGN_PID, &["python3", "/srv/app2/main.py"]);
        assert!(!classify(&d, Path::new("/srv/app")));
    }

    #[test]
    fn test_entry_point_substring_is_not_entry_point() {
        let d = desc(FOREIGN_PID, &["python3", "/x/comfyui/not_main.py"]);
        assert!(!classify(&d, Path::new("/x/comfyui")));
    }

    #[test]
    fn test_own_pid_never_target() {
        let d = desc(
            std::process::id(),
            &["python", "/x/ComfyUI/main.py", STANDALONE_FLAG],
        );
        assert!(!classify(&d, Path::new("/x/ComfyUI")));
    }

    #[test]
    fn test_parent_pid_never_target() {
        let parent = crate::sys::parent_pid().unwrap();
        let d = desc(parent, &["python", "/x/ComfyUI/main.py"]);
        assert!(!classify(&d, Path::new("/x/ComfyUI")));
    }

    #[test]
    fn test_describe_own_process() {
        let d = describe(std::process::id()).unwrap();
        assert!(!d.cmdline.is_empty());
    }

    #[test]
    fn test_system_inspector_rejects_self() {
        let inspector = SystemInspector::new("/");
        assert!(!inspector.is_target(std::process::id()));
    }
}
