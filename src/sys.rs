use std::io;

// =========================================================================
// Unix implementation
// =========================================================================

#[cfg(unix)]
mod platform {
    use super::*;

    pub use nix::sys::signal::Signal;
    use nix::unistd::Pid;

    pub fn send_signal(pid: u32, signal: Signal) -> io::Result<()> {
        nix::sys::signal::kill(Pid::from_raw(pid as i32), signal).map_err(io::Error::other)
    }

    /// Signal the whole process group led by `pid`, falling back to the
    /// single process when `pid` is not a group leader.
    fn signal_tree(pid: u32, signal: Signal) -> io::Result<()> {
        match nix::sys::signal::killpg(Pid::from_raw(pid as i32), signal) {
            Ok(()) => Ok(()),
            Err(_) => send_signal(pid, signal),
        }
    }

    pub fn terminate_tree(pid: u32) -> io::Result<()> {
        signal_tree(pid, Signal::SIGTERM)
    }

    pub fn force_kill_tree(pid: u32) -> io::Result<()> {
        signal_tree(pid, Signal::SIGKILL)
    }

    pub fn is_pid_alive(pid: u32) -> bool {
        match nix::sys::signal::kill(Pid::from_raw(pid as i32), None) {
            Ok(()) | Err(nix::errno::Errno::EPERM) => !is_zombie(pid),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    fn is_zombie(pid: u32) -> bool {
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
            return false;
        };
        // The command name may contain spaces or parens; the state follows the last ')'.
        stat.rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .is_some_and(|state| state == "Z")
    }

    #[cfg(not(target_os = "linux"))]
    fn is_zombie(_pid: u32) -> bool {
        false
    }

    pub fn parent_pid() -> Option<u32> {
        Some(std::os::unix::process::parent_id())
    }

    /// Put the target into its own process group so the whole tree can be
    /// signalled at once.
    pub fn configure_target_cmd(cmd: &mut tokio::process::Command) {
        cmd.process_group(0);
    }

    pub fn hide_console(_cmd: &mut tokio::process::Command) {}

    pub fn hide_console_std(_cmd: &mut std::process::Command) {}

    pub async fn signal_shutdown() {
        use tokio::signal::unix::{SignalKind, signal};

        let (Ok(mut sigterm), Ok(mut sigint)) = (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) else {
            tokio::signal::ctrl_c().await.ok();
            return;
        };

        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
    }
}

// =========================================================================
// Windows implementation
// =========================================================================

#[cfg(windows)]
mod platform {
    use super::*;
    use std::os::windows::process::CommandExt;

    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

    fn taskkill(pid: u32, force: bool) -> io::Result<()> {
        let mut cmd = std::process::Command::new("taskkill");
        cmd.args(["/PID", &pid.to_string(), "/T"]);
        if force {
            cmd.arg("/F");
        }
        cmd.stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .creation_flags(CREATE_NO_WINDOW);
        let status = cmd.status()?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!("taskkill exited with {status}")))
        }
    }

    pub fn terminate_tree(pid: u32) -> io::Result<()> {
        taskkill(pid, false)
    }

    pub fn force_kill_tree(pid: u32) -> io::Result<()> {
        taskkill(pid, true)
    }

    pub fn is_pid_alive(pid: u32) -> bool {
        use windows_sys::Win32::Foundation::CloseHandle;
        use windows_sys::Win32::System::Threading::{
            GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
        };

        unsafe {
            let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
            if handle.is_null() {
                return false;
            }
            let mut exit_code: u32 = 0;
            let result = GetExitCodeProcess(handle, &mut exit_code);
            CloseHandle(handle);
            // STILL_ACTIVE = 259
            result != 0 && exit_code == 259
        }
    }

    pub fn parent_pid() -> Option<u32> {
        use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

        let own = Pid::from_u32(std::process::id());
        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[own]),
            true,
            ProcessRefreshKind::nothing(),
        );
        system
            .process(own)
            .and_then(|p| p.parent())
            .map(|p| p.as_u32())
    }

    pub fn configure_target_cmd(cmd: &mut tokio::process::Command) {
        cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }

    pub fn hide_console(cmd: &mut tokio::process::Command) {
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    pub fn hide_console_std(cmd: &mut std::process::Command) {
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    pub async fn signal_shutdown() {
        tokio::signal::ctrl_c().await.ok();
    }
}

// =========================================================================
// Re-exports
// =========================================================================

pub use platform::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_pid_is_alive() {
        assert!(is_pid_alive(std::process::id()));
    }

    #[test]
    fn test_parent_pid_differs_from_own() {
        let parent = parent_pid().unwrap();
        assert_ne!(parent, std::process::id());
    }

    #[cfg(unix)]
    #[test]
    fn test_reaped_child_is_not_alive() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!is_pid_alive(pid));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_zombie_child_is_not_alive() {
        let child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        // Not reaped yet: the process lingers as a zombie.
        std::thread::sleep(std::time::Duration::from_millis(300));
        assert!(!is_pid_alive(pid));
        drop(child);
    }

    #[cfg(unix)]
    #[test]
    fn test_terminate_tree_stops_group_leader() {
        use std::os::unix::process::CommandExt;

        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap();
        terminate_tree(child.id()).unwrap();
        let status = child.wait().unwrap();
        assert!(!status.success());
    }
}
