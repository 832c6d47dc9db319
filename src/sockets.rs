//! Maps a TCP port to the PIDs holding sockets on it.
//!
//! Enumeration goes through a ranked provider chain that is detected once
//! per process: the kernel socket table on Linux, a table-dump tool
//! elsewhere, and nothing when neither is usable. Only sockets in
//! `LISTEN` or `ESTABLISHED` state count.

use std::collections::BTreeSet;
use std::sync::OnceLock;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketProvider {
    /// `/proc/net/tcp{,6}` joined with `/proc/<pid>/fd` socket inodes.
    ProcNet,
    /// `netstat -ano` (Windows).
    Netstat,
    /// `lsof -t` (macOS and other unixes).
    Lsof,
    Unavailable,
}

static PROVIDER: OnceLock<SocketProvider> = OnceLock::new();

pub fn provider() -> SocketProvider {
    *PROVIDER.get_or_init(|| {
        let detected = detect_provider();
        debug!(?detected, "socket provider selected");
        detected
    })
}

fn detect_provider() -> SocketProvider {
    if cfg!(target_os = "linux") && std::fs::metadata("/proc/net/tcp").is_ok() {
        return SocketProvider::ProcNet;
    }
    if cfg!(windows) {
        return SocketProvider::Netstat;
    }
    if tool_runs("lsof", &["-v"]) {
        return SocketProvider::Lsof;
    }
    SocketProvider::Unavailable
}

fn tool_runs(program: &str, args: &[&str]) -> bool {
    let mut cmd = std::process::Command::new(program);
    cmd.args(args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    crate::sys::hide_console_std(&mut cmd);
    cmd.status().is_ok()
}

/// PIDs with a listening or established TCP socket bound locally to `port`.
/// Blocking: walks the process table or runs a subprocess.
pub fn find_candidate_pids(port: u16) -> BTreeSet<u32> {
    match provider() {
        SocketProvider::ProcNet => proc_net_pids(port),
        SocketProvider::Netstat => netstat_pids(port),
        SocketProvider::Lsof => lsof_pids(port),
        SocketProvider::Unavailable => BTreeSet::new(),
    }
}

// ---------------------------------------------------------------------------
// /proc
// ---------------------------------------------------------------------------

const TCP_ESTABLISHED: &str = "01";
const TCP_LISTEN: &str = "0A";

/// Socket inodes from a `/proc/net/tcp` style table whose local port is `port`.
pub fn parse_proc_net(content: &str, port: u16) -> Vec<u64> {
    let mut inodes = Vec::new();
    for line in content.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }
        let Some((_, local_port)) = fields[1].rsplit_once(':') else {
            continue;
        };
        if u16::from_str_radix(local_port, 16).ok() != Some(port) {
            continue;
        }
        let state = fields[3];
        if !state.eq_ignore_ascii_case(TCP_LISTEN) && state != TCP_ESTABLISHED {
            continue;
        }
        if let Ok(inode) = fields[9].parse::<u64>()
            && inode != 0
        {
            inodes.push(inode);
        }
    }
    inodes
}

fn proc_net_pids(port: u16) -> BTreeSet<u32> {
    let mut inodes = Vec::new();
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        if let Ok(content) = std::fs::read_to_string(table) {
            inodes.extend(parse_proc_net(&content, port));
        }
    }
    if inodes.is_empty() {
        return BTreeSet::new();
    }

    let mut pids = BTreeSet::new();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return pids;
    };
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        // Unreadable fd dirs belong to other users; skip them.
        let Ok(fds) = std::fs::read_dir(entry.path().join("fd")) else {
            continue;
        };
        for fd in fds.flatten() {
            let Ok(link) = std::fs::read_link(fd.path()) else {
                continue;
            };
            if let Some(inode) = socket_inode(&link.to_string_lossy())
                && inodes.contains(&inode)
            {
                pids.insert(pid);
                break;
            }
        }
    }
    pids
}

fn socket_inode(link: &str) -> Option<u64> {
    link.strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

// ---------------------------------------------------------------------------
// netstat
// ---------------------------------------------------------------------------

/// PIDs from `netstat -ano` output with a local address on `port`.
pub fn parse_netstat(output: &str, port: u16) -> BTreeSet<u32> {
    let mut pids = BTreeSet::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 5 || !fields[0].eq_ignore_ascii_case("TCP") {
            continue;
        }
        let local_port = fields[1].rsplit_once(':').map(|(_, p)| p);
        if local_port.and_then(|p| p.parse::<u16>().ok()) != Some(port) {
            continue;
        }
        if !matches!(fields[3], "LISTENING" | "ESTABLISHED") {
            continue;
        }
        if let Ok(pid) = fields[4].parse::<u32>()
            && pid != 0
        {
            pids.insert(pid);
        }
    }
    pids
}

fn netstat_pids(port: u16) -> BTreeSet<u32> {
    match run_tool("netstat", &["-ano"]) {
        Some(output) => parse_netstat(&output, port),
        None => BTreeSet::new(),
    }
}

// ---------------------------------------------------------------------------
// lsof
// ---------------------------------------------------------------------------

fn lsof_pids(port: u16) -> BTreeSet<u32> {
    let filter = format!("-iTCP:{port}");
    let Some(output) = run_tool("lsof", &["-nP", &filter, "-sTCP:LISTEN,ESTABLISHED", "-t"])
    else {
        return BTreeSet::new();
    };
    output
        .lines()
        .filter_map(|l| l.trim().parse::<u32>().ok())
        .collect()
}

fn run_tool(program: &str, args: &[&str]) -> Option<String> {
    let mut cmd = std::process::Command::new(program);
    cmd.args(args).stdin(std::process::Stdio::null());
    crate::sys::hide_console_std(&mut cmd);
    match cmd.output() {
        Ok(out) => Some(String::from_utf8_lossy(&out.stdout).into_owned()),
        Err(e) => {
            debug!(program, error = %e, "socket table tool failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROC_NET_TCP: &str = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:1FFC 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 41234 1 0000000000000000 100 0 0 10 0
   1: 0100007F:1FFC 0100007F:C350 01 00000000:00000000 00:00000000 00000000  1000        0 41235 1 0000000000000000 20 4 30 10 -1
   2: 0100007F:1FFC 0100007F:C351 06 00000000:00000000 03:00001770 00000000     0        0 0 3 0000000000000000
   3: 0100007F:0016 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 999 1 0000000000000000 100 0 0 10 0
   4: 0100007F:C352 0100007F:1FFC 01 00000000:00000000 00:00000000 00000000  1000        0 41236 1 0000000000000000 20 4 30 10 -1
";

    #[test]
    fn test_proc_net_keeps_listen_and_established_on_local_port() {
        // 0x1FFC = 8188
        let inodes = parse_proc_net(PROC_NET_TCP, 8188);
        assert_eq!(inodes, vec![41234, 41235]);
    }

    #[test]
    fn test_proc_net_ignores_time_wait_and_remote_port() {
        let inodes = parse_proc_net(PROC_NET_TCP, 8188);
        assert!(!inodes.contains(&0));
        assert!(!inodes.contains(&41236));
    }

    #[test]
    fn test_proc_net_other_port() {
        assert_eq!(parse_proc_net(PROC_NET_TCP, 22), vec![999]);
        assert!(parse_proc_net(PROC_NET_TCP, 9999).is_empty());
    }

    const NETSTAT: &str = "
Active Connections

  Proto  Local Address          Foreign Address        State           PID
  TCP    0.0.0.0:8188           0.0.0.0:0              LISTENING       4242
  TCP    127.0.0.1:8188         127.0.0.1:50001        ESTABLISHED     4242
  TCP    127.0.0.1:50001        127.0.0.1:8188         ESTABLISHED     777
  TCP    127.0.0.1:8188         127.0.0.1:50002        TIME_WAIT       0
  TCP    [::]:8188              [::]:0                 LISTENING       5151
  TCP    0.0.0.0:81880          0.0.0.0:0              LISTENING       9
  UDP    0.0.0.0:8188           *:*                                    31
";

    #[test]
    fn test_netstat_parsing() {
        let pids = parse_netstat(NETSTAT, 8188);
        assert_eq!(pids.into_iter().collect::<Vec<_>>(), vec![4242, 5151]);
    }

    #[test]
    fn test_socket_inode() {
        assert_eq!(socket_inode("socket:[41234]"), Some(41234));
        assert_eq!(socket_inode("pipe:[41234]"), None);
        assert_eq!(socket_inode("/dev/null"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_finds_own_listener() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let pids = find_candidate_pids(port);
        assert!(pids.contains(&std::process::id()));
    }
}
