use std::time::Duration;

use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{PidSignal, TerminateOutcome};

/// No-op on Unix; the group is addressed by the leader's PID.
pub struct ProcessGroupHandle;

pub fn configure_process_group(cmd: &mut Command) {
    cmd.process_group(0);
}

pub fn post_spawn_setup(_child_pid: Option<u32>) -> Option<ProcessGroupHandle> {
    None
}

pub async fn terminate_group(
    child: &mut tokio::process::Child,
    child_pid: Option<u32>,
    _group_handle: Option<&ProcessGroupHandle>,
    grace: Duration,
) -> TerminateOutcome {
    let Some(pid) = child_pid else {
        let _ = child.kill().await;
        return TerminateOutcome::AlreadyExited;
    };

    let pgid = Pid::from_raw(pid as i32);
    match killpg(pgid, Signal::SIGTERM) {
        Ok(()) => debug!(pid, "sent SIGTERM to process group"),
        Err(nix::errno::Errno::ESRCH) => {
            debug!(pid, "process group already exited");
            let _ = child.wait().await;
            return TerminateOutcome::AlreadyExited;
        }
        Err(e) => {
            warn!(pid, error = %e, "killpg(SIGTERM) failed, falling back to kill");
            let _ = child.kill().await;
            return TerminateOutcome::Forced;
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(_)) => {
            // Reap stragglers that ignored SIGTERM but share the group.
            let _ = killpg(pgid, Signal::SIGKILL);
            TerminateOutcome::Graceful
        }
        _ => {
            warn!(pid, grace = ?grace, "process group did not exit in time, sending SIGKILL");
            let _ = killpg(pgid, Signal::SIGKILL);
            let _ = child.kill().await;
            let _ = child.wait().await;
            TerminateOutcome::Forced
        }
    }
}

pub fn signal_pid(pid: u32, signal: PidSignal) -> bool {
    let sig = match signal {
        PidSignal::Terminate => Signal::SIGTERM,
        PidSignal::Kill => Signal::SIGKILL,
    };
    match kill(Pid::from_raw(pid as i32), sig) {
        Ok(()) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        Err(e) => {
            warn!(pid, error = %e, "failed to signal process");
            false
        }
    }
}

pub fn is_process_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Socket inodes in LISTEN state (`0A`) bound to `port`, from a
/// `/proc/net/tcp{,6}` table.
#[cfg(target_os = "linux")]
fn listening_inodes(table: &str, port: u16) -> Vec<String> {
    let port_hex = format!("{:04X}", port);
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 || fields[3] != "0A" {
                return None;
            }
            let local_port = fields[1].rsplit(':').next()?;
            (local_port == port_hex && fields[9] != "0").then(|| fields[9].to_string())
        })
        .collect()
}

/// PIDs holding any of the given socket inodes open.
#[cfg(target_os = "linux")]
fn pids_for_inodes(inodes: &[String]) -> Vec<(u32, String)> {
    let needles: Vec<String> = inodes.iter().map(|i| format!("socket:[{}]", i)).collect();
    let mut found = Vec::new();
    let Ok(proc_dir) = std::fs::read_dir("/proc") else {
        return found;
    };
    for entry in proc_dir.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        let Ok(pid) = name.parse::<u32>() else {
            continue;
        };
        let Ok(fds) = std::fs::read_dir(format!("/proc/{}/fd", pid)) else {
            continue;
        };
        let holds = fds.flatten().any(|fd| {
            std::fs::read_link(fd.path())
                .map(|link| needles.iter().any(|n| link.to_string_lossy() == n.as_str()))
                .unwrap_or(false)
        });
        if holds {
            let cmdline = std::fs::read_to_string(format!("/proc/{}/cmdline", pid))
                .map(|c| c.replace('\0', " ").trim().to_string())
                .unwrap_or_default();
            found.push((pid, cmdline));
        }
    }
    found
}

#[cfg(target_os = "linux")]
fn port_owners(port: u16) -> Vec<(u32, String)> {
    let mut inodes = Vec::new();
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        if let Ok(content) = std::fs::read_to_string(table) {
            inodes.extend(listening_inodes(&content, port));
        }
    }
    if inodes.is_empty() {
        return Vec::new();
    }
    pids_for_inodes(&inodes)
}

#[cfg(target_os = "linux")]
pub fn listening_pids(port: u16) -> Vec<u32> {
    port_owners(port).into_iter().map(|(pid, _)| pid).collect()
}

#[cfg(not(target_os = "linux"))]
pub fn listening_pids(port: u16) -> Vec<u32> {
    let output = std::process::Command::new("lsof")
        .args(["-nP", "-t", &format!("-iTCP:{}", port), "-sTCP:LISTEN"])
        .output();
    match output {
        Ok(out) => String::from_utf8_lossy(&out.stdout)
            .lines()
            .filter_map(|l| l.trim().parse().ok())
            .collect(),
        Err(e) => {
            debug!(port, error = %e, "lsof unavailable");
            Vec::new()
        }
    }
}

#[cfg(target_os = "linux")]
pub fn identify_port_owner(port: u16) -> Option<String> {
    let (pid, cmd) = port_owners(port).into_iter().next()?;
    if cmd.is_empty() {
        return Some(format!("PID {}", pid));
    }
    if cmd.chars().count() > 60 {
        let short: String = cmd.chars().take(57).collect();
        return Some(format!("{}... (PID {})", short, pid));
    }
    Some(format!("{} (PID {})", cmd, pid))
}

#[cfg(not(target_os = "linux"))]
pub fn identify_port_owner(port: u16) -> Option<String> {
    listening_pids(port)
        .first()
        .map(|pid| format!("PID {}", pid))
}

const SHELL_PATH_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn login_shell_path() -> Option<String> {
    let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
    let mut cmd = Command::new(&shell);
    cmd.args(["-ilc", "printf %s \"$PATH\""])
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(SHELL_PATH_TIMEOUT, cmd.output()).await {
        Ok(Ok(out)) if out.status.success() => out,
        Ok(Ok(out)) => {
            debug!(shell = %shell, status = ?out.status, "login shell exited with failure");
            return None;
        }
        Ok(Err(e)) => {
            debug!(shell = %shell, error = %e, "failed to run login shell");
            return None;
        }
        Err(_) => {
            debug!(shell = %shell, "login shell timed out");
            return None;
        }
    };

    // rc files may print banners before our printf.
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}
