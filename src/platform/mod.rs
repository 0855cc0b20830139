use std::time::Duration;

use tokio::process::Command;

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
use unix as imp;
#[cfg(windows)]
use windows as imp;

pub use imp::ProcessGroupHandle;

/// Host operating system, used to pick daemon strategies and install URLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPlatform {
    MacOs,
    Linux,
    Windows,
}

impl HostPlatform {
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            HostPlatform::MacOs
        } else if cfg!(windows) {
            HostPlatform::Windows
        } else {
            HostPlatform::Linux
        }
    }
}

impl std::fmt::Display for HostPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostPlatform::MacOs => write!(f, "macOS"),
            HostPlatform::Linux => write!(f, "Linux"),
            HostPlatform::Windows => write!(f, "Windows"),
        }
    }
}

/// How `terminate_group` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// Exited within the grace period after the polite signal.
    Graceful,
    /// Needed the forced kill.
    Forced,
    /// Was already gone when the signal was sent.
    AlreadyExited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidSignal {
    Terminate,
    Kill,
}

/// Put the command in its own process group so the whole tree can be
/// signalled at once.
/// Unix: `process_group(0)`, Windows: `CREATE_NEW_PROCESS_GROUP`
pub fn configure_process_group(cmd: &mut Command) {
    imp::configure_process_group(cmd)
}

/// Post-spawn setup (a Job Object on Windows). Keep the handle alive for the
/// lifetime of the child.
pub fn post_spawn_setup(child_pid: Option<u32>) -> Option<ProcessGroupHandle> {
    imp::post_spawn_setup(child_pid)
}

/// Ask the child's process group to exit, wait up to `grace`, then kill the
/// group. Returns once the child has been reaped.
pub async fn terminate_group(
    child: &mut tokio::process::Child,
    child_pid: Option<u32>,
    group_handle: Option<&ProcessGroupHandle>,
    grace: Duration,
) -> TerminateOutcome {
    imp::terminate_group(child, child_pid, group_handle, grace).await
}

/// Send a signal to a single process. Returns false if it no longer exists.
pub fn signal_pid(pid: u32, signal: PidSignal) -> bool {
    imp::signal_pid(pid, signal)
}

pub fn is_process_alive(pid: u32) -> bool {
    imp::is_process_alive(pid)
}

/// PIDs with a TCP socket listening on `port`. Blocking; call from
/// `spawn_blocking` inside async code.
pub fn listening_pids(port: u16) -> Vec<u32> {
    let mut pids = imp::listening_pids(port);
    pids.sort_unstable();
    pids.dedup();
    pids
}

/// Identify which process owns a given TCP port, for messages.
pub fn identify_port_owner(port: u16) -> Option<String> {
    imp::identify_port_owner(port)
}

/// The `PATH` an interactive login shell would see. `None` on Windows or
/// when the shell cannot be queried in time.
pub async fn login_shell_path() -> Option<String> {
    imp::login_shell_path().await
}

/// Expand leading `~` or `$HOME` in a path string to the actual home directory.
///
/// Returns the original string unchanged when no home directory is available
/// or the string doesn't start with `~` or `$HOME`.
pub fn expand_home(path: &str) -> String {
    let Some(home) = dirs::home_dir() else {
        return path.to_string();
    };
    let home = home.to_string_lossy();
    if path == "~" || path == "$HOME" {
        return home.to_string();
    }
    if let Some(rest) = path.strip_prefix("~/") {
        return format!("{}/{}", home, rest);
    }
    if let Some(rest) = path
        .strip_prefix("$HOME/")
        .or_else(|| path.strip_prefix("$HOME\\"))
    {
        return format!("{}/{}", home, rest);
    }
    path.to_string()
}
