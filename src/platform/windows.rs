use std::ffi::c_void;
use std::os::windows::process::CommandExt as _;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

use windows_sys::Win32::Foundation::CloseHandle;
use windows_sys::Win32::System::Console::{GenerateConsoleCtrlEvent, CTRL_BREAK_EVENT};
use windows_sys::Win32::System::JobObjects::{
    AssignProcessToJobObject, CreateJobObjectW, TerminateJobObject,
};
use windows_sys::Win32::System::Threading::{
    GetExitCodeProcess, OpenProcess, TerminateProcess, CREATE_NEW_PROCESS_GROUP,
    PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_SET_QUOTA, PROCESS_TERMINATE,
};

use super::{PidSignal, TerminateOutcome};

const STILL_ACTIVE: u32 = 259;
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Job Object that owns the child and everything it spawns.
pub struct ProcessGroupHandle {
    job: *mut c_void,
}

impl Drop for ProcessGroupHandle {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.job);
        }
    }
}

// SAFETY: Job object handles are thread-safe Windows kernel objects.
unsafe impl Send for ProcessGroupHandle {}
unsafe impl Sync for ProcessGroupHandle {}

pub fn configure_process_group(cmd: &mut Command) {
    cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
}

pub fn post_spawn_setup(child_pid: Option<u32>) -> Option<ProcessGroupHandle> {
    let pid = child_pid?;
    unsafe {
        let job = CreateJobObjectW(std::ptr::null(), std::ptr::null());
        if job.is_null() {
            warn!("CreateJobObjectW failed");
            return None;
        }

        let proc_handle = OpenProcess(PROCESS_SET_QUOTA | PROCESS_TERMINATE, 0, pid);
        if proc_handle.is_null() {
            warn!(pid, "OpenProcess failed for job assignment");
            CloseHandle(job);
            return None;
        }

        let result = AssignProcessToJobObject(job, proc_handle);
        CloseHandle(proc_handle);

        if result == 0 {
            warn!(pid, "AssignProcessToJobObject failed");
            CloseHandle(job);
            return None;
        }

        Some(ProcessGroupHandle { job })
    }
}

pub async fn terminate_group(
    child: &mut tokio::process::Child,
    child_pid: Option<u32>,
    group_handle: Option<&ProcessGroupHandle>,
    grace: Duration,
) -> TerminateOutcome {
    let Some(pid) = child_pid else {
        let _ = child.kill().await;
        return TerminateOutcome::AlreadyExited;
    };

    unsafe {
        if GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid) != 0 {
            debug!(pid, "sent CTRL_BREAK_EVENT");
        }
    }

    if let Ok(Ok(_)) = tokio::time::timeout(grace, child.wait()).await {
        return TerminateOutcome::Graceful;
    }

    warn!(pid, grace = ?grace, "process did not exit in time, terminating job");
    match group_handle {
        Some(handle) => unsafe {
            TerminateJobObject(handle.job, 1);
        },
        None => {
            let _ = child.kill().await;
        }
    }
    let _ = child.wait().await;
    TerminateOutcome::Forced
}

pub fn signal_pid(pid: u32, signal: PidSignal) -> bool {
    match signal {
        PidSignal::Terminate => {
            let status = std::process::Command::new("taskkill")
                .args(["/PID", &pid.to_string(), "/T"])
                .creation_flags(CREATE_NO_WINDOW)
                .status();
            matches!(status, Ok(s) if s.success())
        }
        PidSignal::Kill => unsafe {
            let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
            if handle.is_null() {
                return false;
            }
            let ok = TerminateProcess(handle, 1) != 0;
            CloseHandle(handle);
            ok
        },
    }
}

pub fn is_process_alive(pid: u32) -> bool {
    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if handle.is_null() {
            return false;
        }
        let mut exit_code: u32 = 0;
        let result = GetExitCodeProcess(handle, &mut exit_code);
        CloseHandle(handle);
        result != 0 && exit_code == STILL_ACTIVE
    }
}

/// Parse `netstat -ano -p TCP` output for listeners on `port`.
fn parse_netstat(output: &str, port: u16) -> Vec<u32> {
    let suffix = format!(":{}", port);
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 5 || !fields[0].eq_ignore_ascii_case("TCP") {
                return None;
            }
            if !fields[3].eq_ignore_ascii_case("LISTENING") || !fields[1].ends_with(&suffix) {
                return None;
            }
            fields[4].parse().ok()
        })
        .collect()
}

pub fn listening_pids(port: u16) -> Vec<u32> {
    let output = std::process::Command::new("netstat")
        .args(["-ano", "-p", "TCP"])
        .creation_flags(CREATE_NO_WINDOW)
        .output();
    match output {
        Ok(out) => parse_netstat(&String::from_utf8_lossy(&out.stdout), port),
        Err(e) => {
            debug!(port, error = %e, "netstat unavailable");
            Vec::new()
        }
    }
}

pub fn identify_port_owner(port: u16) -> Option<String> {
    listening_pids(port)
        .first()
        .map(|pid| format!("PID {}", pid))
}

pub async fn login_shell_path() -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn netstat_listeners() {
        let out = "\
  Proto  Local Address          Foreign Address        State           PID
  TCP    0.0.0.0:3000           0.0.0.0:0              LISTENING       4120
  TCP    127.0.0.1:30000        0.0.0.0:0              LISTENING       77
  TCP    127.0.0.1:3000         127.0.0.1:50123        ESTABLISHED     4120
";
        assert_eq!(parse_netstat(out, 3000), vec![4120]);
    }
}
