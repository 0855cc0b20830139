use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::platform::{self, PidSignal};

/// A process that was holding a port and was told to leave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReclaimedPort {
    pub port: u16,
    pub pid: u32,
    /// Command line or PID description, when the platform can tell.
    pub owner: Option<String>,
    /// Needed SIGKILL after the grace period.
    pub forced: bool,
}

#[async_trait]
pub trait PortReclaimer: Send + Sync {
    /// Free every port in `ports` that some other process is listening on.
    async fn reclaim(&self, ports: &[u16]) -> Vec<ReclaimedPort>;
}

/// Signals the real listeners: SIGTERM, a short grace, then SIGKILL.
#[derive(Debug, Clone)]
pub struct SystemReclaimer {
    grace: Duration,
}

impl SystemReclaimer {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }
}

impl Default for SystemReclaimer {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

#[async_trait]
impl PortReclaimer for SystemReclaimer {
    async fn reclaim(&self, ports: &[u16]) -> Vec<ReclaimedPort> {
        let own_pid = std::process::id();
        let ports = ports.to_vec();
        let owners = tokio::task::spawn_blocking(move || {
            ports
                .into_iter()
                .flat_map(|port| {
                    platform::listening_pids(port)
                        .into_iter()
                        .filter(|pid| *pid != own_pid)
                        .map(move |pid| (port, pid))
                })
                .map(|(port, pid)| (port, pid, platform::identify_port_owner(port)))
                .collect::<Vec<_>>()
        })
        .await
        .unwrap_or_default();

        if owners.is_empty() {
            debug!("no stale listeners to reclaim");
            return Vec::new();
        }

        for (port, pid, owner) in &owners {
            info!(port, pid, owner = owner.as_deref().unwrap_or("unknown"), "terminating stale listener");
            platform::signal_pid(*pid, PidSignal::Terminate);
        }

        let deadline = tokio::time::Instant::now() + self.grace;
        while tokio::time::Instant::now() < deadline
            && owners.iter().any(|(_, pid, _)| platform::is_process_alive(*pid))
        {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        owners
            .into_iter()
            .map(|(port, pid, owner)| {
                let forced = platform::is_process_alive(pid);
                if forced {
                    warn!(port, pid, "stale listener ignored SIGTERM, killing");
                    platform::signal_pid(pid, PidSignal::Kill);
                }
                ReclaimedPort {
                    port,
                    pid,
                    owner,
                    forced,
                }
            })
            .collect()
    }
}

/// Ports the supervisor clears before a full start: every declared health
/// port plus the configured sub-process range.
pub fn ports_to_reclaim(
    health_ports: impl IntoIterator<Item = u16>,
    range: Option<crate::config::model::PortRange>,
) -> Vec<u16> {
    let mut ports: Vec<u16> = health_ports.into_iter().collect();
    if let Some(range) = range {
        ports.extend(range.ports());
    }
    ports.sort_unstable();
    ports.dedup();
    ports
}
