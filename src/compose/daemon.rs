//! Getting a container daemon running, escalating one strategy at a time.

use std::time::Duration;

use tracing::{debug, info, warn};

use super::ContainerOrchestrator;
use crate::exec::CommandSpec;
use crate::platform::HostPlatform;

const HOMEBREW_INSTALLER: &str =
    "https://raw.githubusercontent.com/Homebrew/install/HEAD/install.sh";

/// One way of obtaining a running daemon, tried in order until one works.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireStrategy {
    /// Open Docker Desktop and wait for it to come up.
    LaunchDesktop,
    /// Start an already installed Colima VM.
    StartColima,
    /// `brew install colima docker`, then start it.
    BrewInstallColima,
    /// Install Homebrew behind one administrator prompt, then Colima.
    InstallHomebrew,
    /// `systemctl start docker`
    SystemctlStart,
    /// `systemctl start docker` through a graphical privilege prompt.
    PkexecStart,
    /// Official convenience installer plus group membership, elevated.
    PkexecInstall,
}

impl AcquireStrategy {
    pub fn describe(&self) -> &'static str {
        match self {
            AcquireStrategy::LaunchDesktop => "launching Docker Desktop",
            AcquireStrategy::StartColima => "starting Colima",
            AcquireStrategy::BrewInstallColima => "installing Colima with Homebrew",
            AcquireStrategy::InstallHomebrew => "installing Homebrew and Colima",
            AcquireStrategy::SystemctlStart => "starting the docker service",
            AcquireStrategy::PkexecStart => "starting the docker service (elevated)",
            AcquireStrategy::PkexecInstall => "installing Docker Engine (elevated)",
        }
    }
}

/// The ordered chain for a host.
pub fn chain_for(host: HostPlatform) -> &'static [AcquireStrategy] {
    use AcquireStrategy::*;
    match host {
        HostPlatform::MacOs => &[LaunchDesktop, StartColima, BrewInstallColima, InstallHomebrew],
        HostPlatform::Linux => &[SystemctlStart, PkexecStart, PkexecInstall],
        HostPlatform::Windows => &[LaunchDesktop],
    }
}

/// Where to send the user when every strategy failed.
pub fn manual_install_url(host: HostPlatform) -> &'static str {
    match host {
        HostPlatform::MacOs => "https://docs.docker.com/desktop/setup/install/mac-install/",
        HostPlatform::Linux => "https://docs.docker.com/engine/install/",
        HostPlatform::Windows => "https://docs.docker.com/desktop/setup/install/windows-install/",
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DaemonTimeouts {
    /// `docker info`
    pub probe: Duration,
    /// How long to wait for a launched daemon to answer.
    pub launch_poll: Duration,
    pub poll_interval: Duration,
    /// Start commands (`systemctl`, `colima start`).
    pub start: Duration,
    /// Package installs.
    pub install: Duration,
}

impl Default for DaemonTimeouts {
    fn default() -> Self {
        Self {
            probe: Duration::from_secs(10),
            launch_poll: Duration::from_secs(60),
            poll_interval: Duration::from_secs(2),
            start: Duration::from_secs(180),
            install: Duration::from_secs(900),
        }
    }
}

impl ContainerOrchestrator {
    pub async fn is_daemon_running(&self) -> bool {
        let spec = CommandSpec::new("docker")
            .arg("info")
            .timeout(self.timeouts.probe);
        match self.runner.run(&spec).await {
            Ok(out) => out.success,
            Err(e) => {
                debug!(error = %e, "docker info failed");
                false
            }
        }
    }

    /// Try each strategy for this host until the daemon answers. Returns
    /// false once the chain is exhausted.
    pub async fn acquire_daemon(&self) -> bool {
        if self.is_daemon_running().await {
            return true;
        }
        for strategy in chain_for(self.host) {
            info!(strategy = ?strategy, "{}", strategy.describe());
            let budget = self.strategy_budget(*strategy);
            match tokio::time::timeout(budget, self.attempt(*strategy)).await {
                Ok(true) => {
                    info!(strategy = ?strategy, "container daemon is running");
                    self.reset_detection();
                    return true;
                }
                Ok(false) => debug!(strategy = ?strategy, "strategy did not produce a daemon"),
                Err(_) => warn!(strategy = ?strategy, budget = ?budget, "strategy timed out"),
            }
        }
        warn!(url = manual_install_url(self.host), "could not start a container daemon");
        if self.host == HostPlatform::Linux {
            warn!("docker group membership only applies after logging out and back in");
        }
        false
    }

    pub fn manual_install_url(&self) -> &'static str {
        manual_install_url(self.host)
    }

    fn strategy_budget(&self, strategy: AcquireStrategy) -> Duration {
        let t = &self.timeouts;
        match strategy {
            AcquireStrategy::LaunchDesktop => t.launch_poll + t.probe,
            AcquireStrategy::StartColima | AcquireStrategy::SystemctlStart | AcquireStrategy::PkexecStart => {
                t.start + t.launch_poll
            }
            AcquireStrategy::BrewInstallColima | AcquireStrategy::PkexecInstall => {
                t.install + t.start + t.launch_poll
            }
            AcquireStrategy::InstallHomebrew => t.install * 2 + t.start + t.launch_poll,
        }
    }

    /// Run `spec`; any error or non-zero exit counts as failure.
    async fn step(&self, spec: CommandSpec) -> bool {
        let shown = spec.display();
        match self.runner.run(&spec).await {
            Ok(out) if out.success => true,
            Ok(out) => {
                debug!(command = %shown, error = %out.error_summary(), "command failed");
                false
            }
            Err(e) => {
                debug!(command = %shown, error = %e, "command failed");
                false
            }
        }
    }

    async fn poll_daemon(&self, budget: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            if self.is_daemon_running().await {
                return true;
            }
            if tokio::time::Instant::now() + self.timeouts.poll_interval > deadline {
                return false;
            }
            tokio::time::sleep(self.timeouts.poll_interval).await;
        }
    }

    async fn attempt(&self, strategy: AcquireStrategy) -> bool {
        let t = self.timeouts;
        match strategy {
            AcquireStrategy::LaunchDesktop => {
                let launch = match self.host {
                    HostPlatform::Windows => CommandSpec::new("powershell").args([
                        "-NoProfile",
                        "-Command",
                        "Start-Process 'C:\\Program Files\\Docker\\Docker\\Docker Desktop.exe'",
                    ]),
                    _ => CommandSpec::new("open").args(["-a", "Docker"]),
                };
                self.step(launch.timeout(t.probe)).await && self.poll_daemon(t.launch_poll).await
            }
            AcquireStrategy::StartColima => self.start_colima("colima").await,
            AcquireStrategy::BrewInstallColima => self.brew_install_colima(&brew_binary()).await,
            AcquireStrategy::InstallHomebrew => {
                let user = current_user();
                let prepare = format!(
                    "do shell script \"mkdir -p /opt/homebrew && chown -R {}:admin /opt/homebrew\" with administrator privileges",
                    user
                );
                if !self
                    .step(CommandSpec::new("osascript").args(["-e", prepare.as_str()]).timeout(t.install))
                    .await
                {
                    return false;
                }
                let install = format!("NONINTERACTIVE=1 /bin/bash -c \"$(curl -fsSL {})\"", HOMEBREW_INSTALLER);
                if !self
                    .step(CommandSpec::new("/bin/bash").args(["-c", install.as_str()]).timeout(t.install))
                    .await
                {
                    return false;
                }
                self.brew_install_colima(&brew_binary()).await
            }
            AcquireStrategy::SystemctlStart => {
                self.step(CommandSpec::new("systemctl").args(["start", "docker"]).timeout(t.start))
                    .await
                    && self.poll_daemon(t.launch_poll).await
            }
            AcquireStrategy::PkexecStart => {
                self.step(
                    CommandSpec::new("pkexec")
                        .args(["systemctl", "start", "docker"])
                        .timeout(t.start),
                )
                .await
                    && self.poll_daemon(t.launch_poll).await
            }
            AcquireStrategy::PkexecInstall => {
                let script = format!(
                    "curl -fsSL https://get.docker.com | sh && usermod -aG docker {} && systemctl enable --now docker",
                    current_user()
                );
                self.step(
                    CommandSpec::new("pkexec")
                        .args(["sh", "-c", script.as_str()])
                        .timeout(t.install),
                )
                .await
                    && self.poll_daemon(t.launch_poll).await
            }
        }
    }

    async fn start_colima(&self, colima: &str) -> bool {
        let t = self.timeouts;
        if !self.step(CommandSpec::new(colima).arg("version").timeout(t.probe)).await {
            return false;
        }
        self.step(CommandSpec::new(colima).arg("start").timeout(t.start)).await
            && self.poll_daemon(t.launch_poll).await
    }

    async fn brew_install_colima(&self, brew: &str) -> bool {
        let t = self.timeouts;
        if !self.step(CommandSpec::new(brew).arg("--version").timeout(t.probe)).await {
            return false;
        }
        if !self
            .step(CommandSpec::new(brew).args(["install", "colima", "docker"]).timeout(t.install))
            .await
        {
            return false;
        }
        self.start_colima(&colima_binary(brew)).await
    }
}

/// Homebrew may have been installed during this run and not be on PATH yet.
fn brew_binary() -> String {
    ["/opt/homebrew/bin/brew", "/usr/local/bin/brew"]
        .iter()
        .find(|p| std::path::Path::new(p).exists())
        .map(|p| p.to_string())
        .unwrap_or_else(|| "brew".to_string())
}

fn colima_binary(brew: &str) -> String {
    match brew.strip_suffix("brew") {
        Some(prefix) if !prefix.is_empty() => format!("{}colima", prefix),
        _ => "colima".to_string(),
    }
}

fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "$(logname)".to_string())
}
