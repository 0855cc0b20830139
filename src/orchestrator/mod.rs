pub mod ports;
pub mod supervisor;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use is_terminal::IsTerminal;
use owo_colors::OwoColorize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::compose::ContainerOrchestrator;
use crate::config::{self, LoadedConfig};
use crate::exec::SystemRunner;
use crate::health::probe::NetProber;
use crate::health::{HealthEvent, HealthMonitor, HealthState};
use crate::provision::credentials::EnvCredentials;
use crate::provision::{ProvisionOptions, ProvisionOutcome, ProvisionPlan, Provisioner};
use crate::ui::logs::LogWriter;
use crate::ui::summary::{format_step, print_health};

use ports::SystemReclaimer;
use supervisor::{ProcessStatus, ProcessSupervisor, SupervisorEvent};

/// Which provisioning workflow precedes supervision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Install,
    QuickStart,
}

/// Wires the configuration into the supervisor, health monitor, container
/// orchestrator and provisioner, and owns their shutdown.
pub struct Orchestrator {
    loaded: LoadedConfig,
    supervisor: ProcessSupervisor,
    health: Arc<HealthMonitor>,
    compose: Arc<ContainerOrchestrator>,
    provisioner: Arc<Provisioner>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Orchestrator {
    /// Load and validate the config, resolve the process environment and
    /// build every component. Nothing is started yet.
    pub async fn from_config(config_path: &Path) -> Result<Self> {
        let loaded = config::load_config(config_path)
            .with_context(|| format!("loading config from {}", config_path.display()))?;
        let env = config::env::build_process_env(&loaded.config.settings).await;

        let services = loaded.services();
        let infra = loaded.infra();
        let runner = Arc::new(SystemRunner::with_env(env.clone()));
        let prober = Arc::new(NetProber::new(loaded.config.health.probe_timeout));

        let supervisor = ProcessSupervisor::builder(services.clone(), loaded.config.supervisor.clone())
            .env(env.clone())
            .reclaimer(Arc::new(SystemReclaimer::default()))
            .prober(prober.clone())
            .build();
        let health = Arc::new(HealthMonitor::new(
            &services,
            &infra,
            prober.clone(),
            loaded.config.health.interval,
        ));
        let compose = Arc::new(ContainerOrchestrator::from_config(
            runner.clone(),
            &loaded.root,
            loaded.config.compose.as_ref(),
        ));
        let credentials = Arc::new(EnvCredentials::from_config(
            &loaded.config.credentials,
            &loaded.root,
            &env,
        ));
        let provisioner = Arc::new(Provisioner::new(
            ProvisionPlan::from_config(&loaded),
            runner,
            compose.clone(),
            Arc::new(supervisor.clone()),
            prober,
            credentials,
        ));

        Ok(Self {
            loaded,
            supervisor,
            health,
            compose,
            provisioner,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    pub fn config(&self) -> &LoadedConfig {
        &self.loaded
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn compose(&self) -> &Arc<ContainerOrchestrator> {
        &self.compose
    }

    pub fn provisioner(&self) -> &Arc<Provisioner> {
        &self.provisioner
    }

    pub async fn install(&self, options: ProvisionOptions) -> ProvisionOutcome {
        self.provisioner.install(options).await
    }

    pub async fn quick_start(&self, options: ProvisionOptions) -> ProvisionOutcome {
        self.provisioner.quick_start(options).await
    }

    /// Provision, then supervise with live output until Ctrl+C.
    pub async fn run(&self, mode: RunMode, options: ProvisionOptions) -> Result<()> {
        self.spawn_display();

        let provisioning = async {
            match mode {
                RunMode::Install => self.install(options).await,
                RunMode::QuickStart => self.quick_start(options).await,
            }
        };
        tokio::pin!(provisioning);
        let outcome = tokio::select! {
            outcome = &mut provisioning => outcome,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted during provisioning");
                // Let the workflow unwind so it cannot launch after shutdown.
                self.provisioner.cancel();
                provisioning.await;
                self.shutdown().await;
                return Ok(());
            }
        };

        if !outcome.success {
            self.shutdown().await;
            anyhow::bail!(outcome.error.unwrap_or_else(|| "provisioning failed".into()));
        }

        self.health.start().await;
        let status = self.health.get_status().await;
        print_health(
            &self.loaded.config.project.name,
            &status,
            &self.supervisor.get_all_status(),
        );
        if std::io::stdout().is_terminal() {
            println!("  Press {} to stop", "Ctrl+C".bold());
        } else {
            println!("  Press Ctrl+C to stop");
        }
        println!();

        tokio::signal::ctrl_c()
            .await
            .context("waiting for Ctrl+C")?;
        info!("shutting down");
        self.shutdown().await;
        Ok(())
    }

    /// Stop monitoring and every supervised process. Container groups are
    /// left running.
    pub async fn shutdown(&self) {
        self.provisioner.cancel();
        self.health.stop();
        self.supervisor.stop_all().await;
        self.cancel.cancel();
        self.tracker.close();
        if tokio::time::timeout(Duration::from_secs(5), self.tracker.wait())
            .await
            .is_err()
        {
            warn!("display tasks did not finish in time");
        }
    }

    fn spawn_display(&self) {
        let use_color = std::io::stdout().is_terminal();
        let name_width = self
            .supervisor
            .services()
            .iter()
            .map(|s| s.id.len())
            .max()
            .unwrap_or(0);

        let mut events = self.supervisor.subscribe();
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            let mut writer = LogWriter::new(name_width, use_color);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(SupervisorEvent::Log(entry)) => writer.write(&entry),
                        Ok(SupervisorEvent::StatusChange { service_id, status, last_error }) => {
                            match (status, last_error) {
                                (ProcessStatus::Crashed, Some(err)) => {
                                    warn!(service = %service_id, error = %err, "crashed")
                                }
                                _ => info!(service = %service_id, status = %status, "status changed"),
                            }
                        }
                        Ok(SupervisorEvent::Reclaimed(r)) => {
                            info!(
                                port = r.port,
                                pid = r.pid,
                                owner = r.owner.as_deref().unwrap_or("unknown"),
                                forced = r.forced,
                                "reclaimed port",
                            )
                        }
                        Ok(SupervisorEvent::Spawned { .. }) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "log display fell behind");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });

        let mut health = self.health.subscribe();
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = health.recv() => match event {
                        Ok(HealthEvent::StateChanged { id, from, to }) => match to {
                            HealthState::Unhealthy => warn!(entity = %id, from = %from, "unhealthy"),
                            _ => info!(entity = %id, from = %from, to = %to, "health changed"),
                        },
                        Ok(HealthEvent::Update(_)) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });

        let mut steps = self.provisioner.subscribe();
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    step = steps.recv() => match step {
                        Ok(step) => println!("  {}", format_step(&step, use_color)),
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
    }
}
