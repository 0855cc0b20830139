pub mod probe;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::model::{InfraDefinition, ServiceDefinition};
use probe::Prober;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Unhealthy,
    Unknown,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::Unhealthy => write!(f, "unhealthy"),
            HealthState::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Service,
    Infrastructure,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthRecord {
    pub id: String,
    pub label: String,
    pub kind: EntityKind,
    pub required: bool,
    pub state: HealthState,
    pub port: Option<u16>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OverallHealth {
    pub records: Vec<HealthRecord>,
    pub all_healthy: bool,
}

#[derive(Debug, Clone)]
pub enum HealthEvent {
    /// Emitted once after every full check.
    Update(OverallHealth),
    /// Emitted only when an entity's state actually changes.
    StateChanged {
        id: String,
        from: HealthState,
        to: HealthState,
    },
}

#[derive(Debug, Clone)]
enum ProbeTarget {
    Http(String),
    Tcp { host: String, port: u16 },
}

#[derive(Debug, Clone)]
struct Target {
    id: String,
    probe: ProbeTarget,
}

/// Periodically probes services and infrastructure and keeps the latest
/// result per entity. The poll path is the only writer of the records.
pub struct HealthMonitor {
    targets: Vec<Target>,
    prober: Arc<dyn Prober>,
    interval: Duration,
    records: RwLock<BTreeMap<String, HealthRecord>>,
    events: broadcast::Sender<HealthEvent>,
    ticker: Mutex<Option<CancellationToken>>,
}

impl HealthMonitor {
    /// Services with neither a health URL nor a health port are not tracked.
    pub fn new(
        services: &[ServiceDefinition],
        infra: &[InfraDefinition],
        prober: Arc<dyn Prober>,
        interval: Duration,
    ) -> Self {
        let mut targets = Vec::new();
        let mut records = BTreeMap::new();

        for svc in services {
            let probe = match (&svc.health_url, svc.health_port) {
                (Some(url), _) => ProbeTarget::Http(url.clone()),
                (None, Some(port)) => ProbeTarget::Tcp {
                    host: "127.0.0.1".to_string(),
                    port,
                },
                (None, None) => continue,
            };
            targets.push(Target {
                id: svc.id.clone(),
                probe,
            });
            records.insert(
                svc.id.clone(),
                HealthRecord {
                    id: svc.id.clone(),
                    label: svc.label.clone(),
                    kind: EntityKind::Service,
                    required: !svc.optional,
                    state: HealthState::Unknown,
                    port: svc.health_port,
                    last_checked_at: None,
                    message: None,
                },
            );
        }

        for dep in infra {
            targets.push(Target {
                id: dep.id.clone(),
                probe: ProbeTarget::Tcp {
                    host: dep.host.clone(),
                    port: dep.port,
                },
            });
            records.insert(
                dep.id.clone(),
                HealthRecord {
                    id: dep.id.clone(),
                    label: dep.label.clone(),
                    kind: EntityKind::Infrastructure,
                    required: dep.required,
                    state: HealthState::Unknown,
                    port: Some(dep.port),
                    last_checked_at: None,
                    message: None,
                },
            );
        }

        let (events, _) = broadcast::channel(256);
        Self {
            targets,
            prober,
            interval,
            records: RwLock::new(records),
            events,
            ticker: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.ticker.lock().map(|t| t.is_some()).unwrap_or(false)
    }

    /// Run one check immediately, then keep checking every interval until
    /// `stop`. Calling it again while running does nothing.
    pub async fn start(self: &Arc<Self>) {
        let token = {
            let Ok(mut ticker) = self.ticker.lock() else {
                return;
            };
            if ticker.is_some() {
                return;
            }
            let token = CancellationToken::new();
            *ticker = Some(token.clone());
            token
        };

        info!(targets = self.targets.len(), interval = ?self.interval, "health monitor started");
        self.check_all().await;

        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(monitor.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; that check already ran.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        monitor.check_all().await;
                    }
                }
            }
            debug!("health monitor stopped");
        });
    }

    pub fn stop(&self) {
        if let Ok(mut ticker) = self.ticker.lock() {
            if let Some(token) = ticker.take() {
                token.cancel();
            }
        }
    }

    /// Probe every target concurrently and publish the results.
    pub async fn check_all(&self) -> OverallHealth {
        let probes = self.targets.iter().map(|target| async move {
            let result = match &target.probe {
                ProbeTarget::Http(url) => self.prober.http(url).await,
                ProbeTarget::Tcp { host, port } => self.prober.tcp(host, *port).await,
            };
            (target.id.clone(), result)
        });
        let results = join_all(probes).await;
        let now = Utc::now();

        let mut flips = Vec::new();
        let overall = {
            let mut records = self.records.write().await;
            for (id, result) in results {
                let Some(record) = records.get_mut(&id) else {
                    continue;
                };
                let (state, message) = match result {
                    Ok(()) => (HealthState::Healthy, None),
                    Err(msg) => (HealthState::Unhealthy, Some(msg)),
                };
                if record.state != state {
                    flips.push((id.clone(), record.state, state));
                }
                record.state = state;
                record.message = message;
                record.last_checked_at = Some(now);
            }
            summarize(&records)
        };

        for (id, from, to) in flips {
            debug!(id = %id, %from, %to, "health state changed");
            let _ = self.events.send(HealthEvent::StateChanged { id, from, to });
        }
        let _ = self.events.send(HealthEvent::Update(overall.clone()));
        overall
    }

    pub async fn get_status(&self) -> OverallHealth {
        summarize(&*self.records.read().await)
    }
}

/// Services and required infrastructure must all be healthy; optional
/// infrastructure does not count.
fn summarize(records: &BTreeMap<String, HealthRecord>) -> OverallHealth {
    let all_healthy = records
        .values()
        .filter(|r| r.kind == EntityKind::Service || r.required)
        .all(|r| r.state == HealthState::Healthy);
    OverallHealth {
        records: records.values().cloned().collect(),
        all_healthy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::probe::{NetProber, ProbeResult};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::path::Path;

    struct FakeProber {
        up_ports: Mutex<HashSet<u16>>,
    }

    impl FakeProber {
        fn with_up(ports: &[u16]) -> Arc<Self> {
            Arc::new(Self {
                up_ports: Mutex::new(ports.iter().copied().collect()),
            })
        }
    }

    #[async_trait]
    impl Prober for FakeProber {
        async fn tcp(&self, _host: &str, port: u16) -> ProbeResult {
            if self.up_ports.lock().unwrap().contains(&port) {
                Ok(())
            } else {
                Err("connection refused".into())
            }
        }
        async fn http(&self, url: &str) -> ProbeResult {
            Err(format!("no http in tests: {}", url))
        }
    }

    fn infra(id: &str, port: u16, required: bool) -> InfraDefinition {
        InfraDefinition {
            id: id.into(),
            label: id.into(),
            host: "127.0.0.1".into(),
            port,
            required,
        }
    }

    fn service_on(id: &str, port: u16) -> ServiceDefinition {
        let mut svc = ServiceDefinition::new(id, "true", &[], Path::new("."), 0);
        svc.health_port = Some(port);
        svc
    }

    #[tokio::test]
    async fn state_changes_are_edge_triggered() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let monitor = HealthMonitor::new(
            &[service_on("api", port)],
            &[],
            Arc::new(NetProber::default()),
            Duration::from_secs(60),
        );
        let mut rx = monitor.subscribe();

        monitor.check_all().await;
        monitor.check_all().await;

        let mut changes = 0;
        let mut updates = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                HealthEvent::StateChanged { id, from, to } => {
                    assert_eq!(id, "api");
                    assert_eq!(from, HealthState::Unknown);
                    assert_eq!(to, HealthState::Healthy);
                    changes += 1;
                }
                HealthEvent::Update(_) => updates += 1,
            }
        }
        assert_eq!(changes, 1);
        assert_eq!(updates, 2);
    }

    #[tokio::test]
    async fn optional_infra_does_not_affect_aggregate() {
        let prober = FakeProber::with_up(&[3000, 5432]);
        let monitor = HealthMonitor::new(
            &[service_on("api", 3000)],
            &[infra("db", 5432, true), infra("vector", 6333, false)],
            prober.clone(),
            Duration::from_secs(60),
        );

        let overall = monitor.check_all().await;
        assert!(overall.all_healthy);
        let vector = overall.records.iter().find(|r| r.id == "vector").unwrap();
        assert_eq!(vector.state, HealthState::Unhealthy);
        assert!(vector.message.as_deref().unwrap().contains("refused"));

        prober.up_ports.lock().unwrap().remove(&5432);
        let overall = monitor.check_all().await;
        assert!(!overall.all_healthy);
    }

    #[tokio::test]
    async fn services_without_probe_are_excluded() {
        let bare = ServiceDefinition::new("cron", "true", &[], Path::new("."), 0);
        let monitor = HealthMonitor::new(
            &[bare],
            &[],
            FakeProber::with_up(&[]),
            Duration::from_secs(60),
        );
        let status = monitor.get_status().await;
        assert!(status.records.is_empty());
        assert!(status.all_healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent_and_stop_cancels() {
        let monitor = Arc::new(HealthMonitor::new(
            &[service_on("api", 3000)],
            &[],
            FakeProber::with_up(&[3000]),
            Duration::from_secs(5),
        ));
        let mut rx = monitor.subscribe();

        monitor.start().await;
        monitor.start().await;
        assert!(monitor.is_running());
        assert_eq!(monitor.get_status().await.records[0].state, HealthState::Healthy);

        let mut updates = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, HealthEvent::Update(_)) {
                updates += 1;
            }
        }
        assert_eq!(updates, 1, "second start must not run another check");

        monitor.stop();
        assert!(!monitor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn started_monitor_checks_every_interval() {
        let monitor = Arc::new(HealthMonitor::new(
            &[service_on("api", 3000)],
            &[],
            FakeProber::with_up(&[3000]),
            Duration::from_secs(5),
        ));
        let mut rx = monitor.subscribe();

        monitor.start().await;
        tokio::time::sleep(Duration::from_millis(10_500)).await;
        monitor.stop();

        let updates = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|e| matches!(e, HealthEvent::Update(_)))
            .count();
        assert_eq!(updates, 3);
    }
}
