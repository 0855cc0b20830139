use std::collections::{BTreeMap, HashMap, HashSet};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::model::{Readiness, ServiceDefinition, SupervisorConfig};
use crate::health::probe::{NetProber, Prober};
use crate::orchestrator::ports::{ports_to_reclaim, PortReclaimer, ReclaimedPort, SystemReclaimer};
use crate::platform;
use crate::ui::buffer::LogBuffer;
use crate::ui::logs::{LogEntry, LogStream};

// ---------------------------------------------------------------------------
// Records and events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Stopped,
    Starting,
    Running,
    Crashed,
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessStatus::Stopped => write!(f, "stopped"),
            ProcessStatus::Starting => write!(f, "starting"),
            ProcessStatus::Running => write!(f, "running"),
            ProcessStatus::Crashed => write!(f, "crashed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessRecord {
    pub service_id: String,
    pub pid: Option<u32>,
    pub status: ProcessStatus,
    pub restart_count: u32,
    pub last_error: Option<String>,
}

impl ProcessRecord {
    fn stopped(service_id: &str) -> Self {
        Self {
            service_id: service_id.to_string(),
            pid: None,
            status: ProcessStatus::Stopped,
            restart_count: 0,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    Log(LogEntry),
    StatusChange {
        service_id: String,
        status: ProcessStatus,
        last_error: Option<String>,
    },
    Spawned {
        service_id: String,
        pid: u32,
    },
    Reclaimed(ReclaimedPort),
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("unknown service `{id}`{}", .suggestion.as_ref().map(|s| format!(" (did you mean `{}`?)", s)).unwrap_or_default())]
    UnknownService {
        id: String,
        suggestion: Option<String>,
    },
    #[error("failed to spawn `{id}`: {source}")]
    Spawn {
        id: String,
        #[source]
        source: std::io::Error,
    },
    #[error("supervision task for `{0}` ended before the process was spawned")]
    TaskEnded(String),
    #[error("start was interrupted by a stop request")]
    Aborted,
}

/// What `start_all` did, per service.
#[derive(Debug, Default, Clone, Serialize)]
pub struct StartAllReport {
    pub started: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<(String, String)>,
}

// ---------------------------------------------------------------------------
// RestartPolicy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub initial_delay: Duration,
}

impl RestartPolicy {
    pub fn from_config(cfg: &SupervisorConfig) -> Self {
        Self {
            max_restarts: cfg.max_restarts,
            initial_delay: cfg.initial_delay,
        }
    }

    /// Delay before restart `attempt` (1-based): `initial * 2^(attempt-1)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_delay.saturating_mul(1u32 << exponent)
    }
}

// ---------------------------------------------------------------------------
// ProcessSupervisor
// ---------------------------------------------------------------------------

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Slot {
    generation: u64,
    record: ProcessRecord,
}

struct RunHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    services: Vec<ServiceDefinition>,
    env: BTreeMap<String, String>,
    settings: SupervisorConfig,
    policy: RestartPolicy,
    records: Mutex<BTreeMap<String, Slot>>,
    running: Mutex<HashMap<String, RunHandle>>,
    next_generation: AtomicU64,
    shutdowns_in_flight: AtomicUsize,
    stop_epoch: AtomicU64,
    logs: Mutex<LogBuffer>,
    events: broadcast::Sender<SupervisorEvent>,
    reclaimer: Arc<dyn PortReclaimer>,
    prober: Arc<dyn Prober>,
}

/// Owns every service process. It is the only writer of process records;
/// each record is tagged with the generation of the task that owns it so a
/// superseded task can never overwrite its successor's state.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

pub struct SupervisorBuilder {
    services: Vec<ServiceDefinition>,
    settings: SupervisorConfig,
    env: Option<BTreeMap<String, String>>,
    reclaimer: Arc<dyn PortReclaimer>,
    prober: Arc<dyn Prober>,
}

impl SupervisorBuilder {
    pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn reclaimer(mut self, reclaimer: Arc<dyn PortReclaimer>) -> Self {
        self.reclaimer = reclaimer;
        self
    }

    pub fn prober(mut self, prober: Arc<dyn Prober>) -> Self {
        self.prober = prober;
        self
    }

    pub fn build(self) -> ProcessSupervisor {
        let mut services = self.services;
        services.sort_by(|a, b| a.start_order.cmp(&b.start_order).then_with(|| a.id.cmp(&b.id)));
        let (events, _) = broadcast::channel(1024);
        ProcessSupervisor {
            inner: Arc::new(Inner {
                services,
                env: self.env.unwrap_or_else(|| std::env::vars().collect()),
                policy: RestartPolicy::from_config(&self.settings),
                logs: Mutex::new(LogBuffer::new(self.settings.log_capacity)),
                settings: self.settings,
                records: Mutex::new(BTreeMap::new()),
                running: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                shutdowns_in_flight: AtomicUsize::new(0),
                stop_epoch: AtomicU64::new(0),
                events,
                reclaimer: self.reclaimer,
                prober: self.prober,
            }),
        }
    }
}

struct ShutdownGuard<'a>(&'a AtomicUsize);

impl Drop for ShutdownGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ProcessSupervisor {
    pub fn builder(services: Vec<ServiceDefinition>, settings: SupervisorConfig) -> SupervisorBuilder {
        SupervisorBuilder {
            services,
            settings,
            env: None,
            reclaimer: Arc::new(SystemReclaimer::default()),
            prober: Arc::new(NetProber::default()),
        }
    }

    /// Registry services in start order.
    pub fn services(&self) -> &[ServiceDefinition] {
        &self.inner.services
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.inner.events.subscribe()
    }

    /// Spawn one service, replacing any existing process for it. Resolves
    /// with the PID once the spawn call has returned.
    pub async fn start(&self, id: &str) -> Result<u32, SupervisorError> {
        let def = self.inner.definition(id)?.clone();
        self.stop(id).await;

        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        let (spawn_tx, spawn_rx) = oneshot::channel();
        let task = tokio::spawn(run_service(
            Arc::clone(&self.inner),
            def,
            generation,
            cancel.clone(),
            spawn_tx,
        ));

        let previous = lock(&self.inner.running).insert(id.to_string(), RunHandle { cancel, task });
        if let Some(previous) = previous {
            // A concurrent start raced us; the older task terminates its child.
            previous.cancel.cancel();
        }

        match spawn_rx.await {
            Ok(result) => result,
            Err(_) => Err(SupervisorError::TaskEnded(id.to_string())),
        }
    }

    /// Terminate a service's process group and drop its record. Resolves
    /// once the process has exited. Stopping an idle service is a no-op.
    pub async fn stop(&self, id: &str) {
        let handle = lock(&self.inner.running).remove(id);
        if let Some(handle) = handle {
            handle.cancel.cancel();
            if let Err(e) = handle.task.await {
                warn!(service = %id, error = %e, "supervision task failed");
            }
        }

        let removed = lock(&self.inner.records).remove(id);
        if let Some(slot) = removed {
            if slot.record.status != ProcessStatus::Stopped {
                self.inner.emit_status(id, ProcessStatus::Stopped, None);
            }
        }
    }

    /// Stop every service concurrently. Safe to call repeatedly and while a
    /// `start_all` is in progress, which then aborts.
    pub async fn stop_all(&self) {
        self.inner.shutdowns_in_flight.fetch_add(1, Ordering::SeqCst);
        let _guard = ShutdownGuard(&self.inner.shutdowns_in_flight);
        self.inner.stop_epoch.fetch_add(1, Ordering::SeqCst);

        let mut ids: HashSet<String> = lock(&self.inner.running).keys().cloned().collect();
        ids.extend(lock(&self.inner.records).keys().cloned());
        if ids.is_empty() {
            return;
        }

        info!(count = ids.len(), "stopping all services");
        futures_util::future::join_all(ids.iter().map(|id| self.stop(id))).await;
    }

    /// Stop everything, reclaim stale ports, then spawn every service that is
    /// not skipped in ascending start order with a settle delay between
    /// spawns. Optional services whose working directory is missing are
    /// skipped. Individual spawn failures are reported, not fatal.
    pub async fn start_all(&self, skip: &HashSet<String>) -> Result<StartAllReport, SupervisorError> {
        self.stop_all().await;
        let epoch = self.inner.stop_epoch.load(Ordering::SeqCst);

        let ports = ports_to_reclaim(
            self.inner.services.iter().filter_map(|s| s.health_port),
            self.inner.settings.reclaim_port_range,
        );
        if !ports.is_empty() {
            for reclaimed in self.inner.reclaimer.reclaim(&ports).await {
                let _ = self.inner.events.send(SupervisorEvent::Reclaimed(reclaimed));
            }
        }

        let mut report = StartAllReport::default();
        let mut spawned_any = false;
        for svc in &self.inner.services {
            if self.inner.stop_epoch.load(Ordering::SeqCst) != epoch {
                return Err(SupervisorError::Aborted);
            }
            if skip.contains(&svc.id) {
                info!(service = %svc.id, "skipping service");
                report.skipped.push(svc.id.clone());
                continue;
            }
            if svc.optional && !svc.cwd.is_dir() {
                info!(service = %svc.id, cwd = %svc.cwd.display(), "skipping optional service, directory missing");
                report.skipped.push(svc.id.clone());
                continue;
            }

            if spawned_any {
                tokio::time::sleep(self.inner.settings.settle_delay).await;
                if self.inner.stop_epoch.load(Ordering::SeqCst) != epoch {
                    return Err(SupervisorError::Aborted);
                }
            }
            spawned_any = true;

            match self.start(&svc.id).await {
                Ok(pid) => {
                    info!(service = %svc.id, pid, "started");
                    report.started.push(svc.id.clone());
                }
                Err(e) => {
                    error!(service = %svc.id, error = %e, "failed to start");
                    report.failed.push((svc.id.clone(), e.to_string()));
                }
            }
        }
        Ok(report)
    }

    /// Start a service afresh with its restart counter reset, e.g. after it
    /// exhausted its restarts.
    pub async fn restart_service(&self, id: &str) -> Result<u32, SupervisorError> {
        self.start(id).await
    }

    /// One record per registry service; services without a record report
    /// `stopped`.
    pub fn get_all_status(&self) -> Vec<ProcessRecord> {
        let records = lock(&self.inner.records);
        self.inner
            .services
            .iter()
            .map(|svc| match records.get(&svc.id) {
                Some(slot) => slot.record.clone(),
                None => ProcessRecord::stopped(&svc.id),
            })
            .collect()
    }

    pub fn get_status(&self, id: &str) -> Option<ProcessRecord> {
        lock(&self.inner.records).get(id).map(|slot| slot.record.clone())
    }

    pub fn get_logs(&self, service: Option<&str>, tail: usize) -> Vec<LogEntry> {
        lock(&self.inner.logs).tail(service, tail)
    }
}

impl Inner {
    fn definition(&self, id: &str) -> Result<&ServiceDefinition, SupervisorError> {
        self.services.iter().find(|s| s.id == id).ok_or_else(|| {
            let ids: Vec<String> = self.services.iter().map(|s| s.id.clone()).collect();
            SupervisorError::UnknownService {
                id: id.to_string(),
                suggestion: crate::config::validate::closest_match(id, ids.iter()),
            }
        })
    }

    fn shutting_down(&self) -> bool {
        self.shutdowns_in_flight.load(Ordering::SeqCst) > 0
    }

    fn emit_status(&self, id: &str, status: ProcessStatus, last_error: Option<String>) {
        let _ = self.events.send(SupervisorEvent::StatusChange {
            service_id: id.to_string(),
            status,
            last_error,
        });
    }

    /// Replace the record for `id`, claiming it for `generation`.
    fn put_record(&self, generation: u64, record: ProcessRecord) {
        let id = record.service_id.clone();
        let (status, last_error) = (record.status, record.last_error.clone());
        let changed = {
            let mut records = lock(&self.records);
            if records.get(&id).is_some_and(|slot| slot.generation > generation) {
                return;
            }
            let changed = records.get(&id).map(|slot| slot.record.status) != Some(status);
            records.insert(id.clone(), Slot { generation, record });
            changed
        };
        if changed {
            self.emit_status(&id, status, last_error);
        }
    }

    /// Mutate the record only if it still belongs to `generation`.
    fn update_record(&self, id: &str, generation: u64, f: impl FnOnce(&mut ProcessRecord)) {
        let change = {
            let mut records = lock(&self.records);
            let Some(slot) = records.get_mut(id) else {
                return;
            };
            if slot.generation != generation {
                return;
            }
            let before = slot.record.status;
            f(&mut slot.record);
            (slot.record.status != before).then(|| (slot.record.status, slot.record.last_error.clone()))
        };
        if let Some((status, last_error)) = change {
            self.emit_status(id, status, last_error);
        }
    }

    fn mark_running(&self, id: &str, generation: u64) {
        self.update_record(id, generation, |rec| {
            if rec.status == ProcessStatus::Starting {
                rec.status = ProcessStatus::Running;
            }
        });
    }

    fn push_log(&self, entry: LogEntry) {
        lock(&self.logs).push(entry.clone());
        let _ = self.events.send(SupervisorEvent::Log(entry));
    }
}

// ---------------------------------------------------------------------------
// Per-service task
// ---------------------------------------------------------------------------

enum RunOutcome {
    Cancelled,
    Exited(Result<ExitStatus, String>),
    SpawnFailed { first: bool, message: String },
}

fn describe_exit(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exited with code {}", code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("terminated by signal {}", signal);
        }
    }
    "terminated".to_string()
}

async fn run_service(
    inner: Arc<Inner>,
    def: ServiceDefinition,
    generation: u64,
    cancel: CancellationToken,
    spawn_tx: oneshot::Sender<Result<u32, SupervisorError>>,
) {
    let mut spawn_tx = Some(spawn_tx);
    let mut restarts: u32 = 0;

    loop {
        let outcome = run_once(&inner, &def, generation, &cancel, restarts, &mut spawn_tx).await;

        let error = match outcome {
            RunOutcome::Cancelled => {
                inner.update_record(&def.id, generation, |rec| {
                    rec.status = ProcessStatus::Stopped;
                    rec.pid = None;
                });
                return;
            }
            RunOutcome::SpawnFailed { first: true, .. } => return,
            RunOutcome::SpawnFailed { first: false, message } => message,
            RunOutcome::Exited(Err(message)) => message,
            RunOutcome::Exited(Ok(status)) => {
                if inner.shutting_down() || status.code() == Some(0) {
                    info!(service = %def.id, status = %status, "process exited");
                    inner.update_record(&def.id, generation, |rec| {
                        rec.status = ProcessStatus::Stopped;
                        rec.pid = None;
                    });
                    return;
                }
                describe_exit(&status)
            }
        };

        warn!(service = %def.id, error = %error, restart_count = restarts, "process crashed");
        inner.update_record(&def.id, generation, |rec| {
            rec.status = ProcessStatus::Crashed;
            rec.pid = None;
            rec.last_error = Some(error.clone());
        });

        if restarts >= inner.policy.max_restarts {
            error!(
                service = %def.id,
                max_restarts = inner.policy.max_restarts,
                "reached maximum restart count, giving up",
            );
            return;
        }

        if !def.wait_for_ports.is_empty() {
            let wait = async {
                for port in &def.wait_for_ports {
                    let up = crate::health::probe::wait_for_port(
                        inner.prober.as_ref(),
                        "127.0.0.1",
                        *port,
                        inner.settings.restart_port_wait,
                        Duration::from_secs(1),
                    )
                    .await;
                    if !up {
                        warn!(service = %def.id, port, "dependency port still down, restarting anyway");
                    }
                }
            };
            tokio::select! {
                _ = wait => {}
                _ = cancel.cancelled() => {
                    inner.update_record(&def.id, generation, |rec| rec.status = ProcessStatus::Stopped);
                    return;
                }
            }
        }

        restarts += 1;
        let delay = inner.policy.delay_for(restarts);
        info!(
            service = %def.id,
            delay_ms = delay.as_millis() as u64,
            attempt = restarts,
            "restarting after backoff",
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => {
                inner.update_record(&def.id, generation, |rec| rec.status = ProcessStatus::Stopped);
                return;
            }
        }
    }
}

fn spawn_child(inner: &Inner, def: &ServiceDefinition) -> std::io::Result<Child> {
    let mut cmd = Command::new(&def.command);
    cmd.args(&def.args)
        .current_dir(&def.cwd)
        .env_clear()
        .envs(&inner.env)
        .envs(&def.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    platform::configure_process_group(&mut cmd);
    cmd.spawn()
}

async fn run_once(
    inner: &Arc<Inner>,
    def: &ServiceDefinition,
    generation: u64,
    cancel: &CancellationToken,
    restarts: u32,
    spawn_tx: &mut Option<oneshot::Sender<Result<u32, SupervisorError>>>,
) -> RunOutcome {
    info!(service = %def.id, attempt = restarts + 1, command = %def.command, "spawning");

    let mut child = match spawn_child(inner, def) {
        Ok(child) => child,
        Err(source) => {
            let message = format!("failed to spawn `{}`: {}", def.command, source);
            error!(service = %def.id, error = %message);
            inner.put_record(
                generation,
                ProcessRecord {
                    service_id: def.id.clone(),
                    pid: None,
                    status: ProcessStatus::Crashed,
                    restart_count: restarts,
                    last_error: Some(message.clone()),
                },
            );
            let first = match spawn_tx.take() {
                Some(tx) => {
                    let _ = tx.send(Err(SupervisorError::Spawn {
                        id: def.id.clone(),
                        source,
                    }));
                    true
                }
                None => false,
            };
            return RunOutcome::SpawnFailed { first, message };
        }
    };

    let pid = child.id();
    let group = platform::post_spawn_setup(pid);
    debug!(service = %def.id, pid = ?pid, "child spawned");

    inner.put_record(
        generation,
        ProcessRecord {
            service_id: def.id.clone(),
            pid,
            status: ProcessStatus::Starting,
            restart_count: restarts,
            last_error: None,
        },
    );
    if let Some(pid) = pid {
        let _ = inner.events.send(SupervisorEvent::Spawned {
            service_id: def.id.clone(),
            pid,
        });
    }
    if let Some(tx) = spawn_tx.take() {
        let _ = tx.send(Ok(pid.unwrap_or_default()));
    }

    let health_gated = def.readiness == Readiness::Health
        && (def.health_url.is_some() || def.health_port.is_some());

    let mut pumps = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        pumps.push(tokio::spawn(pump(
            Arc::clone(inner),
            def.id.clone(),
            generation,
            LogStream::Stdout,
            stdout,
            !health_gated,
        )));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(tokio::spawn(pump(
            Arc::clone(inner),
            def.id.clone(),
            generation,
            LogStream::Stderr,
            stderr,
            !health_gated,
        )));
    }
    let readiness = health_gated.then(|| tokio::spawn(await_health(Arc::clone(inner), def.clone(), generation)));

    let outcome = tokio::select! {
        result = child.wait() => RunOutcome::Exited(result.map_err(|e| format!("wait failed: {}", e))),
        _ = cancel.cancelled() => {
            info!(service = %def.id, "stopping");
            let how = platform::terminate_group(
                &mut child,
                pid,
                group.as_ref(),
                inner.settings.stop_grace,
            )
            .await;
            debug!(service = %def.id, outcome = ?how, "process group terminated");
            RunOutcome::Cancelled
        }
    };

    if let Some(task) = readiness {
        task.abort();
    }
    for mut pump in pumps {
        // Grandchildren can keep the pipe open after the leader exits.
        if tokio::time::timeout(Duration::from_secs(2), &mut pump).await.is_err() {
            pump.abort();
        }
    }
    outcome
}

/// Unterminated output is flushed as a log entry once it reaches this size.
const MAX_LINE_BYTES: usize = 16 * 1024;

async fn pump<R>(
    inner: Arc<Inner>,
    id: String,
    generation: u64,
    stream: LogStream,
    reader: R,
    marks_ready: bool,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    let mut seen_output = false;
    loop {
        let chunk = match reader.fill_buf().await {
            Ok(chunk) if chunk.is_empty() => break,
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(service = %id, error = %e, "output read error");
                break;
            }
        };
        // Any chunk counts, a banner without a newline included.
        if !seen_output {
            seen_output = true;
            if marks_ready {
                inner.mark_running(&id, generation);
            }
        }

        let consumed = chunk.len();
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            line.extend_from_slice(&rest[..pos]);
            flush_line(&inner, &id, stream, &mut line);
            rest = &rest[pos + 1..];
        }
        line.extend_from_slice(rest);
        if line.len() >= MAX_LINE_BYTES {
            flush_line(&inner, &id, stream, &mut line);
        }
        reader.consume(consumed);
    }
    if !line.is_empty() {
        flush_line(&inner, &id, stream, &mut line);
    }
}

fn flush_line(inner: &Inner, id: &str, stream: LogStream, line: &mut Vec<u8>) {
    let text = String::from_utf8_lossy(line).trim_end_matches('\r').to_string();
    inner.push_log(LogEntry::new(id, stream, text));
    line.clear();
}

async fn await_health(inner: Arc<Inner>, def: ServiceDefinition, generation: u64) {
    loop {
        let result = match (&def.health_url, def.health_port) {
            (Some(url), _) => inner.prober.http(url).await,
            (None, Some(port)) => inner.prober.tcp("127.0.0.1", port).await,
            (None, None) => Ok(()),
        };
        if result.is_ok() {
            inner.mark_running(&def.id, generation);
            return;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::probe::ProbeResult;
    use crate::platform::test_commands;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::AtomicBool;
    use std::time::Instant;

    struct NoopReclaimer;

    #[async_trait]
    impl PortReclaimer for NoopReclaimer {
        async fn reclaim(&self, _ports: &[u16]) -> Vec<ReclaimedPort> {
            Vec::new()
        }
    }

    /// Reports every requested port as reclaimed from a fake PID.
    struct RecordingReclaimer {
        seen: Mutex<Vec<u16>>,
    }

    #[async_trait]
    impl PortReclaimer for RecordingReclaimer {
        async fn reclaim(&self, ports: &[u16]) -> Vec<ReclaimedPort> {
            self.seen.lock().unwrap().extend_from_slice(ports);
            ports
                .iter()
                .map(|port| ReclaimedPort {
                    port: *port,
                    pid: 4242,
                    owner: None,
                    forced: false,
                })
                .collect()
        }
    }

    struct DownProber;

    #[async_trait]
    impl Prober for DownProber {
        async fn tcp(&self, _host: &str, _port: u16) -> ProbeResult {
            Err("refused".into())
        }
        async fn http(&self, _url: &str) -> ProbeResult {
            Err("refused".into())
        }
    }

    /// Down until the test flips it.
    #[derive(Default)]
    struct SwitchProber {
        up: AtomicBool,
        calls: AtomicUsize,
    }

    impl SwitchProber {
        fn probe(&self) -> ProbeResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.up.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err("refused".into())
            }
        }
    }

    #[async_trait]
    impl Prober for SwitchProber {
        async fn tcp(&self, _host: &str, _port: u16) -> ProbeResult {
            self.probe()
        }
        async fn http(&self, _url: &str) -> ProbeResult {
            self.probe()
        }
    }

    fn spawn_count(events: &mut broadcast::Receiver<SupervisorEvent>) -> usize {
        std::iter::from_fn(|| events.try_recv().ok())
            .filter(|e| matches!(e, SupervisorEvent::Spawned { .. }))
            .count()
    }

    fn service(id: &str, (program, args): (String, Vec<String>), cwd: &Path, order: i32) -> ServiceDefinition {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        ServiceDefinition::new(id, &program, &args, cwd, order)
    }

    fn settings() -> SupervisorConfig {
        SupervisorConfig {
            max_restarts: 0,
            initial_delay: Duration::from_millis(50),
            stop_grace: Duration::from_secs(5),
            settle_delay: Duration::from_millis(10),
            ..SupervisorConfig::default()
        }
    }

    fn supervisor(services: Vec<ServiceDefinition>, settings: SupervisorConfig) -> ProcessSupervisor {
        ProcessSupervisor::builder(services, settings)
            .reclaimer(Arc::new(NoopReclaimer))
            .prober(Arc::new(DownProber))
            .build()
    }

    async fn wait_for_status(sup: &ProcessSupervisor, id: &str, want: ProcessStatus) -> ProcessRecord {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(rec) = sup.get_status(id) {
                if rec.status == want {
                    return rec;
                }
            }
            assert!(Instant::now() < deadline, "timed out waiting for {} to be {}", id, want);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[test]
    fn backoff_doubles_from_initial_delay() {
        let policy = RestartPolicy {
            max_restarts: 5,
            initial_delay: Duration::from_secs(1),
        };
        let delays: Vec<_> = (1..=5).map(|n| policy.delay_for(n)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(16),
            ]
        );
        assert!(policy.delay_for(100) >= policy.delay_for(99));
    }

    #[tokio::test]
    async fn first_output_line_marks_running() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(vec![service("api", test_commands::sleep_long(), dir.path(), 0)], settings());

        let pid = sup.start("api").await.unwrap();
        assert!(pid > 0);
        let rec = wait_for_status(&sup, "api", ProcessStatus::Running).await;
        assert_eq!(rec.pid, Some(pid));
        assert!(sup.get_logs(Some("api"), 10).iter().any(|e| e.message == "started"));

        sup.stop("api").await;
        assert!(sup.get_status("api").is_none());
        assert_eq!(sup.get_all_status()[0].status, ProcessStatus::Stopped);
        assert!(!platform::is_process_alive(pid));
    }

    #[tokio::test]
    async fn silent_process_stays_starting() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(vec![service("db", test_commands::silent_sleep(), dir.path(), 0)], settings());
        sup.start("db").await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(sup.get_status("db").unwrap().status, ProcessStatus::Starting);
        sup.stop_all().await;
    }

    #[tokio::test]
    async fn starting_twice_keeps_a_single_record() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(vec![service("api", test_commands::sleep_long(), dir.path(), 0)], settings());

        let first = sup.start("api").await.unwrap();
        let second = sup.start("api").await.unwrap();
        assert_ne!(first, second);
        assert!(!platform::is_process_alive(first));

        let rows: Vec<_> = sup
            .get_all_status()
            .into_iter()
            .filter(|r| r.service_id == "api")
            .collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].pid, Some(second));
        sup.stop_all().await;
    }

    #[tokio::test]
    async fn crash_loop_gives_up_after_max_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = SupervisorConfig {
            max_restarts: 2,
            ..settings()
        };
        let sup = supervisor(vec![service("worker", test_commands::exit_failure(), dir.path(), 0)], cfg);
        let mut events = sup.subscribe();

        sup.start("worker").await.unwrap();
        let rec = {
            let deadline = Instant::now() + Duration::from_secs(10);
            loop {
                let rec = sup.get_status("worker").unwrap();
                if rec.status == ProcessStatus::Crashed && rec.restart_count == 2 {
                    break rec;
                }
                assert!(Instant::now() < deadline, "crash loop did not settle: {:?}", rec);
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        assert_eq!(rec.last_error.as_deref(), Some("exited with code 3"));

        // Let a would-be fourth spawn happen if the limit were broken.
        tokio::time::sleep(Duration::from_millis(400)).await;
        let mut spawns = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SupervisorEvent::Spawned { .. }) {
                spawns += 1;
            }
        }
        assert_eq!(spawns, 3);

        // A manual restart resets the counter.
        sup.restart_service("worker").await.unwrap();
        assert_eq!(sup.get_status("worker").unwrap().restart_count, 0);
        sup.stop_all().await;
    }

    #[tokio::test]
    async fn clean_exit_is_stopped_not_crashed() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = SupervisorConfig {
            max_restarts: 3,
            ..settings()
        };
        let sup = supervisor(vec![service("job", test_commands::exit_success(), dir.path(), 0)], cfg);
        sup.start("job").await.unwrap();
        let rec = wait_for_status(&sup, "job", ProcessStatus::Stopped).await;
        assert_eq!(rec.restart_count, 0);
        assert!(rec.last_error.is_none());
    }

    #[tokio::test]
    async fn start_all_spawns_in_ascending_order() {
        let dir = tempfile::tempdir().unwrap();
        let services = (0..5)
            .rev()
            .map(|i| service(&format!("svc{}", i), test_commands::sleep_long(), dir.path(), i * 10))
            .collect();
        let sup = supervisor(services, settings());
        let mut events = sup.subscribe();

        let report = sup.start_all(&HashSet::new()).await.unwrap();
        assert_eq!(report.started, vec!["svc0", "svc1", "svc2", "svc3", "svc4"]);

        let mut order = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SupervisorEvent::Spawned { service_id, .. } = event {
                order.push(service_id);
            }
        }
        assert_eq!(order, vec!["svc0", "svc1", "svc2", "svc3", "svc4"]);
        sup.stop_all().await;
    }

    #[tokio::test]
    async fn start_all_waits_settle_delay_between_spawns() {
        let dir = tempfile::tempdir().unwrap();
        let services = vec![
            service("a", test_commands::sleep_long(), dir.path(), 1),
            service("b", test_commands::sleep_long(), dir.path(), 2),
            service("c", test_commands::sleep_long(), dir.path(), 3),
        ];
        let settle = Duration::from_millis(200);
        let sup = supervisor(
            services,
            SupervisorConfig {
                settle_delay: settle,
                ..settings()
            },
        );
        let mut events = sup.subscribe();
        let times = tokio::spawn(async move {
            let mut times = Vec::new();
            while let Ok(event) = events.recv().await {
                if let SupervisorEvent::Spawned { .. } = event {
                    times.push(Instant::now());
                    if times.len() == 3 {
                        break;
                    }
                }
            }
            times
        });

        sup.start_all(&HashSet::new()).await.unwrap();
        let times = times.await.unwrap();
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= settle, "spawns too close: {:?}", pair[1] - pair[0]);
        }
        sup.stop_all().await;
    }

    #[tokio::test]
    async fn reclaims_ports_before_first_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let mut api = service("api", test_commands::sleep_long(), dir.path(), 0);
        api.health_port = Some(3999);
        let reclaimer = Arc::new(RecordingReclaimer {
            seen: Mutex::new(Vec::new()),
        });
        let cfg = SupervisorConfig {
            reclaim_port_range: Some(crate::config::model::PortRange { start: 9100, end: 9101 }),
            ..settings()
        };
        let sup = ProcessSupervisor::builder(vec![api], cfg)
            .reclaimer(reclaimer.clone())
            .prober(Arc::new(DownProber))
            .build();
        let mut events = sup.subscribe();

        sup.start_all(&HashSet::new()).await.unwrap();
        assert_eq!(*reclaimer.seen.lock().unwrap(), vec![3999, 9100, 9101]);

        let mut journal = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event {
                SupervisorEvent::Reclaimed(r) => journal.push(format!("reclaim {}", r.port)),
                SupervisorEvent::Spawned { service_id, .. } => journal.push(format!("spawn {}", service_id)),
                _ => {}
            }
        }
        assert_eq!(journal, vec!["reclaim 3999", "reclaim 9100", "reclaim 9101", "spawn api"]);
        sup.stop_all().await;
    }

    #[tokio::test]
    async fn start_all_skips_requested_and_missing_optional() {
        let dir = tempfile::tempdir().unwrap();
        let mut optional = service("search", test_commands::sleep_long(), &dir.path().join("missing"), 2);
        optional.optional = true;
        let services = vec![
            service("api", test_commands::sleep_long(), dir.path(), 0),
            service("worker", test_commands::sleep_long(), dir.path(), 1),
            optional,
        ];
        let sup = supervisor(services, settings());

        let skip: HashSet<String> = ["worker".to_string()].into_iter().collect();
        let report = sup.start_all(&skip).await.unwrap();
        assert_eq!(report.started, vec!["api"]);
        assert_eq!(report.skipped, vec!["worker", "search"]);
        sup.stop_all().await;
    }

    #[tokio::test]
    async fn spawn_failure_is_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let services = vec![
            ServiceDefinition::new("broken", "definitely-not-a-real-binary-xyz", &[], dir.path(), 0),
            service("api", test_commands::sleep_long(), dir.path(), 1),
        ];
        let sup = supervisor(services, settings());
        let report = sup.start_all(&HashSet::new()).await.unwrap();
        assert_eq!(report.started, vec!["api"]);
        assert_eq!(report.failed.len(), 1);
        let broken = sup.get_status("broken").unwrap();
        assert_eq!(broken.status, ProcessStatus::Crashed);
        assert!(broken.last_error.is_some());
        sup.stop_all().await;
    }

    #[tokio::test]
    async fn stop_all_aborts_in_flight_start_all() {
        let dir = tempfile::tempdir().unwrap();
        let services = (0..3)
            .map(|i| service(&format!("s{}", i), test_commands::sleep_long(), dir.path(), i))
            .collect();
        let sup = supervisor(
            services,
            SupervisorConfig {
                settle_delay: Duration::from_millis(500),
                ..settings()
            },
        );

        let runner = sup.clone();
        let start = tokio::spawn(async move { runner.start_all(&HashSet::new()).await });
        tokio::time::sleep(Duration::from_millis(150)).await;
        sup.stop_all().await;
        sup.stop_all().await;

        let result = start.await.unwrap();
        assert!(matches!(result, Err(SupervisorError::Aborted)));
        assert!(sup
            .get_all_status()
            .iter()
            .all(|r| r.status == ProcessStatus::Stopped));
    }

    #[tokio::test]
    async fn unknown_service_suggests_name() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(vec![service("worker", test_commands::sleep_long(), dir.path(), 0)], settings());
        let err = sup.start("wroker").await.unwrap_err();
        assert!(err.to_string().contains("did you mean `worker`"), "got: {}", err);
    }

    #[tokio::test]
    async fn unterminated_output_marks_running() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(
            vec![service("api", test_commands::prompt_without_newline(), dir.path(), 0)],
            settings(),
        );
        sup.start("api").await.unwrap();
        wait_for_status(&sup, "api", ProcessStatus::Running).await;

        // The partial line is logged once the process goes away.
        sup.stop("api").await;
        assert!(sup
            .get_logs(Some("api"), 10)
            .iter()
            .any(|e| e.message.contains("listening on 3000")));
    }

    #[tokio::test]
    async fn restart_waits_for_dependency_ports() {
        let dir = tempfile::tempdir().unwrap();
        let mut worker = service("worker", test_commands::exit_failure(), dir.path(), 0);
        worker.wait_for_ports = vec![5432];
        let prober = Arc::new(SwitchProber::default());
        let sup = ProcessSupervisor::builder(
            vec![worker],
            SupervisorConfig {
                max_restarts: 1,
                restart_port_wait: Duration::from_secs(30),
                ..settings()
            },
        )
        .reclaimer(Arc::new(NoopReclaimer))
        .prober(prober.clone())
        .build();
        let mut events = sup.subscribe();

        sup.start("worker").await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while prober.calls.load(Ordering::SeqCst) < 2 {
            assert!(Instant::now() < deadline, "restart gate never polled the port");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let rec = sup.get_status("worker").unwrap();
        assert_eq!(rec.status, ProcessStatus::Crashed);
        assert_eq!(rec.restart_count, 0);
        assert_eq!(spawn_count(&mut events), 1);

        prober.up.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let rec = sup.get_status("worker").unwrap();
            if rec.status == ProcessStatus::Crashed && rec.restart_count == 1 {
                break;
            }
            assert!(Instant::now() < deadline, "no restart after the port came up: {:?}", rec);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(spawn_count(&mut events), 1);
        sup.stop_all().await;
    }

    #[tokio::test]
    async fn health_readiness_ignores_output_until_probe_passes() {
        let dir = tempfile::tempdir().unwrap();
        let mut api = service("api", test_commands::chatty(), dir.path(), 0);
        api.readiness = Readiness::Health;
        api.health_port = Some(4000);
        let prober = Arc::new(SwitchProber::default());
        let sup = ProcessSupervisor::builder(vec![api], settings())
            .reclaimer(Arc::new(NoopReclaimer))
            .prober(prober.clone())
            .build();

        sup.start("api").await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while sup.get_logs(Some("api"), 10).len() < 3 {
            assert!(Instant::now() < deadline, "no output from chatty service");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(sup.get_status("api").unwrap().status, ProcessStatus::Starting);

        prober.up.store(true, Ordering::SeqCst);
        wait_for_status(&sup, "api", ProcessStatus::Running).await;
        sup.stop_all().await;
    }
}
