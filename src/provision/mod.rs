//! The install and quick-start workflows.
//!
//! Each workflow is a fixed list of steps. Every step reports progress on a
//! broadcast channel and finishes with exactly one terminal status. A fatal
//! step ends the run; the other steps degrade, usually by dropping the
//! optional component for the rest of the run.

pub mod credentials;
pub mod progress;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{ConstantBuilder, Retryable};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::compose::ContainerOrchestrator;
use crate::config::model::{
    CommandConfig, ComposeConfig, InfraDefinition, OptionalComponentConfig, ProvisionConfig,
    ServiceDefinition, ToolConfig,
};
use crate::config::LoadedConfig;
use crate::exec::{CommandRunner, CommandSpec};
use crate::health::probe::{wait_for_port, Prober};
use crate::orchestrator::supervisor::{ProcessSupervisor, StartAllReport, SupervisorError};

use credentials::{cli_tool_message, CredentialStatus};
use progress::{ProvisioningStep, StepHandle};

const TOOL_CHECK_TIMEOUT: Duration = Duration::from_secs(30);
const PORT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Starts the application services once infrastructure is up.
#[async_trait]
pub trait ServiceLauncher: Send + Sync {
    async fn launch(&self, skip: &HashSet<String>) -> Result<StartAllReport, SupervisorError>;
}

#[async_trait]
impl ServiceLauncher for ProcessSupervisor {
    async fn launch(&self, skip: &HashSet<String>) -> Result<StartAllReport, SupervisorError> {
        self.start_all(skip).await
    }
}

#[derive(Debug, Error)]
#[error("{label}: {message}")]
pub struct StepError {
    pub label: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProvisionOptions {
    pub skip_optional_component: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProvisionOutcome {
    pub success: bool,
    pub error: Option<String>,
}

impl ProvisionOutcome {
    fn succeeded() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Everything the workflows need from the configuration.
#[derive(Debug, Clone)]
pub struct ProvisionPlan {
    pub root: PathBuf,
    pub settings: ProvisionConfig,
    pub compose: Option<ComposeConfig>,
    pub services: Vec<ServiceDefinition>,
    pub infra: Vec<InfraDefinition>,
}

impl ProvisionPlan {
    pub fn from_config(loaded: &LoadedConfig) -> Self {
        Self {
            root: loaded.root.clone(),
            settings: loaded.config.provision.clone(),
            compose: loaded.config.compose.clone(),
            services: loaded.services(),
            infra: loaded.infra(),
        }
    }

    fn component(&self) -> Option<&OptionalComponentConfig> {
        self.settings.optional_component.as_ref()
    }

    fn component_dir(&self) -> Option<PathBuf> {
        self.component()
            .map(|c| self.root.join(crate::platform::expand_home(&c.dir)))
    }

    fn component_services(&self) -> HashSet<String> {
        self.component()
            .map(|c| c.services.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn component_infra(&self) -> Vec<&InfraDefinition> {
        let Some(component) = self.component() else {
            return Vec::new();
        };
        self.infra
            .iter()
            .filter(|i| component.infra.contains(&i.id))
            .collect()
    }

    fn primary_datastore(&self) -> Option<&InfraDefinition> {
        let id = self.settings.primary_datastore.as_ref()?;
        self.infra.iter().find(|i| &i.id == id)
    }

    fn command_spec(&self, cmd: &CommandConfig) -> CommandSpec {
        let cwd = match &cmd.cwd {
            Some(dir) => self.root.join(crate::platform::expand_home(dir)),
            None => self.root.clone(),
        };
        CommandSpec::new(cmd.command.clone())
            .args(cmd.args.iter().cloned())
            .cwd(cwd)
            .timeout(self.settings.command_timeout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    PackageManager,
    CliTool,
    Dependencies,
    Daemon,
    CloneComponent,
    Containers,
    PrimaryDatastore,
    SchemaCreate,
    SchemaSync,
    ComponentDependencies,
    Frontend,
    OptionalInfra,
    StartServices,
}

impl Step {
    fn label(self) -> &'static str {
        match self {
            Step::PackageManager => "Package manager",
            Step::CliTool => "CLI tool",
            Step::Dependencies => "Runtime dependencies",
            Step::Daemon => "Container daemon",
            Step::CloneComponent => "Optional component",
            Step::Containers => "Containers",
            Step::PrimaryDatastore => "Primary datastore",
            Step::SchemaCreate => "Schema creation",
            Step::SchemaSync => "Schema sync",
            Step::ComponentDependencies => "Optional component dependencies",
            Step::Frontend => "Frontend build",
            Step::OptionalInfra => "Optional infrastructure",
            Step::StartServices => "Start services",
        }
    }
}

const INSTALL_STEPS: [Step; 13] = [
    Step::PackageManager,
    Step::CliTool,
    Step::Dependencies,
    Step::Daemon,
    Step::CloneComponent,
    Step::Containers,
    Step::PrimaryDatastore,
    Step::SchemaCreate,
    Step::SchemaSync,
    Step::ComponentDependencies,
    Step::Frontend,
    Step::OptionalInfra,
    Step::StartServices,
];

const QUICK_START_STEPS: [Step; 5] = [
    Step::Daemon,
    Step::Containers,
    Step::PrimaryDatastore,
    Step::OptionalInfra,
    Step::StartServices,
];

/// Per-run state shared between steps.
struct RunState {
    skip_component: bool,
}

impl RunState {
    fn degrade(&mut self, reason: &str) {
        if !self.skip_component {
            warn!(reason = %reason, "continuing without the optional component");
        }
        self.skip_component = true;
    }
}

type StepResult = Result<(), StepError>;

fn fatal(step: StepHandle, message: impl Into<String>) -> StepResult {
    let message = message.into();
    let label = step.label();
    step.error(message.clone());
    Err(StepError { label, message })
}

pub struct Provisioner {
    plan: ProvisionPlan,
    runner: Arc<dyn CommandRunner>,
    compose: Arc<ContainerOrchestrator>,
    launcher: Arc<dyn ServiceLauncher>,
    prober: Arc<dyn Prober>,
    credentials: Arc<dyn CredentialStatus>,
    progress: broadcast::Sender<ProvisioningStep>,
    cancel: CancellationToken,
}

impl Provisioner {
    pub fn new(
        plan: ProvisionPlan,
        runner: Arc<dyn CommandRunner>,
        compose: Arc<ContainerOrchestrator>,
        launcher: Arc<dyn ServiceLauncher>,
        prober: Arc<dyn Prober>,
        credentials: Arc<dyn CredentialStatus>,
    ) -> Self {
        let (progress, _) = broadcast::channel(256);
        Self {
            plan,
            runner,
            compose,
            launcher,
            prober,
            credentials,
            progress,
            cancel: CancellationToken::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProvisioningStep> {
        self.progress.subscribe()
    }

    /// Abandon the running workflow at its current step. Nothing is
    /// launched afterwards.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// First-run workflow: tools, dependencies, infrastructure, schema,
    /// frontend, then services.
    pub async fn install(self: &Arc<Self>, options: ProvisionOptions) -> ProvisionOutcome {
        self.spawn_run(&INSTALL_STEPS, options, false).await
    }

    /// Later runs: infrastructure, then services.
    pub async fn quick_start(self: &Arc<Self>, options: ProvisionOptions) -> ProvisionOutcome {
        self.spawn_run(&QUICK_START_STEPS, options, true).await
    }

    async fn spawn_run(
        self: &Arc<Self>,
        steps: &'static [Step],
        options: ProvisionOptions,
        quick: bool,
    ) -> ProvisionOutcome {
        let this = Arc::clone(self);
        match tokio::spawn(async move { this.run(steps, options, quick).await }).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "provisioning task failed");
                ProvisionOutcome::failed(format!("provisioning task failed: {}", e))
            }
        }
    }

    async fn run(&self, steps: &[Step], options: ProvisionOptions, quick: bool) -> ProvisionOutcome {
        let mut state = RunState {
            skip_component: options.skip_optional_component || self.plan.component().is_none(),
        };
        // Quick start never clones, so a missing checkout means no component.
        if quick && !state.skip_component && !self.plan.component_dir().is_some_and(|d| d.is_dir()) {
            state.degrade("optional component is not checked out");
        }

        for (i, step) in steps.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return ProvisionOutcome::failed("provisioning cancelled");
            }
            let handle = StepHandle::begin(self.progress.clone(), i + 1, steps.len(), step.label());
            let result = tokio::select! {
                result = self.run_step(*step, handle, &mut state) => result,
                _ = self.cancel.cancelled() => {
                    warn!(step = step.label(), "provisioning cancelled");
                    return ProvisionOutcome::failed("provisioning cancelled");
                }
            };
            if let Err(e) = result {
                error!(error = %e, "provisioning stopped");
                return ProvisionOutcome::failed(e.to_string());
            }
        }
        info!("provisioning complete");
        ProvisionOutcome::succeeded()
    }

    async fn run_step(&self, step: Step, handle: StepHandle, state: &mut RunState) -> StepResult {
        match step {
            Step::PackageManager => self.package_manager(handle).await,
            Step::CliTool => self.cli_tool(handle).await,
            Step::Dependencies => self.dependencies(handle).await,
            Step::Daemon => self.daemon(handle).await,
            Step::CloneComponent => self.clone_component(handle, state).await,
            Step::Containers => self.containers(handle, state).await,
            Step::PrimaryDatastore => self.primary_datastore(handle).await,
            Step::SchemaCreate => self.schema_create(handle).await,
            Step::SchemaSync => self.schema_sync(handle).await,
            Step::ComponentDependencies => self.component_dependencies(handle, state).await,
            Step::Frontend => self.frontend(handle).await,
            Step::OptionalInfra => self.optional_infra(handle, state).await,
            Step::StartServices => self.start_services(handle, state).await,
        }
    }

    // -- tools ---------------------------------------------------------------

    async fn tool_present(&self, tool: &ToolConfig) -> bool {
        let Some(spec) = CommandSpec::from_argv(&tool.check) else {
            return false;
        };
        matches!(
            self.runner.run(&spec.timeout(TOOL_CHECK_TIMEOUT)).await,
            Ok(out) if out.success
        )
    }

    async fn ensure_tool(&self, tool: &ToolConfig, step: &StepHandle) -> Result<(), String> {
        if self.tool_present(tool).await {
            return Ok(());
        }
        let Some(install) = CommandSpec::from_argv(&tool.install) else {
            return Err(format!("{} is not installed", tool.name));
        };
        step.running(format!("installing {}", tool.name));
        let spec = install
            .cwd(&self.plan.root)
            .timeout(self.plan.settings.command_timeout);
        let out = self.runner.run(&spec).await.map_err(|e| e.to_string())?;
        if !out.success {
            return Err(format!("installing {} failed: {}", tool.name, out.error_summary()));
        }
        if self.tool_present(tool).await {
            Ok(())
        } else {
            Err(format!("{} is still missing after install", tool.name))
        }
    }

    async fn package_manager(&self, step: StepHandle) -> StepResult {
        let Some(tool) = &self.plan.settings.package_manager else {
            step.skipped("not configured");
            return Ok(());
        };
        match self.ensure_tool(tool, &step).await {
            Ok(()) => {
                step.done(Some(format!("{} available", tool.name)));
                Ok(())
            }
            Err(message) => fatal(step, message),
        }
    }

    async fn cli_tool(&self, step: StepHandle) -> StepResult {
        let Some(tool) = &self.plan.settings.cli_tool else {
            step.skipped("not configured");
            return Ok(());
        };
        let installed = match self.ensure_tool(tool, &step).await {
            Ok(()) => true,
            Err(message) => {
                warn!(tool = %tool.name, error = %message, "CLI tool unavailable");
                false
            }
        };
        let message = cli_tool_message(&tool.name, installed, self.credentials.as_ref());
        if installed {
            step.done(Some(message));
        } else {
            step.skipped(message);
        }
        Ok(())
    }

    async fn dependencies(&self, step: StepHandle) -> StepResult {
        let Some(cmd) = &self.plan.settings.dependencies else {
            step.skipped("not configured");
            return Ok(());
        };
        let spec = self.plan.command_spec(cmd);
        let on_line = |line: &str| step.running(line.to_string());
        match self.runner.run_streaming(&spec, &on_line).await {
            Ok(out) if out.success => {
                step.done(None);
                Ok(())
            }
            Ok(out) => fatal(step, format!("`{}` failed: {}", spec.display(), out.error_summary())),
            Err(e) => fatal(step, e.to_string()),
        }
    }

    // -- infrastructure ------------------------------------------------------

    async fn daemon(&self, step: StepHandle) -> StepResult {
        if self.plan.compose.is_none() {
            step.skipped("no compose files configured");
            return Ok(());
        }
        if self.compose.is_daemon_running().await {
            step.done(Some("already running".into()));
            return Ok(());
        }
        step.running("starting container daemon");
        if self.compose.acquire_daemon().await {
            step.done(Some("started".into()));
            Ok(())
        } else {
            fatal(
                step,
                format!(
                    "could not start a container daemon; install it manually: {}",
                    self.compose.manual_install_url()
                ),
            )
        }
    }

    async fn clone_component(&self, step: StepHandle, state: &mut RunState) -> StepResult {
        let (Some(component), Some(dir)) = (self.plan.component(), self.plan.component_dir()) else {
            step.skipped("not configured");
            return Ok(());
        };
        if state.skip_component {
            step.skipped(format!("{} disabled", component.name));
            return Ok(());
        }
        if dir.is_dir() {
            step.done(Some(format!("{} already present", component.name)));
            return Ok(());
        }

        let spec = CommandSpec::new("git")
            .args(["clone", component.repo.as_str()])
            .arg(dir.to_string_lossy())
            .cwd(&self.plan.root)
            .timeout(self.plan.settings.command_timeout);
        let failure = match self.runner.run(&spec).await {
            Ok(out) if out.success => None,
            Ok(out) => Some(out.error_summary()),
            Err(e) => Some(e.to_string()),
        };
        match failure {
            None => step.done(Some(format!("cloned {}", component.name))),
            Some(message) => {
                state.degrade(&message);
                step.done(Some(format!("clone failed, skipping {}: {}", component.name, message)));
            }
        }
        Ok(())
    }

    async fn containers(&self, step: StepHandle, state: &mut RunState) -> StepResult {
        let Some(compose) = &self.plan.compose else {
            step.skipped("no compose files configured");
            return Ok(());
        };

        step.running(format!("starting {}", compose.required_file));
        if let Err(e) = self.compose.start_group(&compose.required_file).await {
            return fatal(step, e.to_string());
        }

        let mut note = None;
        if let Some(optional) = &compose.optional_file {
            if state.skip_component {
                note = Some(format!("{} not started", optional));
            } else {
                step.running(format!("starting {}", optional));
                if let Err(e) = self.compose.start_group(optional).await {
                    let message = e.to_string();
                    state.degrade(&message);
                    note = Some(format!("optional containers failed: {}", message));
                }
            }
        }
        step.done(note);
        Ok(())
    }

    async fn primary_datastore(&self, step: StepHandle) -> StepResult {
        let Some(store) = self.plan.primary_datastore() else {
            step.skipped("not configured");
            return Ok(());
        };
        step.running(format!("waiting for {} on port {}", store.label, store.port));
        let wait = self.plan.settings.datastore_wait;
        if wait_for_port(self.prober.as_ref(), &store.host, store.port, wait, PORT_POLL_INTERVAL).await {
            step.done(Some(format!("{} is accepting connections", store.label)));
            Ok(())
        } else {
            fatal(
                step,
                format!(
                    "{} did not open port {} within {}",
                    store.label,
                    store.port,
                    humantime::format_duration(wait)
                ),
            )
        }
    }

    async fn run_command(&self, spec: &CommandSpec) -> Result<(), String> {
        match self.runner.run(spec).await {
            Ok(out) if out.success => Ok(()),
            Ok(out) => Err(out.error_summary()),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn schema_create(&self, step: StepHandle) -> StepResult {
        let Some(cmd) = &self.plan.settings.schema_create else {
            step.skipped("not configured");
            return Ok(());
        };
        let spec = self.plan.command_spec(cmd);
        let attempts = self.plan.settings.schema_attempts.max(1);

        let result = (|| self.run_command(&spec))
            .retry(
                ConstantBuilder::default()
                    .with_delay(self.plan.settings.schema_retry_delay)
                    .with_max_times(attempts - 1),
            )
            .notify(|err: &String, dur: Duration| {
                warn!(error = %err, retry_in = ?dur, "schema creation failed, retrying");
                step.running(format!("retrying in {}: {}", humantime::format_duration(dur), err));
            })
            .await;

        match result {
            Ok(()) => {
                step.done(None);
                Ok(())
            }
            Err(message) => fatal(step, format!("failed after {} attempts: {}", attempts, message)),
        }
    }

    async fn schema_sync(&self, step: StepHandle) -> StepResult {
        let Some(cmd) = &self.plan.settings.schema_sync else {
            step.skipped("not configured");
            return Ok(());
        };
        match self.run_command(&self.plan.command_spec(cmd)).await {
            Ok(()) => step.done(None),
            Err(message) => step.error(message),
        }
        Ok(())
    }

    async fn component_dependencies(&self, step: StepHandle, state: &mut RunState) -> StepResult {
        let Some(component) = self.plan.component() else {
            step.skipped("not configured");
            return Ok(());
        };
        if state.skip_component {
            step.skipped(format!("{} disabled", component.name));
            return Ok(());
        }
        let Some(install) = &component.install else {
            step.skipped("nothing to install");
            return Ok(());
        };

        let mut spec = self.plan.command_spec(install);
        if install.cwd.is_none() {
            if let Some(dir) = self.plan.component_dir() {
                spec = spec.cwd(dir);
            }
        }
        match self.run_command(&spec).await {
            Ok(()) => step.done(None),
            Err(message) => {
                state.degrade(&message);
                step.skipped(format!("install failed, skipping {}: {}", component.name, message));
            }
        }
        Ok(())
    }

    async fn frontend(&self, step: StepHandle) -> StepResult {
        let Some(frontend) = &self.plan.settings.frontend else {
            step.skipped("not configured");
            return Ok(());
        };
        let artifact = self.plan.root.join(crate::platform::expand_home(&frontend.artifact));
        if artifact.exists() {
            step.skipped("already built");
            return Ok(());
        }
        match self.run_command(&self.plan.command_spec(&frontend.build)).await {
            Ok(()) => {
                step.done(None);
                Ok(())
            }
            Err(message) => fatal(step, message),
        }
    }

    async fn optional_infra(&self, step: StepHandle, state: &mut RunState) -> StepResult {
        if state.skip_component {
            step.skipped("optional component disabled");
            return Ok(());
        }
        let targets = self.plan.component_infra();
        if targets.is_empty() {
            step.skipped("nothing to wait for");
            return Ok(());
        }

        let names: Vec<&str> = targets.iter().map(|i| i.label.as_str()).collect();
        step.running(format!("waiting for {}", names.join(", ")));
        let wait = self.plan.settings.optional_infra_wait;
        let results = futures_util::future::join_all(targets.iter().map(|infra| {
            wait_for_port(self.prober.as_ref(), &infra.host, infra.port, wait, PORT_POLL_INTERVAL)
        }))
        .await;

        let down: Vec<&str> = targets
            .iter()
            .zip(results)
            .filter(|(_, up)| !up)
            .map(|(infra, _)| infra.label.as_str())
            .collect();
        if down.is_empty() {
            step.done(None);
        } else {
            let message = format!(
                "{} not reachable after {}, skipping optional component",
                down.join(", "),
                humantime::format_duration(wait)
            );
            state.degrade(&message);
            step.skipped(message);
        }
        Ok(())
    }

    async fn start_services(&self, step: StepHandle, state: &mut RunState) -> StepResult {
        let skip = if state.skip_component {
            self.plan.component_services()
        } else {
            HashSet::new()
        };

        let report = match self.launcher.launch(&skip).await {
            Ok(report) => report,
            Err(e) => return fatal(step, e.to_string()),
        };

        let required_failures: Vec<String> = report
            .failed
            .iter()
            .filter(|(id, _)| self.plan.services.iter().any(|s| &s.id == id && !s.optional))
            .map(|(id, err)| format!("{} ({})", id, err))
            .collect();
        if !required_failures.is_empty() {
            return fatal(step, format!("failed to start {}", required_failures.join(", ")));
        }

        step.done(Some(format!(
            "{} started, {} skipped",
            report.started.len(),
            report.skipped.len()
        )));
        Ok(())
    }
}
