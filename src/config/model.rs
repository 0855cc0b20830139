use serde::{de, Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub struct StackConfig {
    pub project: ProjectConfig,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
    #[serde(default)]
    pub infra: BTreeMap<String, InfraConfig>,
    #[serde(default)]
    pub compose: Option<ComposeConfig>,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub provision: ProvisionConfig,
    /// Key-value application settings layered over the process environment.
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
    #[serde(default)]
    pub credentials: CredentialsConfig,
}

#[derive(Debug, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    /// Project root, relative to the config file's directory.
    #[serde(default)]
    pub root: Option<String>,
}

// ---------------------------------------------------------------------------
// Human-readable durations ("500ms", "5s", "3m")
// ---------------------------------------------------------------------------

fn human_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw).map_err(de::Error::custom)
}

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Readiness {
    /// The first line of output marks the service as running.
    #[default]
    Output,
    /// The service stays `starting` until its health probe first succeeds.
    Health,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ServiceConfig {
    #[serde(default)]
    pub label: Option<String>,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub health_port: Option<u16>,
    #[serde(default)]
    pub health_url: Option<String>,
    #[serde(default)]
    pub start_order: i32,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Infrastructure ports that must be reachable before a crash restart.
    #[serde(default)]
    pub wait_for_ports: Vec<u16>,
    #[serde(default)]
    pub readiness: Readiness,
}

/// Immutable, resolved view of one supervised service.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceDefinition {
    pub id: String,
    pub label: String,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub health_port: Option<u16>,
    pub health_url: Option<String>,
    pub start_order: i32,
    pub optional: bool,
    pub env: BTreeMap<String, String>,
    pub wait_for_ports: Vec<u16>,
    pub readiness: Readiness,
}

impl ServiceDefinition {
    pub fn from_config(id: &str, cfg: &ServiceConfig, root: &Path) -> Self {
        let cwd = match &cfg.cwd {
            Some(dir) => root.join(crate::platform::expand_home(dir)),
            None => root.to_path_buf(),
        };
        Self {
            id: id.to_string(),
            label: cfg.label.clone().unwrap_or_else(|| id.to_string()),
            command: crate::platform::expand_home(&cfg.command),
            args: cfg.args.clone(),
            cwd,
            health_port: cfg.health_port,
            health_url: cfg.health_url.clone(),
            start_order: cfg.start_order,
            optional: cfg.optional,
            env: cfg.env.clone(),
            wait_for_ports: cfg.wait_for_ports.clone(),
            readiness: cfg.readiness,
        }
    }

    /// Minimal definition for tests and embedding: `command args...` in `cwd`.
    pub fn new(id: &str, command: &str, args: &[&str], cwd: &Path, start_order: i32) -> Self {
        Self {
            id: id.to_string(),
            label: id.to_string(),
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            cwd: cwd.to_path_buf(),
            health_port: None,
            health_url: None,
            start_order,
            optional: false,
            env: BTreeMap::new(),
            wait_for_ports: Vec::new(),
            readiness: Readiness::Output,
        }
    }
}

// ---------------------------------------------------------------------------
// Infrastructure dependencies
// ---------------------------------------------------------------------------

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct InfraConfig {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    #[serde(default = "default_true")]
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InfraDefinition {
    pub id: String,
    pub label: String,
    pub host: String,
    pub port: u16,
    pub required: bool,
}

impl InfraDefinition {
    pub fn from_config(id: &str, cfg: &InfraConfig) -> Self {
        Self {
            id: id.to_string(),
            label: cfg.label.clone().unwrap_or_else(|| id.to_string()),
            host: cfg.host.clone(),
            port: cfg.port,
            required: cfg.required,
        }
    }
}

// ---------------------------------------------------------------------------
// Compose
// ---------------------------------------------------------------------------

fn default_compose_timeout() -> Duration {
    Duration::from_secs(300)
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ComposeConfig {
    /// Group that the stack cannot run without.
    pub required_file: String,
    /// Group backing the optional component.
    #[serde(default)]
    pub optional_file: Option<String>,
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default = "default_compose_timeout", deserialize_with = "human_duration")]
    pub timeout: Duration,
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

fn default_max_restarts() -> u32 {
    5
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_stop_grace() -> Duration {
    Duration::from_secs(5)
}

fn default_settle_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_log_capacity() -> usize {
    2000
}

fn default_restart_port_wait() -> Duration {
    Duration::from_secs(60)
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn ports(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SupervisorConfig {
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_initial_delay", deserialize_with = "human_duration")]
    pub initial_delay: Duration,
    #[serde(default = "default_stop_grace", deserialize_with = "human_duration")]
    pub stop_grace: Duration,
    #[serde(default = "default_settle_delay", deserialize_with = "human_duration")]
    pub settle_delay: Duration,
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
    #[serde(default = "default_restart_port_wait", deserialize_with = "human_duration")]
    pub restart_port_wait: Duration,
    /// Ports used by children the services spawn themselves.
    #[serde(default)]
    pub reclaim_port_range: Option<PortRange>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            initial_delay: default_initial_delay(),
            stop_grace: default_stop_grace(),
            settle_delay: default_settle_delay(),
            log_capacity: default_log_capacity(),
            restart_port_wait: default_restart_port_wait(),
            reclaim_port_range: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

fn default_health_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(2)
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct HealthConfig {
    #[serde(default = "default_health_interval", deserialize_with = "human_duration")]
    pub interval: Duration,
    #[serde(default = "default_probe_timeout", deserialize_with = "human_duration")]
    pub probe_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: default_health_interval(),
            probe_timeout: default_probe_timeout(),
        }
    }
}

// ---------------------------------------------------------------------------
// Provisioning
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ToolConfig {
    pub name: String,
    /// argv that succeeds when the tool is installed.
    pub check: Vec<String>,
    /// argv that installs the tool.
    #[serde(default)]
    pub install: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CommandConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct OptionalComponentConfig {
    pub name: String,
    pub repo: String,
    pub dir: String,
    #[serde(default)]
    pub install: Option<CommandConfig>,
    /// Service ids that belong to this component.
    #[serde(default)]
    pub services: Vec<String>,
    /// Infra ids this component needs before its services can start.
    #[serde(default)]
    pub infra: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct FrontendConfig {
    pub build: CommandConfig,
    /// Path whose presence means the build already ran.
    pub artifact: String,
}

fn default_datastore_wait() -> Duration {
    Duration::from_secs(60)
}

fn default_optional_infra_wait() -> Duration {
    Duration::from_secs(180)
}

fn default_schema_attempts() -> usize {
    5
}

fn default_schema_retry_delay() -> Duration {
    Duration::from_secs(3)
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(900)
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ProvisionConfig {
    #[serde(default)]
    pub package_manager: Option<ToolConfig>,
    #[serde(default)]
    pub cli_tool: Option<ToolConfig>,
    #[serde(default)]
    pub dependencies: Option<CommandConfig>,
    #[serde(default)]
    pub optional_component: Option<OptionalComponentConfig>,
    /// Infra id of the primary datastore.
    #[serde(default)]
    pub primary_datastore: Option<String>,
    #[serde(default)]
    pub schema_create: Option<CommandConfig>,
    #[serde(default)]
    pub schema_sync: Option<CommandConfig>,
    #[serde(default)]
    pub frontend: Option<FrontendConfig>,
    #[serde(default = "default_datastore_wait", deserialize_with = "human_duration")]
    pub datastore_wait: Duration,
    #[serde(default = "default_optional_infra_wait", deserialize_with = "human_duration")]
    pub optional_infra_wait: Duration,
    #[serde(default = "default_schema_attempts")]
    pub schema_attempts: usize,
    #[serde(default = "default_schema_retry_delay", deserialize_with = "human_duration")]
    pub schema_retry_delay: Duration,
    #[serde(default = "default_command_timeout", deserialize_with = "human_duration")]
    pub command_timeout: Duration,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            package_manager: None,
            cli_tool: None,
            dependencies: None,
            optional_component: None,
            primary_datastore: None,
            schema_create: None,
            schema_sync: None,
            frontend: None,
            datastore_wait: default_datastore_wait(),
            optional_infra_wait: default_optional_infra_wait(),
            schema_attempts: default_schema_attempts(),
            schema_retry_delay: default_schema_retry_delay(),
            command_timeout: default_command_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct CredentialsConfig {
    /// Environment variable holding an API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// File whose presence means an interactive login already happened.
    #[serde(default)]
    pub auth_file: Option<String>,
}

impl StackConfig {
    /// Resolve the project root against the config file's directory.
    pub fn root_dir(&self, config_dir: &Path) -> PathBuf {
        match &self.project.root {
            Some(root) => config_dir.join(crate::platform::expand_home(root)),
            None => config_dir.to_path_buf(),
        }
    }

    /// Service definitions in ascending start order (ties broken by id).
    pub fn service_definitions(&self, root: &Path) -> Vec<ServiceDefinition> {
        let mut defs: Vec<ServiceDefinition> = self
            .services
            .iter()
            .map(|(id, cfg)| ServiceDefinition::from_config(id, cfg, root))
            .collect();
        defs.sort_by(|a, b| a.start_order.cmp(&b.start_order).then_with(|| a.id.cmp(&b.id)));
        defs
    }

    pub fn infra_definitions(&self) -> Vec<InfraDefinition> {
        self.infra
            .iter()
            .map(|(id, cfg)| InfraDefinition::from_config(id, cfg))
            .collect()
    }
}
