//! Container infrastructure through the compose CLI.
//!
//! Everything shells out through a [`CommandRunner`], so the same code drives
//! either `docker compose` or the standalone `docker-compose`.

pub mod daemon;
pub mod lifecycle;
pub mod variant;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;

use crate::config::model::ComposeConfig;
use crate::exec::{CommandRunner, ExecError};
use crate::platform::HostPlatform;

pub use daemon::{AcquireStrategy, DaemonTimeouts};
pub use lifecycle::ContainerStatus;
pub use variant::ComposeVariant;

#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("compose file not found: {}", .0.display())]
    MissingFile(PathBuf),
    #[error("`{action}` failed for {}: {message}", .file.display())]
    CommandFailed {
        action: &'static str,
        file: PathBuf,
        message: String,
    },
    #[error(transparent)]
    Exec(#[from] ExecError),
}

pub const DEFAULT_GROUP_TIMEOUT: Duration = Duration::from_secs(300);

pub struct ContainerOrchestrator {
    runner: Arc<dyn CommandRunner>,
    host: HostPlatform,
    project_root: PathBuf,
    project_name: Option<String>,
    variant: Mutex<Option<ComposeVariant>>,
    timeouts: DaemonTimeouts,
    group_timeout: Duration,
}

impl ContainerOrchestrator {
    pub fn new(runner: Arc<dyn CommandRunner>, project_root: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            host: HostPlatform::current(),
            project_root: project_root.into(),
            project_name: None,
            variant: Mutex::new(None),
            timeouts: DaemonTimeouts::default(),
            group_timeout: DEFAULT_GROUP_TIMEOUT,
        }
    }

    pub fn from_config(
        runner: Arc<dyn CommandRunner>,
        project_root: &Path,
        config: Option<&ComposeConfig>,
    ) -> Self {
        let mut orchestrator = Self::new(runner, project_root);
        if let Some(cfg) = config {
            orchestrator.project_name = cfg.project_name.clone();
            orchestrator.group_timeout = cfg.timeout;
        }
        orchestrator
    }

    pub fn with_host(mut self, host: HostPlatform) -> Self {
        self.host = host;
        self
    }

    pub fn with_project_name(mut self, name: impl Into<String>) -> Self {
        self.project_name = Some(name.into());
        self
    }

    pub fn with_daemon_timeouts(mut self, timeouts: DaemonTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn host(&self) -> HostPlatform {
        self.host
    }

    /// Compose files are resolved against the project root.
    pub fn resolve_file(&self, file: &str) -> PathBuf {
        self.project_root.join(crate::platform::expand_home(file))
    }
}
