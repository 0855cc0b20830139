use std::time::Duration;

use tracing::{debug, info};

use super::ContainerOrchestrator;
use crate::exec::CommandSpec;

const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Which compose CLI is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposeVariant {
    /// `docker compose` (CLI plugin)
    Plugin,
    /// `docker-compose` (standalone binary)
    Standalone,
}

impl ComposeVariant {
    /// Program plus leading args for this variant.
    pub fn base(&self) -> (&'static str, &'static [&'static str]) {
        match self {
            ComposeVariant::Plugin => ("docker", &["compose"]),
            ComposeVariant::Standalone => ("docker-compose", &[]),
        }
    }

    pub fn command(&self) -> CommandSpec {
        let (program, args) = self.base();
        CommandSpec::new(program).args(args.iter().copied())
    }
}

impl std::fmt::Display for ComposeVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComposeVariant::Plugin => write!(f, "docker compose"),
            ComposeVariant::Standalone => write!(f, "docker-compose"),
        }
    }
}

impl ContainerOrchestrator {
    /// Find the installed compose CLI. The first variant that answers
    /// `version` is cached; when neither answers the plugin form is returned
    /// without caching so a later install is picked up.
    pub async fn detect_variant(&self) -> ComposeVariant {
        if let Some(cached) = self.cached_variant() {
            return cached;
        }

        for variant in [ComposeVariant::Plugin, ComposeVariant::Standalone] {
            let spec = variant.command().arg("version").timeout(VERSION_PROBE_TIMEOUT);
            match self.runner.run(&spec).await {
                Ok(out) if out.success => {
                    info!(variant = %variant, "detected compose CLI");
                    if let Ok(mut slot) = self.variant.lock() {
                        *slot = Some(variant);
                    }
                    return variant;
                }
                Ok(out) => debug!(variant = %variant, error = %out.error_summary(), "compose variant unavailable"),
                Err(e) => debug!(variant = %variant, error = %e, "compose variant unavailable"),
            }
        }

        debug!("no compose CLI responded, assuming docker compose");
        ComposeVariant::Plugin
    }

    pub fn cached_variant(&self) -> Option<ComposeVariant> {
        self.variant.lock().ok().and_then(|v| *v)
    }

    /// Forget the cached variant, e.g. after installing Docker.
    pub fn reset_detection(&self) {
        if let Ok(mut slot) = self.variant.lock() {
            *slot = None;
        }
    }
}
