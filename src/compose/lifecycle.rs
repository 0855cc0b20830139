use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{ComposeError, ContainerOrchestrator};
use crate::exec::CommandSpec;

/// One container as reported by `ps --format json`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerStatus {
    pub name: String,
    pub state: String,
    pub ports: Vec<u16>,
}

#[derive(Debug, Deserialize)]
struct PsRecord {
    #[serde(rename = "Name")]
    name: String,
    #[serde(default, rename = "State")]
    state: String,
    #[serde(default, rename = "Publishers")]
    publishers: Option<Vec<PsPublisher>>,
}

#[derive(Debug, Deserialize)]
struct PsPublisher {
    #[serde(default, rename = "PublishedPort")]
    published_port: u16,
}

impl From<PsRecord> for ContainerStatus {
    fn from(rec: PsRecord) -> Self {
        let mut ports: Vec<u16> = rec
            .publishers
            .unwrap_or_default()
            .into_iter()
            .map(|p| p.published_port)
            .filter(|p| *p != 0)
            .collect();
        ports.sort_unstable();
        ports.dedup();
        Self {
            name: rec.name,
            state: rec.state,
            ports,
        }
    }
}

/// Parse `ps --format json` output. Newer CLIs print one object per line,
/// older ones a single array. Anything unparseable yields an empty list.
pub fn parse_ps_output(stdout: &str) -> Vec<ContainerStatus> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let ndjson: Result<Vec<PsRecord>, _> = trimmed
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(serde_json::from_str::<PsRecord>)
        .collect();
    if let Ok(records) = ndjson {
        return records.into_iter().map(Into::into).collect();
    }

    match serde_json::from_str::<Vec<PsRecord>>(trimmed) {
        Ok(records) => records.into_iter().map(Into::into).collect(),
        Err(e) => {
            debug!(error = %e, "unparseable compose ps output");
            Vec::new()
        }
    }
}

impl ContainerOrchestrator {
    async fn compose_command(&self, file: &Path) -> CommandSpec {
        let mut spec = self
            .detect_variant()
            .await
            .command()
            .arg("-f")
            .arg(file.to_string_lossy())
            .cwd(&self.project_root)
            .timeout(self.group_timeout);
        if let Some(name) = &self.project_name {
            spec = spec.arg("-p").arg(name.clone());
        }
        spec
    }

    async fn run_group(
        &self,
        action: &'static str,
        file: &str,
        args: &[&str],
    ) -> Result<(), ComposeError> {
        let path = self.resolve_file(file);
        if !path.is_file() {
            return Err(ComposeError::MissingFile(path));
        }
        let spec = self.compose_command(&path).await.args(args.iter().copied());
        info!(file = %path.display(), "compose {}", action);
        let output = self.runner.run(&spec).await?;
        if !output.success {
            return Err(ComposeError::CommandFailed {
                action,
                file: path,
                message: output.error_summary(),
            });
        }
        Ok(())
    }

    /// `up -d` for one compose file.
    pub async fn start_group(&self, file: &str) -> Result<(), ComposeError> {
        self.run_group("up", file, &["up", "-d"]).await
    }

    /// `down` for one compose file.
    pub async fn stop_group(&self, file: &str) -> Result<(), ComposeError> {
        self.run_group("down", file, &["down"]).await
    }

    /// Container status for one compose file. Never fails; problems give an
    /// empty list.
    pub async fn group_status(&self, file: &str) -> Vec<ContainerStatus> {
        let path = self.resolve_file(file);
        if !path.is_file() {
            debug!(file = %path.display(), "compose file missing");
            return Vec::new();
        }
        let spec = self
            .compose_command(&path)
            .await
            .args(["ps", "--format", "json"])
            .timeout(self.timeouts.probe.max(std::time::Duration::from_secs(30)));
        match self.runner.run(&spec).await {
            Ok(out) if out.success => parse_ps_output(&out.stdout),
            Ok(out) => {
                debug!(error = %out.error_summary(), "compose ps failed");
                Vec::new()
            }
            Err(e) => {
                debug!(error = %e, "compose ps failed");
                Vec::new()
            }
        }
    }
}
