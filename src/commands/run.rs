use anyhow::Result;
use std::path::Path;

use crate::config::resolve::resolve_config;
use crate::orchestrator::{Orchestrator, RunMode};
use crate::provision::ProvisionOptions;

pub async fn run(config_file: Option<&Path>, mode: RunMode, skip_optional: bool) -> Result<()> {
    let config_path = resolve_config(config_file)?;
    let orchestrator = Orchestrator::from_config(&config_path).await?;
    orchestrator
        .run(
            mode,
            ProvisionOptions {
                skip_optional_component: skip_optional,
            },
        )
        .await
}
