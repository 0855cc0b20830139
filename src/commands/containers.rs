use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use crate::compose::ContainerOrchestrator;
use crate::config::resolve::resolve_config;
use crate::config::{self, LoadedConfig};
use crate::exec::SystemRunner;
use crate::ui::summary::print_containers;

fn load(config_file: Option<&Path>) -> Result<LoadedConfig> {
    let config_path = resolve_config(config_file)?;
    config::load_config(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))
}

fn orchestrator(loaded: &LoadedConfig) -> ContainerOrchestrator {
    ContainerOrchestrator::from_config(
        Arc::new(SystemRunner::new()),
        &loaded.root,
        loaded.config.compose.as_ref(),
    )
}

pub async fn run(config_file: Option<&Path>) -> Result<()> {
    let loaded = load(config_file)?;
    let Some(compose) = &loaded.config.compose else {
        println!("No compose files configured.");
        return Ok(());
    };
    let orch = orchestrator(&loaded);

    let files = std::iter::once(&compose.required_file).chain(compose.optional_file.iter());
    for file in files {
        let containers = orch.group_status(file).await;
        print_containers(file, &containers);
    }
    println!();
    Ok(())
}

/// Stop the optional group, then the required one. A failure in the
/// optional group is reported but does not stop the required group.
pub async fn down(config_file: Option<&Path>) -> Result<()> {
    let loaded = load(config_file)?;
    let Some(compose) = &loaded.config.compose else {
        println!("No compose files configured.");
        return Ok(());
    };
    let orch = orchestrator(&loaded);

    if let Some(optional) = &compose.optional_file {
        match orch.stop_group(optional).await {
            Ok(()) => println!("  stopped {}", optional),
            Err(e) => tracing::warn!(file = %optional, error = %e, "could not stop optional group"),
        }
    }
    orch.stop_group(&compose.required_file)
        .await
        .with_context(|| format!("stopping {}", compose.required_file))?;
    println!("  stopped {}", compose.required_file);
    Ok(())
}
