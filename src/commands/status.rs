use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use crate::config;
use crate::config::resolve::resolve_config;
use crate::health::probe::NetProber;
use crate::health::HealthMonitor;
use crate::ui::summary::print_health;

/// One-shot health check. Process state is only known to a running
/// supervisor, so this reports probes alone.
pub async fn run(config_file: Option<&Path>, json: bool) -> Result<()> {
    let config_path = resolve_config(config_file)?;
    let loaded = config::load_config(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    let monitor = HealthMonitor::new(
        &loaded.services(),
        &loaded.infra(),
        Arc::new(NetProber::new(loaded.config.health.probe_timeout)),
        loaded.config.health.interval,
    );
    let health = monitor.check_all().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&health)?);
    } else {
        print_health(&loaded.config.project.name, &health, &[]);
    }
    Ok(())
}
