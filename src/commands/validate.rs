use anyhow::Result;
use owo_colors::OwoColorize;
use std::path::Path;

use crate::config;
use crate::config::resolve::resolve_config;
use crate::config::validate::validate;
use crate::config::ConfigError;

pub fn run(config_file: Option<&Path>) -> Result<()> {
    let config_path = resolve_config(config_file)?;
    let config = config::parse_config(&config_path)?;

    let filename = config_path
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_else(|| config::resolve::CONFIG_FILE.to_string());

    validate(&config).map_err(ConfigError::Invalid)?;
    println!(
        "  {} {} is valid ({} services, {} infra)",
        "\u{2713}".green(),
        filename,
        config.services.len(),
        config.infra.len(),
    );
    Ok(())
}
