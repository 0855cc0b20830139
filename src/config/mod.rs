pub mod env;
pub mod model;
pub mod resolve;
pub mod validate;

use std::path::{Path, PathBuf};

use thiserror::Error;

use model::{InfraDefinition, ServiceDefinition, StackConfig};
use validate::ConfigIssue;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("configuration errors:\n{}", format_issues(.0))]
    Invalid(Vec<ConfigIssue>),
}

fn format_issues(issues: &[ConfigIssue]) -> String {
    issues
        .iter()
        .map(|i| format!("  - {}", i))
        .collect::<Vec<_>>()
        .join("\n")
}

/// A parsed, validated config together with where it came from.
#[derive(Debug)]
pub struct LoadedConfig {
    pub config: StackConfig,
    pub path: PathBuf,
    pub root: PathBuf,
}

impl LoadedConfig {
    pub fn services(&self) -> Vec<ServiceDefinition> {
        self.config.service_definitions(&self.root)
    }

    pub fn infra(&self) -> Vec<InfraDefinition> {
        self.config.infra_definitions()
    }

    /// Resolve a config-relative path against the project root.
    pub fn resolve_path(&self, relative: &str) -> PathBuf {
        self.root.join(crate::platform::expand_home(relative))
    }
}

pub fn parse_config(path: &Path) -> Result<StackConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

pub fn load_config(path: &Path) -> Result<LoadedConfig, ConfigError> {
    let config = parse_config(path)?;
    validate::validate(&config).map_err(ConfigError::Invalid)?;

    let config_dir = path.parent().unwrap_or_else(|| Path::new("."));
    let root = config.root_dir(config_dir);
    Ok(LoadedConfig {
        config,
        path: path.to_path_buf(),
        root,
    })
}
