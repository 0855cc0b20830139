use std::collections::BTreeMap;

use thiserror::Error;

use crate::config::model::StackConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigIssue {
    #[error("service `{service}` has an empty command")]
    EmptyCommand { service: String },

    #[error("service `{service}` declares health_url `{url}` which is not an http(s) URL")]
    InvalidHealthUrl { service: String, url: String },

    #[error("health port {port} is declared by multiple services: {services:?}")]
    DuplicateHealthPort { port: u16, services: Vec<String> },

    #[error("provision.primary_datastore refers to unknown infra `{infra}`")]
    UnknownDatastore { infra: String },

    #[error("optional component `{component}` lists unknown service `{service}`{}", suggestion_suffix(.suggestion))]
    UnknownComponentService {
        component: String,
        service: String,
        suggestion: Option<String>,
    },

    #[error("optional component `{component}` lists unknown infra `{infra}`")]
    UnknownComponentInfra { component: String, infra: String },

    #[error("supervisor.reclaim_port_range start {start} is greater than end {end}")]
    InvalidPortRange { start: u16, end: u16 },

    #[error("tool `{tool}` has an empty check command")]
    EmptyToolCheck { tool: String },

    #[error("compose.required_file is empty")]
    EmptyComposeFile,

    #[error("provision.schema_attempts must be at least 1")]
    ZeroSchemaAttempts,
}

fn suggestion_suffix(suggestion: &Option<String>) -> String {
    match suggestion {
        Some(s) => format!(" (did you mean `{}`?)", s),
        None => String::new(),
    }
}

/// Suggest the closest known name for a typo, as the CLI does for service ids.
pub fn closest_match<'a>(name: &str, candidates: impl Iterator<Item = &'a String>) -> Option<String> {
    candidates
        .map(|c| (strsim::jaro_winkler(name, c), c))
        .filter(|(score, _)| *score > 0.8)
        .max_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, c)| c.clone())
}

/// Check a parsed config for problems serde cannot catch.  Every issue is
/// collected so the user sees all of them at once.
pub fn validate(config: &StackConfig) -> Result<(), Vec<ConfigIssue>> {
    let mut issues = Vec::new();

    let mut by_port: BTreeMap<u16, Vec<String>> = BTreeMap::new();
    for (id, svc) in &config.services {
        if svc.command.trim().is_empty() {
            issues.push(ConfigIssue::EmptyCommand {
                service: id.clone(),
            });
        }
        if let Some(url) = &svc.health_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                issues.push(ConfigIssue::InvalidHealthUrl {
                    service: id.clone(),
                    url: url.clone(),
                });
            }
        }
        if let Some(port) = svc.health_port {
            by_port.entry(port).or_default().push(id.clone());
        }
    }
    for (port, services) in by_port {
        if services.len() > 1 {
            issues.push(ConfigIssue::DuplicateHealthPort { port, services });
        }
    }

    if let Some(compose) = &config.compose {
        if compose.required_file.trim().is_empty() {
            issues.push(ConfigIssue::EmptyComposeFile);
        }
    }

    if let Some(range) = &config.supervisor.reclaim_port_range {
        if range.start > range.end {
            issues.push(ConfigIssue::InvalidPortRange {
                start: range.start,
                end: range.end,
            });
        }
    }

    let provision = &config.provision;
    if let Some(infra) = &provision.primary_datastore {
        if !config.infra.contains_key(infra) {
            issues.push(ConfigIssue::UnknownDatastore {
                infra: infra.clone(),
            });
        }
    }

    if let Some(component) = &provision.optional_component {
        for service in &component.services {
            if !config.services.contains_key(service) {
                issues.push(ConfigIssue::UnknownComponentService {
                    component: component.name.clone(),
                    service: service.clone(),
                    suggestion: closest_match(service, config.services.keys()),
                });
            }
        }
        for infra in &component.infra {
            if !config.infra.contains_key(infra) {
                issues.push(ConfigIssue::UnknownComponentInfra {
                    component: component.name.clone(),
                    infra: infra.clone(),
                });
            }
        }
    }

    for tool in [&provision.package_manager, &provision.cli_tool]
        .into_iter()
        .flatten()
    {
        if tool.check.is_empty() {
            issues.push(ConfigIssue::EmptyToolCheck {
                tool: tool.name.clone(),
            });
        }
    }

    if provision.schema_attempts == 0 {
        issues.push(ConfigIssue::ZeroSchemaAttempts);
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(issues)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> StackConfig {
        toml::from_str(raw).unwrap()
    }

    #[test]
    fn valid_config_passes() {
        let config = parse(
            r#"
[project]
name = "ok"
[services.api]
command = "bun"
health_port = 3000
[infra.db]
port = 5432
[provision]
primary_datastore = "db"
"#,
        );
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn collects_every_issue() {
        let config = parse(
            r#"
[project]
name = "bad"
[services.api]
command = "  "
health_port = 3000
health_url = "localhost:3000"
[services.web]
command = "bun"
health_port = 3000
[supervisor]
reclaim_port_range = { start = 10, end = 5 }
[provision]
primary_datastore = "nope"
schema_attempts = 0
"#,
        );
        let issues = validate(&config).unwrap_err();
        assert!(issues.contains(&ConfigIssue::EmptyCommand {
            service: "api".into()
        }));
        assert!(issues.contains(&ConfigIssue::DuplicateHealthPort {
            port: 3000,
            services: vec!["api".into(), "web".into()],
        }));
        assert!(issues.contains(&ConfigIssue::InvalidPortRange { start: 10, end: 5 }));
        assert!(issues.contains(&ConfigIssue::UnknownDatastore {
            infra: "nope".into()
        }));
        assert!(issues.contains(&ConfigIssue::ZeroSchemaAttempts));
        assert!(issues
            .iter()
            .any(|i| matches!(i, ConfigIssue::InvalidHealthUrl { .. })));
    }

    #[test]
    fn unknown_component_service_suggests_close_name() {
        let config = parse(
            r#"
[project]
name = "typo"
[services.indexer]
command = "python"
[provision.optional_component]
name = "search"
repo = "https://example.com/search.git"
dir = "vendor/search"
services = ["indexr"]
"#,
        );
        let issues = validate(&config).unwrap_err();
        assert_eq!(issues.len(), 1);
        let msg = issues[0].to_string();
        assert!(msg.contains("did you mean `indexer`"), "got: {}", msg);
    }
}
