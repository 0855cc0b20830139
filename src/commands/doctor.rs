use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

use crate::compose::ContainerOrchestrator;
use crate::config;
use crate::config::model::ToolConfig;
use crate::config::resolve::resolve_config;
use crate::exec::{CommandRunner, CommandSpec, SystemRunner};

async fn version_of(runner: &dyn CommandRunner, spec: CommandSpec) -> Option<String> {
    match runner.run(&spec).await {
        Ok(out) if out.success => {
            // Some tools print their version to stderr
            let text = if out.stdout.trim().is_empty() {
                out.stderr
            } else {
                out.stdout
            };
            Some(text.lines().next().unwrap_or_default().trim().to_string())
        }
        _ => None,
    }
}

fn report(name: &str, found: Option<String>) -> bool {
    match found {
        Some(version) => {
            println!("  [ok] {:<16} {}", name, version);
            true
        }
        None => {
            println!("  [!!] {:<16} not found", name);
            false
        }
    }
}

pub async fn run(config_file: Option<&Path>) -> Result<()> {
    println!("stackwarden doctor");
    println!("==================");
    println!();

    let runner = Arc::new(SystemRunner::new());
    let mut all_ok = true;

    all_ok &= report("docker", version_of(runner.as_ref(), CommandSpec::new("docker").arg("--version")).await);
    all_ok &= report("git", version_of(runner.as_ref(), CommandSpec::new("git").arg("--version")).await);

    // Tool checks only apply when a config is reachable.
    let loaded = resolve_config(config_file)
        .ok()
        .and_then(|path| config::load_config(&path).ok());
    let root = loaded
        .as_ref()
        .map(|l| l.root.clone())
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default());

    if let Some(loaded) = &loaded {
        let provision = &loaded.config.provision;
        let tools: Vec<&ToolConfig> = provision
            .package_manager
            .iter()
            .chain(provision.cli_tool.iter())
            .collect();
        for tool in tools {
            let found = match CommandSpec::from_argv(&tool.check) {
                Some(spec) => version_of(runner.as_ref(), spec).await,
                None => None,
            };
            all_ok &= report(&tool.name, found);
        }
    }

    let compose = ContainerOrchestrator::from_config(
        runner.clone(),
        &root,
        loaded.as_ref().and_then(|l| l.config.compose.as_ref()),
    );
    let daemon_up = compose.is_daemon_running().await;
    all_ok &= report("docker daemon", daemon_up.then(|| "running".to_string()));
    let variant = compose.detect_variant().await;
    let compose_found = compose.cached_variant().map(|_| variant.to_string());
    all_ok &= report("compose", compose_found);

    println!();
    if all_ok {
        println!("All dependencies found.");
    } else {
        println!("Some dependencies are missing. `stackwarden install` can set most of them up.");
        if !daemon_up {
            println!("Container daemon install guide: {}", compose.manual_install_url());
        }
    }

    Ok(())
}
