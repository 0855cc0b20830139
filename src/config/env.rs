//! Process environment for spawned services and tool invocations.
//!
//! A process launched from a desktop shell inherits a minimal `PATH`, so on
//! Unix the interactive login shell is asked for its `PATH` first.  The
//! `[settings]` table is then layered on top.

use std::collections::BTreeMap;

use tracing::{debug, warn};

/// Layer `settings` over `env`.  Non-empty values override.  An empty value
/// never replaces a variable that is already set.
pub fn merge_settings(env: &mut BTreeMap<String, String>, settings: &BTreeMap<String, String>) {
    for (key, value) in settings {
        if value.trim().is_empty() {
            if env.contains_key(key) {
                debug!(key = %key, "empty setting left existing environment value in place");
                continue;
            }
            env.insert(key.clone(), String::new());
        } else {
            env.insert(key.clone(), value.clone());
        }
    }
}

/// Build the environment every child process receives.
pub async fn build_process_env(settings: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = std::env::vars().collect();

    match crate::platform::login_shell_path().await {
        Some(path) if !path.is_empty() => {
            debug!(path = %path, "using login shell PATH");
            env.insert("PATH".to_string(), path);
        }
        _ => {
            warn!("could not resolve login shell PATH, using inherited PATH");
        }
    }

    merge_settings(&mut env, settings);
    env
}
