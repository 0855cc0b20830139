use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::model::CredentialsConfig;

/// Whether the CLI tool can act on the user's behalf. Only used to pick the
/// message shown after the CLI tool step.
pub trait CredentialStatus: Send + Sync {
    fn is_authenticated(&self) -> bool;
    fn has_api_key(&self) -> bool;
}

/// Credentials read from an environment variable and a login marker file.
#[derive(Debug, Clone, Default)]
pub struct EnvCredentials {
    api_key: Option<String>,
    auth_file: Option<PathBuf>,
}

impl EnvCredentials {
    pub fn from_config(cfg: &CredentialsConfig, root: &Path, env: &BTreeMap<String, String>) -> Self {
        Self {
            api_key: cfg
                .api_key_env
                .as_ref()
                .and_then(|name| env.get(name))
                .filter(|v| !v.trim().is_empty())
                .cloned(),
            auth_file: cfg
                .auth_file
                .as_ref()
                .map(|f| root.join(crate::platform::expand_home(f))),
        }
    }
}

impl CredentialStatus for EnvCredentials {
    fn is_authenticated(&self) -> bool {
        self.auth_file.as_ref().is_some_and(|f| f.exists())
    }

    fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }
}

/// Message for the CLI tool step.
pub fn cli_tool_message(tool: &str, installed: bool, creds: &dyn CredentialStatus) -> String {
    if !installed {
        return format!("{} unavailable, continuing without it", tool);
    }
    if creds.has_api_key() {
        format!("{} ready (API key)", tool)
    } else if creds.is_authenticated() {
        format!("{} ready (signed in)", tool)
    } else {
        format!("{} installed; sign in or set an API key to enable it", tool)
    }
}
