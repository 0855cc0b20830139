use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "stackwarden.toml";

/// Environment variable that points at a config file, checked before the
/// directory walk.
pub const CONFIG_ENV: &str = "STACKWARDEN_CONFIG";

/// Search `start` and each ancestor for `filename`.
pub fn find_config(start: &Path, filename: &str) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(filename))
        .find(|candidate| candidate.is_file())
}

/// Pick the config file: explicit `-f` path, then `$STACKWARDEN_CONFIG`,
/// then the nearest `stackwarden.toml` above the working directory.
pub fn resolve_config(cli_file: Option<&Path>) -> anyhow::Result<PathBuf> {
    let explicit = cli_file
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));

    if let Some(path) = explicit {
        if !path.is_file() {
            anyhow::bail!("Config file not found: {}", path.display());
        }
        return Ok(path.canonicalize()?);
    }

    let cwd = std::env::current_dir()?;
    find_config(&cwd, CONFIG_FILE).ok_or_else(|| {
        anyhow::anyhow!(
            "No {} found in {} or any parent directory",
            CONFIG_FILE,
            cwd.display()
        )
    })
}
