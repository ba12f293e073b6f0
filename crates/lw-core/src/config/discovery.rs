//! Configuration discovery and resolution

use super::types::{LwConfig, default_probe_interval_ms};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Repo-local config file name
const REPO_CONFIG_FILE: &str = ".loopwatch.toml";

/// Global config location relative to the home directory
const GLOBAL_CONFIG_PATH: &str = ".config/loopwatch/config.toml";

/// Configuration error
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// An explicitly requested config file does not exist
    #[error("Configuration not found: {}", .0.display())]
    NotFound(PathBuf),
}

/// Command-line overrides for configuration
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    /// Explicit config file; replaces repo-local and global discovery
    pub config_path: Option<PathBuf>,
    /// Override worker executable
    pub worker_command: Option<String>,
    /// Override hub listen address
    pub bind: Option<String>,
}

/// Resolve configuration from all sources
///
/// Priority (highest to lowest):
/// 1. Command-line overrides
/// 2. Environment variables
/// 3. Repo-local config (.loopwatch.toml in current dir, walking up to git root)
/// 4. Global config (~/.config/loopwatch/config.toml)
/// 5. Defaults
///
/// Files are merged key by key, so a repo-local file that sets only
/// `worker.command` keeps every other value from the global file.
pub fn resolve_config(
    overrides: &ConfigOverrides,
    current_dir: &Path,
    home_dir: &Path,
) -> Result<LwConfig, ConfigError> {
    let mut merged = toml::Table::new();

    if let Some(ref explicit) = overrides.config_path {
        if !explicit.exists() {
            return Err(ConfigError::NotFound(explicit.clone()));
        }
        merge_tables(&mut merged, load_table(explicit)?);
    } else {
        // 4. Global config
        let global_config_path = home_dir.join(GLOBAL_CONFIG_PATH);
        if global_config_path.exists() {
            match load_table(&global_config_path) {
                Ok(table) => merge_tables(&mut merged, table),
                Err(e) => warn!("Failed to parse global config at {global_config_path:?}: {e}"),
            }
        }

        // 3. Repo-local config
        if let Some(repo_config) = find_repo_local_config(current_dir) {
            match load_table(&repo_config) {
                Ok(table) => merge_tables(&mut merged, table),
                Err(e) => warn!("Failed to parse repo config at {repo_config:?}: {e}"),
            }
        }
    }

    let mut config: LwConfig = toml::Value::Table(merged).try_into()?;

    if config.hub.probe_interval_ms == 0 {
        warn!("Ignoring hub.probe_interval_ms = 0; using the default");
        config.hub.probe_interval_ms = default_probe_interval_ms();
    }

    // 2. Environment variables
    apply_env_overrides(&mut config);

    // 1. Command-line overrides
    apply_cli_overrides(&mut config, overrides);

    Ok(config)
}

/// Find repo-local config file
///
/// Searches current directory and parent directories up to git root
fn find_repo_local_config(current_dir: &Path) -> Option<PathBuf> {
    let mut dir = current_dir;

    loop {
        let config_path = dir.join(REPO_CONFIG_FILE);
        if config_path.exists() {
            return Some(config_path);
        }

        if dir.join(".git").exists() {
            break;
        }

        dir = dir.parent()?;
    }

    None
}

fn load_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    Ok(contents.parse::<toml::Table>()?)
}

/// Deep-merge `overlay` into `base`; nested tables merge, everything else replaces.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

fn apply_env_overrides(config: &mut LwConfig) {
    if let Some(command) = env_string("LW_WORKER_COMMAND") {
        config.worker.command = command;
    }

    if let Some(command) = env_string("LW_CHAT_COMMAND") {
        config.conversation.command = command;
    }

    if let Some(model) = env_string("LW_CHAT_MODEL") {
        config.conversation.model = model;
    }

    if let Some(bind) = env_string("LW_HUB_BIND") {
        config.hub.bind = bind;
    }

    if let Some(raw) = env_string("LW_PROBE_INTERVAL_MS") {
        match raw.parse::<u64>() {
            Ok(ms) if ms > 0 => config.hub.probe_interval_ms = ms,
            _ => warn!("Ignoring invalid LW_PROBE_INTERVAL_MS value {raw:?}"),
        }
    }

    if let Some(command) = env_string("LW_TASKS_COMMAND") {
        config.tasks.command = command;
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn apply_cli_overrides(config: &mut LwConfig, overrides: &ConfigOverrides) {
    if let Some(ref command) = overrides.worker_command {
        config.worker.command = command.clone();
    }

    if let Some(ref bind) = overrides.bind {
        config.hub.bind = bind.clone();
    }
}
