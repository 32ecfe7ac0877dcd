// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::model::{RawSettings, Settings};
use crate::errors::{FlowError, Result};

/// Environment variable overriding `[redis].port`.
pub const ENV_REDIS_PORT: &str = "FLOWMGR_REDIS_PORT";
/// Environment variable overriding `[redis].db`.
pub const ENV_REDIS_DATABASE: &str = "FLOWMGR_REDIS_DATABASE";
/// Environment variable overriding `[executor].docker_command`.
pub const ENV_DOCKER_COMMAND: &str = "FLOWMGR_DOCKER_COMMAND";

/// Load a settings file from a given path and return the raw `RawSettings`.
///
/// This only performs TOML deserialization; it does **not** perform semantic
/// validation. Use [`load_and_validate`] for that.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawSettings> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;

    let settings: RawSettings = toml::from_str(&contents)?;

    Ok(settings)
}

/// Load settings from path, apply environment overrides, resolve relative
/// directories against the config file's directory and validate.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<Settings> {
    let path = path.as_ref();
    let mut raw = load_from_path(path)?;

    apply_env_overrides(&mut raw, |key| std::env::var(key).ok())?;

    let base = config_root_dir(path);
    raw.executor.resolve_relative_to(&base);
    raw.processes.resolve_relative_to(&base);

    Settings::try_from(raw)
}

/// Apply environment overrides using the given lookup.
///
/// The lookup is injected so tests don't have to touch process-global state.
pub fn apply_env_overrides<F>(raw: &mut RawSettings, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(port) = lookup(ENV_REDIS_PORT) {
        raw.redis.port = port.trim().parse().map_err(|_| {
            FlowError::ConfigError(format!("{ENV_REDIS_PORT} must be a port number (got '{port}')"))
        })?;
        debug!(port = raw.redis.port, "redis port overridden from environment");
    }

    if let Some(db) = lookup(ENV_REDIS_DATABASE) {
        raw.redis.db = db.trim().parse().map_err(|_| {
            FlowError::ConfigError(format!("{ENV_REDIS_DATABASE} must be an integer (got '{db}')"))
        })?;
        debug!(db = raw.redis.db, "redis database overridden from environment");
    }

    if let Some(cmd) = lookup(ENV_DOCKER_COMMAND) {
        debug!(cmd = %cmd, "docker command overridden from environment");
        raw.executor.docker_command = cmd;
    }

    Ok(())
}

/// Directory that relative paths in the config are resolved against.
///
/// A bare filename (parent = "") falls back to the current directory.
pub fn config_root_dir(config_path: &Path) -> PathBuf {
    match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    }
}

/// Default settings path: `flowmgr.toml` in the working directory.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("flowmgr.toml")
}
