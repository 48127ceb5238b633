// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::config::model::Config;

/// Load a configuration file from a given path.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)
        .with_context(|| format!("reading config file at {:?}", path))?;

    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("parsing YAML config from {:?}", path))?;

    Ok(config)
}

/// Load a configuration file if it exists; otherwise fall back to defaults.
///
/// A config file that exists but fails to parse is still an error: silently
/// running on defaults when the operator wrote a (broken) config would hide
/// the mistake.
pub fn load_or_default(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        debug!(?path, "no config file found, using defaults");
        return Ok(Config::default());
    }
    load_from_path(path)
}

/// Default config path: `watchflow.yaml` in the current working directory.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("watchflow.yaml")
}
