// src/config/loader.rs

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::Result;
use crate::fs::FileSystem;

/// Environment variable through which `condor_submit_dag` hands the config
/// path to the run engine.
pub const CONFIG_FILE_ENV: &str = "_CONDOR_DAGMAN_CONFIG_FILE";

/// Load a configuration file from a given path and return the raw `RawConfigFile`.
///
/// This only performs TOML deserialization; it does **not** perform semantic
/// validation. Use [`load_and_validate`] for that.
pub fn load_from_path(fs: &dyn FileSystem, path: impl AsRef<Path>) -> Result<RawConfigFile> {
    let path = path.as_ref();
    let contents = fs.read_to_string(path)?;

    let config: RawConfigFile = toml::from_str(&contents)?;

    Ok(config)
}

/// Load a configuration file from path and run validation.
pub fn load_and_validate(fs: &dyn FileSystem, path: impl AsRef<Path>) -> Result<ConfigFile> {
    let raw_config = load_from_path(fs, &path)?;
    let config = ConfigFile::try_from(raw_config)?;
    Ok(config)
}

/// Resolve which config file to use: explicit CLI path first, then
/// [`CONFIG_FILE_ENV`]. `None` means "built-in defaults".
pub fn resolve_config_path(cli: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = cli {
        return Some(p.to_path_buf());
    }
    std::env::var_os(CONFIG_FILE_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// Load the configuration the binaries run with.
pub fn load_effective(fs: &dyn FileSystem, cli: Option<&Path>) -> Result<ConfigFile> {
    match resolve_config_path(cli) {
        Some(path) => {
            debug!(path = ?path, "loading configuration");
            load_and_validate(fs, path)
        }
        None => Ok(ConfigFile::default()),
    }
}
