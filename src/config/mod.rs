// src/config/mod.rs

//! Configuration loading and validation for gridflow.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load a config file (`loader.rs`), honouring `_CONDOR_DAGMAN_CONFIG_FILE`.
//! - Validate value ranges (`validate.rs`).

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{load_and_validate, load_effective, load_from_path, CONFIG_FILE_ENV};
pub use model::{ConfigFile, DagmanSection, GridmanagerSection, RawConfigFile};
pub use validate::validate_config;
