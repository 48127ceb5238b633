// src/config/mod.rs

//! Configuration loading for watchflow.
//!
//! Responsibilities:
//! - Define the YAML-backed data model (`model.rs`).
//! - Load a config file from disk (`loader.rs`).
//!
//! All fields have defaults, so a missing config file is not an error for
//! callers that are happy with the defaults.

pub mod loader;
pub mod model;

pub use loader::{default_config_path, load_from_path, load_or_default};
pub use model::Config;
