// src/errors.rs

//! Crate-wide error aliases.
//!
//! Structured error types live next to the layers that produce them
//! (`store::StoreError`, `workflow::ParseError`); the orchestration layers
//! use `anyhow` with context.

pub use anyhow::{Error, Result};
