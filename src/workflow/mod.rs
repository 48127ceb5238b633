// src/workflow/mod.rs

//! Workflow and plugin definition parsing.
//!
//! This module owns the YAML surface of the engine:
//!
//! - [`def`] — workflow definitions: parse, validate, the run/uses step sum.
//! - [`vars`] — variable binding, substitution and output-path computation.
//! - [`matcher`] — file-glob and ignore-pattern matching.
//! - [`plugin`] — plugin definitions: references, inputs, conditions, env.
//!
//! Everything here is pure (no database, no subprocesses) except the PATH
//! lookup used for plugin dependency validation.

pub mod def;
pub mod matcher;
pub mod plugin;
pub mod vars;

pub use def::{
    parse, validate, ConvertConfig, Options, ParseError, Step, StepKind, WorkflowDef,
};
pub use matcher::{matches_file_glob, matches_ignore};
pub use plugin::{
    evaluate_condition, merge_environment, parse_plugin, parse_plugin_reference, prepare_inputs,
    substitute_inputs, validate_dependencies, PluginDef, PluginInput, PluginStep,
};
pub use vars::{output_path, substitute, Variables};
