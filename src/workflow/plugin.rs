// src/workflow/plugin.rs

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::workflow::def::ParseError;
use crate::workflow::vars::{substitute, Variables};

/// A parsed plugin definition.
///
/// ```yaml
/// name: notify
/// version: 1.2.0
/// dependencies: [curl]
/// inputs:
///   url:
///     type: string
///     required: true
/// steps:
///   - name: post
///     run: "curl -s -X POST '${{ inputs.url }}'"
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct PluginDef {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: String,
    /// Commands that must resolve on `PATH` before the plugin runs.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub inputs: BTreeMap<String, PluginInput>,
    #[serde(default)]
    pub steps: Vec<PluginStep>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Plugin-level environment; between workflow env and step env in
    /// precedence.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// A declared plugin input parameter.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PluginInput {
    #[serde(rename = "type", default)]
    pub input_type: String,
    #[serde(default)]
    pub default: Option<serde_yaml::Value>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
}

/// A step within a plugin.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginStep {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub run: String,
    /// Optional condition; a false condition skips the step.
    #[serde(default)]
    pub condition: Option<String>,
    /// Optional per-step timeout in seconds, overriding the engine-wide
    /// step timeout.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// A plugin declared a command that does not resolve on `PATH`.
#[derive(Debug, Error)]
#[error("required dependency '{command}' not found on PATH")]
pub struct DependencyMissing {
    pub command: String,
}

/// Parse a plugin definition from YAML source and validate it.
pub fn parse_plugin(source: &str) -> Result<PluginDef, ParseError> {
    let plugin: PluginDef = serde_yaml::from_str(source)?;

    if plugin.name.is_empty() {
        return Err(ParseError::Invalid("plugin name is required".to_string()));
    }
    if plugin.version.is_empty() {
        return Err(ParseError::Invalid(
            "plugin version is required".to_string(),
        ));
    }
    if !is_semver(&plugin.version) {
        return Err(ParseError::Invalid(format!(
            "plugin version '{}' must be three dotted integers (e.g. 1.0.0)",
            plugin.version
        )));
    }
    if plugin.steps.is_empty() {
        return Err(ParseError::Invalid(
            "plugin must have at least one step".to_string(),
        ));
    }
    for (i, step) in plugin.steps.iter().enumerate() {
        if step.name.trim().is_empty() {
            return Err(ParseError::Invalid(format!(
                "plugin step {}: name is required",
                i + 1
            )));
        }
        if step.run.trim().is_empty() {
            return Err(ParseError::Invalid(format!(
                "plugin step {} ('{}'): run command is required",
                i + 1,
                step.name
            )));
        }
    }

    Ok(plugin)
}

fn is_semver(version: &str) -> bool {
    let parts: Vec<&str> = version.split('.').collect();
    parts.len() == 3 && parts.iter().all(|p| !p.is_empty() && p.parse::<u64>().is_ok())
}

/// Parse a plugin reference of the form `NAME`, `NAME@vX.Y.Z` or
/// `NAME@X.Y.Z`.
///
/// Returns the plugin name and the requested version; `None` means "use the
/// currently active version".
pub fn parse_plugin_reference(uses: &str) -> Result<(String, Option<String>), ParseError> {
    let uses = uses.trim();
    if uses.is_empty() {
        return Err(ParseError::PluginReference(uses.to_string()));
    }

    let mut parts = uses.split('@');
    let name = parts.next().unwrap_or_default();
    if name.is_empty() {
        return Err(ParseError::PluginReference(uses.to_string()));
    }

    match (parts.next(), parts.next()) {
        (None, _) => Ok((name.to_string(), None)),
        (Some(version), None) => {
            let version = version.strip_prefix('v').unwrap_or(version);
            if version.is_empty() {
                return Err(ParseError::PluginReference(uses.to_string()));
            }
            Ok((name.to_string(), Some(version.to_string())))
        }
        (Some(_), Some(_)) => Err(ParseError::PluginReference(uses.to_string())),
    }
}

/// Merge a plugin's declared input defaults with caller-provided values.
///
/// Defaults apply first, caller values override, and every declared
/// `required` input must end up with a value.
pub fn prepare_inputs(
    plugin: &PluginDef,
    provided: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, ParseError> {
    let mut inputs = BTreeMap::new();

    for (name, input) in &plugin.inputs {
        if let Some(default) = input.default.as_ref().and_then(scalar_to_string) {
            inputs.insert(name.clone(), default);
        }
    }

    for (name, value) in provided {
        inputs.insert(name.clone(), value.clone());
    }

    for (name, input) in &plugin.inputs {
        if input.required && !inputs.contains_key(name) {
            return Err(ParseError::MissingInput(name.clone()));
        }
    }

    Ok(inputs)
}

fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Replace `${{ inputs.NAME }}` (alias `${{ input.NAME }}`) placeholders.
///
/// Placeholders with no matching input are left untouched.
pub fn substitute_inputs(text: &str, inputs: &BTreeMap<String, String>) -> String {
    let Some(re) = input_pattern() else {
        return text.to_string();
    };

    re.replace_all(text, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        match inputs.get(name) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        }
    })
    .into_owned()
}

fn input_pattern() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| match Regex::new(r"\$\{\{\s*inputs?\.(\w+)\s*\}\}") {
        Ok(re) => Some(re),
        Err(err) => {
            warn!(error = %err, "failed to compile input placeholder pattern");
            None
        }
    })
    .as_ref()
}

/// Evaluate a plugin step condition.
///
/// The grammar is deliberately minimal: one `==` or `!=` comparison whose
/// operands may be quoted literals or substituted placeholders. Anything
/// else is truthy unless it is empty, `false` or `0`.
pub fn evaluate_condition(
    condition: &str,
    inputs: &BTreeMap<String, String>,
    vars: &Variables,
) -> bool {
    if condition.trim().is_empty() {
        return true;
    }

    let mut cond = substitute_inputs(condition, inputs);
    cond = substitute(&cond, vars);

    let cond = cond
        .trim()
        .trim_start_matches("${{")
        .trim_end_matches("}}")
        .trim();

    if let Some((left, right)) = cond.split_once("==") {
        return trim_operand(left) == trim_operand(right);
    }
    if let Some((left, right)) = cond.split_once("!=") {
        return trim_operand(left) != trim_operand(right);
    }

    let cond = cond.to_lowercase();
    !cond.is_empty() && cond != "false" && cond != "0"
}

fn trim_operand(s: &str) -> &str {
    s.trim().trim_matches(|c| c == '\'' || c == '"')
}

/// Merge environment maps with precedence (low to high):
/// workflow env, plugin env, step env.
pub fn merge_environment(
    workflow_env: &BTreeMap<String, String>,
    plugin_env: &BTreeMap<String, String>,
    step_env: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = BTreeMap::new();
    for (k, v) in workflow_env {
        merged.insert(k.clone(), v.clone());
    }
    for (k, v) in plugin_env {
        merged.insert(k.clone(), v.clone());
    }
    for (k, v) in step_env {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

/// Verify that every declared dependency resolves on `PATH`.
///
/// Entries may carry a version constraint (`ffmpeg>=6`); only the command
/// part is checked.
pub fn validate_dependencies(dependencies: &[String]) -> Result<(), DependencyMissing> {
    for dep in dependencies {
        let command = dep
            .split(['>', '<', '='])
            .next()
            .unwrap_or_default()
            .trim();
        if command.is_empty() {
            continue;
        }
        if !find_on_path(command) {
            return Err(DependencyMissing {
                command: command.to_string(),
            });
        }
    }
    Ok(())
}

fn find_on_path(command: &str) -> bool {
    if command.contains('/') {
        return Path::new(command).is_file();
    }
    let Some(path_var) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path_var).any(|dir| dir.join(command).is_file())
}
