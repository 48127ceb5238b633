// src/workflow/def.rs

use std::collections::BTreeMap;

use serde::Deserialize;
use thiserror::Error;

/// Error kind for workflow and plugin definition parsing.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{0}")]
    Invalid(String),

    #[error("invalid plugin reference '{0}'")]
    PluginReference(String),

    #[error("required input '{0}' is missing")]
    MissingInput(String),
}

/// A parsed and validated workflow definition.
///
/// ```yaml
/// name: photos-to-webp
/// on:
///   paths: ["/data/incoming"]
/// convert: { from: jpg, to: webp }
/// steps:
///   - name: convert
///     run: "cwebp '${{ input_path }}' -o '${{ output_path }}'"
/// options:
///   file_glob: "*.jpg|*.jpeg"
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowDef {
    pub name: String,
    pub description: String,
    /// Trigger paths from `on.paths`.
    pub paths: Vec<String>,
    pub convert: ConvertConfig,
    /// Workflow-level environment, applied to every step.
    pub env: BTreeMap<String, String>,
    pub steps: Vec<Step>,
    pub options: Options,
}

/// `convert:` section; drives the default output path.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ConvertConfig {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
}

/// `options:` section.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Options {
    /// Advisory per-workflow concurrency; the executor pool size is the
    /// process-wide ceiling.
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,

    #[serde(default)]
    pub include_subdirs: bool,

    #[serde(default = "default_file_glob")]
    pub file_glob: String,

    #[serde(default = "default_skip_on_nochange")]
    pub skip_on_nochange: bool,

    /// Output directory, either literal or relative (`.`/`..` prefix) to the
    /// input file's directory.
    #[serde(default)]
    pub output_dir_pattern: Option<String>,

    #[serde(default)]
    pub ignore: Vec<String>,
}

fn default_concurrency() -> u32 {
    4
}

fn default_file_glob() -> String {
    "*".to_string()
}

fn default_skip_on_nochange() -> bool {
    true
}

impl Default for Options {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            include_subdirs: false,
            file_glob: default_file_glob(),
            skip_on_nochange: default_skip_on_nochange(),
            output_dir_pattern: None,
            ignore: Vec::new(),
        }
    }
}

/// One validated workflow step.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub name: String,
    pub kind: StepKind,
    /// Per-step environment; wins over workflow env on conflict.
    pub env: BTreeMap<String, String>,
}

/// The run/uses discriminator: a step either runs a shell command or
/// expands a plugin reference.
#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    Run {
        command: String,
    },
    Uses {
        /// `NAME`, `NAME@vX.Y.Z` or `NAME@X.Y.Z`.
        reference: String,
        /// Caller-provided plugin inputs.
        with: BTreeMap<String, String>,
    },
}

/// Raw YAML shape, before validation.
#[derive(Debug, Deserialize)]
struct RawWorkflow {
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    on: RawOn,
    #[serde(default)]
    convert: ConvertConfig,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    steps: Vec<RawStep>,
    #[serde(default)]
    options: Options,
}

#[derive(Debug, Default, Deserialize)]
struct RawOn {
    #[serde(default)]
    paths: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawStep {
    #[serde(default)]
    name: String,
    #[serde(default)]
    run: Option<String>,
    #[serde(default)]
    uses: Option<String>,
    #[serde(default)]
    with: BTreeMap<String, String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

/// Parse a workflow definition from YAML source and validate it.
pub fn parse(source: &str) -> Result<WorkflowDef, ParseError> {
    let raw: RawWorkflow = serde_yaml::from_str(source)?;

    let mut options = raw.options;
    if options.file_glob.trim().is_empty() {
        options.file_glob = default_file_glob();
    }

    let mut steps = Vec::with_capacity(raw.steps.len());
    for (i, step) in raw.steps.into_iter().enumerate() {
        steps.push(convert_step(i, step)?);
    }

    let def = WorkflowDef {
        name: raw.name,
        description: raw.description,
        paths: raw.on.paths,
        convert: raw.convert,
        env: raw.env,
        steps,
        options,
    };

    validate(&def)?;
    Ok(def)
}

fn convert_step(index: usize, raw: RawStep) -> Result<Step, ParseError> {
    let position = index + 1;
    if raw.name.trim().is_empty() {
        return Err(ParseError::Invalid(format!(
            "step {position}: name is required"
        )));
    }

    let kind = match (raw.run, raw.uses) {
        (Some(run), None) if !run.trim().is_empty() => StepKind::Run { command: run },
        (None, Some(uses)) if !uses.trim().is_empty() => StepKind::Uses {
            reference: uses,
            with: raw.with,
        },
        (Some(_), Some(_)) => {
            return Err(ParseError::Invalid(format!(
                "step {position} ('{}'): 'run' and 'uses' are mutually exclusive",
                raw.name
            )));
        }
        _ => {
            return Err(ParseError::Invalid(format!(
                "step {position} ('{}'): either 'run' or 'uses' is required",
                raw.name
            )));
        }
    };

    Ok(Step {
        name: raw.name,
        kind,
        env: raw.env,
    })
}

/// Validate a workflow definition.
///
/// Rejects: empty or non-identifier name, zero trigger paths, zero steps,
/// concurrency below 1. Step-level shape errors are caught during [`parse`].
pub fn validate(def: &WorkflowDef) -> Result<(), ParseError> {
    if def.name.is_empty() {
        return Err(ParseError::Invalid("workflow name is required".to_string()));
    }
    if !is_identifier(&def.name) {
        return Err(ParseError::Invalid(format!(
            "workflow name '{}' must contain only alphanumeric characters, hyphens, and underscores",
            def.name
        )));
    }
    if def.paths.is_empty() {
        return Err(ParseError::Invalid(
            "at least one path must be specified in 'on.paths'".to_string(),
        ));
    }
    if def.steps.is_empty() {
        return Err(ParseError::Invalid(
            "at least one step is required".to_string(),
        ));
    }
    if def.options.concurrency < 1 {
        return Err(ParseError::Invalid(
            "concurrency must be at least 1".to_string(),
        ));
    }
    Ok(())
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
