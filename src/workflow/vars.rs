// src/workflow/vars.rs

use std::path::{Path, PathBuf};

use crate::workflow::def::ConvertConfig;

/// The variable binding available inside step commands and env values.
///
/// Placeholder form is `${{ name }}`; placeholders that are not in this set
/// are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Variables {
    pub input_path: String,
    pub output_path: String,
    /// Base name of the input file, extension included.
    pub file_name: String,
    /// Directory containing the input file.
    pub file_dir: String,
    /// Base name without the extension.
    pub file_base: String,
    /// Extension with its leading dot, or empty.
    pub file_ext: String,
}

impl Variables {
    /// Build the binding from an (input, output) path pair.
    pub fn for_paths(input: &Path, output: &Path) -> Self {
        let file_name = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file_dir = input
            .parent()
            .map(|d| d.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file_ext = input
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let file_base = file_name
            .strip_suffix(&file_ext)
            .unwrap_or(&file_name)
            .to_string();

        Self {
            input_path: input.to_string_lossy().into_owned(),
            output_path: output.to_string_lossy().into_owned(),
            file_name,
            file_dir,
            file_base,
            file_ext,
        }
    }
}

/// Replace the documented placeholders in `template`.
///
/// Pure textual replacement; identical inputs always yield identical output.
pub fn substitute(template: &str, vars: &Variables) -> String {
    let replacements = [
        ("${{ input_path }}", vars.input_path.as_str()),
        ("${{ output_path }}", vars.output_path.as_str()),
        ("${{ file_name }}", vars.file_name.as_str()),
        ("${{ file_dir }}", vars.file_dir.as_str()),
        ("${{ file_base }}", vars.file_base.as_str()),
        ("${{ file_ext }}", vars.file_ext.as_str()),
    ];

    let mut result = template.to_string();
    for (placeholder, value) in replacements {
        result = result.replace(placeholder, value);
    }
    result
}

/// Compute the output path for an input file.
///
/// - An `output_dir_pattern` starting with `.` or `..` is resolved relative
///   to the input file's directory; any other pattern is used literally.
/// - An empty `convert.to` preserves the input extension.
pub fn output_path(
    input: &Path,
    convert: &ConvertConfig,
    output_dir_pattern: Option<&str>,
) -> PathBuf {
    let mut dir = input
        .parent()
        .map(|d| d.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));

    let file_name = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = input
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let base = file_name
        .strip_suffix(&ext)
        .unwrap_or(&file_name)
        .to_string();

    if let Some(pattern) = output_dir_pattern.filter(|p| !p.is_empty()) {
        if pattern.starts_with('.') {
            dir = dir.join(pattern);
        } else {
            dir = PathBuf::from(pattern);
        }
    }

    let new_ext = if convert.to.is_empty() {
        ext
    } else {
        format!(".{}", convert.to)
    };

    dir.join(format!("{base}{new_ext}"))
}
