// src/workflow/matcher.rs

use std::path::Path;

use globset::Glob;

/// Check whether a file matches the workflow's glob expression.
///
/// The expression may contain multiple alternatives separated by `,` or `|`
/// (e.g. `"*.jpg,*.jpeg"` or `"*.jpg|*.jpeg"`); a file matches if its base
/// name matches any alternative. Invalid patterns count as non-matches.
pub fn matches_file_glob(file_path: &Path, glob_expr: &str) -> bool {
    let file_name = match file_path.file_name() {
        Some(name) => name.to_string_lossy(),
        None => return false,
    };

    for pattern in glob_expr.split([',', '|']) {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            continue;
        }
        match Glob::new(pattern) {
            Ok(glob) => {
                if glob.compile_matcher().is_match(file_name.as_ref()) {
                    return true;
                }
            }
            Err(_) => continue,
        }
    }

    false
}

/// Check whether a file path matches any ignore pattern.
///
/// Each pattern is tested as:
/// - a glob against the base name (e.g. `*.tmp`, `.DS_Store`),
/// - a glob against the forward-slash-normalized full path
///   (e.g. `**/temp/**`, `build/cache/*`),
/// - a literal equality check against each path segment (e.g. `.git`,
///   `node_modules`).
///
/// A pattern containing `**` additionally acts as a path-containment check
/// against each of its non-wildcard components.
pub fn matches_ignore(file_path: &Path, patterns: &[String]) -> bool {
    if patterns.is_empty() {
        return false;
    }

    let normalized = file_path.to_string_lossy().replace('\\', "/");
    let file_name = file_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    for pattern in patterns {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            continue;
        }

        if pattern.contains("**") || pattern.contains('/') {
            if glob_matches(pattern, &normalized) {
                return true;
            }

            if pattern.contains("**") {
                for component in pattern.split('/') {
                    if component.is_empty() || component == "**" {
                        continue;
                    }
                    if normalized.contains(component) {
                        return true;
                    }
                }
            }
        } else {
            if glob_matches(pattern, &file_name) {
                return true;
            }

            if normalized.split('/').any(|segment| segment == pattern) {
                return true;
            }
        }
    }

    false
}

fn glob_matches(pattern: &str, candidate: &str) -> bool {
    match Glob::new(pattern) {
        Ok(glob) => glob.compile_matcher().is_match(candidate),
        Err(_) => false,
    }
}
