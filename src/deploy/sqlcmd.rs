//! SQLCMD directive processing for deployment scripts.
//!
//! Deployment scripts written for SqlPackage routinely carry SQLCMD
//! directives: `:r` pulls in another file, `:setvar` declares a variable,
//! `$(name)` references one. None of that is valid T-SQL, so scripts must
//! be flattened before they can be executed over a plain connection:
//! includes are expanded at load time and variables are resolved (with
//! per-database overrides from the spec winning over in-script defaults)
//! just before execution.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use encoding_rs::WINDOWS_1252;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::ProvisionError;

/// Matches `:setvar name value` lines, quoted or bare values.
static SETVAR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)^\s*:setvar\s+(\w+)\s+"?([^"\r\n]+)"?\s*$"#).expect("Invalid setvar regex")
});

/// Matches `:r path` or `:r "path with spaces"` lines.
static INCLUDE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)^\s*:r\s+(?:"([^"]+)"|(\S+))\s*$"#).expect("Invalid include regex")
});

/// Matches `$(name)` variable references.
static VAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\((\w+)\)").expect("Invalid variable regex"));

/// Read a script file as text, trying UTF-8 first and falling back to
/// Windows-1252 (SQL files created on Windows are frequently the latter).
/// Strips a UTF-8 BOM when present.
pub(crate) fn read_script_file(path: &Path) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    decode_script_bytes(&bytes)
}

/// Decode raw script bytes with the same UTF-8 → Windows-1252 fallback.
pub(crate) fn decode_script_bytes(bytes: &[u8]) -> std::io::Result<String> {
    let text = match String::from_utf8(bytes.to_vec()) {
        Ok(s) => s,
        Err(_) => {
            let (decoded, _, had_errors) = WINDOWS_1252.decode(bytes);
            if had_errors {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "File contains invalid characters",
                ));
            }
            decoded.into_owned()
        }
    };
    Ok(text.strip_prefix('\u{FEFF}').unwrap_or(&text).to_string())
}

/// Expand all `:r` include directives, resolving relative paths against the
/// including file's directory and refusing circular chains.
pub fn expand_includes(content: &str, source_file: &Path) -> Result<String, ProvisionError> {
    let mut visited = HashSet::new();
    visited.insert(
        source_file
            .canonicalize()
            .unwrap_or_else(|_| source_file.to_path_buf()),
    );
    expand_includes_recursive(content, source_file, &mut visited)
}

fn expand_includes_recursive(
    content: &str,
    source_file: &Path,
    visited: &mut HashSet<PathBuf>,
) -> Result<String, ProvisionError> {
    // In-script :setvar values can appear inside include paths.
    let variables = collect_setvars(content);

    let source_dir = source_file.parent().unwrap_or(Path::new("."));
    let mut result = String::new();
    let mut last_end = 0;

    for caps in INCLUDE_RE.captures_iter(content) {
        let whole = caps.get(0).unwrap();
        result.push_str(&content[last_end..whole.start()]);
        last_end = whole.end();

        let raw_path = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str())
            .unwrap_or("");
        let substituted = substitute(raw_path, &variables);
        // Scripts authored on Windows use backslash separators.
        let normalized = substituted.replace('\\', "/");
        let include_path = Path::new(&normalized);

        let resolved = if include_path.is_absolute() {
            include_path.to_path_buf()
        } else {
            source_dir.join(include_path)
        };

        let canonical =
            resolved
                .canonicalize()
                .map_err(|_| ProvisionError::SqlcmdIncludeNotFound {
                    path: resolved.clone(),
                    source_file: source_file.to_path_buf(),
                })?;

        if visited.contains(&canonical) {
            let chain = visited
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(" -> ");
            return Err(ProvisionError::SqlcmdCircularInclude {
                path: canonical,
                chain,
            });
        }

        let included = read_script_file(&canonical).map_err(|_| {
            ProvisionError::SqlcmdIncludeNotFound {
                path: resolved.clone(),
                source_file: source_file.to_path_buf(),
            }
        })?;

        visited.insert(canonical.clone());
        let expanded = expand_includes_recursive(&included, &canonical, visited)?;
        // The same file may legitimately appear again in a sibling branch.
        visited.remove(&canonical);

        result.push_str(&expanded);
        if !expanded.ends_with('\n') {
            result.push('\n');
        }
    }

    result.push_str(&content[last_end..]);
    Ok(result)
}

/// Resolve SQLCMD variables for execution: collect in-script `:setvar`
/// defaults, overlay `overrides` (the spec's per-database variables win),
/// substitute every `$(name)` reference, and strip the `:setvar` lines
/// themselves since they are not executable T-SQL. Unknown references are
/// left untouched.
pub fn apply_sqlcmd_variables(content: &str, overrides: &[(String, String)]) -> String {
    let mut variables = collect_setvars(content);
    for (name, value) in overrides {
        variables.insert(name.clone(), value.clone());
    }

    let stripped = SETVAR_RE.replace_all(content, "");
    substitute(&stripped, &variables)
}

fn collect_setvars(content: &str) -> HashMap<String, String> {
    let mut variables = HashMap::new();
    for caps in SETVAR_RE.captures_iter(content) {
        let name = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        let value = caps
            .get(2)
            .map(|m| m.as_str().trim_matches('"'))
            .unwrap_or("");
        variables.insert(name.to_string(), value.to_string());
    }
    variables
}

fn substitute(content: &str, variables: &HashMap<String, String>) -> String {
    VAR_RE
        .replace_all(content, |caps: &regex::Captures| {
            let name = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            variables
                .get(name)
                .cloned()
                .unwrap_or_else(|| format!("$({})", name))
        })
        .into_owned()
}
