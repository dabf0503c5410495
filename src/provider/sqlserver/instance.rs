//! SQL Server LocalDB instance lifecycle.
//!
//! Local instances are managed through the `sqllocaldb` CLI that ships with
//! the LocalDB tooling: `versions` enumerates installed engine versions,
//! `info` probes registered instances, `create`/`start`/`stop`/`delete` do
//! the obvious things. A registered instance whose configuration can no
//! longer be read, or whose backing files are gone, is deleted and recreated
//! from scratch. These are throwaway test instances; discarding their data
//! is the intended behavior, not a general recovery strategy.

use std::io;
use std::process::{Command, Output};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::error::ProvisionError;

const SQLLOCALDB: &str = "sqllocaldb";

/// Observed condition of a registered LocalDB instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceHealth {
    /// Registered, configuration readable, backing files present.
    Healthy,
    /// Not registered at all.
    Absent,
    /// Registered, but the instance reports no engine version: the
    /// registration exists without backing files.
    MissingFiles,
    /// Registered, but probing the instance fails outright.
    Corrupt,
}

/// What `ensure_instance` will do for a given health state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceAction {
    Reuse,
    Create,
    Recreate,
}

/// Map an observed instance state to the reconciliation action.
pub fn plan_instance_action(health: InstanceHealth) -> InstanceAction {
    match health {
        InstanceHealth::Healthy => InstanceAction::Reuse,
        InstanceHealth::Absent => InstanceAction::Create,
        InstanceHealth::MissingFiles | InstanceHealth::Corrupt => InstanceAction::Recreate,
    }
}

/// Idempotently bring the named instance to a running state.
///
/// Fails fast with [`ProvisionError::EngineNotInstalled`] when the LocalDB
/// tooling is missing, and with [`ProvisionError::NoInstalledVersion`] when
/// `allowed_versions` names only versions that are not installed.
pub fn ensure_instance(name: &str, allowed_versions: &[String]) -> Result<(), ProvisionError> {
    let installed = installed_versions()?;

    let health = probe_instance(name)?;
    debug!(instance = name, ?health, "probed LocalDB instance");

    match plan_instance_action(health) {
        InstanceAction::Reuse => {}
        InstanceAction::Create => {
            create_instance(name, allowed_versions, &installed)?;
        }
        InstanceAction::Recreate => {
            warn!(
                instance = name,
                ?health,
                "LocalDB instance is unusable; deleting and recreating it"
            );
            delete_instance(name);
            create_instance(name, allowed_versions, &installed)?;
        }
    }

    start_instance(name)
}

/// Pick the engine version a new instance should be created with.
///
/// No constraint: the latest installed version wins. Otherwise the allowed
/// list is walked in descending order and the first version that is also
/// installed wins; when none is, the error enumerates both sets so the
/// mismatch can be fixed without re-running under a debugger.
pub fn select_version(
    allowed: &[String],
    installed: &[String],
) -> Result<String, ProvisionError> {
    if allowed.is_empty() {
        return installed
            .iter()
            .max_by_key(|v| version_key(v))
            .cloned()
            .ok_or_else(|| ProvisionError::NoInstalledVersion {
                configured: Vec::new(),
                installed: installed.to_vec(),
            });
    }

    let mut ordered = allowed.to_vec();
    ordered.sort_by_key(|v| version_key(v));
    ordered.reverse();

    for candidate in &ordered {
        if installed.iter().any(|i| version_matches(i, candidate)) {
            return Ok(candidate.clone());
        }
    }

    Err(ProvisionError::NoInstalledVersion {
        configured: ordered,
        installed: installed.to_vec(),
    })
}

/// Engine versions installed on this machine.
fn installed_versions() -> Result<Vec<String>, ProvisionError> {
    let stdout = run_checked(&["versions"])?;
    Ok(parse_versions_output(&stdout))
}

fn parse_versions_output(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| extract_version(line))
        .collect()
}

fn extract_version(line: &str) -> Option<String> {
    static PAREN: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"\((\d+(?:\.\d+)+)\)").expect("Invalid version regex"));
    if let Some(caps) = PAREN.captures(line) {
        return Some(caps[1].to_string());
    }
    let trimmed = line.trim();
    static BARE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^\d+(?:\.\d+)+$").expect("Invalid version regex"));
    BARE.is_match(trimmed).then(|| trimmed.to_string())
}

/// Probe a registered instance through `sqllocaldb info <name>`.
fn probe_instance(name: &str) -> Result<InstanceHealth, ProvisionError> {
    let output = run(&["info", name])?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    if !output.status.success() {
        let combined = format!("{}{}", stdout, stderr);
        if crate::util::contains_ci(&combined, "doesn't exist")
            || crate::util::contains_ci(&combined, "does not exist")
        {
            return Ok(InstanceHealth::Absent);
        }
        // Registered but unreadable: the configuration is corrupt.
        return Ok(InstanceHealth::Corrupt);
    }

    Ok(parse_info_output(&stdout))
}

fn parse_info_output(stdout: &str) -> InstanceHealth {
    // `info <name>` reports an empty Version field when the registration has
    // lost its backing files.
    let version = stdout
        .lines()
        .find_map(|line| line.trim().strip_prefix("Version:"))
        .map(str::trim)
        .unwrap_or("");

    if version.is_empty() {
        InstanceHealth::MissingFiles
    } else {
        InstanceHealth::Healthy
    }
}

fn create_instance(
    name: &str,
    allowed_versions: &[String],
    installed: &[String],
) -> Result<(), ProvisionError> {
    let version = select_version(allowed_versions, installed)?;
    info!(instance = name, %version, "creating LocalDB instance");
    run_checked(&["create", name, &version])?;
    Ok(())
}

/// Best-effort stop + delete; failures are logged and swallowed because the
/// follow-up create surfaces anything that actually matters.
fn delete_instance(name: &str) {
    if let Err(e) = run_checked(&["stop", name]) {
        debug!(instance = name, error = %e, "stop before delete failed");
    }
    if let Err(e) = run_checked(&["delete", name]) {
        warn!(instance = name, error = %e, "failed to delete LocalDB instance");
    }
}

fn start_instance(name: &str) -> Result<(), ProvisionError> {
    match run_checked(&["start", name]) {
        Ok(_) => Ok(()),
        // Starting an already-running instance is not a failure.
        Err(ProvisionError::InstanceCommandFailed { output, .. })
            if crate::util::contains_ci(&output, "already") =>
        {
            debug!(instance = name, "instance already running");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn run(args: &[&str]) -> Result<Output, ProvisionError> {
    Command::new(SQLLOCALDB).args(args).output().map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            ProvisionError::EngineNotInstalled {
                tool: SQLLOCALDB.to_string(),
            }
        } else {
            ProvisionError::InstanceCommandFailed {
                command: format!("{} {}", SQLLOCALDB, args.join(" ")),
                output: e.to_string(),
            }
        }
    })
}

fn run_checked(args: &[&str]) -> Result<String, ProvisionError> {
    let output = run(args)?;
    if !output.status.success() {
        return Err(ProvisionError::InstanceCommandFailed {
            command: format!("{} {}", SQLLOCALDB, args.join(" ")),
            output: format!(
                "{}{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            ),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Sortable numeric key for a dotted version string.
fn version_key(version: &str) -> Vec<u32> {
    version
        .split('.')
        .map(|part| part.parse().unwrap_or(0))
        .collect()
}

/// An installed version satisfies a configured one when the configured
/// string is a whole-segment prefix, so `15.0` matches `15.0.4153.1`.
fn version_matches(installed: &str, configured: &str) -> bool {
    let installed_key = version_key(installed);
    let configured_key = version_key(configured);
    configured_key.len() <= installed_key.len()
        && installed_key[..configured_key.len()] == configured_key[..]
}
