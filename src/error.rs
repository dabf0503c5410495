//! Error types for rust-dbtest

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while provisioning test databases
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Missing configuration setting `{setting}`: {message}")]
    MissingSetting { setting: String, message: String },

    #[error(
        "Multiple providers declared on test group `{group}` ({providers:?}). \
         Only one provider per group is supported."
    )]
    AmbiguousProvider { group: String, providers: Vec<String> },

    #[error("No provider registered under id `{provider_id}`")]
    UnknownProvider { provider_id: String },

    #[error("SQL Server LocalDB tooling is not installed on this machine (`{tool}` not found)")]
    EngineNotInstalled { tool: String },

    #[error(
        "No allowed LocalDB version is installed. Configured versions: {configured:?}. \
         Installed versions: {installed:?}."
    )]
    NoInstalledVersion {
        configured: Vec<String>,
        installed: Vec<String>,
    },

    #[error("LocalDB instance command `{command}` failed: {output}")]
    InstanceCommandFailed { command: String, output: String },

    #[error("Failed to open a connection to database `{database}`")]
    ConnectionFailed {
        database: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("SQL execution failed against `{database}`: {context}")]
    SqlFailed {
        database: String,
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Failed to read deployment package: {path}")]
    ArtifactReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Deployment package at {path} has no model script")]
    ArtifactMissingModel { path: PathBuf },

    #[error("Invalid deployment package at {path}: {message}")]
    ArtifactInvalid { path: PathBuf, message: String },

    #[error("SQLCMD include file not found: {path} (referenced from {source_file})")]
    SqlcmdIncludeNotFound { path: PathBuf, source_file: PathBuf },

    #[error("Circular SQLCMD include detected: {path} (include chain: {chain})")]
    SqlcmdCircularInclude { path: PathBuf, chain: String },

    #[error(
        "SqlPackage CLI not found in PATH or ~/.dotnet/tools; required for engine-driven deploys"
    )]
    SqlPackageNotFound,

    #[error("SqlPackage deploy of `{database}` failed:\n{output}")]
    EngineDeployFailed { database: String, output: String },

    #[error(
        "Rapid deploy of `{database}` stalled in round {round}: no table statement made progress. \
         {remaining} statement(s) unresolvable, first failure: {first_error}"
    )]
    FixpointStalled {
        database: String,
        round: usize,
        remaining: usize,
        first_error: String,
    },

    #[error("Slot `{slot}` rejected a `{shape}` binding: {message}")]
    SlotBindingFailed {
        slot: String,
        shape: String,
        message: String,
    },

    #[error("{phase} failed for {failed} database(s): {summary}")]
    FanOutFailed {
        phase: String,
        failed: usize,
        summary: String,
    },
}
