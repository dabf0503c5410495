//! Schema deployment engine.
//!
//! Given a connection source and a deployment package, deploys structure and
//! data into a named database. Two strategies, chosen per database spec:
//!
//! - **Engine-driven**: hand the package to the SqlPackage CLI
//!   (`/Action:Publish`, create-if-missing / upgrade-if-existing), streaming
//!   its diagnostics to the log.
//! - **Rapid** ([`rapid`]): drop and recreate the database, then replay the
//!   package's model script with dependency-safe statement ordering. Much
//!   faster for iterative test runs.
//!
//! Pre-deployment scripts run before structural deployment either way and
//! tolerate the target database not existing yet. Post-deployment scripts
//! run right after, unless the spec defers them to per-test execution.

pub mod artifact;
pub mod batch;
pub mod rapid;
pub mod sqlcmd;

use std::io::{BufRead, BufReader};
use std::process::{Command, Stdio};

use tracing::{debug, info, warn};

use crate::config::DatabaseSpec;
use crate::connection::DbConnection;
use crate::error::ProvisionError;

pub use artifact::DeploymentArtifact;
pub use batch::{classify_statement, split_statements, Statement, StatementKind};

/// Opens connections for the deployment engine: `None` for a server-scoped
/// connection, `Some(name)` for one scoped to a database.
pub type Connector<'a> =
    &'a (dyn Fn(Option<&str>) -> Result<Box<dyn DbConnection>, ProvisionError> + Sync);

/// Deploy one database from its spec: load the package, run the pre-script,
/// deploy structure via the configured strategy, then the post-script unless
/// it is deferred to per-test execution.
pub fn deploy_database(connect: Connector<'_>, spec: &DatabaseSpec) -> Result<(), ProvisionError> {
    let artifact = DeploymentArtifact::load(&spec.artifact_path)?;
    info!(
        database = %spec.name,
        package = artifact.name(),
        rapid = spec.rapid_deploy,
        "deploying database"
    );

    if let Some(pre) = artifact.pre_script() {
        run_pre_script(connect, &spec.name, pre, &spec.sqlcmd_variables)?;
    }

    if spec.rapid_deploy {
        rapid::rapid_deploy(connect, &spec.name, &artifact, &spec.sqlcmd_variables)?;
    } else {
        engine_deploy(connect, &spec.name, &artifact)?;
    }

    if spec.run_post_script_per_test {
        debug!(database = %spec.name, "post-deployment script deferred to per-test execution");
    } else if let Some(post) = artifact.post_script() {
        let mut conn = connect(Some(&spec.name))?;
        execute_script(conn.as_mut(), post, &spec.sqlcmd_variables)?;
        close_quietly(conn);
    }

    Ok(())
}

/// Run the package's post-deployment script against an existing database.
/// Used by providers that re-run the script after each per-test data purge.
pub fn run_post_script(
    connect: Connector<'_>,
    spec: &DatabaseSpec,
) -> Result<(), ProvisionError> {
    let artifact = DeploymentArtifact::load(&spec.artifact_path)?;
    let Some(post) = artifact.post_script() else {
        return Ok(());
    };
    let mut conn = connect(Some(&spec.name))?;
    execute_script(conn.as_mut(), post, &spec.sqlcmd_variables)?;
    close_quietly(conn);
    Ok(())
}

/// The pre-deployment script runs before the target database is guaranteed
/// to exist; when a scoped connection cannot be opened the script runs
/// server-scoped instead, and a failure there is logged, not fatal.
fn run_pre_script(
    connect: Connector<'_>,
    database: &str,
    script: &str,
    variables: &[(String, String)],
) -> Result<(), ProvisionError> {
    let mut conn = match connect(Some(database)) {
        Ok(conn) => conn,
        Err(e) => {
            debug!(database, error = %e, "could not scope pre-deployment connection; database may not exist yet");
            connect(None)?
        }
    };

    if let Err(e) = execute_script(conn.as_mut(), script, variables) {
        warn!(database, error = %e, "pre-deployment script failed; continuing with deployment");
    }
    close_quietly(conn);
    Ok(())
}

/// Execute a multi-batch script: resolve SQLCMD variables, split on GO, run
/// each batch in order.
pub(crate) fn execute_script(
    conn: &mut dyn DbConnection,
    script: &str,
    variables: &[(String, String)],
) -> Result<(), ProvisionError> {
    let resolved = sqlcmd::apply_sqlcmd_variables(script, variables);
    for statement in split_statements(&resolved) {
        conn.execute(&statement.sql)?;
    }
    Ok(())
}

fn close_quietly(conn: Box<dyn DbConnection>) {
    let database = conn.database().to_string();
    if let Err(e) = conn.close() {
        debug!(database = %database, error = %e, "connection close failed");
    }
}

/// Engine-driven deploy: publish the package with the SqlPackage CLI.
fn engine_deploy(
    connect: Connector<'_>,
    database: &str,
    artifact: &DeploymentArtifact,
) -> Result<(), ProvisionError> {
    if artifact.source_path().is_dir() {
        return Err(ProvisionError::ArtifactInvalid {
            path: artifact.source_path().to_path_buf(),
            message: "engine-driven deploy requires a package file; \
                      use rapid_deploy for directory artifacts"
                .to_string(),
        });
    }

    let sqlpackage = sqlpackage_path().ok_or(ProvisionError::SqlPackageNotFound)?;

    // Borrow the provider's connection settings for the CLI's target.
    let probe = connect(None)?;
    let connection_string =
        crate::connection::rescope_connection_string(probe.connection_string(), database);
    close_quietly(probe);

    info!(database, tool = %sqlpackage, "publishing package with SqlPackage");
    let mut child = Command::new(&sqlpackage)
        .arg("/Action:Publish")
        .arg(format!(
            "/SourceFile:{}",
            artifact.source_path().display()
        ))
        .arg(format!("/TargetConnectionString:{}", connection_string))
        .arg("/p:BlockOnPossibleDataLoss=False")
        .arg("/p:CreateNewDatabase=False")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| ProvisionError::EngineDeployFailed {
            database: database.to_string(),
            output: format!("failed to run {}: {}", sqlpackage, e),
        })?;

    // Stream the publisher's progress into the log as it happens.
    if let Some(stdout) = child.stdout.take() {
        for line in BufReader::new(stdout).lines().map_while(Result::ok) {
            if !line.trim().is_empty() {
                info!(database, "sqlpackage: {}", line.trim_end());
            }
        }
    }

    let output = child
        .wait_with_output()
        .map_err(|e| ProvisionError::EngineDeployFailed {
            database: database.to_string(),
            output: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(ProvisionError::EngineDeployFailed {
            database: database.to_string(),
            output: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    Ok(())
}

/// Locate the SqlPackage CLI: PATH first, then the .NET global tool dir.
fn sqlpackage_path() -> Option<String> {
    if Command::new("sqlpackage")
        .arg("/version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
    {
        return Some("sqlpackage".to_string());
    }

    if let Ok(home) = std::env::var("HOME") {
        let dotnet_tool_path = format!("{}/.dotnet/tools/sqlpackage", home);
        if Command::new(&dotnet_tool_path)
            .arg("/version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
        {
            return Some(dotnet_tool_path);
        }
    }

    None
}
