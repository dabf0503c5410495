//! Rapid deploy: re-execute the package's model script directly.
//!
//! Instead of handing the package to SqlPackage, the model script is split
//! into statements and replayed against a freshly recreated database.
//! Statement order inside the script is not reliable for interdependent
//! tables, and there is no dependency graph to consult, so table creation
//! retries until a fixpoint: every round attempts all pending statements in
//! original order, deferring failures to the next round; a round that
//! creates nothing means the remainder is unresolvable and the deploy
//! fails. N statements converge in at most N rounds.

use tracing::{debug, info, warn};

use super::artifact::DeploymentArtifact;
use super::batch::{split_statements, Statement, StatementKind};
use super::sqlcmd::apply_sqlcmd_variables;
use super::Connector;
use crate::error::ProvisionError;
use crate::util::quote_ident;

/// Drop, recreate and repopulate `database` from the artifact's model
/// script. The artifact's scratch directory is deleted when the artifact is
/// dropped, whatever the outcome here.
pub fn rapid_deploy(
    connect: Connector<'_>,
    database: &str,
    artifact: &DeploymentArtifact,
    variables: &[(String, String)],
) -> Result<(), ProvisionError> {
    let mut server = connect(None)?;

    // Knock off any sessions still attached to a previous incarnation.
    info!(database, "rapid deploy: recreating database");
    server.execute(&format!(
        "IF EXISTS (SELECT 1 FROM sys.databases WHERE name = N'{db}') \
         BEGIN \
             ALTER DATABASE {qdb} SET SINGLE_USER WITH ROLLBACK IMMEDIATE; \
             DROP DATABASE {qdb}; \
         END",
        db = database.replace('\'', "''"),
        qdb = quote_ident(database)
    ))?;
    server.execute(&format!("CREATE DATABASE {}", quote_ident(database)))?;
    if let Err(e) = server.close() {
        debug!(database, error = %e, "server connection close failed");
    }

    let model = apply_sqlcmd_variables(artifact.model_script(), variables);
    let statements = split_statements(&model);
    debug!(
        database,
        statements = statements.len(),
        "split model script"
    );

    let mut conn = connect(Some(database))?;

    // Parents before dependents, by DDL kind.
    for kind in [
        StatementKind::Filegroup,
        StatementKind::Schema,
        StatementKind::Type,
    ] {
        for stmt in statements.iter().filter(|s| s.kind == kind) {
            conn.execute(&stmt.sql)?;
        }
    }

    let tables: Vec<&Statement> = statements
        .iter()
        .filter(|s| s.kind == StatementKind::Table)
        .collect();
    create_tables_until_fixpoint(conn.as_mut(), database, tables)?;

    // Logins are server-scoped and commonly pre-exist; failures are logged
    // and swallowed.
    for stmt in statements.iter().filter(|s| s.kind == StatementKind::Login) {
        if let Err(e) = conn.execute(&stmt.sql) {
            warn!(database, line = stmt.start_line, error = %e, "login creation failed");
        }
    }

    for stmt in statements.iter().filter(|s| s.kind == StatementKind::Other) {
        conn.execute(&stmt.sql)?;
    }

    if let Err(e) = conn.close() {
        debug!(database, error = %e, "deploy connection close failed");
    }

    info!(database, "rapid deploy complete");
    Ok(())
}

/// Retry-until-fixpoint table creation. Any statement that fails (typically
/// because a referenced table does not exist yet) is deferred to the next
/// round; a full round with zero progress is fatal.
fn create_tables_until_fixpoint(
    conn: &mut dyn crate::connection::DbConnection,
    database: &str,
    mut pending: Vec<&Statement>,
) -> Result<(), ProvisionError> {
    let mut round = 0;

    while !pending.is_empty() {
        round += 1;
        let attempted = pending.len();
        let mut deferred = Vec::new();
        let mut last_error = None;

        for stmt in pending {
            match conn.execute(&stmt.sql) {
                Ok(()) => {}
                Err(e) => {
                    debug!(
                        database,
                        round,
                        line = stmt.start_line,
                        error = %e,
                        "table statement deferred"
                    );
                    last_error = Some(e);
                    deferred.push(stmt);
                }
            }
        }

        let created = attempted - deferred.len();
        info!(
            database,
            round,
            created,
            remaining = deferred.len(),
            "table creation round finished"
        );

        if created == 0 {
            return Err(ProvisionError::FixpointStalled {
                database: database.to_string(),
                round,
                remaining: deferred.len(),
                first_error: last_error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
            });
        }

        pending = deferred;
    }

    Ok(())
}
