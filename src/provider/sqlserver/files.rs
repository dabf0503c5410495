//! Physical/logical reconciliation for file-backed databases.
//!
//! When a database is configured with a data directory, the logical database
//! inside the server and the .mdf file on disk can drift apart between test
//! runs (a deleted file under a still-registered database, or a leftover
//! file from a previous run with no database attached). Reconciliation maps
//! each of the four `{logical, physical}` combinations to exactly one
//! action before deployment proceeds.

use std::path::Path;

use tracing::debug;

use crate::connection::DbConnection;
use crate::error::ProvisionError;
use crate::util::{quote_ident, quote_literal};

/// Action taken for a `{logical_exists, physical_exists}` combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Logical missing, file present: attach the existing file.
    Attach,
    /// Neither exists: create the database and its backing file.
    CreateNew,
    /// Logical present, file missing: discard the logical database, then
    /// create fresh.
    DetachAndCreate,
    /// Both present and agreeing: nothing to do.
    NoOp,
}

/// The reconciliation table. Pure so the mapping itself is testable.
pub fn plan_reconcile(logical_exists: bool, physical_exists: bool) -> ReconcileAction {
    match (logical_exists, physical_exists) {
        (false, true) => ReconcileAction::Attach,
        (false, false) => ReconcileAction::CreateNew,
        (true, false) => ReconcileAction::DetachAndCreate,
        (true, true) => ReconcileAction::NoOp,
    }
}

/// Bring the logical database and its backing file into agreement.
///
/// `conn` must be a server-scoped connection (not scoped to `database`,
/// which may not exist yet). Returns the action that was applied.
pub fn reconcile_file_backed(
    conn: &mut dyn DbConnection,
    database: &str,
    data_file: &Path,
) -> Result<ReconcileAction, ProvisionError> {
    let logical_exists = logical_database_exists(conn, database)?;
    let physical_exists = data_file.exists();

    let action = plan_reconcile(logical_exists, physical_exists);
    debug!(
        database,
        logical_exists, physical_exists, ?action, "reconciling file-backed database"
    );

    let file_literal = quote_literal(&data_file.display().to_string());
    match action {
        ReconcileAction::Attach => {
            conn.execute(&format!(
                "CREATE DATABASE {} ON (FILENAME = {}) FOR ATTACH",
                quote_ident(database),
                file_literal
            ))?;
        }
        ReconcileAction::CreateNew => {
            conn.execute(&format!(
                "CREATE DATABASE {} ON (NAME = {}, FILENAME = {})",
                quote_ident(database),
                quote_literal(database),
                file_literal
            ))?;
        }
        ReconcileAction::DetachAndCreate => {
            conn.execute(&format!(
                "ALTER DATABASE {} SET SINGLE_USER WITH ROLLBACK IMMEDIATE; \
                 EXEC sp_detach_db {}",
                quote_ident(database),
                quote_literal(database)
            ))?;
            conn.execute(&format!(
                "CREATE DATABASE {} ON (NAME = {}, FILENAME = {})",
                quote_ident(database),
                quote_literal(database),
                file_literal
            ))?;
        }
        ReconcileAction::NoOp => {}
    }

    Ok(action)
}

/// Whether `database` is registered in sys.databases.
pub fn logical_database_exists(
    conn: &mut dyn DbConnection,
    database: &str,
) -> Result<bool, ProvisionError> {
    let found = conn.query_scalar(&format!(
        "SELECT name FROM sys.databases WHERE name = {}",
        quote_literal(database)
    ))?;
    Ok(found.is_some())
}
