//! The database provider contract.
//!
//! A provider knows how to bring one kind of database engine to readiness:
//! make sure a server instance exists and is running, deploy a named
//! database's schema, reset its data between tests, and open connections
//! scoped to it. [`sqlserver::SqlServerProvider`] is the built-in
//! implementation; anything implementing [`DatabaseProvider`] can be
//! registered under an id and selected from configuration.

pub mod sqlserver;

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::DatabaseSpec;
use crate::connection::DbConnection;
use crate::error::ProvisionError;

/// A pluggable backend for one database engine.
///
/// Implementations must be safe to call from multiple threads: group-setup
/// fans `setup_database` out over independent databases when parallel
/// initialisation is enabled, and `initialise_server` must be idempotent so
/// redundant calls against an already-running instance are harmless.
pub trait DatabaseProvider: Send + Sync {
    /// Idempotently ensure the target server instance exists and is running.
    fn initialise_server(&self) -> Result<(), ProvisionError>;

    /// Deploy the named database's schema from its deployment package.
    fn setup_database(&self, spec: &DatabaseSpec) -> Result<(), ProvisionError>;

    /// Open a connection scoped to `database`, or to the server's default
    /// database when `None` (used by the deployment engine before the target
    /// database exists).
    fn open_connection(
        &self,
        database: Option<&str>,
    ) -> Result<Box<dyn DbConnection>, ProvisionError>;

    /// Reset the database to a clean state before a test: purge all
    /// user-table data and, when the spec asks for it, re-run the package's
    /// post-deployment script.
    fn execute_pre_test_tasks(&self, spec: &DatabaseSpec) -> Result<(), ProvisionError>;
}

/// Providers available to the orchestrator, keyed by id.
///
/// Instantiation is the caller's concern; the registry is just the lookup
/// the orchestrator resolves configured provider ids through.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn DatabaseProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        mut self,
        provider_id: impl Into<String>,
        provider: Arc<dyn DatabaseProvider>,
    ) -> Self {
        self.providers.insert(provider_id.into(), provider);
        self
    }

    pub fn get(&self, provider_id: &str) -> Result<Arc<dyn DatabaseProvider>, ProvisionError> {
        self.providers
            .get(provider_id)
            .cloned()
            .ok_or_else(|| ProvisionError::UnknownProvider {
                provider_id: provider_id.to_string(),
            })
    }
}
