//! SQL Server database provider.
//!
//! Targets either a managed LocalDB instance (created, repaired and started
//! on demand through the `sqllocaldb` tooling) or an externally managed
//! server reached through a caller-supplied connection string.

pub mod files;
pub mod instance;

use std::path::PathBuf;

use tracing::{debug, info};

use crate::config::DatabaseSpec;
use crate::connection::{DbConnection, SqlServerConnection};
use crate::deploy;
use crate::error::ProvisionError;
use crate::provider::DatabaseProvider;

/// How the provider reaches its server.
#[derive(Debug, Clone)]
pub enum ServerInstance {
    /// A locally managed LocalDB instance, created if necessary.
    LocalInstance {
        name: String,
        /// Engine versions acceptable for a newly created instance,
        /// matched in descending order. Empty means "latest installed".
        allowed_versions: Vec<String>,
    },
    /// An externally managed server; assumed ready, never initialised here.
    ConnectionString(String),
}

/// Provider-specific settings for [`SqlServerProvider`].
#[derive(Debug, Clone)]
pub struct SqlServerSettings {
    pub instance: ServerInstance,
    /// When set, engine-deployed databases are file-backed under this
    /// directory and reconciled against their .mdf before deployment.
    pub data_directory: Option<PathBuf>,
}

impl SqlServerSettings {
    pub fn local_instance(name: impl Into<String>) -> Self {
        Self {
            instance: ServerInstance::LocalInstance {
                name: name.into(),
                allowed_versions: Vec::new(),
            },
            data_directory: None,
        }
    }

    pub fn connection_string(ado_string: impl Into<String>) -> Self {
        Self {
            instance: ServerInstance::ConnectionString(ado_string.into()),
            data_directory: None,
        }
    }

    pub fn with_allowed_versions(mut self, versions: Vec<String>) -> Self {
        if let ServerInstance::LocalInstance {
            allowed_versions, ..
        } = &mut self.instance
        {
            *allowed_versions = versions;
        }
        self
    }

    pub fn with_data_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_directory = Some(dir.into());
        self
    }
}

/// The built-in SQL Server implementation of [`DatabaseProvider`].
pub struct SqlServerProvider {
    settings: SqlServerSettings,
}

impl SqlServerProvider {
    /// Conventional registry id for this provider.
    pub const PROVIDER_ID: &'static str = "sqlserver";

    pub fn new(settings: SqlServerSettings) -> Self {
        Self { settings }
    }

    /// The ADO.NET-style connection string for server-scoped connections.
    fn ado_string(&self) -> Result<String, ProvisionError> {
        match &self.settings.instance {
            ServerInstance::ConnectionString(s) if s.trim().is_empty() => {
                Err(ProvisionError::MissingSetting {
                    setting: "connection_string".to_string(),
                    message: "connection string mode requires a non-empty connection string"
                        .to_string(),
                })
            }
            ServerInstance::ConnectionString(s) => Ok(s.clone()),
            ServerInstance::LocalInstance { name, .. } if name.trim().is_empty() => {
                Err(ProvisionError::MissingSetting {
                    setting: "local_instance_name".to_string(),
                    message: "local instance mode requires an instance name".to_string(),
                })
            }
            ServerInstance::LocalInstance { name, .. } => Ok(format!(
                "Server=(localdb)\\{};Integrated Security=SSPI;TrustServerCertificate=true",
                name
            )),
        }
    }

    /// Purge all user-table data: disable constraints, delete every row,
    /// re-enable with CHECK, then reseed identities. A table whose identity
    /// was never used gets a bare RESEED (a `RESEED, 0` there would make the
    /// first insert start at 0 instead of the seed).
    const PURGE_SQL: &'static str = r#"
        EXEC sp_MSForEachTable "SET QUOTED_IDENTIFIER ON; ALTER TABLE ? NOCHECK CONSTRAINT all;"
        EXEC sp_MSForEachTable "SET QUOTED_IDENTIFIER ON; DELETE FROM ?"
        EXEC sp_MSForEachTable "SET QUOTED_IDENTIFIER ON; ALTER TABLE ? WITH CHECK CHECK CONSTRAINT all"
        EXEC sp_MSForEachTable "IF OBJECTPROPERTY(object_id('?'), 'TableHasIdentity') = 1 BEGIN IF IDENT_CURRENT('?') IS NULL DBCC CHECKIDENT ('?', RESEED) ELSE DBCC CHECKIDENT ('?', RESEED, 0) END"
    "#;
}

impl DatabaseProvider for SqlServerProvider {
    fn initialise_server(&self) -> Result<(), ProvisionError> {
        match &self.settings.instance {
            ServerInstance::LocalInstance {
                name,
                allowed_versions,
            } => {
                if name.trim().is_empty() {
                    return Err(ProvisionError::MissingSetting {
                        setting: "local_instance_name".to_string(),
                        message: "local instance mode requires an instance name".to_string(),
                    });
                }
                info!(instance = %name, "initialising LocalDB instance");
                instance::ensure_instance(name, allowed_versions)
            }
            ServerInstance::ConnectionString(_) => {
                // External server; readiness is the environment's problem.
                debug!("connection string mode; skipping server initialisation");
                Ok(())
            }
        }
    }

    fn setup_database(&self, spec: &DatabaseSpec) -> Result<(), ProvisionError> {
        // File-backed databases agree with their .mdf before the engine
        // deploys into them. Rapid deploys recreate from nothing instead.
        if !spec.rapid_deploy {
            if let Some(dir) = &self.settings.data_directory {
                let mut conn = self.open_connection(None)?;
                let mdf = dir.join(format!("{}.mdf", spec.name));
                files::reconcile_file_backed(conn.as_mut(), &spec.name, &mdf)?;
                if let Err(e) = conn.close() {
                    debug!(database = %spec.name, error = %e, "connection close failed");
                }
            }
        }

        let connect = |db: Option<&str>| self.open_connection(db);
        deploy::deploy_database(&connect, spec)
    }

    fn open_connection(
        &self,
        database: Option<&str>,
    ) -> Result<Box<dyn DbConnection>, ProvisionError> {
        let ado = self.ado_string()?;
        Ok(Box::new(SqlServerConnection::open(&ado, database)?))
    }

    fn execute_pre_test_tasks(&self, spec: &DatabaseSpec) -> Result<(), ProvisionError> {
        debug!(database = %spec.name, "purging database contents");
        let mut conn = self.open_connection(Some(&spec.name))?;
        conn.execute(Self::PURGE_SQL)?;
        if let Err(e) = conn.close() {
            debug!(database = %spec.name, error = %e, "connection close failed");
        }

        if spec.run_post_script_per_test {
            debug!(database = %spec.name, "re-running post-deployment script");
            let connect = |db: Option<&str>| self.open_connection(db);
            deploy::run_post_script(&connect, spec)?;
        }

        Ok(())
    }
}
