//! Blocking database connections.
//!
//! The provider contract is synchronous: every deployment statement and
//! pre-test reset is a blocking call with no timeout imposed here. tiberius
//! is an async client, so the crate owns one shared multi-thread tokio
//! runtime and parks on it for the duration of each call.

use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;
use tiberius::{Client, Config};
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use crate::error::ProvisionError;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Shared runtime backing all blocking SQL calls.
static RUNTIME: Lazy<Runtime> = Lazy::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("failed to build tokio runtime for SQL connections")
});

pub(crate) fn runtime() -> &'static Runtime {
    &RUNTIME
}

/// An open, blocking database connection.
///
/// This is the seam the deployment engine, the binding resolver and the
/// orchestrator work against; production code uses [`SqlServerConnection`],
/// tests substitute scripted fakes.
pub trait DbConnection: Send {
    /// Execute a batch of SQL, discarding any result sets.
    fn execute(&mut self, sql: &str) -> Result<(), ProvisionError>;

    /// Execute a query and return the first column of the first row as text,
    /// or `None` for an empty result. Callers CAST non-character columns.
    fn query_scalar(&mut self, sql: &str) -> Result<Option<String>, ProvisionError>;

    /// The database this connection is scoped to.
    fn database(&self) -> &str;

    /// A connection string another client could use to reach the same
    /// database.
    fn connection_string(&self) -> &str;

    /// Close the connection, flushing any protocol goodbye.
    fn close(self: Box<Self>) -> Result<(), ProvisionError>;
}

/// A live connection handed to a test object, with its lifetime owned by
/// the test session.
///
/// The session keeps a clone of every handle it opens and closes the
/// underlying connection exactly once at test-teardown; the handle in the
/// test object's slot goes inert at that point. Using a handle after
/// teardown is an error, not undefined behavior.
#[derive(Clone)]
pub struct TestConnection {
    database: String,
    connection_string: String,
    inner: Arc<std::sync::Mutex<Option<Box<dyn DbConnection>>>>,
}

impl TestConnection {
    pub(crate) fn track(conn: Box<dyn DbConnection>) -> Self {
        Self {
            database: conn.database().to_string(),
            connection_string: conn.connection_string().to_string(),
            inner: Arc::new(std::sync::Mutex::new(Some(conn))),
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().map(|g| g.is_some()).unwrap_or(false)
    }

    pub fn execute(&self, sql: &str) -> Result<(), ProvisionError> {
        let mut guard = self.inner.lock().expect("connection mutex poisoned");
        match guard.as_mut() {
            Some(conn) => conn.execute(sql),
            None => Err(self.closed_error()),
        }
    }

    pub fn query_scalar(&self, sql: &str) -> Result<Option<String>, ProvisionError> {
        let mut guard = self.inner.lock().expect("connection mutex poisoned");
        match guard.as_mut() {
            Some(conn) => conn.query_scalar(sql),
            None => Err(self.closed_error()),
        }
    }

    /// Close the underlying connection. Subsequent closes are no-ops, so the
    /// session and a slot clone can never double-close.
    pub(crate) fn close(&self) -> Result<(), ProvisionError> {
        let conn = self.inner.lock().expect("connection mutex poisoned").take();
        match conn {
            Some(conn) => conn.close(),
            None => Ok(()),
        }
    }

    fn closed_error(&self) -> ProvisionError {
        ProvisionError::SqlFailed {
            database: self.database.clone(),
            context: "connection was closed by test teardown".to_string(),
            source: "connection closed".into(),
        }
    }
}

impl fmt::Debug for TestConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestConnection")
            .field("database", &self.database)
            .field("open", &self.is_open())
            .finish()
    }
}

/// A zero-argument callable that opens a fresh connection on demand.
///
/// Connections opened through a factory are not tracked by the test session;
/// the code invoking the factory owns the connection it gets back.
#[derive(Clone)]
pub struct ConnectionFactory {
    database: String,
    opener: Arc<dyn Fn() -> Result<Box<dyn DbConnection>, ProvisionError> + Send + Sync>,
}

impl ConnectionFactory {
    pub fn new(
        database: impl Into<String>,
        opener: impl Fn() -> Result<Box<dyn DbConnection>, ProvisionError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            database: database.into(),
            opener: Arc::new(opener),
        }
    }

    /// The database new connections will be scoped to.
    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn open(&self) -> Result<Box<dyn DbConnection>, ProvisionError> {
        (self.opener)()
    }
}

impl fmt::Debug for ConnectionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionFactory")
            .field("database", &self.database)
            .finish_non_exhaustive()
    }
}

type SqlClient = Client<Compat<TcpStream>>;

/// A blocking connection to SQL Server, backed by tiberius.
pub struct SqlServerConnection {
    client: SqlClient,
    database: String,
    connection_string: String,
}

impl SqlServerConnection {
    /// Open a connection described by an ADO.NET-style connection string,
    /// optionally rescoped to `database`.
    pub fn open(ado_string: &str, database: Option<&str>) -> Result<Self, ProvisionError> {
        let mut config =
            Config::from_ado_string(ado_string).map_err(|e| ProvisionError::ConnectionFailed {
                database: database.unwrap_or("master").to_string(),
                source: Box::new(e),
            })?;

        let database = database.map(str::to_string).unwrap_or_else(|| "master".to_string());
        config.database(&database);

        let connection_string = rescope_connection_string(ado_string, &database);

        let client = runtime()
            .block_on(async {
                let tcp = TcpStream::connect(config.get_addr()).await?;
                tcp.set_nodelay(true)?;
                let client = Client::connect(config, tcp.compat_write()).await?;
                Ok::<SqlClient, BoxError>(client)
            })
            .map_err(|source| ProvisionError::ConnectionFailed {
                database: database.clone(),
                source,
            })?;

        Ok(Self {
            client,
            database,
            connection_string,
        })
    }
}

impl DbConnection for SqlServerConnection {
    fn execute(&mut self, sql: &str) -> Result<(), ProvisionError> {
        runtime()
            .block_on(async {
                let stream = self.client.simple_query(sql).await?;
                stream.into_results().await?;
                Ok::<(), BoxError>(())
            })
            .map_err(|source| ProvisionError::SqlFailed {
                database: self.database.clone(),
                context: first_line(sql),
                source,
            })
    }

    fn query_scalar(&mut self, sql: &str) -> Result<Option<String>, ProvisionError> {
        runtime()
            .block_on(async {
                let row = self.client.simple_query(sql).await?.into_row().await?;
                Ok::<Option<String>, BoxError>(
                    row.and_then(|r| r.get::<&str, _>(0).map(str::to_string)),
                )
            })
            .map_err(|source| ProvisionError::SqlFailed {
                database: self.database.clone(),
                context: first_line(sql),
                source,
            })
    }

    fn database(&self) -> &str {
        &self.database
    }

    fn connection_string(&self) -> &str {
        &self.connection_string
    }

    fn close(self: Box<Self>) -> Result<(), ProvisionError> {
        let this = *self;
        runtime()
            .block_on(this.client.close())
            .map_err(|source| ProvisionError::SqlFailed {
                database: this.database,
                context: "close".to_string(),
                source: Box::new(source),
            })
    }
}

/// Rewrite the `Database`/`Initial Catalog` entry of an ADO.NET connection
/// string so the copy handed to test code targets the bound database.
pub(crate) fn rescope_connection_string(ado_string: &str, database: &str) -> String {
    let mut parts: Vec<String> = ado_string
        .split(';')
        .filter(|part| {
            let key = part.split('=').next().unwrap_or("").trim();
            !part.trim().is_empty()
                && !key.eq_ignore_ascii_case("Database")
                && !key.eq_ignore_ascii_case("Initial Catalog")
        })
        .map(str::to_string)
        .collect();
    parts.push(format!("Database={}", database));
    parts.join(";")
}

/// First line of a SQL batch, for error context.
fn first_line(sql: &str) -> String {
    let line = sql.trim_start().lines().next().unwrap_or("").trim();
    if line.len() > 120 {
        format!("{}...", &line[..120])
    } else {
        line.to_string()
    }
}
