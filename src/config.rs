//! Resolved configuration records.
//!
//! All values here are plain immutable data, constructed by the caller
//! (typically a test-framework integration layer that has already parsed
//! whatever configuration format it favors) and passed into the
//! [`Orchestrator`](crate::orchestrator::Orchestrator) by value. The crate
//! never reads configuration files or process-global state itself.

use std::path::PathBuf;

use crate::binding::SlotSpec;

/// Process-wide provisioning policy, loaded once per test run.
#[derive(Debug, Clone)]
pub struct GlobalPolicy {
    /// Provider id used when a test group does not declare its own.
    pub default_provider: String,
    /// Deploy independent databases concurrently during group-setup and
    /// run pre-test resets concurrently during test-setup.
    pub use_parallel_initialisation: bool,
    /// Honor per-group provider overrides. When false every group uses the
    /// default provider, which keeps groups from switching providers under a
    /// shared server instance.
    pub deploy_databases_per_group: bool,
}

impl GlobalPolicy {
    pub fn new(default_provider: impl Into<String>) -> Self {
        Self {
            default_provider: default_provider.into(),
            use_parallel_initialisation: false,
            deploy_databases_per_group: false,
        }
    }

    pub fn with_parallel_initialisation(mut self, enabled: bool) -> Self {
        self.use_parallel_initialisation = enabled;
        self
    }

    pub fn with_per_group_deploy(mut self, enabled: bool) -> Self {
        self.deploy_databases_per_group = enabled;
        self
    }
}

/// One named database that must exist, with schema, before tests run.
///
/// Specs are uniquely keyed by `name`; when the same name is declared by
/// multiple sources the first-seen spec wins (see
/// [`resolve_effective_specs`](crate::orchestrator::resolve_effective_specs)).
#[derive(Debug, Clone)]
pub struct DatabaseSpec {
    pub name: String,
    /// Deployment package: a dacpac-style ZIP or a directory holding
    /// `model.sql` and optional `predeploy.sql`/`postdeploy.sql`.
    pub artifact_path: PathBuf,
    /// Explicit name of the connection slot this database should be bound
    /// to, when the naming convention does not apply.
    pub connection_slot_hint: Option<String>,
    /// Use the script-splitting rapid deploy path instead of the SqlPackage
    /// engine deploy.
    pub rapid_deploy: bool,
    /// Re-run the package's post-deployment script after every per-test
    /// data purge instead of once at deployment time.
    pub run_post_script_per_test: bool,
    /// SQLCMD variables substituted into deployment scripts (`$(name)`).
    pub sqlcmd_variables: Vec<(String, String)>,
}

impl DatabaseSpec {
    pub fn new(name: impl Into<String>, artifact_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            artifact_path: artifact_path.into(),
            connection_slot_hint: None,
            rapid_deploy: false,
            run_post_script_per_test: false,
            sqlcmd_variables: Vec::new(),
        }
    }

    pub fn with_slot_hint(mut self, slot: impl Into<String>) -> Self {
        self.connection_slot_hint = Some(slot.into());
        self
    }

    pub fn with_rapid_deploy(mut self, enabled: bool) -> Self {
        self.rapid_deploy = enabled;
        self
    }

    pub fn with_post_script_per_test(mut self, enabled: bool) -> Self {
        self.run_post_script_per_test = enabled;
        self
    }

    pub fn with_sqlcmd_variable(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.sqlcmd_variables.push((name.into(), value.into()));
        self
    }
}

/// The logical scope (a test class or collection) that owns a set of
/// databases and a chosen provider. Created once per group; its databases
/// are deployed once and reused by every test in the group.
#[derive(Debug, Clone, Default)]
pub struct TestGroup {
    pub name: String,
    /// Provider ids declared on the group. More than one entry is a fatal
    /// ambiguity; zero means the global default applies.
    pub providers: Vec<String>,
    /// Databases declared directly on the group.
    pub databases: Vec<DatabaseSpec>,
    /// Connection slots declared by the group's test type. Slots that name
    /// a database can imply membership in the effective database set.
    pub slots: Vec<SlotSpec>,
}

impl TestGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_provider(mut self, provider_id: impl Into<String>) -> Self {
        self.providers.push(provider_id.into());
        self
    }

    pub fn with_database(mut self, spec: DatabaseSpec) -> Self {
        self.databases.push(spec);
        self
    }

    pub fn with_slot(mut self, slot: SlotSpec) -> Self {
        self.slots.push(slot);
        self
    }
}
