//! The provisioning orchestrator.
//!
//! Drives the four lifecycle operations the test-framework integration
//! layer calls around test execution:
//!
//! - **group-setup**: resolve the provider and the effective database set,
//!   initialise the server, deploy every database (concurrently when the
//!   policy allows). Returns a [`ProvisionedGroup`] handle; the group
//!   cannot reach the per-test operations without one, which encodes the
//!   `Uninitialised → ServerReady → DatabasesDeployed` progression in the
//!   types.
//! - **test-setup**: reset every database's data, then bind connection
//!   slots on the test object.
//! - **test-teardown**: close every connection the session tracked,
//!   unconditionally.
//! - **group-teardown**: reserved extension point.
//!
//! The orchestrator holds no locks of its own. Each test's connections live
//! in an explicit [`TestSession`] owned by that test's execution context,
//! and parallel fan-out only ever touches distinct databases.

use std::collections::HashSet;
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::binding::{find_best_match_slot, ConnectionSlots, SlotShape, SlotValue};
use crate::config::{DatabaseSpec, GlobalPolicy, TestGroup};
use crate::connection::{ConnectionFactory, TestConnection};
use crate::error::ProvisionError;
use crate::provider::{DatabaseProvider, ProviderRegistry};

/// Connections opened for one executing test.
///
/// Owned by the test's execution context and threaded through
/// `test_setup`/`test_teardown`; empty at the start and end of every test.
#[derive(Default)]
pub struct TestSession {
    connections: Vec<TestConnection>,
}

impl TestSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn track(&mut self, connection: TestConnection) {
        self.connections.push(connection);
    }
}

/// A test group whose server is ready and whose databases are deployed.
pub struct ProvisionedGroup {
    group: TestGroup,
    provider: Arc<dyn DatabaseProvider>,
    specs: Vec<DatabaseSpec>,
}

impl ProvisionedGroup {
    pub fn name(&self) -> &str {
        &self.group.name
    }

    /// The effective database set, in resolution order.
    pub fn database_specs(&self) -> &[DatabaseSpec] {
        &self.specs
    }

    pub fn provider(&self) -> &Arc<dyn DatabaseProvider> {
        &self.provider
    }
}

/// Root entry point: owns the policy, the provider registry and the
/// configuration-declared database specs.
pub struct Orchestrator {
    policy: GlobalPolicy,
    registry: ProviderRegistry,
    config_databases: Vec<DatabaseSpec>,
}

impl Orchestrator {
    pub fn new(
        policy: GlobalPolicy,
        registry: ProviderRegistry,
        config_databases: Vec<DatabaseSpec>,
    ) -> Self {
        Self {
            policy,
            registry,
            config_databases,
        }
    }

    /// Provision everything a test group needs: provider, server, databases.
    pub fn group_setup(&self, group: TestGroup) -> Result<ProvisionedGroup, ProvisionError> {
        let provider = self.resolve_provider(&group)?;
        provider.initialise_server()?;

        let specs = resolve_effective_specs(&group, &self.config_databases);
        info!(
            group = %group.name,
            databases = specs.len(),
            parallel = self.policy.use_parallel_initialisation,
            "deploying group databases"
        );

        self.fan_out(&specs, "deployment", |spec| provider.setup_database(spec))?;

        Ok(ProvisionedGroup {
            group,
            provider,
            specs,
        })
    }

    /// Reserved extension point; deliberately does nothing today. Server
    /// instances outlive groups because other groups may share them.
    pub fn group_teardown(&self, group: &ProvisionedGroup) {
        debug!(group = %group.name(), "group teardown");
    }

    /// Reset every database and bind the test object's connection slots.
    ///
    /// Connections opened here are tracked in `session` even when a later
    /// step fails, so `test_teardown` always releases them.
    pub fn test_setup(
        &self,
        group: &ProvisionedGroup,
        session: &mut TestSession,
        target: &mut dyn ConnectionSlots,
    ) -> Result<(), ProvisionError> {
        self.fan_out(&group.specs, "pre-test reset", |spec| {
            group.provider.execute_pre_test_tasks(spec)
        })?;

        let slots = target.declare_slots();
        let mut bound: HashSet<String> = HashSet::new();

        for spec in &group.specs {
            let Some(slot) = find_best_match_slot(
                &slots,
                &bound,
                &spec.name,
                spec.connection_slot_hint.as_deref(),
            ) else {
                debug!(group = %group.name(), database = %spec.name, "no slot matches database");
                continue;
            };

            let value = self.make_slot_value(group, session, &spec.name, slot.shape)?;
            debug!(
                group = %group.name(),
                database = %spec.name,
                slot = %slot.name,
                shape = %slot.shape,
                "binding connection slot"
            );
            target.bind_slot(&slot.name, value)?;
            bound.insert(slot.name.clone());
        }

        Ok(())
    }

    /// Close and discard every connection in the session. Never fails:
    /// close errors are logged and the connection is discarded regardless,
    /// so the session is empty afterwards even when the test body or
    /// `test_setup` blew up.
    pub fn test_teardown(&self, session: &mut TestSession) {
        for connection in session.connections.drain(..) {
            let database = connection.database().to_string();
            if let Err(e) = connection.close() {
                warn!(database = %database, error = %e, "failed to close test connection");
            }
        }
    }

    /// Build the value for one slot according to its declared shape.
    fn make_slot_value(
        &self,
        group: &ProvisionedGroup,
        session: &mut TestSession,
        database: &str,
        shape: SlotShape,
    ) -> Result<SlotValue, ProvisionError> {
        match shape {
            SlotShape::OpenConnection => {
                let conn = group.provider.open_connection(Some(database))?;
                let tracked = TestConnection::track(conn);
                session.track(tracked.clone());
                Ok(SlotValue::Connection(tracked))
            }
            SlotShape::ConnectionFactory => {
                let provider = Arc::clone(&group.provider);
                let name = database.to_string();
                Ok(SlotValue::Factory(ConnectionFactory::new(
                    database,
                    move || provider.open_connection(Some(&name)),
                )))
            }
            SlotShape::ConnectionString => {
                // Open transiently just to learn the connection string.
                let conn = group.provider.open_connection(Some(database))?;
                let connection_string = conn.connection_string().to_string();
                if let Err(e) = conn.close() {
                    debug!(database, error = %e, "transient connection close failed");
                }
                Ok(SlotValue::ConnectionString(connection_string))
            }
        }
    }

    /// Effective provider for a group: an explicit override is honored only
    /// when the policy allows per-group deployment; otherwise every group
    /// shares the global default.
    fn resolve_provider(
        &self,
        group: &TestGroup,
    ) -> Result<Arc<dyn DatabaseProvider>, ProvisionError> {
        if group.providers.len() > 1 {
            return Err(ProvisionError::AmbiguousProvider {
                group: group.name.clone(),
                providers: group.providers.clone(),
            });
        }

        match group.providers.first() {
            Some(id) if self.policy.deploy_databases_per_group => self.registry.get(id),
            Some(id) => {
                debug!(
                    group = %group.name,
                    declared = %id,
                    "per-group providers disabled; using the global default"
                );
                self.registry.get(&self.policy.default_provider)
            }
            None => self.registry.get(&self.policy.default_provider),
        }
    }

    /// Apply `op` to every spec, concurrently when the policy enables
    /// parallel initialisation. The parallel path never cancels siblings:
    /// every branch runs to completion and failures are aggregated.
    fn fan_out<F>(
        &self,
        specs: &[DatabaseSpec],
        phase: &str,
        op: F,
    ) -> Result<(), ProvisionError>
    where
        F: Fn(&DatabaseSpec) -> Result<(), ProvisionError> + Sync,
    {
        if self.policy.use_parallel_initialisation {
            let failures: Vec<(String, ProvisionError)> = specs
                .par_iter()
                .filter_map(|spec| op(spec).err().map(|e| (spec.name.clone(), e)))
                .collect();

            if failures.is_empty() {
                Ok(())
            } else {
                Err(ProvisionError::FanOutFailed {
                    phase: phase.to_string(),
                    failed: failures.len(),
                    summary: failures
                        .iter()
                        .map(|(name, e)| format!("{}: {}", name, e))
                        .collect::<Vec<_>>()
                        .join("; "),
                })
            }
        } else {
            for spec in specs {
                op(spec)?;
            }
            Ok(())
        }
    }
}

/// Merge the effective database set from its three sources, in order:
/// group-declared specs, configuration-declared specs, then databases
/// implied by declared slots. Names de-duplicate with first-seen-wins.
///
/// A slot-implied name with no configuration spec behind it has no
/// deployment package and is skipped with a warning.
pub fn resolve_effective_specs(group: &TestGroup, config: &[DatabaseSpec]) -> Vec<DatabaseSpec> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut specs = Vec::new();

    for spec in group.databases.iter().chain(config.iter()) {
        if seen.insert(spec.name.clone()) {
            specs.push(spec.clone());
        }
    }

    for slot in &group.slots {
        let Some(database) = &slot.database else {
            continue;
        };
        if seen.contains(database) {
            continue;
        }
        match config.iter().find(|s| &s.name == database) {
            Some(spec) => {
                seen.insert(database.clone());
                specs.push(spec.clone());
            }
            None => warn!(
                group = %group.name,
                database = %database,
                slot = %slot.name,
                "slot names a database with no configured deployment package; skipping"
            ),
        }
    }

    specs
}
