//! rust-dbtest: ephemeral SQL Server databases for integration tests
//!
//! Provisions real (not mocked) databases around test execution: makes sure
//! a server instance is up, deploys schema packages into named databases,
//! wipes their data between tests, and hands live connections to test
//! objects through declared connection slots.
//!
//! The test-framework integration layer drives four lifecycle calls:
//!
//! ```rust,ignore
//! let orchestrator = Orchestrator::new(policy, registry, config_databases);
//!
//! // once per test class/collection
//! let group = orchestrator.group_setup(test_group)?;
//!
//! // around every test
//! let mut session = TestSession::new();
//! orchestrator.test_setup(&group, &mut session, &mut test_object)?;
//! // ... run the test ...
//! orchestrator.test_teardown(&mut session);
//!
//! orchestrator.group_teardown(&group);
//! ```

pub mod binding;
pub mod config;
pub mod connection;
pub mod deploy;
pub mod error;
pub mod orchestrator;
pub mod provider;
pub(crate) mod util;

pub use binding::{ConnectionSlots, SlotShape, SlotSpec, SlotValue};
pub use config::{DatabaseSpec, GlobalPolicy, TestGroup};
pub use connection::{ConnectionFactory, DbConnection, TestConnection};
pub use deploy::DeploymentArtifact;
pub use error::ProvisionError;
pub use orchestrator::{Orchestrator, ProvisionedGroup, TestSession};
pub use provider::{DatabaseProvider, ProviderRegistry};
