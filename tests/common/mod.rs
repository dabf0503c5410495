//! Common test utilities for rust-dbtest tests

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rust_dbtest::binding::{ConnectionSlots, SlotSpec, SlotValue};
use rust_dbtest::connection::{ConnectionFactory, DbConnection, TestConnection};
use rust_dbtest::error::ProvisionError;
use rust_dbtest::provider::DatabaseProvider;
use rust_dbtest::DatabaseSpec;

/// Everything a mock provider observed, shared across its connections.
#[derive(Default)]
pub struct MockState {
    pub initialise_calls: usize,
    pub setup_calls: Vec<String>,
    pub reset_calls: Vec<String>,
    pub opened: usize,
    pub closed: usize,
    /// (database, sql) per executed batch.
    pub executed: Vec<(String, String)>,
}

/// An in-memory provider for orchestrator tests: records every call and can
/// be scripted to fail specific operations per database.
#[derive(Default)]
pub struct MockProvider {
    state: Arc<Mutex<MockState>>,
    fail_setup: HashSet<String>,
    fail_reset: HashSet<String>,
    fail_connect: HashSet<String>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_setup(mut self, database: &str) -> Self {
        self.fail_setup.insert(database.to_string());
        self
    }

    pub fn failing_reset(mut self, database: &str) -> Self {
        self.fail_reset.insert(database.to_string());
        self
    }

    pub fn failing_connect(mut self, database: &str) -> Self {
        self.fail_connect.insert(database.to_string());
        self
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn setup_calls(&self) -> Vec<String> {
        self.state().setup_calls.clone()
    }

    pub fn reset_calls(&self) -> Vec<String> {
        self.state().reset_calls.clone()
    }

    pub fn open_connection_balance(&self) -> (usize, usize) {
        let state = self.state();
        (state.opened, state.closed)
    }

    fn scripted_failure(&self, database: &str, what: &str) -> ProvisionError {
        ProvisionError::SqlFailed {
            database: database.to_string(),
            context: format!("scripted {what} failure"),
            source: "mock failure".into(),
        }
    }
}

impl DatabaseProvider for MockProvider {
    fn initialise_server(&self) -> Result<(), ProvisionError> {
        self.state().initialise_calls += 1;
        Ok(())
    }

    fn setup_database(&self, spec: &DatabaseSpec) -> Result<(), ProvisionError> {
        if self.fail_setup.contains(&spec.name) {
            return Err(self.scripted_failure(&spec.name, "deploy"));
        }
        self.state().setup_calls.push(spec.name.clone());
        Ok(())
    }

    fn open_connection(
        &self,
        database: Option<&str>,
    ) -> Result<Box<dyn DbConnection>, ProvisionError> {
        let database = database.unwrap_or("master").to_string();
        if self.fail_connect.contains(&database) {
            return Err(ProvisionError::ConnectionFailed {
                database,
                source: "mock connect failure".into(),
            });
        }
        self.state().opened += 1;
        Ok(Box::new(MockConnection {
            connection_string: format!("Server=mock;Database={}", database),
            database,
            state: self.state.clone(),
        }))
    }

    fn execute_pre_test_tasks(&self, spec: &DatabaseSpec) -> Result<(), ProvisionError> {
        if self.fail_reset.contains(&spec.name) {
            return Err(self.scripted_failure(&spec.name, "reset"));
        }
        self.state().reset_calls.push(spec.name.clone());
        Ok(())
    }
}

pub struct MockConnection {
    database: String,
    connection_string: String,
    state: Arc<Mutex<MockState>>,
}

impl DbConnection for MockConnection {
    fn execute(&mut self, sql: &str) -> Result<(), ProvisionError> {
        self.state
            .lock()
            .unwrap()
            .executed
            .push((self.database.clone(), sql.to_string()));
        Ok(())
    }

    fn query_scalar(&mut self, _sql: &str) -> Result<Option<String>, ProvisionError> {
        Ok(None)
    }

    fn database(&self) -> &str {
        &self.database
    }

    fn connection_string(&self) -> &str {
        &self.connection_string
    }

    fn close(self: Box<Self>) -> Result<(), ProvisionError> {
        self.state.lock().unwrap().closed += 1;
        Ok(())
    }
}

/// A test object that records what the orchestrator binds into it.
#[derive(Default)]
pub struct RecordingTarget {
    pub slots: Vec<SlotSpec>,
    /// When set, every bind is rejected, simulating a slot that cannot hold
    /// the offered value.
    pub reject_binds: bool,
    pub connections: HashMap<String, TestConnection>,
    pub factories: HashMap<String, ConnectionFactory>,
    pub strings: HashMap<String, String>,
    pub bind_order: Vec<String>,
}

impl RecordingTarget {
    pub fn with_slots(slots: Vec<SlotSpec>) -> Self {
        Self {
            slots,
            ..Default::default()
        }
    }

    pub fn rejecting_binds(mut self) -> Self {
        self.reject_binds = true;
        self
    }
}

impl ConnectionSlots for RecordingTarget {
    fn declare_slots(&self) -> Vec<SlotSpec> {
        self.slots.clone()
    }

    fn bind_slot(&mut self, name: &str, value: SlotValue) -> Result<(), ProvisionError> {
        if self.reject_binds {
            return Err(ProvisionError::SlotBindingFailed {
                slot: name.to_string(),
                shape: value.shape().to_string(),
                message: "slot cannot hold this value".to_string(),
            });
        }

        match value {
            SlotValue::Connection(conn) => {
                self.connections.insert(name.to_string(), conn);
            }
            SlotValue::Factory(factory) => {
                self.factories.insert(name.to_string(), factory);
            }
            SlotValue::ConnectionString(s) => {
                self.strings.insert(name.to_string(), s);
            }
        }
        self.bind_order.push(name.to_string());
        Ok(())
    }
}

/// Write a dacpac-style ZIP deployment package.
pub fn write_zip_package(path: &Path, entries: &[(&str, &str)]) {
    let file = std::fs::File::create(path).expect("Failed to create package file");
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    for (name, content) in entries {
        writer
            .start_file(*name, options)
            .expect("Failed to start ZIP entry");
        writer
            .write_all(content.as_bytes())
            .expect("Failed to write ZIP entry");
    }
    writer.finish().expect("Failed to finish package");
}

/// Write a directory-form deployment package.
pub fn write_dir_package(root: &Path, entries: &[(&str, &str)]) {
    for (name, content) in entries {
        let path = root.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create package dirs");
        }
        std::fs::write(path, content).expect("Failed to write package file");
    }
}
