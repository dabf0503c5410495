//! Connection slot declaration and best-match resolution.
//!
//! A slot is a named destination on a test object that the orchestrator
//! populates before each test: with an open connection, with a factory that
//! opens connections on demand, or with a connection string. Test objects
//! declare their slots up front through [`ConnectionSlots`] — a static
//! mapping, not runtime introspection — and receive values through
//! `bind_slot`.

use std::collections::HashSet;
use std::fmt;

use crate::connection::{ConnectionFactory, TestConnection};
use crate::error::ProvisionError;

/// What kind of value a slot accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotShape {
    /// An already-open connection, closed for the test by the session.
    OpenConnection,
    /// A callable producing fresh connections on demand.
    ConnectionFactory,
    /// A connection string another client can use.
    ConnectionString,
}

impl fmt::Display for SlotShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SlotShape::OpenConnection => "OpenConnection",
            SlotShape::ConnectionFactory => "ConnectionFactory",
            SlotShape::ConnectionString => "ConnectionString",
        };
        f.write_str(name)
    }
}

/// A declared slot: its name, its shape, and optionally the database it is
/// explicitly tied to.
#[derive(Debug, Clone)]
pub struct SlotSpec {
    pub name: String,
    pub shape: SlotShape,
    /// Explicit target database. Slots without one are matched by naming
    /// convention or by the database spec's slot hint.
    pub database: Option<String>,
}

impl SlotSpec {
    pub fn new(name: impl Into<String>, shape: SlotShape) -> Self {
        Self {
            name: name.into(),
            shape,
            database: None,
        }
    }

    pub fn for_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }
}

/// A value being written into a slot.
pub enum SlotValue {
    /// A session-tracked connection, closed at test-teardown.
    Connection(TestConnection),
    Factory(ConnectionFactory),
    ConnectionString(String),
}

impl SlotValue {
    pub fn shape(&self) -> SlotShape {
        match self {
            SlotValue::Connection(_) => SlotShape::OpenConnection,
            SlotValue::Factory(_) => SlotShape::ConnectionFactory,
            SlotValue::ConnectionString(_) => SlotShape::ConnectionString,
        }
    }
}

impl fmt::Debug for SlotValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SlotValue::{}", self.shape())
    }
}

/// The capability contract test objects implement to receive connections.
///
/// `declare_slots` is the static registration the orchestrator matches
/// databases against; `bind_slot` writes one resolved value into the named
/// slot. Rejecting a value whose shape the slot cannot hold is the binding
/// error surfaced to the test.
pub trait ConnectionSlots {
    fn declare_slots(&self) -> Vec<SlotSpec>;

    fn bind_slot(&mut self, name: &str, value: SlotValue) -> Result<(), ProvisionError>;
}

/// The `<PascalCase(database)>Connection` naming convention: the slot name a
/// database matches when nothing names it explicitly.
pub fn conventional_slot_name(database: &str) -> String {
    let mut chars = database.chars();
    let pascal = match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    };
    format!("{}Connection", pascal)
}

/// Find the best-match slot for `database`, in precedence order:
/// (a) a slot explicitly naming the database, (b) the naming convention,
/// (c) the spec's configured slot hint. Slots already bound in this pass are
/// excluded, which keeps every slot written at most once per test.
pub(crate) fn find_best_match_slot<'a>(
    slots: &'a [SlotSpec],
    bound: &HashSet<String>,
    database: &str,
    hint: Option<&str>,
) -> Option<&'a SlotSpec> {
    let available = || slots.iter().filter(|s| !bound.contains(&s.name));

    available()
        .find(|s| s.database.as_deref() == Some(database))
        .or_else(|| {
            let conventional = conventional_slot_name(database);
            available().find(|s| s.name == conventional)
        })
        .or_else(|| hint.and_then(|h| available().find(|s| s.name == h)))
}
