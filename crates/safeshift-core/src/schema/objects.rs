//! Views, triggers and functions.
//!
//! These are tracked as raw text. They are not diffed into operations; the
//! safety validator inspects them for stale references.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A view or materialized view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewDefinition {
    /// View name.
    pub name: String,
    /// Definition text as stored by the catalog.
    pub definition: String,
    /// Materialized view (PostgreSQL only).
    #[serde(default)]
    pub materialized: bool,
}

/// When a trigger fires relative to the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerTiming {
    /// BEFORE.
    Before,
    /// AFTER.
    After,
    /// INSTEAD OF.
    InsteadOf,
}

impl fmt::Display for TriggerTiming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerTiming::Before => write!(f, "BEFORE"),
            TriggerTiming::After => write!(f, "AFTER"),
            TriggerTiming::InsteadOf => write!(f, "INSTEAD OF"),
        }
    }
}

/// A trigger event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerEvent {
    /// INSERT.
    Insert,
    /// UPDATE.
    Update,
    /// DELETE.
    Delete,
    /// TRUNCATE.
    Truncate,
}

/// A trigger attached to a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerDefinition {
    /// Trigger name.
    pub name: String,
    /// Table the trigger is attached to.
    pub table: String,
    /// Firing time.
    pub timing: TriggerTiming,
    /// Events that fire the trigger.
    pub events: Vec<TriggerEvent>,
    /// Function executed (PostgreSQL); SQLite triggers have inline bodies.
    #[serde(default)]
    pub function: Option<String>,
    /// Full CREATE TRIGGER text, when the catalog exposes it.
    #[serde(default)]
    pub definition: Option<String>,
}

/// A stored function or procedure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    /// Function name.
    pub name: String,
    /// Source text.
    pub definition: String,
}
