//! Dynamic-schema tabular ledger with per-table identifier allocation.
//!
//! The crate is storage-agnostic: every component borrows a [`TableBackend`]
//! (and, for allocation, a [`CounterStore`]) plus a shared [`LedgerLocks`]
//! registry. `intake-ledger-store-sqlite` provides the production backend;
//! [`memory`] provides in-process doubles.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

mod allocator;
mod backend;
mod backfill;
mod layout;
mod locator;
mod locks;
pub mod memory;
mod record;
mod schema;
mod status;
mod writer;

pub use allocator::{semester_label, AssignedIdentifiers, CounterInit, IdentifierAllocator};
pub use backend::{CounterStore, TableBackend};
pub use backfill::{BackfillReport, BackfillService, RowFailure};
pub use layout::{IdentifierKind, IdentifierSpec, LedgerConfig, TableLayout};
pub use locator::{DuplicateIdentifier, RowKey, RowLocator};
pub use locks::LedgerLocks;
pub use record::{CellValue, Record, CONFIRMATION_FIELD, STATUS_FIELD};
pub use schema::{column_key, AddedColumns, SchemaConflict, SchemaManager};
pub use status::{normalize_status, to_display_string, CanonicalStatus};
pub use writer::{AppendedRow, RowWriter};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum IntakeError {
    #[error("schema conflict in table `{table}`: columns {columns:?} all normalize to `{key}`")]
    SchemaConflict { table: String, key: String, columns: Vec<String> },
    #[error("storage write failure: {0}")]
    StorageWriteFailure(String),
    #[error("storage read failure: {0}")]
    StorageReadFailure(String),
    #[error("no row in table `{table}` matches identifier `{id}`")]
    RowNotFound { table: String, id: String },
    #[error("identifier allocation degraded for `{key}`: {reason}")]
    AllocationDegraded { key: String, reason: String },
    #[error("counter `{key}` kept changing after {attempts} compare-and-set attempts")]
    CounterContention { key: String, attempts: u32 },
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("validation error: {0}")]
    Validation(String),
}

impl IntakeError {
    /// Stable, machine-readable code for this error.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::SchemaConflict { .. } => "SCHEMA_CONFLICT",
            Self::StorageWriteFailure(_) => "STORAGE_WRITE_FAILURE",
            Self::StorageReadFailure(_) => "STORAGE_READ_FAILURE",
            Self::RowNotFound { .. } => "ROW_NOT_FOUND",
            Self::AllocationDegraded { .. } => "ALLOCATION_DEGRADED",
            Self::CounterContention { .. } => "COUNTER_CONTENTION",
            Self::UnknownTable(_) => "UNKNOWN_TABLE",
            Self::Validation(_) => "VALIDATION",
        }
    }

    /// Reclassify read failures as write failures for multi-step writes.
    #[must_use]
    pub fn into_write_failure(self) -> Self {
        match self {
            Self::StorageReadFailure(message) => Self::StorageWriteFailure(message),
            other => other,
        }
    }
}

/// 1-based position of a data row within its table (header excluded).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RowPosition(pub u64);

impl Display for RowPosition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Persisted counter identity, rendered as `"{table}:{counter}"`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CounterKey {
    pub table: String,
    pub counter: String,
}

impl CounterKey {
    #[must_use]
    pub fn new(table: &str, counter: &str) -> Self {
        Self { table: table.to_string(), counter: counter.to_string() }
    }
}

impl Display for CounterKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.table, self.counter)
    }
}

/// Format a timestamp the way the ledger persists it (RFC 3339).
///
/// # Errors
/// Returns [`IntakeError::Validation`] when the timestamp cannot be formatted.
pub fn format_timestamp(value: OffsetDateTime) -> Result<String, IntakeError> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| IntakeError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_key_renders_table_and_kind() {
        assert_eq!(CounterKey::new("Orders", "Historical").to_string(), "Orders:Historical");
    }

    #[test]
    fn error_codes_are_stable() {
        let cases = [
            (IntakeError::StorageWriteFailure("x".to_string()), "STORAGE_WRITE_FAILURE"),
            (
                IntakeError::RowNotFound { table: "Orders".to_string(), id: "7".to_string() },
                "ROW_NOT_FOUND",
            ),
            (
                IntakeError::AllocationDegraded {
                    key: "Orders:Historical".to_string(),
                    reason: "offline".to_string(),
                },
                "ALLOCATION_DEGRADED",
            ),
            (
                IntakeError::SchemaConflict {
                    table: "Orders".to_string(),
                    key: "event date".to_string(),
                    columns: vec!["Event Date".to_string(), "Event_Date".to_string()],
                },
                "SCHEMA_CONFLICT",
            ),
        ];
        for (error, code) in cases {
            assert_eq!(error.code(), code);
        }
    }

    #[test]
    fn read_failures_become_write_failures_inside_writes() {
        let err = IntakeError::StorageReadFailure("disk".to_string()).into_write_failure();
        assert_eq!(err.code(), "STORAGE_WRITE_FAILURE");
        let untouched = IntakeError::Validation("bad".to_string()).into_write_failure();
        assert_eq!(untouched.code(), "VALIDATION");
    }
}
