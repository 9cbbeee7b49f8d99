use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{IntakeError, LedgerLocks, TableBackend};

const MAX_HEADER_ATTEMPTS: u32 = 8;

/// Lookup key for a column name: case-insensitive, with `_`, `-` and
/// whitespace treated as one separator and surrounding whitespace ignored.
#[must_use]
pub fn column_key(name: &str) -> String {
    name.split(|ch: char| ch == '_' || ch == '-' || ch.is_whitespace())
        .filter(|part| !part.is_empty())
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// First header index whose name shares `name`'s column key.
pub(crate) fn position_in(header: &[String], name: &str) -> Option<usize> {
    let key = column_key(name);
    if key.is_empty() {
        return None;
    }
    header.iter().position(|column| column_key(column) == key)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddedColumns {
    pub added: Vec<String>,
}

/// Header columns that normalize to the same key. Only the first is ever
/// matched by lookups.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaConflict {
    pub table: String,
    pub key: String,
    pub columns: Vec<String>,
    pub positions: Vec<usize>,
}

impl From<&SchemaConflict> for IntakeError {
    fn from(conflict: &SchemaConflict) -> Self {
        Self::SchemaConflict {
            table: conflict.table.clone(),
            key: conflict.key.clone(),
            columns: conflict.columns.clone(),
        }
    }
}

/// Owns the column layout of every table in one backend.
pub struct SchemaManager<'a, B: TableBackend + ?Sized> {
    backend: &'a B,
    locks: &'a LedgerLocks,
}

impl<'a, B: TableBackend + ?Sized> SchemaManager<'a, B> {
    #[must_use]
    pub fn new(backend: &'a B, locks: &'a LedgerLocks) -> Self {
        Self { backend, locks }
    }

    /// Current header of `table`; empty when it has none yet.
    ///
    /// # Errors
    /// Returns an error when the backend cannot be read.
    pub fn get_columns(&self, table: &str) -> Result<Vec<String>, IntakeError> {
        self.backend.read_header(table)
    }

    /// 0-based index of the first column matching `name` by column key.
    ///
    /// # Errors
    /// Returns an error when the backend cannot be read.
    pub fn find_column(&self, table: &str, name: &str) -> Result<Option<usize>, IntakeError> {
        Ok(position_in(&self.get_columns(table)?, name))
    }

    /// Append every name in `required` that the header lacks.
    ///
    /// Requested names that share a column key with an earlier requested name
    /// are aliases and never create a second column. Calling this again with
    /// the same names adds nothing.
    ///
    /// # Errors
    /// Returns an error when the backend cannot be read or written, or when
    /// the header keeps changing underneath the extension.
    pub fn ensure_columns<S: AsRef<str>>(
        &self,
        table: &str,
        required: &[S],
    ) -> Result<AddedColumns, IntakeError> {
        let requested = dedupe_requested(table, required);
        if requested.is_empty() {
            return Ok(AddedColumns::default());
        }

        let lock = self.locks.header_lock(table);
        let _guard = lock.lock();

        for attempt in 1..=MAX_HEADER_ATTEMPTS {
            let header = self.backend.read_header(table)?;
            let existing: HashSet<String> = header.iter().map(|name| column_key(name)).collect();
            let missing: Vec<String> = requested
                .iter()
                .filter(|name| !existing.contains(&column_key(name)))
                .cloned()
                .collect();
            if missing.is_empty() {
                return Ok(AddedColumns::default());
            }

            if self.backend.append_header_columns(table, header.len(), &missing)? {
                info!(table, columns = ?missing, "extended table header");
                return Ok(AddedColumns { added: missing });
            }
            debug!(table, attempt, "header changed concurrently; retrying extension");
        }

        Err(IntakeError::StorageWriteFailure(format!(
            "header of table `{table}` kept changing during extension"
        )))
    }

    /// Report header columns that collide after normalization.
    ///
    /// # Errors
    /// Returns an error when the backend cannot be read.
    pub fn audit(&self, table: &str) -> Result<Vec<SchemaConflict>, IntakeError> {
        let header = self.get_columns(table)?;
        let mut groups: BTreeMap<usize, (String, Vec<usize>)> = BTreeMap::new();
        let mut first_by_key: BTreeMap<String, usize> = BTreeMap::new();

        for (index, name) in header.iter().enumerate() {
            let key = column_key(name);
            let first = *first_by_key.entry(key.clone()).or_insert(index);
            groups.entry(first).or_insert_with(|| (key, Vec::new())).1.push(index);
        }

        let conflicts: Vec<SchemaConflict> = groups
            .into_values()
            .filter(|(_, positions)| positions.len() > 1)
            .map(|(key, positions)| SchemaConflict {
                table: table.to_string(),
                key,
                columns: positions.iter().map(|index| header[*index].clone()).collect(),
                positions,
            })
            .collect();

        for conflict in &conflicts {
            warn!(error = %IntakeError::from(conflict), "first-seen column wins");
        }
        Ok(conflicts)
    }
}

fn dedupe_requested<S: AsRef<str>>(table: &str, required: &[S]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut requested = Vec::with_capacity(required.len());
    for name in required {
        let trimmed = name.as_ref().trim();
        let key = column_key(trimmed);
        if key.is_empty() {
            continue;
        }
        if seen.insert(key) {
            requested.push(trimmed.to_string());
        } else {
            debug!(table, column = trimmed, "requested column is an alias of an earlier name");
        }
    }
    requested
}
