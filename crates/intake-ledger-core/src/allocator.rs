use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use tracing::{debug, info, warn};

use crate::schema::position_in;
use crate::{
    CellValue, CounterKey, CounterStore, IdentifierKind, IdentifierSpec, IntakeError, LedgerLocks,
    RowPosition, SchemaManager, TableBackend, TableLayout,
};

const MAX_CAS_ATTEMPTS: u32 = 16;

/// `"Spring 2026"` style label: January-May is Spring, June-July Summer,
/// August-December Fall.
#[must_use]
pub fn semester_label(date: Date) -> String {
    let season = match u8::from(date.month()) {
        1..=5 => "Spring",
        6..=7 => "Summer",
        _ => "Fall",
    };
    format!("{season} {}", date.year())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssignedIdentifiers {
    pub row_position: Option<RowPosition>,
    /// Identifier column -> value now stored in the row.
    pub assigned: BTreeMap<String, String>,
    /// Columns this call filled in (the rest already had values).
    pub newly_assigned: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CounterInit {
    pub key: String,
    pub scanned_max: u64,
    pub previous: Option<u64>,
    pub current: u64,
}

/// Issues per-(table, counter kind) identifiers.
///
/// Allocation for one key runs under that key's slot in [`LedgerLocks`].
/// The persisted counter is advanced with compare-and-set so separate
/// processes sharing one counter store also never hand out the same value.
pub struct IdentifierAllocator<'a, B: TableBackend + ?Sized, C: CounterStore + ?Sized> {
    backend: &'a B,
    counters: &'a C,
    locks: &'a LedgerLocks,
}

impl<'a, B: TableBackend + ?Sized, C: CounterStore + ?Sized> IdentifierAllocator<'a, B, C> {
    #[must_use]
    pub fn new(backend: &'a B, counters: &'a C, locks: &'a LedgerLocks) -> Self {
        Self { backend, counters, locks }
    }

    /// Largest identifier already stored in the counter's column, 0 when the
    /// column is absent or holds nothing numeric.
    ///
    /// # Errors
    /// Returns [`IntakeError::Validation`] for a counter the layout does not
    /// declare, or a read failure from the backend.
    pub fn scanned_max(&self, layout: &TableLayout, counter: &str) -> Result<u64, IntakeError> {
        let spec = counter_spec(layout, counter)?;
        self.scan_column(&layout.name, &spec.column)
    }

    /// Next identifier for `counter` in `layout`'s table.
    ///
    /// The baseline is the larger of the column scan, the persisted counter
    /// and this process's high-water mark for the key. When the counter store
    /// cannot be reached the value is still issued from the scan and
    /// high-water mark, and the degradation is logged.
    ///
    /// # Errors
    /// Returns [`IntakeError::CounterContention`] when compare-and-set keeps
    /// losing, [`IntakeError::Validation`] for an undeclared counter, or a read
    /// failure from the backend.
    pub fn allocate(&self, layout: &TableLayout, counter: &str) -> Result<u64, IntakeError> {
        let spec = counter_spec(layout, counter)?;
        let key = counter_key(layout, spec);
        let slot = self.locks.counter_slot(&key);
        let mut high_water = slot.lock();

        let scanned = self.scan_column(&layout.name, &spec.column)?;
        let floor = scanned.max(*high_water);

        let next = match self.advance_counter(&key, floor) {
            Ok(next) => next,
            Err(err @ IntakeError::CounterContention { .. }) => return Err(err),
            Err(err) => {
                let next = increment(&key, floor)?;
                let degraded =
                    IntakeError::AllocationDegraded { key: key.to_string(), reason: err.to_string() };
                warn!(error = %degraded, issued = next, "issuing identifier without persisted counter");
                next
            }
        };

        *high_water = next;
        debug!(key = %key, id = next, "allocated identifier");
        Ok(next)
    }

    fn advance_counter(&self, key: &CounterKey, floor: u64) -> Result<u64, IntakeError> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let persisted = self.counters.get(key)?;
            let next = increment(key, floor.max(persisted.unwrap_or(0)))?;
            if self.counters.compare_and_set(key, persisted, next)? {
                return Ok(next);
            }
            debug!(key = %key, attempt, "counter changed concurrently; retrying");
        }
        Err(IntakeError::CounterContention { key: key.to_string(), attempts: MAX_CAS_ATTEMPTS })
    }

    /// Raise the persisted counter to the column's scanned maximum. Never
    /// lowers it.
    ///
    /// # Errors
    /// Returns an error when the backend or counter store fails, or
    /// [`IntakeError::CounterContention`] when the counter keeps moving.
    pub fn initialize_counter(
        &self,
        layout: &TableLayout,
        counter: &str,
    ) -> Result<CounterInit, IntakeError> {
        let spec = counter_spec(layout, counter)?;
        let key = counter_key(layout, spec);
        let slot = self.locks.counter_slot(&key);
        let _guard = slot.lock();

        let scanned_max = self.scan_column(&layout.name, &spec.column)?;
        let mut previous = None;
        for _ in 0..MAX_CAS_ATTEMPTS {
            previous = self.counters.get(&key)?;
            if let Some(current) = previous.filter(|value| *value >= scanned_max) {
                return Ok(CounterInit { key: key.to_string(), scanned_max, previous, current });
            }
            if self.counters.compare_and_set(&key, previous, scanned_max)? {
                info!(key = %key, scanned_max, ?previous, "initialized counter from table scan");
                return Ok(CounterInit {
                    key: key.to_string(),
                    scanned_max,
                    previous,
                    current: scanned_max,
                });
            }
        }
        debug!(key = %key, ?previous, "gave up initializing a moving counter");
        Err(IntakeError::CounterContention { key: key.to_string(), attempts: MAX_CAS_ATTEMPTS })
    }

    /// Fill every blank identifier cell of one row.
    ///
    /// Existing non-blank values are kept. New values are written with a
    /// conditional write, so when another assigner fills a cell first its
    /// value is kept and reported instead.
    ///
    /// # Errors
    /// Returns [`IntakeError::RowNotFound`] for a missing row, or any
    /// allocation or storage error.
    pub fn assign_identifiers(
        &self,
        layout: &TableLayout,
        row: RowPosition,
        now: OffsetDateTime,
    ) -> Result<AssignedIdentifiers, IntakeError> {
        let mut result = AssignedIdentifiers { row_position: Some(row), ..AssignedIdentifiers::default() };
        if layout.identifiers.is_empty() {
            return Ok(result);
        }

        let table = layout.name.as_str();
        SchemaManager::new(self.backend, self.locks)
            .ensure_columns(table, &layout.identifier_columns())?;
        let header = self.backend.read_header(table)?;
        let cells = self.read_existing_row(table, row)?;

        for spec in &layout.identifiers {
            let column = position_in(&header, &spec.column).ok_or_else(|| {
                IntakeError::StorageReadFailure(format!(
                    "identifier column `{}` missing from `{table}` after extension",
                    spec.column
                ))
            })?;

            if let Some(existing) = cells.get(column).filter(|cell| !cell.is_blank()) {
                result.assigned.insert(spec.column.clone(), existing.to_display_string());
                continue;
            }

            let value = match spec.kind {
                IdentifierKind::Counter => CellValue::identifier(self.allocate(layout, spec.label())?),
                IdentifierKind::SemesterLabel => CellValue::Text(semester_label(now.date())),
            };

            if self.backend.write_cell_if_blank(table, row, column, &value)? {
                result.assigned.insert(spec.column.clone(), value.to_display_string());
                result.newly_assigned.push(spec.column.clone());
            } else {
                let winner = self
                    .read_existing_row(table, row)?
                    .get(column)
                    .map(CellValue::to_display_string)
                    .unwrap_or_default();
                debug!(table, %row, column = %spec.column, "identifier filled concurrently; keeping it");
                result.assigned.insert(spec.column.clone(), winner);
            }
        }

        if !result.newly_assigned.is_empty() {
            info!(table, %row, columns = ?result.newly_assigned, "assigned identifiers");
        }
        Ok(result)
    }

    fn read_existing_row(&self, table: &str, row: RowPosition) -> Result<Vec<CellValue>, IntakeError> {
        self.backend.read_row(table, row)?.ok_or_else(|| IntakeError::RowNotFound {
            table: table.to_string(),
            id: format!("row {row}"),
        })
    }

    fn scan_column(&self, table: &str, column: &str) -> Result<u64, IntakeError> {
        let header = self.backend.read_header(table)?;
        let Some(index) = position_in(&header, column) else {
            return Ok(0);
        };
        Ok(self
            .backend
            .read_column(table, index)?
            .iter()
            .filter_map(CellValue::as_identifier)
            .max()
            .unwrap_or(0))
    }
}

fn counter_spec<'l>(layout: &'l TableLayout, counter: &str) -> Result<&'l IdentifierSpec, IntakeError> {
    let key = crate::column_key(counter);
    layout
        .identifiers
        .iter()
        .find(|spec| spec.counter_kind().is_some_and(|kind| crate::column_key(kind) == key))
        .ok_or_else(|| {
            IntakeError::Validation(format!(
                "table `{}` declares no counter `{counter}`",
                layout.name
            ))
        })
}

fn counter_key(layout: &TableLayout, spec: &IdentifierSpec) -> CounterKey {
    CounterKey::new(&layout.name, spec.label())
}

fn increment(key: &CounterKey, value: u64) -> Result<u64, IntakeError> {
    value
        .checked_add(1)
        .ok_or_else(|| IntakeError::Validation(format!("counter `{key}` is exhausted")))
}
