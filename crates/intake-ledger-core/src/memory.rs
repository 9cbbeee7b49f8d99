//! In-process storage doubles.
//!
//! [`MemoryBackend`] and [`MemoryCounterStore`] behave like the production
//! store but keep everything behind a mutex. Both can be switched into a
//! failing mode to exercise error paths; [`UnavailableCounterStore`] always
//! fails.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::{column_key, CellValue, CounterKey, CounterStore, IntakeError, RowPosition, TableBackend};

#[derive(Debug, Default, Clone)]
struct MemoryTable {
    name: String,
    header: Vec<String>,
    rows: Vec<Vec<CellValue>>,
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    tables: Mutex<BTreeMap<String, MemoryTable>>,
    unavailable: AtomicBool,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a table's header verbatim, bypassing normalization.
    pub fn insert_header(&self, table: &str, header: &[&str]) {
        let mut tables = self.tables.lock();
        let entry = tables
            .entry(column_key(table))
            .or_insert_with(|| MemoryTable { name: table.to_string(), ..MemoryTable::default() });
        entry.header = header.iter().map(ToString::to_string).collect();
    }

    /// Append a row without touching the header.
    pub fn push_raw_row(&self, table: &str, cells: Vec<CellValue>) -> RowPosition {
        let mut tables = self.tables.lock();
        let entry = tables
            .entry(column_key(table))
            .or_insert_with(|| MemoryTable { name: table.to_string(), ..MemoryTable::default() });
        entry.rows.push(cells);
        RowPosition(entry.rows.len() as u64)
    }

    /// Make every subsequent call fail (or succeed again).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_read(&self) -> Result<(), IntakeError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(IntakeError::StorageReadFailure("memory backend is offline".to_string()));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<(), IntakeError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(IntakeError::StorageWriteFailure("memory backend is offline".to_string()));
        }
        Ok(())
    }

    fn with_row<T>(
        &self,
        table: &str,
        row: RowPosition,
        apply: impl FnOnce(&mut Vec<CellValue>) -> T,
    ) -> Result<T, IntakeError> {
        let mut tables = self.tables.lock();
        let cells = tables
            .get_mut(&column_key(table))
            .and_then(|entry| {
                let index = usize::try_from(row.0).ok()?.checked_sub(1)?;
                entry.rows.get_mut(index)
            })
            .ok_or_else(|| IntakeError::RowNotFound {
                table: table.to_string(),
                id: format!("row {row}"),
            })?;
        Ok(apply(cells))
    }
}

fn place(cells: &mut Vec<CellValue>, column: usize, value: &CellValue) {
    if cells.len() <= column {
        cells.resize(column + 1, CellValue::Blank);
    }
    cells[column] = value.clone();
}

impl TableBackend for MemoryBackend {
    fn list_tables(&self) -> Result<Vec<String>, IntakeError> {
        self.check_read()?;
        Ok(self.tables.lock().values().map(|table| table.name.clone()).collect())
    }

    fn read_header(&self, table: &str) -> Result<Vec<String>, IntakeError> {
        self.check_read()?;
        Ok(self
            .tables
            .lock()
            .get(&column_key(table))
            .map(|entry| entry.header.clone())
            .unwrap_or_default())
    }

    fn append_header_columns(
        &self,
        table: &str,
        expected_len: usize,
        names: &[String],
    ) -> Result<bool, IntakeError> {
        self.check_write()?;
        let mut tables = self.tables.lock();
        let entry = tables
            .entry(column_key(table))
            .or_insert_with(|| MemoryTable { name: table.to_string(), ..MemoryTable::default() });
        if entry.header.len() != expected_len {
            return Ok(false);
        }
        entry.header.extend(names.iter().cloned());
        Ok(true)
    }

    fn row_count(&self, table: &str) -> Result<u64, IntakeError> {
        self.check_read()?;
        Ok(self.tables.lock().get(&column_key(table)).map_or(0, |entry| entry.rows.len() as u64))
    }

    fn append_row(&self, table: &str, cells: &[CellValue]) -> Result<RowPosition, IntakeError> {
        self.check_write()?;
        Ok(self.push_raw_row(table, cells.to_vec()))
    }

    fn read_row(
        &self,
        table: &str,
        row: RowPosition,
    ) -> Result<Option<Vec<CellValue>>, IntakeError> {
        self.check_read()?;
        let tables = self.tables.lock();
        let Some(entry) = tables.get(&column_key(table)) else {
            return Ok(None);
        };
        let Some(index) = usize::try_from(row.0).ok().and_then(|value| value.checked_sub(1)) else {
            return Ok(None);
        };
        Ok(entry.rows.get(index).cloned())
    }

    fn read_rows(&self, table: &str) -> Result<Vec<Vec<CellValue>>, IntakeError> {
        self.check_read()?;
        Ok(self.tables.lock().get(&column_key(table)).map(|entry| entry.rows.clone()).unwrap_or_default())
    }

    fn write_cell(
        &self,
        table: &str,
        row: RowPosition,
        column: usize,
        value: &CellValue,
    ) -> Result<(), IntakeError> {
        self.check_write()?;
        self.with_row(table, row, |cells| place(cells, column, value))
    }

    fn write_cell_if_blank(
        &self,
        table: &str,
        row: RowPosition,
        column: usize,
        value: &CellValue,
    ) -> Result<bool, IntakeError> {
        self.check_write()?;
        self.with_row(table, row, |cells| {
            if cells.get(column).is_some_and(|current| !current.is_blank()) {
                return false;
            }
            place(cells, column, value);
            true
        })
    }
}

#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    values: Mutex<HashMap<CounterKey, u64>>,
    unavailable: AtomicBool,
}

impl MemoryCounterStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Snapshot of every persisted counter.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<CounterKey, u64> {
        self.values.lock().iter().map(|(key, value)| (key.clone(), *value)).collect()
    }

    fn check(&self) -> Result<(), IntakeError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(IntakeError::StorageReadFailure("counter store is offline".to_string()));
        }
        Ok(())
    }
}

impl CounterStore for MemoryCounterStore {
    fn get(&self, key: &CounterKey) -> Result<Option<u64>, IntakeError> {
        self.check()?;
        Ok(self.values.lock().get(key).copied())
    }

    fn compare_and_set(
        &self,
        key: &CounterKey,
        expected: Option<u64>,
        new: u64,
    ) -> Result<bool, IntakeError> {
        self.check()?;
        let mut values = self.values.lock();
        if values.get(key).copied() != expected {
            return Ok(false);
        }
        values.insert(key.clone(), new);
        Ok(true)
    }

    fn remove(&self, key: &CounterKey) -> Result<(), IntakeError> {
        self.check()?;
        self.values.lock().remove(key);
        Ok(())
    }
}

/// Counter store whose every call fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableCounterStore;

impl CounterStore for UnavailableCounterStore {
    fn get(&self, key: &CounterKey) -> Result<Option<u64>, IntakeError> {
        Err(IntakeError::StorageReadFailure(format!("counter store unreachable for `{key}`")))
    }

    fn compare_and_set(
        &self,
        key: &CounterKey,
        _expected: Option<u64>,
        _new: u64,
    ) -> Result<bool, IntakeError> {
        Err(IntakeError::StorageWriteFailure(format!("counter store unreachable for `{key}`")))
    }

    fn remove(&self, key: &CounterKey) -> Result<(), IntakeError> {
        Err(IntakeError::StorageWriteFailure(format!("counter store unreachable for `{key}`")))
    }
}
