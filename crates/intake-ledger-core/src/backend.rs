use crate::{CellValue, CounterKey, IntakeError, RowPosition};

/// Raw read/write primitives of a tabular store.
///
/// Rows may be shorter than the header when columns were appended after the
/// row was written; callers treat missing trailing cells as blank. Column
/// indexes are 0-based, row positions 1-based.
pub trait TableBackend {
    /// Names of every table that has a header or at least one row.
    ///
    /// # Errors
    /// Returns [`IntakeError::StorageReadFailure`] when the store cannot be read.
    fn list_tables(&self) -> Result<Vec<String>, IntakeError>;

    /// Current header row, empty when the table does not exist yet.
    ///
    /// # Errors
    /// Returns [`IntakeError::StorageReadFailure`] when the store cannot be read.
    fn read_header(&self, table: &str) -> Result<Vec<String>, IntakeError>;

    /// Append `names` to the header, but only if it still has `expected_len`
    /// columns. Returns `false` when another writer extended it first.
    ///
    /// # Errors
    /// Returns [`IntakeError::StorageWriteFailure`] when the store rejects the write.
    fn append_header_columns(
        &self,
        table: &str,
        expected_len: usize,
        names: &[String],
    ) -> Result<bool, IntakeError>;

    /// Number of data rows (header excluded).
    ///
    /// # Errors
    /// Returns [`IntakeError::StorageReadFailure`] when the store cannot be read.
    fn row_count(&self, table: &str) -> Result<u64, IntakeError>;

    /// Atomically append a row at `last + 1` and return its position.
    ///
    /// # Errors
    /// Returns [`IntakeError::StorageWriteFailure`] when the store rejects the write.
    fn append_row(&self, table: &str, cells: &[CellValue]) -> Result<RowPosition, IntakeError>;

    /// One row's cells, or `None` when no row exists at `row`.
    ///
    /// # Errors
    /// Returns [`IntakeError::StorageReadFailure`] when the store cannot be read.
    fn read_row(&self, table: &str, row: RowPosition)
        -> Result<Option<Vec<CellValue>>, IntakeError>;

    /// Every data row in position order.
    ///
    /// # Errors
    /// Returns [`IntakeError::StorageReadFailure`] when the store cannot be read.
    fn read_rows(&self, table: &str) -> Result<Vec<Vec<CellValue>>, IntakeError>;

    /// One column's cell for every row, in position order.
    ///
    /// # Errors
    /// Returns [`IntakeError::StorageReadFailure`] when the store cannot be read.
    fn read_column(&self, table: &str, column: usize) -> Result<Vec<CellValue>, IntakeError> {
        Ok(self
            .read_rows(table)?
            .into_iter()
            .map(|mut cells| {
                if column < cells.len() {
                    cells.swap_remove(column)
                } else {
                    CellValue::Blank
                }
            })
            .collect())
    }

    /// Overwrite one cell. Writing [`CellValue::Blank`] clears it.
    ///
    /// # Errors
    /// Returns [`IntakeError::RowNotFound`] for a missing row and
    /// [`IntakeError::StorageWriteFailure`] when the store rejects the write.
    fn write_cell(
        &self,
        table: &str,
        row: RowPosition,
        column: usize,
        value: &CellValue,
    ) -> Result<(), IntakeError>;

    /// Write one cell only if it is currently blank. Returns whether the
    /// value was written.
    ///
    /// # Errors
    /// Returns [`IntakeError::RowNotFound`] for a missing row and
    /// [`IntakeError::StorageWriteFailure`] when the store rejects the write.
    fn write_cell_if_blank(
        &self,
        table: &str,
        row: RowPosition,
        column: usize,
        value: &CellValue,
    ) -> Result<bool, IntakeError>;
}

/// Key-value persistence for "highest identifier issued so far".
pub trait CounterStore {
    /// # Errors
    /// Returns an error when the persistence service is unavailable.
    fn get(&self, key: &CounterKey) -> Result<Option<u64>, IntakeError>;

    /// Set `key` to `new` only if it currently holds `expected` (`None` meaning
    /// absent). Returns whether the swap happened.
    ///
    /// # Errors
    /// Returns an error when the persistence service is unavailable.
    fn compare_and_set(
        &self,
        key: &CounterKey,
        expected: Option<u64>,
        new: u64,
    ) -> Result<bool, IntakeError>;

    /// # Errors
    /// Returns an error when the persistence service is unavailable.
    fn remove(&self, key: &CounterKey) -> Result<(), IntakeError>;
}
