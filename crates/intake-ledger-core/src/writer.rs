use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;

use crate::schema::position_in;
use crate::{
    format_timestamp, CellValue, IntakeError, LedgerLocks, Record, RowPosition, SchemaManager,
    TableBackend, TableLayout,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppendedRow {
    pub table: String,
    pub row_position: RowPosition,
    pub added_columns: Vec<String>,
}

pub struct RowWriter<'a, B: TableBackend + ?Sized> {
    backend: &'a B,
    locks: &'a LedgerLocks,
}

impl<'a, B: TableBackend + ?Sized> RowWriter<'a, B> {
    #[must_use]
    pub fn new(backend: &'a B, locks: &'a LedgerLocks) -> Self {
        Self { backend, locks }
    }

    /// Append `record` as a new row of `layout`'s table.
    ///
    /// The header is first extended with the timestamp column, the record's
    /// fields and the layout's identifier columns. Identifier cells are left
    /// blank for [`crate::IdentifierAllocator::assign_identifiers`].
    ///
    /// # Errors
    /// Every storage failure surfaces as [`IntakeError::StorageWriteFailure`].
    pub fn append_row(
        &self,
        layout: &TableLayout,
        record: &Record,
        now: OffsetDateTime,
    ) -> Result<AppendedRow, IntakeError> {
        self.append_inner(layout, record, now).map_err(IntakeError::into_write_failure)
    }

    fn append_inner(
        &self,
        layout: &TableLayout,
        record: &Record,
        now: OffsetDateTime,
    ) -> Result<AppendedRow, IntakeError> {
        let table = layout.name.as_str();
        let fields: Vec<(String, CellValue)> = record
            .fields()
            .into_iter()
            .filter(|(name, _)| {
                let reserved = layout.is_identifier_column(name)
                    || crate::column_key(name) == crate::column_key(&layout.timestamp_column);
                if reserved {
                    debug!(table, field = %name, "ignoring submitted value for a reserved column");
                }
                !reserved
            })
            .collect();

        let mut required: Vec<&str> = Vec::with_capacity(fields.len() + layout.identifiers.len() + 1);
        required.push(&layout.timestamp_column);
        required.extend(fields.iter().map(|(name, _)| name.as_str()));
        required.extend(layout.identifier_columns());

        let added = SchemaManager::new(self.backend, self.locks).ensure_columns(table, &required)?;
        let header = self.backend.read_header(table)?;

        let mut cells = vec![CellValue::Blank; header.len()];
        if let Some(index) = position_in(&header, &layout.timestamp_column) {
            cells[index] = CellValue::Text(format_timestamp(now)?);
        }
        for (name, value) in fields {
            if let Some(index) = position_in(&header, &name) {
                cells[index] = value;
            }
        }

        let row_position = self.backend.append_row(table, &cells)?;
        debug!(table, row = %row_position, "appended row");
        Ok(AppendedRow { table: table.to_string(), row_position, added_columns: added.added })
    }
}
