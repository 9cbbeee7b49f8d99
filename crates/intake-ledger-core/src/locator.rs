use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::schema::position_in;
use crate::{CellValue, IntakeError, LedgerLocks, RowPosition, SchemaManager, TableBackend, TableLayout};

/// Typed form of an opaque row identifier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub enum RowKey {
    LegacyId(u64),
    CurrentId(u64),
}

impl RowKey {
    /// Candidate keys for a raw id, legacy first. Empty when the id is not a
    /// positive integer.
    #[must_use]
    pub fn candidates(raw: &str) -> Vec<Self> {
        match CellValue::Text(raw.to_string()).as_identifier() {
            Some(value) if value > 0 => vec![Self::LegacyId(value), Self::CurrentId(value)],
            _ => Vec::new(),
        }
    }

    #[must_use]
    pub fn value(self) -> u64 {
        match self {
            Self::LegacyId(value) | Self::CurrentId(value) => value,
        }
    }

    fn column(self, layout: &TableLayout) -> Option<&str> {
        match self {
            Self::LegacyId(_) => layout.legacy_id_column.as_deref(),
            Self::CurrentId(_) => layout.current_id_column.as_deref(),
        }
    }
}

/// One identifier value held by more than one row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DuplicateIdentifier {
    pub column: String,
    pub value: String,
    pub rows: Vec<RowPosition>,
}

/// Resolves opaque ids to rows and applies cell updates.
pub struct RowLocator<'a, B: TableBackend + ?Sized> {
    backend: &'a B,
    locks: &'a LedgerLocks,
}

impl<'a, B: TableBackend + ?Sized> RowLocator<'a, B> {
    #[must_use]
    pub fn new(backend: &'a B, locks: &'a LedgerLocks) -> Self {
        Self { backend, locks }
    }

    /// First row, top to bottom, whose legacy or current id column loosely
    /// equals `id`.
    ///
    /// # Errors
    /// Returns a read failure from the backend.
    pub fn find_row(&self, layout: &TableLayout, id: &str) -> Result<Option<RowPosition>, IntakeError> {
        let candidates = RowKey::candidates(id);
        if candidates.is_empty() {
            debug!(table = %layout.name, id, "id is not a positive integer");
            return Ok(None);
        }

        let header = self.backend.read_header(&layout.name)?;
        let columns: Vec<(RowKey, usize)> = candidates
            .into_iter()
            .filter_map(|key| {
                let column = key.column(layout)?;
                Some((key, position_in(&header, column)?))
            })
            .collect();
        if columns.is_empty() {
            return Ok(None);
        }

        let rows = self.backend.read_rows(&layout.name)?;
        Ok(rows.iter().enumerate().find_map(|(index, cells)| {
            columns
                .iter()
                .any(|(key, column)| cells.get(*column).is_some_and(|cell| cell.loosely_equals(key.value())))
                .then(|| RowPosition(index as u64 + 1))
        }))
    }

    /// First row matching one specific key.
    ///
    /// # Errors
    /// Returns a read failure from the backend.
    pub fn find_by_key(&self, layout: &TableLayout, key: RowKey) -> Result<Option<RowPosition>, IntakeError> {
        let Some(column) = key.column(layout) else {
            return Ok(None);
        };
        let Some(index) = position_in(&self.backend.read_header(&layout.name)?, column) else {
            return Ok(None);
        };
        Ok(self
            .backend
            .read_column(&layout.name, index)?
            .iter()
            .position(|cell| cell.loosely_equals(key.value()))
            .map(|position| RowPosition(position as u64 + 1)))
    }

    /// [`Self::find_row`], failing with [`IntakeError::RowNotFound`] on a miss.
    ///
    /// # Errors
    /// Returns [`IntakeError::RowNotFound`] or a read failure.
    pub fn require_row(&self, layout: &TableLayout, id: &str) -> Result<RowPosition, IntakeError> {
        self.find_row(layout, id)?.ok_or_else(|| IntakeError::RowNotFound {
            table: layout.name.clone(),
            id: id.to_string(),
        })
    }

    /// The row as `(column, value)` pairs aligned with the header. Cells
    /// past the end of a short row read as blank.
    ///
    /// # Errors
    /// Returns [`IntakeError::RowNotFound`] or a read failure.
    pub fn read_record(
        &self,
        layout: &TableLayout,
        row: RowPosition,
    ) -> Result<Vec<(String, CellValue)>, IntakeError> {
        let header = self.backend.read_header(&layout.name)?;
        let cells = self.backend.read_row(&layout.name, row)?.ok_or_else(|| IntakeError::RowNotFound {
            table: layout.name.clone(),
            id: format!("row {row}"),
        })?;
        Ok(header
            .into_iter()
            .enumerate()
            .map(|(index, name)| (name, cells.get(index).cloned().unwrap_or_default()))
            .collect())
    }

    /// Write `fields` into `row`, creating missing columns. Last write wins.
    ///
    /// # Errors
    /// Returns [`IntakeError::Validation`] when a field targets an identifier
    /// column, [`IntakeError::RowNotFound`] for a missing row, or a storage
    /// failure.
    pub fn update_cells(
        &self,
        layout: &TableLayout,
        row: RowPosition,
        fields: &[(String, CellValue)],
    ) -> Result<(), IntakeError> {
        if let Some((name, _)) = fields.iter().find(|(name, _)| layout.is_identifier_column(name)) {
            return Err(IntakeError::Validation(format!(
                "identifier column `{name}` of table `{}` is immutable",
                layout.name
            )));
        }
        if self.backend.read_row(&layout.name, row)?.is_none() {
            return Err(IntakeError::RowNotFound {
                table: layout.name.clone(),
                id: format!("row {row}"),
            });
        }

        let names: Vec<&str> = fields.iter().map(|(name, _)| name.as_str()).collect();
        SchemaManager::new(self.backend, self.locks)
            .ensure_columns(&layout.name, &names)
            .map_err(IntakeError::into_write_failure)?;
        let header = self.backend.read_header(&layout.name).map_err(IntakeError::into_write_failure)?;

        for (name, value) in fields {
            let column = position_in(&header, name).ok_or_else(|| {
                IntakeError::StorageWriteFailure(format!(
                    "column `{name}` missing from `{}` after extension",
                    layout.name
                ))
            })?;
            self.backend.write_cell(&layout.name, row, column, value)?;
        }
        debug!(table = %layout.name, %row, fields = fields.len(), "updated cells");
        Ok(())
    }

    /// Identifier values that appear in more than one row. Lookups only ever
    /// see the first of them.
    ///
    /// # Errors
    /// Returns a read failure from the backend.
    pub fn duplicate_identifiers(&self, layout: &TableLayout) -> Result<Vec<DuplicateIdentifier>, IntakeError> {
        let header = self.backend.read_header(&layout.name)?;
        let mut duplicates = Vec::new();

        for spec in layout.identifiers.iter().filter(|spec| spec.counter_kind().is_some()) {
            let Some(index) = position_in(&header, &spec.column) else {
                continue;
            };
            let mut seen: BTreeMap<u64, Vec<RowPosition>> = BTreeMap::new();
            for (position, cell) in self.backend.read_column(&layout.name, index)?.iter().enumerate() {
                if let Some(value) = cell.as_identifier() {
                    seen.entry(value).or_default().push(RowPosition(position as u64 + 1));
                }
            }
            for (value, rows) in seen.into_iter().filter(|(_, rows)| rows.len() > 1) {
                warn!(table = %layout.name, column = %spec.column, value, ?rows, "duplicate identifier");
                duplicates.push(DuplicateIdentifier {
                    column: spec.column.clone(),
                    value: value.to_string(),
                    rows,
                });
            }
        }
        Ok(duplicates)
    }
}
