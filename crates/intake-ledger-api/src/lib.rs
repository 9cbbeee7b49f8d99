use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use intake_ledger_core::{
    format_timestamp, normalize_status, to_display_string, BackfillReport, BackfillService,
    CanonicalStatus, CellValue, CounterInit, DuplicateIdentifier, IdentifierAllocator,
    IntakeError, LedgerConfig, LedgerLocks, Record, RowLocator, RowPosition, RowWriter,
    SchemaConflict, SchemaManager, TableLayout, STATUS_FIELD,
};
use intake_ledger_store_sqlite::{SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use tracing::{info, warn};

mod config;

pub use config::{load_config, parse_config};

pub const API_CONTRACT_VERSION: &str = "api.v1";

pub const STATUS_UPDATED_BY_COLUMN: &str = "Status Updated By";
pub const STATUS_UPDATED_AT_COLUMN: &str = "Status Updated At";
pub const COMMENTS_COLUMN: &str = "Comments";
pub const COMMENT_UPDATED_BY_COLUMN: &str = "Comment Updated By";
pub const COMMENT_UPDATED_AT_COLUMN: &str = "Comment Updated At";

const DEFAULT_ACTOR: &str = "system";

fn default_actor() -> String {
    DEFAULT_ACTOR.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmissionRequest {
    /// Table name or alias; inferred from the fields when absent.
    #[serde(default)]
    pub table: Option<String>,
    pub confirmation: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub submitted_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmissionReceipt {
    pub table: String,
    pub row_position: RowPosition,
    pub confirmation: String,
    pub status: String,
    pub added_columns: Vec<String>,
    pub identifiers: BTreeMap<String, String>,
    /// Set when the row was stored but identifier assignment failed; a
    /// later repair pass fills the gap.
    pub identifier_warning: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusUpdateRequest {
    pub table: String,
    pub id: String,
    pub status: String,
    #[serde(default = "default_actor")]
    pub actor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommentUpdateRequest {
    pub table: String,
    pub id: String,
    pub comment: String,
    #[serde(default = "default_actor")]
    pub actor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileLinkRequest {
    pub table: String,
    pub id: String,
    pub field: String,
    pub url: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub uploaded_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RowUpdateResult {
    pub table: String,
    pub row_position: RowPosition,
    pub updated_columns: Vec<String>,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<CanonicalStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RowView {
    pub table: String,
    pub row_position: RowPosition,
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableColumns {
    pub table: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CounterInitReport {
    pub table: String,
    pub counters: Vec<CounterInit>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditReport {
    pub table: String,
    pub schema_conflicts: Vec<SchemaConflict>,
    pub duplicate_identifiers: Vec<DuplicateIdentifier>,
}

/// Workflow facade over one ledger database.
///
/// Each call opens (and migrates) its own connection. Clones share the
/// configuration and the lock registry, so every clone in a process
/// serializes header extension and identifier allocation together.
#[derive(Debug, Clone)]
pub struct IntakeLedgerApi {
    db_path: PathBuf,
    config: Arc<LedgerConfig>,
    locks: Arc<LedgerLocks>,
}

impl IntakeLedgerApi {
    /// Facade over the built-in table layouts.
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self {
            db_path,
            config: Arc::new(LedgerConfig::default()),
            locks: Arc::new(LedgerLocks::new()),
        }
    }

    /// Facade over a custom configuration.
    ///
    /// # Errors
    /// Returns an error when the configuration does not validate.
    pub fn with_config(db_path: PathBuf, config: LedgerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { db_path, config: Arc::new(config), locks: Arc::new(LedgerLocks::new()) })
    }

    #[must_use]
    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_migrated(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    fn selected_layouts(&self, table: Option<&str>) -> Result<Vec<&TableLayout>> {
        match table {
            Some(selector) => Ok(vec![self.config.table(selector)?]),
            None => Ok(self.config.tables.iter().collect()),
        }
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Store one submission and assign its identifiers.
    ///
    /// The row is committed before identifiers are assigned. An assignment
    /// failure does not fail the submission; it is reported in
    /// [`SubmissionReceipt::identifier_warning`].
    ///
    /// # Errors
    /// Returns an error for an empty confirmation, an unknown or
    /// uninferable table, or when the row cannot be written.
    pub fn submit(&self, request: SubmissionRequest) -> Result<SubmissionReceipt> {
        if request.confirmation.trim().is_empty() {
            return Err(IntakeError::Validation("confirmation MUST NOT be empty".to_string()).into());
        }
        let confirmation = request.confirmation;

        let mut record = Record::from_fields(&request.fields);
        record.confirmation = Some(confirmation.clone());
        let status = record.status.get_or_insert(CanonicalStatus::New).clone();
        let layout = self.config.resolve(request.table.as_deref(), &record)?;

        let store = self.open_migrated()?;
        let now = request.submitted_at.unwrap_or_else(OffsetDateTime::now_utc);
        let appended = RowWriter::new(&store, &self.locks).append_row(layout, &record, now)?;

        let allocator = IdentifierAllocator::new(&store, &store, &self.locks);
        let (identifiers, identifier_warning) =
            match allocator.assign_identifiers(layout, appended.row_position, now) {
                Ok(assigned) => (assigned.assigned, None),
                Err(err) => {
                    warn!(
                        table = %layout.name,
                        row = %appended.row_position,
                        code = err.code(),
                        error = %err,
                        "submission stored without identifiers"
                    );
                    (BTreeMap::new(), Some(err.to_string()))
                }
            };

        info!(table = %layout.name, row = %appended.row_position, "submission stored");
        Ok(SubmissionReceipt {
            table: appended.table,
            row_position: appended.row_position,
            confirmation,
            status: to_display_string(&status),
            added_columns: appended.added_columns,
            identifiers,
            identifier_warning,
        })
    }

    /// Normalize and record a status change on the row matching `id`.
    ///
    /// # Errors
    /// Returns an error when the table or row cannot be found or written.
    pub fn update_status(&self, request: StatusUpdateRequest) -> Result<RowUpdateResult> {
        let status = normalize_status(Some(&request.status));
        let mut result = self.update_row(
            &request.table,
            &request.id,
            vec![
                (STATUS_FIELD.to_string(), CellValue::Text(to_display_string(&status))),
                (STATUS_UPDATED_BY_COLUMN.to_string(), CellValue::Text(request.actor)),
            ],
            STATUS_UPDATED_AT_COLUMN,
            OffsetDateTime::now_utc(),
        )?;
        result.status = Some(status);
        Ok(result)
    }

    /// Replace the comment on the row matching `id`.
    ///
    /// # Errors
    /// Returns an error when the table or row cannot be found or written.
    pub fn update_comment(&self, request: CommentUpdateRequest) -> Result<RowUpdateResult> {
        self.update_row(
            &request.table,
            &request.id,
            vec![
                (COMMENTS_COLUMN.to_string(), CellValue::Text(request.comment)),
                (COMMENT_UPDATED_BY_COLUMN.to_string(), CellValue::Text(request.actor)),
            ],
            COMMENT_UPDATED_AT_COLUMN,
            OffsetDateTime::now_utc(),
        )
    }

    /// Record an uploaded file's URL under `field` on the row matching `id`.
    ///
    /// # Errors
    /// Returns an error for an empty field or URL, an identifier field, or
    /// when the table or row cannot be found or written.
    pub fn attach_file_link(&self, request: FileLinkRequest) -> Result<RowUpdateResult> {
        let field = request.field.trim();
        if field.is_empty() {
            return Err(IntakeError::Validation("file field MUST NOT be empty".to_string()).into());
        }
        if request.url.trim().is_empty() {
            return Err(IntakeError::Validation("file URL MUST NOT be empty".to_string()).into());
        }

        self.update_row(
            &request.table,
            &request.id,
            vec![(field.to_string(), CellValue::Text(request.url.trim().to_string()))],
            &format!("{field} Uploaded At"),
            request.uploaded_at.unwrap_or_else(OffsetDateTime::now_utc),
        )
    }

    fn update_row(
        &self,
        table: &str,
        id: &str,
        mut fields: Vec<(String, CellValue)>,
        timestamp_column: &str,
        at: OffsetDateTime,
    ) -> Result<RowUpdateResult> {
        let layout = self.config.table(table)?;
        let updated_at = format_timestamp(at)?;
        fields.push((timestamp_column.to_string(), CellValue::Text(updated_at.clone())));

        let store = self.open_migrated()?;
        let locator = RowLocator::new(&store, &self.locks);
        let row_position = locator.require_row(layout, id)?;
        locator.update_cells(layout, row_position, &fields)?;

        info!(table = %layout.name, row = %row_position, id, "row updated");
        Ok(RowUpdateResult {
            table: layout.name.clone(),
            row_position,
            updated_columns: fields.into_iter().map(|(name, _)| name).collect(),
            updated_at,
            status: None,
        })
    }

    /// Assign identifiers to rows that lack them, for one table or all of them.
    ///
    /// # Errors
    /// Returns an error for an unknown table or when a table cannot be read.
    pub fn repair_missing_identifiers(&self, table: Option<&str>) -> Result<Vec<BackfillReport>> {
        let layouts = self.selected_layouts(table)?;
        let store = self.open_migrated()?;
        let service = BackfillService::new(&store, &store, &self.locks);
        let now = OffsetDateTime::now_utc();

        layouts
            .into_iter()
            .map(|layout| {
                service
                    .repair_missing_identifiers(layout, now)
                    .with_context(|| format!("identifier repair failed for {}", layout.name))
            })
            .collect()
    }

    /// Raise persisted counters to their columns' scanned maxima.
    ///
    /// # Errors
    /// Returns an error for an unknown table or when a counter cannot be initialized.
    pub fn initialize_counters(&self, table: Option<&str>) -> Result<Vec<CounterInitReport>> {
        let layouts = self.selected_layouts(table)?;
        let store = self.open_migrated()?;
        let allocator = IdentifierAllocator::new(&store, &store, &self.locks);

        let mut reports = Vec::with_capacity(layouts.len());
        for layout in layouts {
            let mut counters = Vec::new();
            for counter in layout.counter_kinds() {
                counters.push(allocator.initialize_counter(layout, counter)?);
            }
            reports.push(CounterInitReport { table: layout.name.clone(), counters });
        }
        Ok(reports)
    }

    /// Header conflicts and duplicated identifier values per table.
    ///
    /// # Errors
    /// Returns an error for an unknown table or when a table cannot be read.
    pub fn audit(&self, table: Option<&str>) -> Result<Vec<AuditReport>> {
        let layouts = self.selected_layouts(table)?;
        let store = self.open_migrated()?;
        let schema = SchemaManager::new(&store, &self.locks);
        let locator = RowLocator::new(&store, &self.locks);

        let mut reports = Vec::with_capacity(layouts.len());
        for layout in layouts {
            reports.push(AuditReport {
                table: layout.name.clone(),
                schema_conflicts: schema.audit(&layout.name)?,
                duplicate_identifiers: locator.duplicate_identifiers(layout)?,
            });
        }
        Ok(reports)
    }

    /// Current header of a configured table.
    ///
    /// # Errors
    /// Returns an error for an unknown table or when the header cannot be read.
    pub fn columns(&self, table: &str) -> Result<TableColumns> {
        let layout = self.config.table(table)?;
        let store = self.open_migrated()?;
        let columns = SchemaManager::new(&store, &self.locks).get_columns(&layout.name)?;
        Ok(TableColumns { table: layout.name.clone(), columns })
    }

    /// The row matching `id`, keyed by column name. Where header names
    /// collide after normalization the first column wins.
    ///
    /// # Errors
    /// Returns an error for an unknown table or when no row matches `id`.
    pub fn show_row(&self, table: &str, id: &str) -> Result<RowView> {
        let layout = self.config.table(table)?;
        let store = self.open_migrated()?;
        let locator = RowLocator::new(&store, &self.locks);
        let row_position = locator.require_row(layout, id)?;

        let mut fields = Map::new();
        for (column, value) in locator.read_record(layout, row_position)? {
            fields.entry(column).or_insert_with(|| value.to_json());
        }
        Ok(RowView { table: layout.name.clone(), row_position, fields })
    }
}
