use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use intake_ledger_core::{
    column_key, CellValue, CounterKey, CounterStore, IntakeError, RowPosition, TableBackend,
};
use rusqlite::{
    params, Connection, DatabaseName, OptionalExtension, Transaction, TransactionBehavior,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info};

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS ledger_tables (
  table_key TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ledger_columns (
  table_key TEXT NOT NULL,
  position INTEGER NOT NULL CHECK (position >= 0),
  name TEXT NOT NULL,
  added_at TEXT NOT NULL,
  PRIMARY KEY (table_key, position),
  FOREIGN KEY (table_key) REFERENCES ledger_tables(table_key)
);

CREATE TABLE IF NOT EXISTS ledger_rows (
  table_key TEXT NOT NULL,
  position INTEGER NOT NULL CHECK (position >= 1),
  appended_at TEXT NOT NULL,
  PRIMARY KEY (table_key, position),
  FOREIGN KEY (table_key) REFERENCES ledger_tables(table_key)
);

CREATE TABLE IF NOT EXISTS ledger_cells (
  table_key TEXT NOT NULL,
  row_position INTEGER NOT NULL,
  column_position INTEGER NOT NULL CHECK (column_position >= 0),
  value_json TEXT NOT NULL,
  PRIMARY KEY (table_key, row_position, column_position),
  FOREIGN KEY (table_key, row_position) REFERENCES ledger_rows(table_key, position)
);

CREATE TABLE IF NOT EXISTS ledger_counters (
  counter_key TEXT PRIMARY KEY,
  table_name TEXT NOT NULL,
  counter_kind TEXT NOT NULL,
  value INTEGER NOT NULL CHECK (value >= 0),
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_ledger_cells_column
  ON ledger_cells(table_key, column_position);
";

/// Tabular ledger and counter store on one `SQLite` connection.
///
/// Every table shares the `ledger_*` relations: headers are rows of
/// `ledger_columns`, cells are JSON scalars in `ledger_cells`. Writes that
/// must observe-then-modify run in `BEGIN IMMEDIATE` transactions, so they
/// are atomic across connections to the same file.
pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    /// Cells stored at a column position the table's header does not have.
    pub cells_outside_header: u64,
    /// Tables whose row positions are not exactly `1..=row_count`.
    pub tables_with_row_gaps: Vec<String>,
    pub schema_status: SchemaStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CounterRecord {
    pub key: String,
    pub table: String,
    pub counter: String,
    pub value: u64,
    pub updated_at: String,
}

impl SqliteStore {
    /// Open a SQLite-backed ledger and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version == 0 {
            self.apply_migration_1()?;
        } else if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn apply_migration_1(&mut self) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
        tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
        record_schema_version(&tx, 1)?;
        tx.commit().context("failed to commit migration v1")?;
        info!(version = 1, "applied ledger migration");
        Ok(())
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.migrate()?;
        Ok(())
    }

    /// Run quick-check, foreign-key-check, ledger consistency and schema status probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let (cells_outside_header, tables_with_row_gaps) = if table_exists(&self.conn, "ledger_cells")? {
            (count_cells_outside_header(&self.conn)?, tables_with_row_gaps(&self.conn)?)
        } else {
            (0, Vec::new())
        };

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            cells_outside_header,
            tables_with_row_gaps,
            schema_status,
        })
    }

    /// Every persisted counter, ordered by key.
    ///
    /// # Errors
    /// Returns an error when the counter table cannot be read.
    pub fn list_counters(&self) -> Result<Vec<CounterRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT counter_key, table_name, counter_kind, value, updated_at
                 FROM ledger_counters
                 ORDER BY counter_key ASC",
            )
            .context("failed to prepare counter listing")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut counters = Vec::new();
        for row in rows {
            let (key, table, counter, value, updated_at) = row?;
            counters.push(CounterRecord {
                value: u64::try_from(value)
                    .with_context(|| format!("counter {key} holds negative value {value}"))?,
                key,
                table,
                counter,
                updated_at,
            });
        }
        Ok(counters)
    }

    fn immediate(&self) -> Result<Transaction<'_>> {
        Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .context("failed to start immediate transaction")
    }

    fn table_names(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM ledger_tables ORDER BY rowid ASC")
            .context("failed to prepare table listing")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to list ledger tables")?;
        Ok(names)
    }

    fn header(&self, table: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT name FROM ledger_columns WHERE table_key = ?1 ORDER BY position ASC",
            )
            .context("failed to prepare header query")?;
        let header = stmt
            .query_map(params![column_key(table)], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("failed to read header of {table}"))?;
        Ok(header)
    }

    fn extend_header(&self, table: &str, expected_len: usize, names: &[String]) -> Result<bool> {
        let key = column_key(table);
        let tx = self.immediate()?;
        ensure_table(&tx, &key, table)?;

        let current: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM ledger_columns WHERE table_key = ?1",
                params![key],
                |row| row.get(0),
            )
            .context("failed to count header columns")?;
        if usize::try_from(current).context("negative column count")? != expected_len {
            debug!(table, current, expected_len, "header moved; extension skipped");
            return Ok(false);
        }

        let now = now_rfc3339()?;
        for (offset, name) in names.iter().enumerate() {
            tx.execute(
                "INSERT INTO ledger_columns(table_key, position, name, added_at) VALUES (?1, ?2, ?3, ?4)",
                params![key, to_sql_index(expected_len + offset)?, name, now],
            )
            .with_context(|| format!("failed to append column {name} to {table}"))?;
        }

        tx.commit().context("failed to commit header extension")?;
        Ok(true)
    }

    fn count_rows(&self, table: &str) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM ledger_rows WHERE table_key = ?1",
                params![column_key(table)],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to count rows of {table}"))?;
        u64::try_from(count).context("negative row count")
    }

    fn insert_row(&self, table: &str, cells: &[CellValue]) -> Result<RowPosition> {
        let key = column_key(table);
        let tx = self.immediate()?;
        ensure_table(&tx, &key, table)?;

        let position: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(position), 0) + 1 FROM ledger_rows WHERE table_key = ?1",
                params![key],
                |row| row.get(0),
            )
            .context("failed to pick next row position")?;
        tx.execute(
            "INSERT INTO ledger_rows(table_key, position, appended_at) VALUES (?1, ?2, ?3)",
            params![key, position, now_rfc3339()?],
        )
        .with_context(|| format!("failed to append row {position} to {table}"))?;

        for (column, cell) in cells.iter().enumerate().filter(|(_, cell)| !cell.is_blank()) {
            tx.execute(
                "INSERT INTO ledger_cells(table_key, row_position, column_position, value_json)
                 VALUES (?1, ?2, ?3, ?4)",
                params![key, position, to_sql_index(column)?, encode_cell(cell)?],
            )
            .with_context(|| format!("failed to write cell {column} of row {position}"))?;
        }

        tx.commit().context("failed to commit row append")?;
        Ok(RowPosition(u64::try_from(position).context("negative row position")?))
    }

    fn row_cells(&self, table: &str, row: RowPosition) -> Result<Option<Vec<CellValue>>> {
        let key = column_key(table);
        let position = to_sql_position(row)?;
        if !row_exists(&self.conn, &key, position)? {
            return Ok(None);
        }

        let mut stmt = self
            .conn
            .prepare(
                "SELECT column_position, value_json FROM ledger_cells
                 WHERE table_key = ?1 AND row_position = ?2
                 ORDER BY column_position ASC",
            )
            .context("failed to prepare row query")?;
        let mut rows = stmt.query(params![key, position])?;

        let mut cells = Vec::new();
        while let Some(row) = rows.next()? {
            let column: i64 = row.get(0)?;
            let raw: String = row.get(1)?;
            place(&mut cells, from_sql_index(column)?, decode_cell(&raw)?);
        }
        Ok(Some(cells))
    }

    fn all_rows(&self, table: &str) -> Result<Vec<Vec<CellValue>>> {
        let key = column_key(table);
        let mut positions = self
            .conn
            .prepare("SELECT position FROM ledger_rows WHERE table_key = ?1 ORDER BY position ASC")
            .context("failed to prepare row listing")?;
        let mut rows: BTreeMap<i64, Vec<CellValue>> = BTreeMap::new();
        for position in positions.query_map(params![key], |row| row.get::<_, i64>(0))? {
            rows.insert(position?, Vec::new());
        }

        let mut stmt = self
            .conn
            .prepare(
                "SELECT row_position, column_position, value_json FROM ledger_cells
                 WHERE table_key = ?1",
            )
            .context("failed to prepare cell listing")?;
        let mut cells = stmt.query(params![key])?;
        while let Some(cell) = cells.next()? {
            let position: i64 = cell.get(0)?;
            let column: i64 = cell.get(1)?;
            let raw: String = cell.get(2)?;
            if let Some(row) = rows.get_mut(&position) {
                place(row, from_sql_index(column)?, decode_cell(&raw)?);
            }
        }

        Ok(rows.into_values().collect())
    }

    fn column_cells(&self, table: &str, column: usize) -> Result<Vec<CellValue>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT c.value_json FROM ledger_rows r
                 LEFT JOIN ledger_cells c
                   ON c.table_key = r.table_key
                  AND c.row_position = r.position
                  AND c.column_position = ?2
                 WHERE r.table_key = ?1
                 ORDER BY r.position ASC",
            )
            .context("failed to prepare column scan")?;
        let mut rows = stmt.query(params![column_key(table), to_sql_index(column)?])?;

        let mut values = Vec::new();
        while let Some(row) = rows.next()? {
            let raw: Option<String> = row.get(0)?;
            values.push(match raw {
                Some(raw) => decode_cell(&raw)?,
                None => CellValue::Blank,
            });
        }
        Ok(values)
    }

    fn put_cell(
        &self,
        table: &str,
        row: RowPosition,
        column: usize,
        value: &CellValue,
        only_if_blank: bool,
    ) -> Result<bool> {
        let key = column_key(table);
        let position = to_sql_position(row)?;
        let column = to_sql_index(column)?;
        let tx = self.immediate()?;

        if !row_exists(&tx, &key, position)? {
            return Err(anyhow::Error::new(IntakeError::RowNotFound {
                table: table.to_string(),
                id: format!("row {row}"),
            }));
        }

        if only_if_blank {
            let current: Option<String> = tx
                .query_row(
                    "SELECT value_json FROM ledger_cells
                     WHERE table_key = ?1 AND row_position = ?2 AND column_position = ?3",
                    params![key, position, column],
                    |row| row.get(0),
                )
                .optional()
                .context("failed to read current cell")?;
            if let Some(raw) = current {
                if !decode_cell(&raw)?.is_blank() {
                    return Ok(false);
                }
            }
        }

        if value.is_blank() {
            tx.execute(
                "DELETE FROM ledger_cells
                 WHERE table_key = ?1 AND row_position = ?2 AND column_position = ?3",
                params![key, position, column],
            )
            .context("failed to clear cell")?;
        } else {
            tx.execute(
                "INSERT INTO ledger_cells(table_key, row_position, column_position, value_json)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(table_key, row_position, column_position)
                 DO UPDATE SET value_json = excluded.value_json",
                params![key, position, column, encode_cell(value)?],
            )
            .context("failed to write cell")?;
        }

        tx.commit().context("failed to commit cell write")?;
        Ok(true)
    }

    fn counter_value(&self, key: &CounterKey) -> Result<Option<u64>> {
        let value: Option<i64> = self
            .conn
            .query_row(
                "SELECT value FROM ledger_counters WHERE counter_key = ?1",
                params![key.to_string()],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read counter {key}"))?;
        value
            .map(u64::try_from)
            .transpose()
            .with_context(|| format!("counter {key} holds a negative value"))
    }

    fn swap_counter(&self, key: &CounterKey, expected: Option<u64>, new: u64) -> Result<bool> {
        let new = i64::try_from(new).with_context(|| format!("counter {key} overflowed"))?;
        let now = now_rfc3339()?;
        let changed = match expected {
            None => self
                .conn
                .execute(
                    "INSERT OR IGNORE INTO ledger_counters(
                        counter_key, table_name, counter_kind, value, updated_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![key.to_string(), key.table, key.counter, new, now],
                )
                .with_context(|| format!("failed to create counter {key}"))?,
            Some(expected) => self
                .conn
                .execute(
                    "UPDATE ledger_counters SET value = ?2, updated_at = ?3
                     WHERE counter_key = ?1 AND value = ?4",
                    params![
                        key.to_string(),
                        new,
                        now,
                        i64::try_from(expected).context("expected counter value overflowed")?
                    ],
                )
                .with_context(|| format!("failed to advance counter {key}"))?,
        };
        Ok(changed == 1)
    }

    fn delete_counter(&self, key: &CounterKey) -> Result<()> {
        self.conn
            .execute("DELETE FROM ledger_counters WHERE counter_key = ?1", params![key.to_string()])
            .with_context(|| format!("failed to delete counter {key}"))?;
        Ok(())
    }
}

impl TableBackend for SqliteStore {
    fn list_tables(&self) -> Result<Vec<String>, IntakeError> {
        self.table_names().map_err(read_failure)
    }

    fn read_header(&self, table: &str) -> Result<Vec<String>, IntakeError> {
        self.header(table).map_err(read_failure)
    }

    fn append_header_columns(
        &self,
        table: &str,
        expected_len: usize,
        names: &[String],
    ) -> Result<bool, IntakeError> {
        self.extend_header(table, expected_len, names).map_err(write_failure)
    }

    fn row_count(&self, table: &str) -> Result<u64, IntakeError> {
        self.count_rows(table).map_err(read_failure)
    }

    fn append_row(&self, table: &str, cells: &[CellValue]) -> Result<RowPosition, IntakeError> {
        self.insert_row(table, cells).map_err(write_failure)
    }

    fn read_row(
        &self,
        table: &str,
        row: RowPosition,
    ) -> Result<Option<Vec<CellValue>>, IntakeError> {
        self.row_cells(table, row).map_err(read_failure)
    }

    fn read_rows(&self, table: &str) -> Result<Vec<Vec<CellValue>>, IntakeError> {
        self.all_rows(table).map_err(read_failure)
    }

    fn read_column(&self, table: &str, column: usize) -> Result<Vec<CellValue>, IntakeError> {
        self.column_cells(table, column).map_err(read_failure)
    }

    fn write_cell(
        &self,
        table: &str,
        row: RowPosition,
        column: usize,
        value: &CellValue,
    ) -> Result<(), IntakeError> {
        self.put_cell(table, row, column, value, false).map(|_| ()).map_err(write_failure)
    }

    fn write_cell_if_blank(
        &self,
        table: &str,
        row: RowPosition,
        column: usize,
        value: &CellValue,
    ) -> Result<bool, IntakeError> {
        self.put_cell(table, row, column, value, true).map_err(write_failure)
    }
}

impl CounterStore for SqliteStore {
    fn get(&self, key: &CounterKey) -> Result<Option<u64>, IntakeError> {
        self.counter_value(key).map_err(read_failure)
    }

    fn compare_and_set(
        &self,
        key: &CounterKey,
        expected: Option<u64>,
        new: u64,
    ) -> Result<bool, IntakeError> {
        self.swap_counter(key, expected, new).map_err(write_failure)
    }

    fn remove(&self, key: &CounterKey) -> Result<(), IntakeError> {
        self.delete_counter(key).map_err(write_failure)
    }
}

fn read_failure(err: anyhow::Error) -> IntakeError {
    match err.downcast::<IntakeError>() {
        Ok(err) => err,
        Err(err) => IntakeError::StorageReadFailure(format!("{err:#}")),
    }
}

fn write_failure(err: anyhow::Error) -> IntakeError {
    match err.downcast::<IntakeError>() {
        Ok(err) => err,
        Err(err) => IntakeError::StorageWriteFailure(format!("{err:#}")),
    }
}

fn place(cells: &mut Vec<CellValue>, column: usize, value: CellValue) {
    if cells.len() <= column {
        cells.resize(column + 1, CellValue::Blank);
    }
    cells[column] = value;
}

fn encode_cell(value: &CellValue) -> Result<String> {
    serde_json::to_string(value).context("failed to encode cell value")
}

fn decode_cell(raw: &str) -> Result<CellValue> {
    serde_json::from_str(raw).with_context(|| format!("invalid cell value_json: {raw}"))
}

fn to_sql_index(index: usize) -> Result<i64> {
    i64::try_from(index).with_context(|| format!("column position {index} out of range"))
}

fn from_sql_index(index: i64) -> Result<usize> {
    usize::try_from(index).with_context(|| format!("invalid column position {index}"))
}

fn to_sql_position(row: RowPosition) -> Result<i64> {
    i64::try_from(row.0).with_context(|| format!("row position {row} out of range"))
}

fn ensure_table(conn: &Connection, key: &str, name: &str) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO ledger_tables(table_key, name, created_at) VALUES (?1, ?2, ?3)",
        params![key, name, now_rfc3339()?],
    )
    .with_context(|| format!("failed to register table {name}"))?;
    Ok(())
}

fn row_exists(conn: &Connection, key: &str, position: i64) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM ledger_rows WHERE table_key = ?1 AND position = ?2)",
            params![key, position],
            |row| row.get::<_, i64>(0),
        )
        .context("failed to check row existence")?;
    Ok(exists == 1)
}

fn count_cells_outside_header(conn: &Connection) -> Result<u64> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM ledger_cells c
             WHERE c.column_position >= (
               SELECT COUNT(*) FROM ledger_columns k WHERE k.table_key = c.table_key
             )",
            [],
            |row| row.get(0),
        )
        .context("failed to count cells outside header")?;
    u64::try_from(count).context("negative cell count")
}

fn tables_with_row_gaps(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(
            "SELECT t.name FROM ledger_tables t
             JOIN ledger_rows r ON r.table_key = t.table_key
             GROUP BY t.table_key, t.name
             HAVING MAX(r.position) <> COUNT(*)
             ORDER BY t.name ASC",
        )
        .context("failed to prepare row gap probe")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("failed to probe row gaps")?;
    Ok(names)
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::thread;

    use intake_ledger_core::{
        IdentifierAllocator, LedgerLocks, Record, RowWriter, TableLayout,
    };
    use ulid::Ulid;

    use super::*;

    fn migrated_memory_store() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    fn temp_db_path(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("intake-ledger-{label}-{}.sqlite3", Ulid::new()))
    }

    fn remove_db_files(db_path: &Path) -> Result<()> {
        for suffix in ["", "-wal", "-shm"] {
            let path = if suffix.is_empty() {
                db_path.to_path_buf()
            } else {
                PathBuf::from(format!("{}{}", db_path.display(), suffix))
            };
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to cleanup sqlite file {}", path.display()))?;
            }
        }
        Ok(())
    }

    #[test]
    fn migrate_fresh_database_reaches_latest_version() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        let before = store.schema_status()?;
        assert_eq!(before.current_version, 0);
        assert_eq!(before.pending_versions, vec![1]);

        store.migrate()?;
        let after = store.schema_status()?;
        assert_eq!(after.current_version, LATEST_SCHEMA_VERSION);
        assert!(after.pending_versions.is_empty());
        assert!(table_exists(&store.conn, "ledger_counters")?);

        store.migrate()?;
        assert_eq!(current_schema_version(&store.conn)?, LATEST_SCHEMA_VERSION);
        Ok(())
    }

    #[test]
    fn migrate_rejects_newer_schema_versions() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        record_schema_version(&store.conn, LATEST_SCHEMA_VERSION + 1)?;

        let Err(err) = store.migrate() else {
            panic!("a database from a newer release must not be migrated");
        };
        assert!(err.to_string().contains("unsupported schema version"));
        Ok(())
    }

    #[test]
    fn header_extension_only_applies_at_expected_length() -> Result<()> {
        let store = migrated_memory_store()?;
        let first = vec!["Timestamp".to_string(), "Vendor".to_string()];
        assert!(store.append_header_columns("Orders", 0, &first)?);
        assert!(!store.append_header_columns("Orders", 0, &["Items".to_string()])?);
        assert!(store.append_header_columns("orders", 2, &["Items".to_string()])?);

        assert_eq!(store.read_header("ORDERS")?, vec!["Timestamp", "Vendor", "Items"]);
        assert_eq!(store.list_tables()?, vec!["Orders"]);
        assert!(store.read_header("Documents")?.is_empty());
        Ok(())
    }

    #[test]
    fn rows_keep_cell_types_and_positions() -> Result<()> {
        let store = migrated_memory_store()?;
        let cells = vec![
            CellValue::from("2026-03-14T09:30:00Z"),
            CellValue::Blank,
            CellValue::Integer(7),
            CellValue::Real(2.5),
            CellValue::Boolean(true),
            CellValue::from("12"),
        ];
        assert_eq!(store.append_row("Orders", &cells)?, RowPosition(1));
        assert_eq!(store.append_row("Orders", &[CellValue::from("short")])?, RowPosition(2));

        assert_eq!(store.read_row("Orders", RowPosition(1))?, Some(cells.clone()));
        assert_eq!(store.read_row("Orders", RowPosition(3))?, None);
        assert_eq!(store.row_count("Orders")?, 2);
        assert_eq!(
            store.read_rows("Orders")?,
            vec![cells, vec![CellValue::from("short")]]
        );
        assert_eq!(store.read_column("Orders", 2)?, vec![CellValue::Integer(7), CellValue::Blank]);
        Ok(())
    }

    #[test]
    fn conditional_writes_never_overwrite() -> Result<()> {
        let store = migrated_memory_store()?;
        let row = store.append_row("Orders", &[CellValue::from("t")])?;

        assert!(store.write_cell_if_blank("Orders", row, 3, &CellValue::Integer(1))?);
        assert!(!store.write_cell_if_blank("Orders", row, 3, &CellValue::Integer(2))?);
        store.write_cell("Orders", row, 1, &CellValue::from("Ordered"))?;
        store.write_cell("Orders", row, 1, &CellValue::Blank)?;

        assert_eq!(
            store.read_row("Orders", row)?,
            Some(vec![
                CellValue::from("t"),
                CellValue::Blank,
                CellValue::Blank,
                CellValue::Integer(1)
            ])
        );

        let missing = store.write_cell("Orders", RowPosition(8), 0, &CellValue::from("x"));
        assert!(matches!(missing, Err(IntakeError::RowNotFound { .. })));
        Ok(())
    }

    #[test]
    fn counters_compare_and_set() -> Result<()> {
        let store = migrated_memory_store()?;
        let key = CounterKey::new("Orders", "Historical");

        assert_eq!(store.get(&key)?, None);
        assert!(store.compare_and_set(&key, None, 4)?);
        assert!(!store.compare_and_set(&key, None, 5)?);
        assert!(!store.compare_and_set(&key, Some(3), 5)?);
        assert!(store.compare_and_set(&key, Some(4), 5)?);
        assert_eq!(store.get(&key)?, Some(5));

        let listed = store.list_counters()?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, "Orders:Historical");
        assert_eq!(listed[0].value, 5);

        store.remove(&key)?;
        assert_eq!(store.get(&key)?, None);
        Ok(())
    }

    #[test]
    fn backup_and_restore_database_round_trip() -> Result<()> {
        let source = migrated_memory_store()?;
        source.append_header_columns("Orders", 0, &["Vendor".to_string()])?;
        source.append_row("Orders", &[CellValue::from("Acme")])?;
        source.compare_and_set(&CounterKey::new("Orders", "Historical"), None, 9)?;

        let backup_file = temp_db_path("backup");
        source.backup_database(&backup_file)?;

        let mut target = SqliteStore::open(Path::new(":memory:"))?;
        target.restore_database(&backup_file)?;
        assert_eq!(target.read_header("Orders")?, vec!["Vendor"]);
        assert_eq!(target.read_rows("Orders")?, vec![vec![CellValue::from("Acme")]]);
        assert_eq!(target.get(&CounterKey::new("Orders", "Historical"))?, Some(9));

        fs::remove_file(&backup_file).with_context(|| {
            format!("failed to cleanup temp backup file {}", backup_file.display())
        })?;
        Ok(())
    }

    #[test]
    fn integrity_check_reports_clean_database() -> Result<()> {
        let store = migrated_memory_store()?;
        store.append_header_columns("Orders", 0, &["Vendor".to_string()])?;
        store.append_row("Orders", &[CellValue::from("Acme")])?;

        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.foreign_key_violations.is_empty());
        assert_eq!(report.cells_outside_header, 0);
        assert!(report.tables_with_row_gaps.is_empty());
        assert_eq!(report.schema_status.current_version, LATEST_SCHEMA_VERSION);
        Ok(())
    }

    #[test]
    fn integrity_check_flags_cells_beyond_the_header() -> Result<()> {
        let store = migrated_memory_store()?;
        store.append_header_columns("Orders", 0, &["Vendor".to_string()])?;
        store.append_row("Orders", &[CellValue::from("Acme"), CellValue::from("stray")])?;

        let report = store.integrity_check()?;
        assert_eq!(report.cells_outside_header, 1);
        Ok(())
    }

    #[test]
    fn concurrent_submissions_across_connections_get_unique_identifiers() -> Result<()> {
        let db_path = temp_db_path("concurrency");
        {
            let mut init = SqliteStore::open(&db_path)?;
            init.migrate()?;
        }

        let writer_threads = 4;
        let rows_per_thread = 10;
        let locks = Arc::new(LedgerLocks::new());
        let layout = Arc::new(TableLayout::standard("Orders", &[], &["Vendor"]));

        let mut handles = Vec::new();
        for worker in 0..writer_threads {
            let path = db_path.clone();
            let locks = Arc::clone(&locks);
            let layout = Arc::clone(&layout);
            handles.push(thread::spawn(move || -> Result<()> {
                let store = SqliteStore::open(&path)?;
                let writer = RowWriter::new(&store, &locks);
                let allocator = IdentifierAllocator::new(&store, &store, &locks);
                for index in 0..rows_per_thread {
                    let mut record = Record::default();
                    record.set("Vendor", CellValue::from(format!("vendor-{worker}-{index}")));
                    let now = OffsetDateTime::now_utc();
                    let appended = writer.append_row(&layout, &record, now)?;
                    allocator.assign_identifiers(&layout, appended.row_position, now)?;
                }
                Ok(())
            }));
        }

        for handle in handles {
            let Ok(thread_result) = handle.join() else {
                return Err(anyhow!("concurrency thread panicked"));
            };
            thread_result?;
        }

        let store = SqliteStore::open(&db_path)?;
        let total = writer_threads * rows_per_thread;
        assert_eq!(store.row_count("Orders")?, total as u64);

        let header = store.read_header("Orders")?;
        let Some(column) = header.iter().position(|name| name == "Historical ID") else {
            return Err(anyhow!("Historical ID column missing"));
        };
        let ids: BTreeSet<u64> = store
            .read_column("Orders", column)?
            .iter()
            .filter_map(CellValue::as_identifier)
            .collect();
        assert_eq!(ids, (1..=total as u64).collect::<BTreeSet<_>>());

        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.tables_with_row_gaps.is_empty());
        drop(store);

        remove_db_files(&db_path)
    }
}
