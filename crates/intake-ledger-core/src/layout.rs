use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::{column_key, IntakeError, Record};

pub const DEFAULT_TIMESTAMP_COLUMN: &str = "Timestamp";
pub const HISTORICAL_ID_COLUMN: &str = "Historical ID";
pub const SUBMISSION_ID_COLUMN: &str = "Submission ID";
pub const SEMESTER_COLUMN: &str = "Semester";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierKind {
    /// Integer drawn from a persisted per-table counter.
    Counter,
    /// Season-and-year label derived from the assignment date.
    SemesterLabel,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct IdentifierSpec {
    pub column: String,
    pub kind: IdentifierKind,
    /// Counter name for `kind: counter`; defaults to the column name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counter: Option<String>,
}

impl IdentifierSpec {
    #[must_use]
    pub fn counter(column: &str, counter: &str) -> Self {
        Self {
            column: column.to_string(),
            kind: IdentifierKind::Counter,
            counter: Some(counter.to_string()),
        }
    }

    #[must_use]
    pub fn semester_label(column: &str) -> Self {
        Self { column: column.to_string(), kind: IdentifierKind::SemesterLabel, counter: None }
    }

    /// Counter kind this column draws from, `None` for derived labels.
    #[must_use]
    pub fn counter_kind(&self) -> Option<&str> {
        match self.kind {
            IdentifierKind::Counter => Some(self.counter.as_deref().unwrap_or(&self.column)),
            IdentifierKind::SemesterLabel => None,
        }
    }

    /// Name reported for this identifier in assignment results.
    #[must_use]
    pub fn label(&self) -> &str {
        self.counter_kind().unwrap_or(&self.column)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TableLayout {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub signature_fields: Vec<String>,
    #[serde(default = "default_timestamp_column")]
    pub timestamp_column: String,
    #[serde(default)]
    pub identifiers: Vec<IdentifierSpec>,
    #[serde(default)]
    pub legacy_id_column: Option<String>,
    #[serde(default)]
    pub current_id_column: Option<String>,
}

fn default_timestamp_column() -> String {
    DEFAULT_TIMESTAMP_COLUMN.to_string()
}

impl TableLayout {
    /// A table with a timestamp column and no identifiers.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            aliases: Vec::new(),
            signature_fields: Vec::new(),
            timestamp_column: default_timestamp_column(),
            identifiers: Vec::new(),
            legacy_id_column: None,
            current_id_column: None,
        }
    }

    /// A submission table with historical, submission and semester identifiers.
    #[must_use]
    pub fn standard(name: &str, aliases: &[&str], signature_fields: &[&str]) -> Self {
        Self {
            aliases: aliases.iter().map(ToString::to_string).collect(),
            signature_fields: signature_fields.iter().map(ToString::to_string).collect(),
            identifiers: vec![
                IdentifierSpec::counter(HISTORICAL_ID_COLUMN, "Historical"),
                IdentifierSpec::counter(SUBMISSION_ID_COLUMN, "Submission"),
                IdentifierSpec::semester_label(SEMESTER_COLUMN),
            ],
            legacy_id_column: Some(HISTORICAL_ID_COLUMN.to_string()),
            current_id_column: Some(SUBMISSION_ID_COLUMN.to_string()),
            ..Self::new(name)
        }
    }

    #[must_use]
    pub fn identifier_columns(&self) -> Vec<&str> {
        self.identifiers.iter().map(|spec| spec.column.as_str()).collect()
    }

    #[must_use]
    pub fn is_identifier_column(&self, name: &str) -> bool {
        let key = column_key(name);
        self.identifiers.iter().any(|spec| column_key(&spec.column) == key)
    }

    /// Column that stores identifiers for `counter`.
    #[must_use]
    pub fn counter_column(&self, counter: &str) -> Option<&str> {
        let key = column_key(counter);
        self.identifiers
            .iter()
            .find(|spec| spec.counter_kind().is_some_and(|kind| column_key(kind) == key))
            .map(|spec| spec.column.as_str())
    }

    #[must_use]
    pub fn counter_kinds(&self) -> Vec<&str> {
        self.identifiers.iter().filter_map(IdentifierSpec::counter_kind).collect()
    }

    #[must_use]
    pub fn matches_selector(&self, selector: &str) -> bool {
        let key = column_key(selector);
        !key.is_empty()
            && (column_key(&self.name) == key
                || self.aliases.iter().any(|alias| column_key(alias) == key))
    }

    fn signature_score(&self, record: &Record) -> usize {
        self.signature_fields.iter().filter(|field| record.get(field).is_some()).count()
    }
}

/// Every submission table the ledger knows about.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LedgerConfig {
    pub tables: Vec<TableLayout>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            tables: vec![
                TableLayout::standard(
                    "Orders",
                    &["order", "purchase", "purchase order"],
                    &["Vendor", "Items", "Total Amount", "Order Link"],
                ),
                TableLayout::standard(
                    "Documents",
                    &["document", "upload", "document upload"],
                    &["Document Type", "File", "Document Link"],
                ),
                TableLayout::standard(
                    "Feedback",
                    &["comment", "survey"],
                    &["Rating", "Feedback", "Suggestions"],
                ),
            ],
        }
    }
}

impl LedgerConfig {
    /// Check table names, identifier declarations and lookup columns.
    ///
    /// # Errors
    /// Returns [`IntakeError::Validation`] describing the first problem found.
    pub fn validate(&self) -> Result<(), IntakeError> {
        if self.tables.is_empty() {
            return Err(IntakeError::Validation("at least one table MUST be configured".to_string()));
        }

        let mut names = HashSet::new();
        for table in &self.tables {
            if column_key(&table.name).is_empty() {
                return Err(IntakeError::Validation("table name MUST NOT be empty".to_string()));
            }
            if !names.insert(column_key(&table.name)) {
                return Err(IntakeError::Validation(format!("duplicate table `{}`", table.name)));
            }
            if column_key(&table.timestamp_column).is_empty() {
                return Err(IntakeError::Validation(format!(
                    "table `{}` MUST declare a timestamp column",
                    table.name
                )));
            }

            let mut columns = HashSet::new();
            for spec in &table.identifiers {
                if column_key(&spec.column).is_empty() {
                    return Err(IntakeError::Validation(format!(
                        "table `{}` has an identifier with an empty column name",
                        table.name
                    )));
                }
                if !columns.insert(column_key(&spec.column)) {
                    return Err(IntakeError::Validation(format!(
                        "table `{}` declares identifier column `{}` twice",
                        table.name, spec.column
                    )));
                }
                if column_key(&spec.column) == column_key(&table.timestamp_column) {
                    return Err(IntakeError::Validation(format!(
                        "table `{}` uses its timestamp column as an identifier",
                        table.name
                    )));
                }
            }

            for lookup in [&table.legacy_id_column, &table.current_id_column].into_iter().flatten() {
                let is_counter = table.identifiers.iter().any(|spec| {
                    spec.kind == IdentifierKind::Counter
                        && column_key(&spec.column) == column_key(lookup)
                });
                if !is_counter {
                    return Err(IntakeError::Validation(format!(
                        "table `{}` lookup column `{lookup}` is not a counter identifier",
                        table.name
                    )));
                }
            }
        }

        Ok(())
    }

    /// Resolve a table by name or alias.
    ///
    /// # Errors
    /// Returns [`IntakeError::UnknownTable`] when nothing matches.
    pub fn table(&self, selector: &str) -> Result<&TableLayout, IntakeError> {
        self.tables
            .iter()
            .find(|table| table.matches_selector(selector))
            .ok_or_else(|| IntakeError::UnknownTable(selector.to_string()))
    }

    /// Pick the table whose signature fields the record carries most of.
    /// Ties go to the table declared first.
    #[must_use]
    pub fn infer_table(&self, record: &Record) -> Option<&TableLayout> {
        let mut best: Option<(&TableLayout, usize)> = None;
        for table in &self.tables {
            let score = table.signature_score(record);
            if score > 0 && best.map_or(true, |(_, top)| score > top) {
                best = Some((table, score));
            }
        }
        best.map(|(table, _)| table)
    }

    /// Resolve a declared selector, falling back to inference when absent.
    ///
    /// # Errors
    /// Returns [`IntakeError::UnknownTable`] for an unknown declared selector
    /// and [`IntakeError::Validation`] when no table can be inferred.
    pub fn resolve(&self, declared: Option<&str>, record: &Record) -> Result<&TableLayout, IntakeError> {
        match declared.map(str::trim).filter(|selector| !selector.is_empty()) {
            Some(selector) => self.table(selector),
            None => self.infer_table(record).ok_or_else(|| {
                IntakeError::Validation(
                    "submission declares no table and none can be inferred from its fields"
                        .to_string(),
                )
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CellValue;

    fn record_with(fields: &[&str]) -> Record {
        let mut record = Record::default();
        for field in fields {
            record.set(field, CellValue::from("x"));
        }
        record
    }

    #[test]
    fn default_config_is_valid() {
        assert_eq!(LedgerConfig::default().validate(), Ok(()));
    }

    #[test]
    fn selectors_match_names_and_aliases_loosely() -> Result<(), IntakeError> {
        let config = LedgerConfig::default();
        assert_eq!(config.table("orders")?.name, "Orders");
        assert_eq!(config.table("Purchase_Order")?.name, "Orders");
        assert_eq!(config.table("UPLOAD")?.name, "Documents");
        assert!(matches!(config.table("invoices"), Err(IntakeError::UnknownTable(_))));
        Ok(())
    }

    #[test]
    fn inference_prefers_most_signature_fields() -> Result<(), IntakeError> {
        let config = LedgerConfig::default();
        let order = record_with(&["vendor", "Total_Amount", "Rating"]);
        assert_eq!(config.resolve(None, &order)?.name, "Orders");
        let feedback = record_with(&["Rating", "Suggestions"]);
        assert_eq!(config.resolve(Some("  "), &feedback)?.name, "Feedback");
        let unknown = record_with(&["Color"]);
        assert!(matches!(config.resolve(None, &unknown), Err(IntakeError::Validation(_))));
        Ok(())
    }

    #[test]
    fn validate_rejects_lookup_columns_outside_counters() {
        let mut config = LedgerConfig::default();
        config.tables[0].legacy_id_column = Some("Semester".to_string());
        assert!(matches!(config.validate(), Err(IntakeError::Validation(_))));

        let mut config = LedgerConfig::default();
        config.tables.push(TableLayout::new("orders"));
        assert!(matches!(config.validate(), Err(IntakeError::Validation(_))));
    }

    #[test]
    fn counter_column_resolves_kinds() {
        let layout = TableLayout::standard("Orders", &[], &[]);
        assert_eq!(layout.counter_column("historical"), Some(HISTORICAL_ID_COLUMN));
        assert_eq!(layout.counter_column("Submission"), Some(SUBMISSION_ID_COLUMN));
        assert_eq!(layout.counter_column("Semester"), None);
        assert_eq!(layout.counter_kinds(), vec!["Historical", "Submission"]);
        assert!(layout.is_identifier_column("semester"));
    }

    #[test]
    fn config_parses_from_json_shape() -> Result<(), serde_json::Error> {
        let config: LedgerConfig = serde_json::from_value(serde_json::json!({
            "tables": [{
                "name": "Orders",
                "identifiers": [
                    {"column": "Historical ID", "kind": "counter", "counter": "Historical"},
                    {"column": "Semester", "kind": "semester_label"}
                ],
                "legacy_id_column": "Historical ID"
            }]
        }))?;
        assert_eq!(config.tables[0].timestamp_column, DEFAULT_TIMESTAMP_COLUMN);
        assert_eq!(config.tables[0].counter_kinds(), vec!["Historical"]);
        assert_eq!(config.validate(), Ok(()));
        Ok(())
    }
}
