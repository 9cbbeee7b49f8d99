use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::{column_key, normalize_status, to_display_string, CanonicalStatus};

pub const CONFIRMATION_FIELD: &str = "Confirmation";
pub const STATUS_FIELD: &str = "Status";

/// One scalar cell of a ledger row.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum CellValue {
    #[default]
    Blank,
    Boolean(bool),
    Integer(i64),
    Real(f64),
    Text(String),
}

impl CellValue {
    /// Cell holding an allocated identifier.
    #[must_use]
    pub fn identifier(value: u64) -> Self {
        i64::try_from(value).map_or_else(|_| Self::Text(value.to_string()), Self::Integer)
    }

    /// Convert one JSON field value; `None` for null, empty and structured values.
    #[must_use]
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(text) if text.trim().is_empty() => None,
            Value::String(text) => Some(Self::Text(text.clone())),
            Value::Number(number) => {
                number.as_i64().map(Self::Integer).or_else(|| number.as_f64().map(Self::Real))
            }
            Value::Bool(flag) => Some(Self::Boolean(*flag)),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Blank => Value::Null,
            Self::Boolean(flag) => Value::Bool(*flag),
            Self::Integer(number) => Value::from(*number),
            Self::Real(number) => Value::from(*number),
            Self::Text(text) => Value::String(text.clone()),
        }
    }

    #[must_use]
    pub fn is_blank(&self) -> bool {
        match self {
            Self::Blank => true,
            Self::Text(text) => text.trim().is_empty(),
            _ => false,
        }
    }

    #[must_use]
    pub fn to_display_string(&self) -> String {
        match self {
            Self::Blank => String::new(),
            Self::Boolean(flag) => flag.to_string(),
            Self::Integer(number) => number.to_string(),
            Self::Real(number) => number.to_string(),
            Self::Text(text) => text.clone(),
        }
    }

    /// Parse the cell as a non-negative integer identifier, coercing numeric
    /// text (`"7"`, `" 7 "`, `"7.0"`) and whole reals. Anything else is `None`.
    #[must_use]
    pub fn as_identifier(&self) -> Option<u64> {
        match self {
            Self::Integer(number) => u64::try_from(*number).ok(),
            Self::Real(number) => whole_non_negative(*number),
            Self::Text(text) => {
                let trimmed = text.trim();
                trimmed
                    .parse::<u64>()
                    .ok()
                    .or_else(|| trimmed.parse::<f64>().ok().and_then(whole_non_negative))
            }
            Self::Blank | Self::Boolean(_) => None,
        }
    }

    /// Type-coercing comparison against an integer identifier.
    #[must_use]
    pub fn loosely_equals(&self, id: u64) -> bool {
        self.as_identifier() == Some(id)
    }
}

// 2^53: beyond this an f64 no longer represents every integer exactly.
const MAX_EXACT_REAL: f64 = 9_007_199_254_740_992.0;

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn whole_non_negative(number: f64) -> Option<u64> {
    if number.is_finite() && number >= 0.0 && number.fract() == 0.0 && number <= MAX_EXACT_REAL {
        Some(number as u64)
    } else {
        None
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for CellValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<bool> for CellValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

/// A submission normalized out of a free-form field map.
///
/// Well-known fields are lifted into typed slots; everything else lands in
/// `extra` in order of first appearance. Fields whose names normalize to the
/// same column key share one entry: the first spelling wins, later values
/// replace earlier ones.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    pub confirmation: Option<String>,
    pub status: Option<CanonicalStatus>,
    pub extra: Vec<(String, CellValue)>,
}

impl Record {
    #[must_use]
    pub fn from_fields(fields: &Map<String, Value>) -> Self {
        let confirmation_key = column_key(CONFIRMATION_FIELD);
        let status_key = column_key(STATUS_FIELD);
        let mut record = Self::default();

        for (name, value) in fields {
            let key = column_key(name);
            if key.is_empty() {
                continue;
            }
            let Some(cell) = CellValue::from_json(value) else {
                debug!(field = %name, "dropping empty or structured field");
                continue;
            };
            if key == confirmation_key {
                record.confirmation = Some(cell.to_display_string());
            } else if key == status_key {
                record.status = Some(normalize_status(Some(&cell.to_display_string())));
            } else {
                record.set(name.trim(), cell);
            }
        }

        record
    }

    /// Set an `extra` field, merging into an existing entry with the same key.
    pub fn set(&mut self, name: &str, value: CellValue) {
        let key = column_key(name);
        if let Some(entry) = self.extra.iter_mut().find(|(existing, _)| column_key(existing) == key) {
            debug!(field = %name, column = %entry.0, "merging aliased field into first spelling");
            entry.1 = value;
        } else {
            self.extra.push((name.to_string(), value));
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&CellValue> {
        let key = column_key(name);
        self.extra.iter().find(|(existing, _)| column_key(existing) == key).map(|(_, value)| value)
    }

    /// Every non-blank field in write order: confirmation, status, then extras.
    #[must_use]
    pub fn fields(&self) -> Vec<(String, CellValue)> {
        let mut fields = Vec::with_capacity(self.extra.len() + 2);
        if let Some(confirmation) = self.confirmation.as_ref().filter(|value| !value.trim().is_empty()) {
            fields.push((CONFIRMATION_FIELD.to_string(), CellValue::Text(confirmation.clone())));
        }
        if let Some(status) = &self.status {
            fields.push((STATUS_FIELD.to_string(), CellValue::Text(to_display_string(status))));
        }
        fields.extend(self.extra.iter().filter(|(_, value)| !value.is_blank()).cloned());
        fields
    }
}
