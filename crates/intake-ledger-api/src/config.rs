use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use intake_ledger_core::LedgerConfig;

/// Parse and validate a YAML ledger configuration.
///
/// # Errors
/// Returns an error when the YAML is malformed or the configuration is invalid.
pub fn parse_config(raw: &str) -> Result<LedgerConfig> {
    let config: LedgerConfig =
        serde_yaml::from_str(raw).context("failed to parse ledger config YAML")?;
    config.validate()?;
    Ok(config)
}

/// Load the configuration at `path`, or the built-in tables when `path` is `None`.
///
/// # Errors
/// Returns an error when the file cannot be read or does not hold a valid configuration.
pub fn load_config(path: Option<&Path>) -> Result<LedgerConfig> {
    let Some(path) = path else {
        return Ok(LedgerConfig::default());
    };
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read ledger config {}", path.display()))?;
    parse_config(&raw).with_context(|| format!("invalid ledger config {}", path.display()))
}

#[cfg(test)]
mod tests {
    use intake_ledger_core::{IdentifierKind, IntakeError};

    use super::*;

    #[test]
    fn yaml_config_parses_with_defaults() -> Result<()> {
        let config = parse_config(
            r"
tables:
  - name: Orders
    aliases: [order, purchase]
    signature_fields: [Vendor, Items]
    legacy_id_column: Historical ID
    current_id_column: Submission ID
    identifiers:
      - { column: Historical ID, kind: counter, counter: Historical }
      - { column: Submission ID, kind: counter, counter: Submission }
      - { column: Semester, kind: semester_label }
  - name: Events
    timestamp_column: Received At
",
        )?;

        assert_eq!(config.tables.len(), 2);
        assert_eq!(config.tables[0].timestamp_column, "Timestamp");
        assert_eq!(config.tables[0].identifiers[2].kind, IdentifierKind::SemesterLabel);
        assert_eq!(config.tables[1].timestamp_column, "Received At");
        assert!(config.tables[1].identifiers.is_empty());
        assert_eq!(config.table("purchase")?.name, "Orders");
        Ok(())
    }

    #[test]
    fn invalid_config_is_rejected_with_validation_error() {
        let result = parse_config(
            r"
tables:
  - name: Orders
    legacy_id_column: Missing ID
",
        );
        let Err(err) = result else {
            panic!("expected an invalid lookup column to be rejected");
        };
        assert!(matches!(err.downcast_ref::<IntakeError>(), Some(IntakeError::Validation(_))));
    }

    #[test]
    fn missing_path_uses_built_in_tables() -> Result<()> {
        let config = load_config(None)?;
        assert_eq!(config, LedgerConfig::default());
        Ok(())
    }
}
