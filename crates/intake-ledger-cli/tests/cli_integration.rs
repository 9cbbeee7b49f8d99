use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_ledger<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_ledger"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute ledger binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_ledger(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "ledger command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

#[test]
fn db_commands_report_schema_versions() {
    let dir = unique_temp_dir("ledger-cli-db");
    let db = dir.join("ledger.sqlite3");
    let db = path_str(&db);

    let dry_run = run_json(["--db", db, "db", "migrate", "--dry-run"]);
    assert_eq!(as_str(&dry_run, "contract_version"), "cli.v1");
    assert_eq!(dry_run.get("dry_run"), Some(&Value::Bool(true)));
    assert_eq!(as_i64(&dry_run, "current_version"), 0);

    let migrated = run_json(["--db", db, "db", "migrate"]);
    assert_eq!(migrated.get("up_to_date"), Some(&Value::Bool(true)));
    let target = as_i64(&migrated, "target_version");
    assert_eq!(as_i64(&migrated, "after_version"), target);

    let status = run_json(["--db", db, "db", "schema-version"]);
    assert_eq!(as_i64(&status, "current_version"), target);

    let integrity = run_json(["--db", db, "db", "integrity-check"]);
    assert_eq!(integrity.get("quick_check_ok"), Some(&Value::Bool(true)));

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn submission_workflow_round_trips_through_the_cli() {
    let dir = unique_temp_dir("ledger-cli-flow");
    let db = dir.join("ledger.sqlite3");
    let db = path_str(&db);

    let receipt = run_json([
        "--db",
        db,
        "submit",
        "--table",
        "orders",
        "--confirmation",
        "CONF-1",
        "--field",
        "Vendor=Acme",
        "--fields-json",
        r#"{"Total Amount": 42, "Items": "Toner"}"#,
        "--submitted-at",
        "2026-02-03T09:00:00Z",
    ]);
    assert_eq!(as_str(&receipt, "table"), "Orders");
    assert_eq!(as_str(&receipt, "status"), "New");
    let identifiers = receipt
        .get("identifiers")
        .unwrap_or_else(|| panic!("missing identifiers in payload: {receipt}"));
    assert_eq!(as_str(identifiers, "Historical ID"), "1");
    assert_eq!(as_str(identifiers, "Semester"), "Spring 2026");
    assert!(receipt.get("identifier_warning").is_some_and(Value::is_null));

    let second = run_json(["--db", db, "submit", "--confirmation", "CONF-2", "--field", "Vendor=Globex"]);
    assert_eq!(as_str(&second, "table"), "Orders");
    let second_ids = second
        .get("identifiers")
        .unwrap_or_else(|| panic!("missing identifiers in payload: {second}"));
    assert_eq!(as_str(second_ids, "Historical ID"), "2");

    let status = run_json([
        "--db", db, "status", "set", "--table", "Orders", "--id", "2", "--status", "delivered", "--actor",
        "buyer",
    ]);
    assert_eq!(as_str(&status, "status"), "DELIVERED");

    let comment = run_json([
        "--db", db, "comment", "set", "--table", "Orders", "--id", "2", "--comment", "left at desk",
    ]);
    assert_eq!(as_i64(&comment, "row_position"), as_i64(&status, "row_position"));

    let attached = run_json([
        "--db",
        db,
        "attach",
        "--table",
        "purchase",
        "--id",
        "2",
        "--field",
        "Receipt",
        "--url",
        "https://files.example.org/receipt.pdf",
    ]);
    assert_eq!(as_str(&attached, "table"), "Orders");

    let row = run_json(["--db", db, "row", "show", "--table", "Orders", "--id", "2"]);
    let fields = row.get("fields").unwrap_or_else(|| panic!("missing fields in payload: {row}"));
    assert_eq!(as_str(fields, "Vendor"), "Globex");
    assert_eq!(as_str(fields, "Status"), "Delivered");
    assert_eq!(as_str(fields, "Status Updated By"), "buyer");
    assert_eq!(as_str(fields, "Comments"), "left at desk");
    assert_eq!(as_str(fields, "Comment Updated By"), "system");
    assert_eq!(as_str(fields, "Receipt"), "https://files.example.org/receipt.pdf");

    let columns = run_json(["--db", db, "table", "columns", "--table", "Orders"]);
    let names = columns
        .get("columns")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing columns in payload: {columns}"));
    assert_eq!(names.first().and_then(Value::as_str), Some("Timestamp"));
    assert!(names.iter().any(|name| name.as_str() == Some("Receipt Uploaded At")));

    let counters = run_json(["--db", db, "db", "counters"]);
    let counters = counters
        .get("counters")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing counters in payload: {counters}"));
    assert!(counters
        .iter()
        .any(|counter| counter.get("key").and_then(Value::as_str) == Some("Orders:Historical")
            && counter.get("value").and_then(Value::as_u64) == Some(2)));

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn admin_commands_cover_every_configured_table() {
    let dir = unique_temp_dir("ledger-cli-admin");
    let db = dir.join("ledger.sqlite3");
    let db = path_str(&db);

    run_json(["--db", db, "submit", "--table", "Feedback", "--confirmation", "FB-1", "--field", "Rating=5"]);

    let repair = run_json(["--db", db, "admin", "repair"]);
    let reports = repair
        .get("reports")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing reports in payload: {repair}"));
    assert_eq!(reports.len(), 3);
    assert!(reports.iter().all(|report| report.get("failures").and_then(Value::as_array).is_some_and(Vec::is_empty)));

    let init = run_json(["--db", db, "admin", "init-counters", "--table", "feedback"]);
    let init_reports = init
        .get("reports")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing reports in payload: {init}"));
    assert_eq!(init_reports.len(), 1);
    assert_eq!(init_reports.first().map(|report| as_str(report, "table")), Some("Feedback"));

    let audit = run_json(["--db", db, "admin", "audit", "--table", "Feedback"]);
    let audit_reports = audit
        .get("reports")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing reports in payload: {audit}"));
    assert!(audit_reports.iter().all(|report| {
        report.get("duplicate_identifiers").and_then(Value::as_array).is_some_and(Vec::is_empty)
    }));

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn yaml_config_defines_custom_tables() {
    let dir = unique_temp_dir("ledger-cli-config");
    let db = dir.join("ledger.sqlite3");
    let config = dir.join("ledger.yaml");
    fs::write(
        &config,
        "tables:\n  - name: Events\n    timestamp_column: Received At\n    current_id_column: Ticket\n    identifiers:\n      - { column: Ticket, kind: counter, counter: Ticket }\n",
    )
    .unwrap_or_else(|err| panic!("failed to write config {}: {err}", config.display()));
    let db = path_str(&db);
    let config = path_str(&config);

    let receipt =
        run_json([
        "--db", db, "--config", config, "submit", "--table", "events", "--confirmation", "EV-1", "--field",
        "Topic=Launch",
    ]);
    assert_eq!(as_str(&receipt, "table"), "Events");

    let columns = run_json(["--db", db, "--config", config, "table", "columns", "--table", "events"]);
    let names = columns
        .get("columns")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing columns in payload: {columns}"));
    assert_eq!(names.first().and_then(Value::as_str), Some("Received At"));

    let row = run_json(["--db", db, "--config", config, "row", "show", "--table", "Events", "--id", "1"]);
    let fields = row.get("fields").unwrap_or_else(|| panic!("missing fields in payload: {row}"));
    assert_eq!(as_str(fields, "Topic"), "Launch");

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn failures_exit_non_zero_with_a_message() {
    let dir = unique_temp_dir("ledger-cli-failure");
    let db = dir.join("ledger.sqlite3");
    let db = path_str(&db);

    let missing = run_ledger(["--db", db, "row", "show", "--table", "Orders", "--id", "99"]);
    assert!(!missing.status.success());
    let stderr = String::from_utf8_lossy(&missing.stderr);
    assert!(stderr.contains("no row in table `Orders` matches identifier `99`"), "stderr: {stderr}");

    let unknown = run_ledger(["--db", db, "table", "columns", "--table", "Invoices"]);
    assert!(!unknown.status.success());
    assert!(String::from_utf8_lossy(&unknown.stderr).contains("unknown table"));

    let blank = run_ledger(["--db", db, "submit", "--table", "Orders", "--confirmation", " "]);
    assert!(!blank.status.success());

    let _ = fs::remove_dir_all(dir);
}
