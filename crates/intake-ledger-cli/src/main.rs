use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use intake_ledger_api::{
    load_config, CommentUpdateRequest, FileLinkRequest, IntakeLedgerApi, StatusUpdateRequest,
    SubmissionRequest,
};
use intake_ledger_store_sqlite::SqliteStore;
use serde_json::{Map, Value};
use time::OffsetDateTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "ledger")]
#[command(about = "Intake ledger CLI")]
struct Cli {
    #[arg(long, default_value = "./intake_ledger.sqlite3")]
    db: PathBuf,

    /// YAML table configuration; the built-in tables are used when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    /// Append a submission row and assign its identifiers.
    Submit(SubmitArgs),
    Status {
        #[command(subcommand)]
        command: StatusCommand,
    },
    Comment {
        #[command(subcommand)]
        command: CommentCommand,
    },
    /// Attach an uploaded file's URL to a row.
    Attach(AttachArgs),
    Row {
        #[command(subcommand)]
        command: RowCommand,
    },
    Table {
        #[command(subcommand)]
        command: TableCommand,
    },
    Admin {
        #[command(subcommand)]
        command: AdminCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    IntegrityCheck,
    Counters,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Args)]
struct SubmitArgs {
    #[arg(long)]
    table: Option<String>,
    #[arg(long)]
    confirmation: String,
    /// `NAME=VALUE`; repeatable.
    #[arg(long = "field")]
    fields: Vec<String>,
    /// JSON object of additional fields.
    #[arg(long)]
    fields_json: Option<String>,
    #[arg(long)]
    submitted_at: Option<String>,
}

#[derive(Debug, Subcommand)]
enum StatusCommand {
    Set(StatusSetArgs),
}

#[derive(Debug, Args)]
struct StatusSetArgs {
    #[command(flatten)]
    target: RowTarget,
    #[arg(long)]
    status: String,
    #[arg(long, default_value = "system")]
    actor: String,
}

#[derive(Debug, Subcommand)]
enum CommentCommand {
    Set(CommentSetArgs),
}

#[derive(Debug, Args)]
struct CommentSetArgs {
    #[command(flatten)]
    target: RowTarget,
    #[arg(long)]
    comment: String,
    #[arg(long, default_value = "system")]
    actor: String,
}

#[derive(Debug, Args)]
struct AttachArgs {
    #[command(flatten)]
    target: RowTarget,
    #[arg(long)]
    field: String,
    #[arg(long)]
    url: String,
    #[arg(long)]
    uploaded_at: Option<String>,
}

#[derive(Debug, Args)]
struct RowTarget {
    #[arg(long)]
    table: String,
    /// Historical or current identifier of the row.
    #[arg(long)]
    id: String,
}

#[derive(Debug, Subcommand)]
enum RowCommand {
    Show(RowTarget),
}

#[derive(Debug, Subcommand)]
enum TableCommand {
    Columns(TableArgs),
}

#[derive(Debug, Args)]
struct TableArgs {
    #[arg(long)]
    table: String,
}

#[derive(Debug, Subcommand)]
enum AdminCommand {
    /// Assign identifiers to rows that lack them.
    Repair(AdminArgs),
    /// Raise persisted counters to the scanned column maxima.
    InitCounters(AdminArgs),
    Audit(AdminArgs),
}

#[derive(Debug, Args)]
struct AdminArgs {
    /// Limit to one table; all configured tables otherwise.
    #[arg(long)]
    table: Option<String>,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command {
        Command::Db { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_db(command, &mut store)
        }
        command => {
            let config = load_config(cli.config.as_deref())?;
            let api = IntakeLedgerApi::with_config(cli.db, config)?;
            run_workflow(command, &api)
        }
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::Backup(args) => {
            store.migrate()?;
            store.backup_database(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
        DbCommand::Restore(args) => {
            store.restore_database(&args.input)?;
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "restored_from": args.input,
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions
            }))
        }
        DbCommand::IntegrityCheck => {
            let report = store.integrity_check()?;
            emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
        }
        DbCommand::Counters => {
            store.migrate()?;
            let counters = store.list_counters()?;
            emit_json(serde_json::json!({ "counters": counters }))
        }
    }
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions
        }));
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_workflow(command: Command, api: &IntakeLedgerApi) -> Result<()> {
    let value = match command {
        Command::Db { .. } => return Err(anyhow!("db commands do not use the workflow API")),
        Command::Submit(args) => {
            let receipt = api.submit(SubmissionRequest {
                table: args.table,
                confirmation: args.confirmation,
                fields: collect_fields(&args.fields, args.fields_json.as_deref())?,
                submitted_at: parse_optional_rfc3339(args.submitted_at.as_deref())?,
            })?;
            serde_json::to_value(&receipt).context("failed to serialize submission receipt")?
        }
        Command::Status { command: StatusCommand::Set(args) } => {
            let result = api.update_status(StatusUpdateRequest {
                table: args.target.table,
                id: args.target.id,
                status: args.status,
                actor: args.actor,
            })?;
            serde_json::to_value(&result).context("failed to serialize status update")?
        }
        Command::Comment { command: CommentCommand::Set(args) } => {
            let result = api.update_comment(CommentUpdateRequest {
                table: args.target.table,
                id: args.target.id,
                comment: args.comment,
                actor: args.actor,
            })?;
            serde_json::to_value(&result).context("failed to serialize comment update")?
        }
        Command::Attach(args) => {
            let result = api.attach_file_link(FileLinkRequest {
                table: args.target.table,
                id: args.target.id,
                field: args.field,
                url: args.url,
                uploaded_at: parse_optional_rfc3339(args.uploaded_at.as_deref())?,
            })?;
            serde_json::to_value(&result).context("failed to serialize file link update")?
        }
        Command::Row { command: RowCommand::Show(target) } => {
            let row = api.show_row(&target.table, &target.id)?;
            serde_json::to_value(&row).context("failed to serialize row")?
        }
        Command::Table { command: TableCommand::Columns(args) } => {
            let columns = api.columns(&args.table)?;
            serde_json::to_value(&columns).context("failed to serialize columns")?
        }
        Command::Admin { command } => match command {
            AdminCommand::Repair(args) => {
                let reports = api.repair_missing_identifiers(args.table.as_deref())?;
                serde_json::json!({ "reports": reports })
            }
            AdminCommand::InitCounters(args) => {
                let reports = api.initialize_counters(args.table.as_deref())?;
                serde_json::json!({ "reports": reports })
            }
            AdminCommand::Audit(args) => {
                let reports = api.audit(args.table.as_deref())?;
                serde_json::json!({ "reports": reports })
            }
        },
    };
    emit_json(value)
}

fn collect_fields(pairs: &[String], fields_json: Option<&str>) -> Result<Map<String, Value>> {
    let mut fields = match fields_json {
        Some(raw) => match serde_json::from_str::<Value>(raw)
            .with_context(|| format!("invalid --fields-json: {raw}"))?
        {
            Value::Object(object) => object,
            other => return Err(anyhow!("--fields-json MUST be a JSON object (received: {other})")),
        },
        None => Map::new(),
    };

    for pair in pairs {
        let (name, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("--field MUST use NAME=VALUE (received: {pair})"))?;
        fields.insert(name.to_string(), Value::String(value.to_string()));
    }
    Ok(fields)
}

fn parse_optional_rfc3339(value: Option<&str>) -> Result<Option<OffsetDateTime>> {
    value.map(parse_rfc3339).transpose()
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 UTC timestamp: {value}"))?;

    if parsed.offset() != time::UtcOffset::UTC {
        return Err(anyhow!("timestamp MUST use UTC offset Z (received: {value})"));
    }

    Ok(parsed)
}
