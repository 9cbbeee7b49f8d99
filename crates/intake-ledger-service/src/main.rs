use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use intake_ledger_api::{
    load_config, AuditReport, CommentUpdateRequest, CounterInitReport, FileLinkRequest,
    IntakeLedgerApi, MigrateResult, RowUpdateResult, RowView, StatusUpdateRequest,
    SubmissionReceipt, SubmissionRequest, TableColumns, API_CONTRACT_VERSION,
};
use intake_ledger_core::{BackfillReport, IntakeError};
use intake_ledger_store_sqlite::SchemaStatus;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    api: IntakeLedgerApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    code: &'static str,
    error: String,
    #[serde(skip)]
    status: StatusCode,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TableSelector {
    #[serde(default)]
    table: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "intake-ledger-service")]
#[command(about = "Local HTTP service for the intake ledger")]
struct Args {
    #[arg(long, default_value = "./intake_ledger.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    /// YAML table configuration; the built-in tables are used when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl ServiceState {
    fn error(err: &anyhow::Error) -> ServiceError {
        let (status, code) = match err.downcast_ref::<IntakeError>() {
            Some(
                intake @ (IntakeError::Validation(_)
                | IntakeError::SchemaConflict { .. }),
            ) => (StatusCode::BAD_REQUEST, intake.code()),
            Some(intake @ (IntakeError::RowNotFound { .. } | IntakeError::UnknownTable(_))) => {
                (StatusCode::NOT_FOUND, intake.code())
            }
            Some(
                intake @ (IntakeError::StorageWriteFailure(_)
                | IntakeError::StorageReadFailure(_)
                | IntakeError::AllocationDegraded { .. }
                | IntakeError::CounterContention { .. }),
            ) => (StatusCode::SERVICE_UNAVAILABLE, intake.code()),
            None => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
        };
        if status.is_server_error() {
            warn!(code, error = %format!("{err:#}"), "request failed");
        }
        ServiceError {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            code,
            error: format!("{err:#}"),
            status,
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/submissions", post(submissions_create))
        .route("/v1/submissions/status", post(submissions_status))
        .route("/v1/submissions/comment", post(submissions_comment))
        .route("/v1/submissions/file-link", post(submissions_file_link))
        .route("/v1/tables/:table/columns", get(table_columns))
        .route("/v1/tables/:table/rows/:id", get(table_row))
        .route("/v1/admin/repair-identifiers", post(admin_repair_identifiers))
        .route("/v1/admin/counters/initialize", post(admin_initialize_counters))
        .route("/v1/admin/audit", post(admin_audit))
        .with_state(state)
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let config = load_config(args.config.as_deref())?;
    let api = IntakeLedgerApi::with_config(args.db, config)?;
    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    info!(bind = %args.bind, "intake ledger service listening");
    axum::serve(listener, app(ServiceState { api })).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    let status = state.api.schema_status().map_err(|err| ServiceState::error(&err))?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let result = state.api.migrate(request.dry_run).map_err(|err| ServiceState::error(&err))?;
    Ok(Json(envelope(result)))
}

async fn submissions_create(
    State(state): State<ServiceState>,
    Json(request): Json<SubmissionRequest>,
) -> Result<Json<ServiceEnvelope<SubmissionReceipt>>, ServiceError> {
    let receipt = state.api.submit(request).map_err(|err| ServiceState::error(&err))?;
    Ok(Json(envelope(receipt)))
}

async fn submissions_status(
    State(state): State<ServiceState>,
    Json(request): Json<StatusUpdateRequest>,
) -> Result<Json<ServiceEnvelope<RowUpdateResult>>, ServiceError> {
    let result = state.api.update_status(request).map_err(|err| ServiceState::error(&err))?;
    Ok(Json(envelope(result)))
}

async fn submissions_comment(
    State(state): State<ServiceState>,
    Json(request): Json<CommentUpdateRequest>,
) -> Result<Json<ServiceEnvelope<RowUpdateResult>>, ServiceError> {
    let result = state.api.update_comment(request).map_err(|err| ServiceState::error(&err))?;
    Ok(Json(envelope(result)))
}

async fn submissions_file_link(
    State(state): State<ServiceState>,
    Json(request): Json<FileLinkRequest>,
) -> Result<Json<ServiceEnvelope<RowUpdateResult>>, ServiceError> {
    let result = state.api.attach_file_link(request).map_err(|err| ServiceState::error(&err))?;
    Ok(Json(envelope(result)))
}

async fn table_columns(
    State(state): State<ServiceState>,
    Path(table): Path<String>,
) -> Result<Json<ServiceEnvelope<TableColumns>>, ServiceError> {
    let columns = state.api.columns(&table).map_err(|err| ServiceState::error(&err))?;
    Ok(Json(envelope(columns)))
}

async fn table_row(
    State(state): State<ServiceState>,
    Path((table, id)): Path<(String, String)>,
) -> Result<Json<ServiceEnvelope<RowView>>, ServiceError> {
    let row = state.api.show_row(&table, &id).map_err(|err| ServiceState::error(&err))?;
    Ok(Json(envelope(row)))
}

async fn admin_repair_identifiers(
    State(state): State<ServiceState>,
    Json(request): Json<TableSelector>,
) -> Result<Json<ServiceEnvelope<Vec<BackfillReport>>>, ServiceError> {
    let reports = state
        .api
        .repair_missing_identifiers(request.table.as_deref())
        .map_err(|err| ServiceState::error(&err))?;
    Ok(Json(envelope(reports)))
}

async fn admin_initialize_counters(
    State(state): State<ServiceState>,
    Json(request): Json<TableSelector>,
) -> Result<Json<ServiceEnvelope<Vec<CounterInitReport>>>, ServiceError> {
    let reports = state
        .api
        .initialize_counters(request.table.as_deref())
        .map_err(|err| ServiceState::error(&err))?;
    Ok(Json(envelope(reports)))
}

async fn admin_audit(
    State(state): State<ServiceState>,
    Json(request): Json<TableSelector>,
) -> Result<Json<ServiceEnvelope<Vec<AuditReport>>>, ServiceError> {
    let reports =
        state.api.audit(request.table.as_deref()).map_err(|err| ServiceState::error(&err))?;
    Ok(Json(envelope(reports)))
}
