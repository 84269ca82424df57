use crate::auth::{authenticate, has_scope};
use crate::metrics::gather_metrics;
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use rpa_common::auth::{Action, ResourceType, Scope};
use rpa_common::observability::{LogEvent, LogLevel};
use rpa_core::platform::models::*;
use rpa_core::platform::persistence::{RobotStore, ScheduleStore};
use rpa_core::platform::PlatformError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::time::Duration as StdDuration;
use utoipa::{IntoParams, OpenApi, ToSchema};
use uuid::Uuid;

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: String,
}

#[derive(Serialize, ToSchema)]
pub struct VersionResponse {
    pub service: String,
    pub version: String,
    pub git_sha: String,
    pub git_tag: String,
    pub build_ts: String,
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: &'static str,
}

pub struct HttpError {
    status: StatusCode,
    message: &'static str,
}

impl HttpError {
    pub fn new(status: StatusCode, message: &'static str) -> Self {
        Self { status, message }
    }
}

impl From<PlatformError> for HttpError {
    fn from(value: PlatformError) -> Self {
        match value {
            PlatformError::NotFound(_) => HttpError::new(StatusCode::NOT_FOUND, "not found"),
            PlatformError::Conflict(_) => HttpError::new(StatusCode::CONFLICT, "conflict"),
            PlatformError::Unauthorized => HttpError::new(StatusCode::UNAUTHORIZED, "unauthorized"),
            PlatformError::Forbidden => HttpError::new(StatusCode::FORBIDDEN, "forbidden"),
            PlatformError::InvalidInput(_) => {
                HttpError::new(StatusCode::BAD_REQUEST, "invalid input")
            }
            PlatformError::Internal(_) => {
                HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
            PlatformError::LeaseLost => HttpError::new(StatusCode::CONFLICT, "lease lost"),
            PlatformError::StaleUpdate => {
                HttpError::new(StatusCode::CONFLICT, "stale update discarded")
            }
            PlatformError::CapabilityMismatch(_) => {
                HttpError::new(StatusCode::BAD_REQUEST, "capability mismatch")
            }
            PlatformError::NoFreeSlot => {
                HttpError::new(StatusCode::CONFLICT, "no free concurrency slot")
            }
            PlatformError::ProtocolViolation(_) => {
                HttpError::new(StatusCode::BAD_REQUEST, "protocol violation")
            }
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

#[derive(Debug, Deserialize, ToSchema, Default, IntoParams)]
pub struct ListLogsParams {
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TelemetryLogResponse {
    pub level: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub component: Option<String>,
    pub tenant_id: Option<String>,
    pub project_id: Option<String>,
    pub metadata: serde_json::Value,
}

fn log_level_str(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Trace => "trace",
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    }
}

impl From<LogEvent> for TelemetryLogResponse {
    fn from(event: LogEvent) -> Self {
        Self {
            level: log_level_str(event.level).to_string(),
            message: event.message,
            timestamp: event.timestamp,
            component: event.component,
            tenant_id: event.tenant_id,
            project_id: event.project_id,
            metadata: event.metadata,
        }
    }
}

#[utoipa::path(get, path = "/health", tag = "system", responses( (status = 200, description = "Service healthy", body = HealthResponse) ))]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: rpa_core::config().service_name.clone(),
    })
}

#[utoipa::path(get, path = "/version", tag = "system", responses( (status = 200, description = "Version info", body = VersionResponse) ))]
pub async fn version() -> Json<VersionResponse> {
    let info = rpa_core::build_info();
    Json(VersionResponse {
        service: rpa_core::config().service_name.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_sha: info.git_sha.to_string(),
        git_tag: info.git_tag.to_string(),
        build_ts: info.build_timestamp.to_string(),
    })
}

#[utoipa::path(get, path = "/metrics", tag = "system")]
pub async fn metrics() -> (axum::http::StatusCode, String) {
    gather_metrics()
}

#[utoipa::path(
    get,
    path = "/telemetry/logs",
    params(ListLogsParams),
    responses(
        (status = 200, description = "Recent structured log events", body = [TelemetryLogResponse])
    ),
    security(("ApiKey" = []), ("BearerAuth" = []))
)]
pub async fn list_recent_logs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ListLogsParams>,
) -> Result<Json<Vec<TelemetryLogResponse>>, HttpError> {
    authorize(&state, &headers, None, &Scope::Admin)?;
    if !state.rate_limiter.check_and_increment(
        Uuid::nil(),
        "observability:list_logs",
        30,
        StdDuration::from_secs(60),
    ) {
        return Err(HttpError::new(
            StatusCode::TOO_MANY_REQUESTS,
            "rate limit exceeded",
        ));
    }
    let limit = params.limit.unwrap_or(100).min(500);
    let events = state.telemetry.log_sink.snapshot();
    let start = events.len().saturating_sub(limit);
    let slice = events.into_iter().skip(start).collect::<Vec<_>>();
    state
        .telemetry
        .metrics
        .set_gauge("gateway_log_buffer_size", slice.len() as f64, None);
    Ok(Json(
        slice.into_iter().map(TelemetryLogResponse::from).collect(),
    ))
}

// ---------------------------------------------------------------------------
// Tenant bootstrap
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateTenantRequest {
    pub name: String,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TenantResponse {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub admin_api_key: Option<String>,
}

#[utoipa::path(
    post,
    path = "/tenants",
    request_body = CreateTenantRequest,
    responses( (status = 201, description = "Tenant created", body = TenantResponse) ),
    security(("ApiKey" = []), ("BearerAuth" = []))
)]
pub async fn create_tenant(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateTenantRequest>,
) -> Result<(StatusCode, Json<TenantResponse>), HttpError> {
    authorize(&state, &headers, None, &Scope::Admin)?;
    use rpa_core::platform::provisioning::TenantCreateRequest;
    let request = TenantCreateRequest {
        name: payload.name,
        idempotency_key: payload.idempotency_key,
        settings: None,
    };
    let bootstrap = state.platform.provisioning().create_tenant_with_options(request)?;
    state.telemetry.logs.emit(
        LogEvent::new(LogLevel::Info, "tenant.created")
            .with_component("gateway")
            .with_tenant(bootstrap.tenant.id.to_string())
            .with_metadata(json!({ "name": bootstrap.tenant.name })),
    );
    Ok((
        StatusCode::CREATED,
        Json(TenantResponse {
            id: bootstrap.tenant.id,
            name: bootstrap.tenant.name,
            created_at: bootstrap.tenant.created_at,
            admin_api_key: bootstrap.admin_api_key.map(|k| k.value),
        }),
    ))
}

// ---------------------------------------------------------------------------
// Robot Registry & Capability Router
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, ToSchema)]
pub struct RegisterRobotRequest {
    pub name: String,
    pub hostname: String,
    #[serde(default)]
    pub capabilities: HashSet<String>,
    #[serde(default)]
    pub tags: HashSet<String>,
    #[serde(default)]
    pub max_concurrent_jobs: Option<u32>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RobotResponse {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub hostname: String,
    pub status: String,
    pub capabilities: HashSet<String>,
    pub tags: HashSet<String>,
    pub max_concurrent_jobs: u32,
    pub current_job_count: u32,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub version: String,
}

impl From<Robot> for RobotResponse {
    fn from(robot: Robot) -> Self {
        Self {
            id: robot.id,
            tenant_id: robot.tenant_id,
            name: robot.name,
            hostname: robot.hostname,
            status: robot_status_str(robot.status).to_string(),
            capabilities: robot.capabilities,
            tags: robot.tags,
            max_concurrent_jobs: robot.max_concurrent_jobs,
            current_job_count: robot.current_job_ids.len() as u32,
            last_heartbeat: robot.last_heartbeat,
            version: robot.version,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ProvisionedRobotResponse {
    pub robot_id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub api_key: String,
}

#[utoipa::path(
    post,
    path = "/tenants/{tenant_id}/robots",
    params( ("tenant_id" = Uuid, Path, description = "Tenant identifier") ),
    request_body = RegisterRobotRequest,
    responses( (status = 201, description = "Robot enrolled", body = ProvisionedRobotResponse) ),
    security(("ApiKey" = []), ("BearerAuth" = []))
)]
pub async fn register_robot(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    headers: HeaderMap,
    Json(payload): Json<RegisterRobotRequest>,
) -> Result<(StatusCode, Json<ProvisionedRobotResponse>), HttpError> {
    authorize(
        &state,
        &headers,
        Some(tenant_id),
        &Scope::Resource(ResourceType::Robot, Action::Write),
    )?;
    use rpa_core::platform::provisioning::RobotRegistrationOptions;
    let provisioned = state.platform.provisioning().register_robot_with_options(
        tenant_id,
        payload.name,
        payload.hostname,
        RobotRegistrationOptions {
            capabilities: payload.capabilities,
            tags: payload.tags,
            max_concurrent_jobs: payload.max_concurrent_jobs,
            version: payload.version,
            idempotency_key: payload.idempotency_key,
        },
    )?;
    Ok((
        StatusCode::CREATED,
        Json(ProvisionedRobotResponse {
            robot_id: provisioned.robot.id,
            tenant_id: provisioned.robot.tenant_id,
            name: provisioned.robot.name,
            api_key: provisioned.api_key.value,
        }),
    ))
}

#[utoipa::path(
    get,
    path = "/tenants/{tenant_id}/robots",
    params( ("tenant_id" = Uuid, Path, description = "Tenant identifier") ),
    responses( (status = 200, description = "Robots in the tenant", body = [RobotResponse]) ),
    security(("ApiKey" = []), ("BearerAuth" = []))
)]
pub async fn list_robots(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<Vec<RobotResponse>>, HttpError> {
    authorize(
        &state,
        &headers,
        Some(tenant_id),
        &Scope::Resource(ResourceType::Robot, Action::Read),
    )?;
    let robots = state.platform.storage().list_robots(tenant_id)?;
    Ok(Json(robots.into_iter().map(RobotResponse::from).collect()))
}

#[derive(Debug, Deserialize, ToSchema, Default)]
pub struct RobotHeartbeatRequest {
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
}

#[utoipa::path(
    post,
    path = "/robots/{robot_id}/heartbeat",
    params( ("robot_id" = Uuid, Path, description = "Robot identifier") ),
    request_body = RobotHeartbeatRequest,
    responses( (status = 200, description = "Heartbeat recorded", body = RobotResponse) ),
    security(("ApiKey" = []), ("BearerAuth" = []))
)]
pub async fn robot_heartbeat(
    State(state): State<AppState>,
    Path(robot_id): Path<Uuid>,
    headers: HeaderMap,
    Json(payload): Json<RobotHeartbeatRequest>,
) -> Result<Json<RobotResponse>, HttpError> {
    authorize(
        &state,
        &headers,
        None,
        &Scope::Resource(ResourceType::Robot, Action::Write),
    )?;
    let robot = state.platform.robots().heartbeat(robot_id, payload.metrics)?;
    Ok(Json(RobotResponse::from(robot)))
}

// ---------------------------------------------------------------------------
// Job Queue & Lease Manager
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, ToSchema)]
pub struct EnqueueJobRequest {
    pub workflow_id: Uuid,
    #[serde(default)]
    pub workflow_name: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
    #[serde(default)]
    pub required_capabilities: HashSet<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub scheduled_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_timeout_seconds() -> u64 {
    3600
}

#[derive(Debug, Deserialize, ToSchema, Default, IntoParams)]
pub struct ListJobsParams {
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct JobResponse {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_name: Option<String>,
    pub status: String,
    pub priority: i32,
    pub inputs: HashMap<String, Value>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub progress: u8,
    pub current_node: Option<String>,
    pub required_capabilities: HashSet<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub claimed_by: Option<Uuid>,
    pub cancel_requested: bool,
    pub cancel_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            tenant_id: job.tenant_id,
            workflow_id: job.workflow_id,
            workflow_name: job.workflow_name,
            status: job_status_str(job.status).to_string(),
            priority: job.priority,
            inputs: job.inputs,
            result: job.result,
            error: job.error,
            error_code: job.error_code.map(job_error_code_str),
            progress: job.progress,
            current_node: job.current_node,
            required_capabilities: job.required_capabilities,
            retry_count: job.retry_count,
            max_retries: job.max_retries,
            claimed_by: job.claimed_by,
            cancel_requested: job.cancel_requested,
            cancel_reason: job.cancel_reason,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
        }
    }
}

fn job_status_str(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "pending",
        JobStatus::Claimed => "claimed",
        JobStatus::Running => "running",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
        JobStatus::Cancelled => "cancelled",
        JobStatus::Timeout => "timeout",
    }
}

fn robot_status_str(status: RobotStatus) -> &'static str {
    match status {
        RobotStatus::Offline => "offline",
        RobotStatus::Online => "online",
        RobotStatus::Busy => "busy",
        RobotStatus::Error => "error",
        RobotStatus::Maintenance => "maintenance",
    }
}

fn job_error_code_str(code: JobErrorCode) -> String {
    match code {
        JobErrorCode::WindowNotFound => "WINDOW_NOT_FOUND",
        JobErrorCode::ElementNotFound => "ELEMENT_NOT_FOUND",
        JobErrorCode::ConnectionRefused => "CONNECTION_REFUSED",
        JobErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
        JobErrorCode::CircuitOpen => "CIRCUIT_OPEN",
        JobErrorCode::Timeout => "TIMEOUT",
        JobErrorCode::AuthFailed => "AUTH_FAILED",
        JobErrorCode::InvalidPayload => "INVALID_PAYLOAD",
    }
    .to_string()
}

fn parse_job_status(value: &str) -> Option<JobStatus> {
    match value.to_ascii_lowercase().as_str() {
        "pending" => Some(JobStatus::Pending),
        "claimed" => Some(JobStatus::Claimed),
        "running" => Some(JobStatus::Running),
        "completed" => Some(JobStatus::Completed),
        "failed" => Some(JobStatus::Failed),
        "cancelled" => Some(JobStatus::Cancelled),
        "timeout" => Some(JobStatus::Timeout),
        _ => None,
    }
}

#[utoipa::path(
    post,
    path = "/tenants/{tenant_id}/jobs",
    params( ("tenant_id" = Uuid, Path, description = "Tenant identifier") ),
    request_body = EnqueueJobRequest,
    responses( (status = 201, description = "Job enqueued", body = JobResponse) ),
    security(("ApiKey" = []), ("BearerAuth" = []))
)]
pub async fn enqueue_job(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    headers: HeaderMap,
    Json(payload): Json<EnqueueJobRequest>,
) -> Result<(StatusCode, Json<JobResponse>), HttpError> {
    authorize(
        &state,
        &headers,
        Some(tenant_id),
        &Scope::Resource(ResourceType::Job, Action::Write),
    )?;
    if !state.rate_limiter.check_and_increment(
        tenant_id,
        "jobs:enqueue",
        600,
        StdDuration::from_secs(60),
    ) {
        return Err(HttpError::new(
            StatusCode::TOO_MANY_REQUESTS,
            "rate limit exceeded",
        ));
    }
    let job = state.platform.queue().enqueue(JobRequest {
        tenant_id,
        workflow_id: payload.workflow_id,
        workflow_name: payload.workflow_name,
        priority: payload.priority,
        payload: Vec::new(),
        inputs: payload.inputs,
        required_capabilities: payload.required_capabilities,
        max_retries: payload.max_retries,
        timeout_seconds: payload.timeout_seconds,
        scheduled_time: payload.scheduled_time,
        idempotency_key: payload.idempotency_key,
    })?;
    state.telemetry.metrics.increment_counter(
        "jobs_enqueued_total",
        1.0,
        Some(HashMap::from([("tenant_id".to_string(), tenant_id.to_string())])),
    );
    Ok((StatusCode::CREATED, Json(JobResponse::from(job))))
}

#[utoipa::path(
    get,
    path = "/tenants/{tenant_id}/jobs/{job_id}",
    params(
        ("tenant_id" = Uuid, Path, description = "Tenant identifier"),
        ("job_id" = Uuid, Path, description = "Job identifier")
    ),
    responses( (status = 200, description = "Job detail", body = JobResponse) ),
    security(("ApiKey" = []), ("BearerAuth" = []))
)]
pub async fn get_job(
    State(state): State<AppState>,
    Path((tenant_id, job_id)): Path<(Uuid, Uuid)>,
    headers: HeaderMap,
) -> Result<Json<JobResponse>, HttpError> {
    authorize(
        &state,
        &headers,
        Some(tenant_id),
        &Scope::Resource(ResourceType::Job, Action::Read),
    )?;
    let job = state.platform.queue().get_job(job_id)?;
    if job.tenant_id != tenant_id {
        return Err(HttpError::new(StatusCode::NOT_FOUND, "not found"));
    }
    Ok(Json(JobResponse::from(job)))
}

#[utoipa::path(
    get,
    path = "/tenants/{tenant_id}/jobs",
    params(
        ("tenant_id" = Uuid, Path, description = "Tenant identifier"),
        ListJobsParams
    ),
    responses( (status = 200, description = "Jobs in the tenant", body = [JobResponse]) ),
    security(("ApiKey" = []), ("BearerAuth" = []))
)]
pub async fn list_jobs(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    headers: HeaderMap,
    Query(params): Query<ListJobsParams>,
) -> Result<Json<Vec<JobResponse>>, HttpError> {
    authorize(
        &state,
        &headers,
        Some(tenant_id),
        &Scope::Resource(ResourceType::Job, Action::Read),
    )?;
    let status = match params.status.as_deref() {
        Some(raw) => Some(
            parse_job_status(raw)
                .ok_or_else(|| HttpError::new(StatusCode::BAD_REQUEST, "invalid status"))?,
        ),
        None => None,
    };
    let jobs = state.platform.queue().list_jobs(tenant_id, status)?;
    Ok(Json(jobs.into_iter().map(JobResponse::from).collect()))
}

#[derive(Debug, Deserialize, ToSchema, Default)]
pub struct CancelJobRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[utoipa::path(
    post,
    path = "/tenants/{tenant_id}/jobs/{job_id}/cancel",
    params(
        ("tenant_id" = Uuid, Path, description = "Tenant identifier"),
        ("job_id" = Uuid, Path, description = "Job identifier")
    ),
    request_body = CancelJobRequest,
    responses( (status = 200, description = "Cancellation requested", body = JobResponse) ),
    security(("ApiKey" = []), ("BearerAuth" = []))
)]
pub async fn cancel_job(
    State(state): State<AppState>,
    Path((tenant_id, job_id)): Path<(Uuid, Uuid)>,
    headers: HeaderMap,
    Json(payload): Json<CancelJobRequest>,
) -> Result<Json<JobResponse>, HttpError> {
    authorize(
        &state,
        &headers,
        Some(tenant_id),
        &Scope::Resource(ResourceType::Job, Action::Write),
    )?;
    let existing = state.platform.queue().get_job(job_id)?;
    if existing.tenant_id != tenant_id {
        return Err(HttpError::new(StatusCode::NOT_FOUND, "not found"));
    }
    let job = state.platform.queue().request_cancel(job_id, payload.reason)?;
    Ok(Json(JobResponse::from(job)))
}

// ---------------------------------------------------------------------------
// Dead Letter Queue
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, ToSchema)]
pub struct DlqEntryResponse {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub job_id: Uuid,
    pub workflow_id: Uuid,
    pub error_message: String,
    pub retry_count: u32,
    pub failed_at: DateTime<Utc>,
}

impl From<DlqEntry> for DlqEntryResponse {
    fn from(entry: DlqEntry) -> Self {
        Self {
            id: entry.id,
            tenant_id: entry.tenant_id,
            job_id: entry.job_id,
            workflow_id: entry.workflow_id,
            error_message: entry.error_message,
            retry_count: entry.retry_count,
            failed_at: entry.failed_at,
        }
    }
}

#[utoipa::path(
    get,
    path = "/tenants/{tenant_id}/dlq",
    params( ("tenant_id" = Uuid, Path, description = "Tenant identifier") ),
    responses( (status = 200, description = "Dead-lettered jobs", body = [DlqEntryResponse]) ),
    security(("ApiKey" = []), ("BearerAuth" = []))
)]
pub async fn list_dlq(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<Vec<DlqEntryResponse>>, HttpError> {
    authorize(
        &state,
        &headers,
        Some(tenant_id),
        &Scope::Resource(ResourceType::Job, Action::Read),
    )?;
    let entries = state.platform.queue().list_dlq(tenant_id)?;
    Ok(Json(entries.into_iter().map(DlqEntryResponse::from).collect()))
}

#[utoipa::path(
    post,
    path = "/tenants/{tenant_id}/dlq/{dlq_id}/retry",
    params(
        ("tenant_id" = Uuid, Path, description = "Tenant identifier"),
        ("dlq_id" = Uuid, Path, description = "DLQ entry identifier")
    ),
    responses( (status = 200, description = "Re-enqueued as a fresh job", body = JobResponse) ),
    security(("ApiKey" = []), ("BearerAuth" = []))
)]
pub async fn retry_dlq_entry(
    State(state): State<AppState>,
    Path((tenant_id, dlq_id)): Path<(Uuid, Uuid)>,
    headers: HeaderMap,
) -> Result<Json<JobResponse>, HttpError> {
    authorize(
        &state,
        &headers,
        Some(tenant_id),
        &Scope::Resource(ResourceType::Job, Action::Write),
    )?;
    let job = state.platform.queue().dlq_retry(dlq_id)?;
    Ok(Json(JobResponse::from(job)))
}

#[utoipa::path(
    delete,
    path = "/tenants/{tenant_id}/dlq/{dlq_id}",
    params(
        ("tenant_id" = Uuid, Path, description = "Tenant identifier"),
        ("dlq_id" = Uuid, Path, description = "DLQ entry identifier")
    ),
    responses( (status = 204, description = "Entry discarded") ),
    security(("ApiKey" = []), ("BearerAuth" = []))
)]
pub async fn purge_dlq_entry(
    State(state): State<AppState>,
    Path((tenant_id, dlq_id)): Path<(Uuid, Uuid)>,
    headers: HeaderMap,
) -> Result<StatusCode, HttpError> {
    authorize(
        &state,
        &headers,
        Some(tenant_id),
        &Scope::Resource(ResourceType::Job, Action::Write),
    )?;
    state.platform.queue().purge_dlq(dlq_id)?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateScheduleRequest {
    pub workflow_id: Uuid,
    pub cron_expression: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ScheduleResponse {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub workflow_id: Uuid,
    pub cron_expression: String,
    pub timezone: String,
    pub enabled: bool,
    pub priority: i32,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub failure_count: u64,
}

impl From<Schedule> for ScheduleResponse {
    fn from(schedule: Schedule) -> Self {
        Self {
            id: schedule.id,
            tenant_id: schedule.tenant_id,
            workflow_id: schedule.workflow_id,
            cron_expression: schedule.cron_expression,
            timezone: schedule.timezone,
            enabled: schedule.enabled,
            priority: schedule.priority,
            last_run: schedule.last_run,
            next_run: schedule.next_run,
            run_count: schedule.run_count,
            failure_count: schedule.failure_count,
        }
    }
}

#[utoipa::path(
    post,
    path = "/tenants/{tenant_id}/schedules",
    params( ("tenant_id" = Uuid, Path, description = "Tenant identifier") ),
    request_body = CreateScheduleRequest,
    responses( (status = 201, description = "Schedule created", body = ScheduleResponse) ),
    security(("ApiKey" = []), ("BearerAuth" = []))
)]
pub async fn create_schedule(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    headers: HeaderMap,
    Json(payload): Json<CreateScheduleRequest>,
) -> Result<(StatusCode, Json<ScheduleResponse>), HttpError> {
    authorize(
        &state,
        &headers,
        Some(tenant_id),
        &Scope::Resource(ResourceType::Schedule, Action::Write),
    )?;
    let schedule = state.platform.scheduler().create_schedule(
        tenant_id,
        payload.workflow_id,
        payload.cron_expression,
        payload.timezone,
        payload.priority,
        payload.inputs,
    )?;
    Ok((StatusCode::CREATED, Json(ScheduleResponse::from(schedule))))
}

#[utoipa::path(
    get,
    path = "/tenants/{tenant_id}/schedules",
    params( ("tenant_id" = Uuid, Path, description = "Tenant identifier") ),
    responses( (status = 200, description = "Schedules in the tenant", body = [ScheduleResponse]) ),
    security(("ApiKey" = []), ("BearerAuth" = []))
)]
pub async fn list_schedules(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<Vec<ScheduleResponse>>, HttpError> {
    authorize(
        &state,
        &headers,
        Some(tenant_id),
        &Scope::Resource(ResourceType::Schedule, Action::Read),
    )?;
    let schedules = state.platform.storage().list_schedules(tenant_id)?;
    Ok(Json(schedules.into_iter().map(ScheduleResponse::from).collect()))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ToggleScheduleRequest {
    pub enabled: bool,
}

#[utoipa::path(
    patch,
    path = "/schedules/{schedule_id}",
    params( ("schedule_id" = Uuid, Path, description = "Schedule identifier") ),
    request_body = ToggleScheduleRequest,
    responses( (status = 200, description = "Schedule toggled", body = ScheduleResponse) ),
    security(("ApiKey" = []), ("BearerAuth" = []))
)]
pub async fn toggle_schedule(
    State(state): State<AppState>,
    Path(schedule_id): Path<Uuid>,
    headers: HeaderMap,
    Json(payload): Json<ToggleScheduleRequest>,
) -> Result<Json<ScheduleResponse>, HttpError> {
    authorize(
        &state,
        &headers,
        None,
        &Scope::Resource(ResourceType::Schedule, Action::Write),
    )?;
    let schedule = state
        .platform
        .scheduler()
        .set_enabled(schedule_id, payload.enabled)?;
    Ok(Json(ScheduleResponse::from(schedule)))
}

#[utoipa::path(
    post,
    path = "/schedules/{schedule_id}/run-now",
    params( ("schedule_id" = Uuid, Path, description = "Schedule identifier") ),
    responses( (status = 201, description = "Job enqueued immediately", body = JobResponse) ),
    security(("ApiKey" = []), ("BearerAuth" = []))
)]
pub async fn run_schedule_now(
    State(state): State<AppState>,
    Path(schedule_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<JobResponse>), HttpError> {
    authorize(
        &state,
        &headers,
        None,
        &Scope::Resource(ResourceType::Schedule, Action::Write),
    )?;
    let job = state.platform.scheduler().run_now(schedule_id)?;
    Ok((StatusCode::CREATED, Json(JobResponse::from(job))))
}

// ---------------------------------------------------------------------------
// API keys
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, ToSchema)]
pub struct ApiKeyResponse {
    pub id: Uuid,
    pub value: String,
    pub tenant_id: Uuid,
    pub robot_id: Option<Uuid>,
    pub label: String,
    pub role: String,
}

impl From<ApiKey> for ApiKeyResponse {
    fn from(key: ApiKey) -> Self {
        Self {
            id: key.id,
            value: key.value,
            tenant_id: key.tenant_id,
            robot_id: key.robot_id,
            label: key.label,
            role: key.role,
        }
    }
}

#[utoipa::path(
    post,
    path = "/api-keys/{key_id}/rotate",
    params( ("key_id" = Uuid, Path, description = "API key identifier") ),
    responses( (status = 200, description = "Rotated key", body = ApiKeyResponse) ),
    security(("ApiKey" = []), ("BearerAuth" = []))
)]
pub async fn rotate_api_key(
    State(state): State<AppState>,
    Path(key_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<ApiKeyResponse>, HttpError> {
    authorize(
        &state,
        &headers,
        None,
        &Scope::Resource(ResourceType::Credential, Action::Write),
    )?;
    let rotated = state.platform.auth().rotate_api_key(key_id)?;
    Ok(Json(ApiKeyResponse::from(rotated)))
}

// ---------------------------------------------------------------------------
// Authorization helper
// ---------------------------------------------------------------------------

/// Resolves the caller and checks it carries `required`. When `tenant_id` is
/// given, the caller must belong to that tenant unless it holds the blanket
/// `Admin` scope.
fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    tenant_id: Option<Uuid>,
    required: &Scope,
) -> Result<AuthContext, HttpError> {
    let ctx = authenticate(&state.platform.auth(), headers)
        .ok_or_else(|| HttpError::new(StatusCode::UNAUTHORIZED, "unauthorized"))?;
    if !has_scope(&ctx, required) {
        return Err(HttpError::new(StatusCode::FORBIDDEN, "scope required"));
    }
    if let Some(tenant_id) = tenant_id {
        let is_admin = ctx.scopes.iter().any(|s| matches!(s, Scope::Admin));
        if !is_admin && ctx.tenant_id != tenant_id {
            return Err(HttpError::new(StatusCode::FORBIDDEN, "tenant scope mismatch"));
        }
    }
    Ok(ctx)
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health,
        version,
        metrics,
        list_recent_logs,
        create_tenant,
        register_robot,
        list_robots,
        robot_heartbeat,
        enqueue_job,
        get_job,
        list_jobs,
        cancel_job,
        list_dlq,
        retry_dlq_entry,
        purge_dlq_entry,
        create_schedule,
        list_schedules,
        toggle_schedule,
        run_schedule_now,
        rotate_api_key
    ),
    components(
        schemas(
            HealthResponse,
            VersionResponse,
            ErrorResponse,
            ListLogsParams,
            TelemetryLogResponse,
            CreateTenantRequest,
            TenantResponse,
            RegisterRobotRequest,
            RobotResponse,
            ProvisionedRobotResponse,
            RobotHeartbeatRequest,
            EnqueueJobRequest,
            ListJobsParams,
            JobResponse,
            CancelJobRequest,
            DlqEntryResponse,
            CreateScheduleRequest,
            ScheduleResponse,
            ToggleScheduleRequest,
            ApiKeyResponse
        )
    ),
    tags(
        (name = "system", description = "System & meta endpoints"),
        (name = "orchestration", description = "Tenants, robots, jobs, DLQ and schedules")
    )
)]
pub struct ApiDoc;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/version", get(version))
        .route("/metrics", get(metrics))
        .route("/telemetry/logs", get(list_recent_logs))
        .route("/tenants", post(create_tenant))
        .route(
            "/tenants/:tenant_id/robots",
            post(register_robot).get(list_robots),
        )
        .route("/robots/:robot_id/heartbeat", post(robot_heartbeat))
        .route(
            "/tenants/:tenant_id/jobs",
            post(enqueue_job).get(list_jobs),
        )
        .route("/tenants/:tenant_id/jobs/:job_id", get(get_job))
        .route(
            "/tenants/:tenant_id/jobs/:job_id/cancel",
            post(cancel_job),
        )
        .route("/tenants/:tenant_id/dlq", get(list_dlq))
        .route(
            "/tenants/:tenant_id/dlq/:dlq_id/retry",
            post(retry_dlq_entry),
        )
        .route(
            "/tenants/:tenant_id/dlq/:dlq_id",
            delete(purge_dlq_entry),
        )
        .route(
            "/tenants/:tenant_id/schedules",
            post(create_schedule).get(list_schedules),
        )
        .route("/schedules/:schedule_id", patch(toggle_schedule))
        .route("/schedules/:schedule_id/run-now", post(run_schedule_now))
        .route("/api-keys/:key_id/rotate", post(rotate_api_key))
}
