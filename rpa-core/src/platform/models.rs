use chrono::{DateTime, Utc};
use rpa_common::auth::Scope;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

pub type TenantId = Uuid;
pub type RobotId = Uuid;
pub type JobId = Uuid;
pub type WorkflowId = Uuid;
pub type ScheduleId = Uuid;
pub type DlqEntryId = Uuid;
pub type ApiKeyId = Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub settings: TenantSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TenantSettings {
    pub allowed_origins: Vec<String>,
    pub token_ttl_seconds: Option<i64>,
}

// ---------------------------------------------------------------------------
// Robot Registry & Capability Router (§3, §4.2)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RobotStatus {
    Offline,
    Online,
    Busy,
    Error,
    Maintenance,
}

impl RobotStatus {
    /// A robot in `Error` or `Maintenance` is never eligible for assignment, §4.2.
    pub fn is_eligible(&self) -> bool {
        matches!(self, RobotStatus::Online | RobotStatus::Busy)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Robot {
    pub id: RobotId,
    pub tenant_id: TenantId,
    pub name: String,
    pub hostname: String,
    pub status: RobotStatus,
    pub capabilities: HashSet<String>,
    pub tags: HashSet<String>,
    pub max_concurrent_jobs: u32,
    pub current_job_ids: HashSet<JobId>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub version: String,
    pub metrics: HashMap<String, f64>,
    pub created_at: DateTime<Utc>,
}

impl Robot {
    /// Invariant: `|current_job_ids| <= max_concurrent_jobs`, §3.
    pub fn has_free_slot(&self) -> bool {
        (self.current_job_ids.len() as u32) < self.max_concurrent_jobs
    }

    pub fn satisfies(&self, required_capabilities: &HashSet<String>) -> bool {
        required_capabilities.is_subset(&self.capabilities)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowAssignment {
    pub workflow_id: WorkflowId,
    pub robot_id: RobotId,
    pub is_default: bool,
    pub priority: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeRobotTarget {
    Robot(RobotId),
    Capabilities(HashSet<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeRobotOverride {
    pub workflow_id: WorkflowId,
    pub node_id: String,
    pub target: NodeRobotTarget,
}

// ---------------------------------------------------------------------------
// Job Queue & Lease Manager (§3, §4.1)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Claimed,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Timeout
        )
    }

    pub fn is_leased(&self) -> bool {
        matches!(self, JobStatus::Claimed | JobStatus::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobFilter {
    pub required_capabilities: HashSet<String>,
    pub robot_id: Option<RobotId>,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            required_capabilities: HashSet::new(),
            robot_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub tenant_id: TenantId,
    pub workflow_id: WorkflowId,
    pub workflow_name: Option<String>,
    pub status: JobStatus,
    pub priority: i32,
    pub payload: Vec<u8>,
    pub inputs: HashMap<String, serde_json::Value>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub error_code: Option<JobErrorCode>,
    pub progress: u8,
    pub current_node: Option<String>,
    pub required_capabilities: HashSet<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout_seconds: u64,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub claimed_by: Option<RobotId>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub lock_heartbeat: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    pub cancel_reason: Option<String>,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// `msg_id` of the last robot-originated update applied to this job, used
    /// to discard out-of-order progress/result messages per §5.
    pub last_msg_id: Option<u128>,
}

impl Job {
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// Machine-readable error codes on terminal job outcomes, §6.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobErrorCode {
    WindowNotFound,
    ElementNotFound,
    ConnectionRefused,
    RateLimitExceeded,
    CircuitOpen,
    Timeout,
    AuthFailed,
    InvalidPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobRequest {
    pub tenant_id: TenantId,
    pub workflow_id: WorkflowId,
    pub workflow_name: Option<String>,
    pub priority: i32,
    pub payload: Vec<u8>,
    pub inputs: HashMap<String, serde_json::Value>,
    pub required_capabilities: HashSet<String>,
    pub max_retries: u32,
    pub timeout_seconds: u64,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobHistoryEvent {
    Created,
    Claimed,
    Started,
    ProgressUpdated,
    Completed,
    FailedRetryable,
    FailedTerminal,
    CancelRequested,
    Cancelled,
    StaleLockReclaimed,
    TimedOut,
    DlqRetried { new_job_id: JobId },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobHistoryEntry {
    pub id: Uuid,
    pub job_id: JobId,
    pub robot_id: Option<RobotId>,
    pub event_type: JobHistoryEvent,
    pub event_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DlqEntry {
    pub id: DlqEntryId,
    pub tenant_id: TenantId,
    pub job_id: JobId,
    pub workflow_id: WorkflowId,
    pub error_message: String,
    pub error_stack: Option<String>,
    pub inputs: HashMap<String, serde_json::Value>,
    pub retry_count: u32,
    pub failed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Scheduler (§3, §4.4)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Schedule {
    pub id: ScheduleId,
    pub tenant_id: TenantId,
    pub workflow_id: WorkflowId,
    pub cron_expression: String,
    pub timezone: String,
    pub enabled: bool,
    pub priority: i32,
    pub inputs: HashMap<String, serde_json::Value>,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub failure_count: u64,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// RobotLog (§3)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RobotLogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RobotLog {
    pub id: Uuid,
    pub robot_id: RobotId,
    pub tenant_id: TenantId,
    pub timestamp: DateTime<Utc>,
    pub level: RobotLogLevel,
    pub message: String,
    pub source: Option<String>,
    pub extra: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// API keys / auth context (kept close to the originating provisioning model)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiKeyRecord {
    pub id: ApiKeyId,
    pub tenant_id: TenantId,
    pub robot_id: Option<RobotId>,
    pub label: String,
    pub role: String,
    pub prefix: String,
    pub hash: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub revoked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiKey {
    pub id: ApiKeyId,
    pub value: String,
    pub tenant_id: TenantId,
    pub robot_id: Option<RobotId>,
    pub label: String,
    pub role: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProvisionedRobot {
    pub robot: RobotSummary,
    pub api_key: ApiKey,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RobotSummary {
    pub id: RobotId,
    pub tenant_id: TenantId,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PrincipalType {
    Tenant,
    Robot,
    Service,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthContext {
    pub principal_id: Uuid,
    pub principal_type: PrincipalType,
    pub tenant_id: TenantId,
    pub role: String,
    pub scopes: Vec<Scope>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthToken {
    pub token: String,
    pub context: AuthContext,
}
