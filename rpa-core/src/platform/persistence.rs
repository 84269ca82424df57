use crate::platform::error::{PlatformError, PlatformResult};
use crate::platform::models::*;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
#[cfg(feature = "db")]
use sqlx::{postgres::PgRow, Pool, Postgres, Row};

pub trait TenantStore: Send + Sync {
    fn insert_tenant(&self, tenant: Tenant) -> PlatformResult<()>;
    fn get_tenant(&self, id: TenantId) -> PlatformResult<Option<Tenant>>;
    fn list_tenants(&self) -> PlatformResult<Vec<Tenant>>;
}

pub trait RobotStore: Send + Sync {
    fn insert_robot(&self, robot: Robot) -> PlatformResult<()>;
    fn get_robot(&self, id: RobotId) -> PlatformResult<Option<Robot>>;
    fn list_robots(&self, tenant_id: TenantId) -> PlatformResult<Vec<Robot>>;
    /// Returns robots in `tenant_id` that are eligible (§4.2 `is_eligible`),
    /// satisfy `required_capabilities`, and currently have a free slot.
    fn list_eligible_robots(
        &self,
        tenant_id: TenantId,
        required_capabilities: &HashSet<String>,
    ) -> PlatformResult<Vec<Robot>>;
    fn update_robot(&self, updated: Robot) -> PlatformResult<()>;
    /// Robots whose `last_heartbeat` predates `cutoff`, used by the registry
    /// sweep to flip them to `Offline`, §4.2.
    fn list_stale_heartbeats(
        &self,
        tenant_id: TenantId,
        cutoff: DateTime<Utc>,
    ) -> PlatformResult<Vec<Robot>>;
}

/// Job Queue & Lease Manager persistence, §4.1.
pub trait JobStore: Send + Sync {
    fn insert_job(&self, job: Job) -> PlatformResult<()>;
    fn get_job(&self, id: JobId) -> PlatformResult<Option<Job>>;
    fn update_job(&self, job: Job) -> PlatformResult<()>;
    fn list_jobs(&self, tenant_id: TenantId, status: Option<JobStatus>) -> PlatformResult<Vec<Job>>;
    fn find_by_idempotency_key(
        &self,
        tenant_id: TenantId,
        key: &str,
    ) -> PlatformResult<Option<Job>>;
    /// Atomically selects and claims the highest-priority eligible pending
    /// job for `robot`, ordered `(priority DESC, created_at ASC)`, §4.1/P1.
    /// Implementations must guarantee at-most-one-claim under concurrent
    /// callers: the in-memory store does this under a single write lock,
    /// the Postgres store with `SELECT ... FOR UPDATE SKIP LOCKED`.
    fn claim_next(&self, tenant_id: TenantId, robot: &Robot) -> PlatformResult<Option<Job>>;
    /// Leased jobs (`Claimed`/`Running`) whose `lock_heartbeat` predates
    /// `cutoff`, for the stale-lock sweep, §4.1/P4.
    fn list_stale_leases(&self, cutoff: DateTime<Utc>) -> PlatformResult<Vec<Job>>;
    fn append_history(&self, entry: JobHistoryEntry) -> PlatformResult<()>;
    fn list_history(&self, job_id: JobId) -> PlatformResult<Vec<JobHistoryEntry>>;
}

pub trait DlqStore: Send + Sync {
    fn insert_dlq(&self, entry: DlqEntry) -> PlatformResult<()>;
    fn get_dlq(&self, id: DlqEntryId) -> PlatformResult<Option<DlqEntry>>;
    fn list_dlq(&self, tenant_id: TenantId) -> PlatformResult<Vec<DlqEntry>>;
    fn delete_dlq(&self, id: DlqEntryId) -> PlatformResult<()>;
    /// Entries older than `cutoff`, for the retention sweep, §6.
    fn list_expired_dlq(&self, cutoff: DateTime<Utc>) -> PlatformResult<Vec<DlqEntry>>;
}

/// Scheduler persistence, §4.4.
pub trait ScheduleStore: Send + Sync {
    fn insert_schedule(&self, schedule: Schedule) -> PlatformResult<()>;
    fn get_schedule(&self, id: ScheduleId) -> PlatformResult<Option<Schedule>>;
    fn update_schedule(&self, schedule: Schedule) -> PlatformResult<()>;
    fn list_schedules(&self, tenant_id: TenantId) -> PlatformResult<Vec<Schedule>>;
    /// Enabled schedules whose `next_run` is at or before `now`, claimed
    /// exactly-once by the caller under the store's own locking, §4.4/P7.
    fn claim_due_schedules(&self, now: DateTime<Utc>) -> PlatformResult<Vec<Schedule>>;
}

pub trait RobotLogStore: Send + Sync {
    fn append_log(&self, log: RobotLog) -> PlatformResult<()>;
    fn list_logs(
        &self,
        robot_id: RobotId,
        since: Option<DateTime<Utc>>,
    ) -> PlatformResult<Vec<RobotLog>>;
    /// Logs older than `cutoff`, for `log_retention_days` cleanup, §6.
    fn delete_logs_before(&self, cutoff: DateTime<Utc>) -> PlatformResult<u64>;
}

pub trait ApiKeyStore: Send + Sync {
    fn insert_api_key(&self, record: ApiKeyRecord) -> PlatformResult<()>;
    fn get_api_key(&self, id: ApiKeyId) -> PlatformResult<Option<ApiKeyRecord>>;
    fn get_api_key_by_prefix(&self, prefix: &str) -> PlatformResult<Option<ApiKeyRecord>>;
    fn list_api_keys(&self, tenant_id: TenantId) -> PlatformResult<Vec<ApiKeyRecord>>;
    fn update_api_key(&self, record: ApiKeyRecord) -> PlatformResult<()>;
}

#[derive(Default)]
struct PlatformState {
    tenants: HashMap<TenantId, Tenant>,
    robots: HashMap<RobotId, Robot>,
    jobs: HashMap<JobId, Job>,
    job_history: HashMap<JobId, Vec<JobHistoryEntry>>,
    dlq: HashMap<DlqEntryId, DlqEntry>,
    schedules: HashMap<ScheduleId, Schedule>,
    robot_logs: Vec<RobotLog>,
    api_keys: HashMap<ApiKeyId, ApiKeyRecord>,
    api_keys_by_prefix: HashMap<String, ApiKeyId>,
}

#[derive(Clone, Default)]
pub struct InMemoryPersistence {
    state: Arc<RwLock<PlatformState>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TenantStore for InMemoryPersistence {
    fn insert_tenant(&self, tenant: Tenant) -> PlatformResult<()> {
        let mut state = self.state.write();
        if state.tenants.contains_key(&tenant.id) {
            return Err(PlatformError::Conflict("tenant"));
        }
        state.tenants.insert(tenant.id, tenant);
        Ok(())
    }

    fn get_tenant(&self, id: TenantId) -> PlatformResult<Option<Tenant>> {
        Ok(self.state.read().tenants.get(&id).cloned())
    }

    fn list_tenants(&self) -> PlatformResult<Vec<Tenant>> {
        let mut tenants: Vec<_> = self.state.read().tenants.values().cloned().collect();
        tenants.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tenants)
    }
}

impl RobotStore for InMemoryPersistence {
    fn insert_robot(&self, robot: Robot) -> PlatformResult<()> {
        let mut state = self.state.write();
        if !state.tenants.contains_key(&robot.tenant_id) {
            return Err(PlatformError::NotFound("tenant"));
        }
        if state.robots.contains_key(&robot.id) {
            return Err(PlatformError::Conflict("robot"));
        }
        state.robots.insert(robot.id, robot);
        Ok(())
    }

    fn get_robot(&self, id: RobotId) -> PlatformResult<Option<Robot>> {
        Ok(self.state.read().robots.get(&id).cloned())
    }

    fn list_robots(&self, tenant_id: TenantId) -> PlatformResult<Vec<Robot>> {
        let mut robots: Vec<_> = self
            .state
            .read()
            .robots
            .values()
            .filter(|r| r.tenant_id == tenant_id)
            .cloned()
            .collect();
        robots.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(robots)
    }

    fn list_eligible_robots(
        &self,
        tenant_id: TenantId,
        required_capabilities: &HashSet<String>,
    ) -> PlatformResult<Vec<Robot>> {
        let robots: Vec<_> = self
            .state
            .read()
            .robots
            .values()
            .filter(|r| {
                r.tenant_id == tenant_id
                    && r.status.is_eligible()
                    && r.has_free_slot()
                    && r.satisfies(required_capabilities)
            })
            .cloned()
            .collect();
        Ok(robots)
    }

    fn update_robot(&self, updated: Robot) -> PlatformResult<()> {
        let mut state = self.state.write();
        if !state.robots.contains_key(&updated.id) {
            return Err(PlatformError::NotFound("robot"));
        }
        state.robots.insert(updated.id, updated);
        Ok(())
    }

    fn list_stale_heartbeats(
        &self,
        tenant_id: TenantId,
        cutoff: DateTime<Utc>,
    ) -> PlatformResult<Vec<Robot>> {
        let robots: Vec<_> = self
            .state
            .read()
            .robots
            .values()
            .filter(|r| {
                r.tenant_id == tenant_id
                    && r.status != RobotStatus::Offline
                    && r.last_heartbeat.map(|hb| hb < cutoff).unwrap_or(true)
            })
            .cloned()
            .collect();
        Ok(robots)
    }
}

impl JobStore for InMemoryPersistence {
    fn insert_job(&self, job: Job) -> PlatformResult<()> {
        let mut state = self.state.write();
        if state.jobs.contains_key(&job.id) {
            return Err(PlatformError::Conflict("job"));
        }
        state.jobs.insert(job.id, job);
        Ok(())
    }

    fn get_job(&self, id: JobId) -> PlatformResult<Option<Job>> {
        Ok(self.state.read().jobs.get(&id).cloned())
    }

    fn update_job(&self, job: Job) -> PlatformResult<()> {
        let mut state = self.state.write();
        if !state.jobs.contains_key(&job.id) {
            return Err(PlatformError::NotFound("job"));
        }
        state.jobs.insert(job.id, job);
        Ok(())
    }

    fn list_jobs(&self, tenant_id: TenantId, status: Option<JobStatus>) -> PlatformResult<Vec<Job>> {
        let mut jobs: Vec<_> = self
            .state
            .read()
            .jobs
            .values()
            .filter(|j| j.tenant_id == tenant_id && status.map(|s| s == j.status).unwrap_or(true))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    fn find_by_idempotency_key(
        &self,
        tenant_id: TenantId,
        key: &str,
    ) -> PlatformResult<Option<Job>> {
        Ok(self
            .state
            .read()
            .jobs
            .values()
            .find(|j| j.tenant_id == tenant_id && j.idempotency_key.as_deref() == Some(key))
            .cloned())
    }

    fn claim_next(&self, tenant_id: TenantId, robot: &Robot) -> PlatformResult<Option<Job>> {
        // Single write lock covers selection and mutation so no other caller
        // can observe or claim the same job between the two steps, P1.
        let mut state = self.state.write();
        let now = Utc::now();
        let candidate_id = state
            .jobs
            .values()
            .filter(|j| {
                j.tenant_id == tenant_id
                    && j.status == JobStatus::Pending
                    && j.scheduled_time.map(|t| t <= now).unwrap_or(true)
                    && robot.satisfies(&j.required_capabilities)
            })
            .max_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| b.created_at.cmp(&a.created_at))
            })
            .map(|j| j.id);
        let Some(id) = candidate_id else {
            return Ok(None);
        };
        let job = state.jobs.get_mut(&id).expect("candidate exists");
        job.status = JobStatus::Claimed;
        job.claimed_by = Some(robot.id);
        job.claimed_at = Some(now);
        job.lock_heartbeat = Some(now);
        Ok(Some(job.clone()))
    }

    fn list_stale_leases(&self, cutoff: DateTime<Utc>) -> PlatformResult<Vec<Job>> {
        let jobs: Vec<_> = self
            .state
            .read()
            .jobs
            .values()
            .filter(|j| {
                j.status.is_leased() && j.lock_heartbeat.map(|hb| hb < cutoff).unwrap_or(true)
            })
            .cloned()
            .collect();
        Ok(jobs)
    }

    fn append_history(&self, entry: JobHistoryEntry) -> PlatformResult<()> {
        let mut state = self.state.write();
        state.job_history.entry(entry.job_id).or_default().push(entry);
        Ok(())
    }

    fn list_history(&self, job_id: JobId) -> PlatformResult<Vec<JobHistoryEntry>> {
        Ok(self
            .state
            .read()
            .job_history
            .get(&job_id)
            .cloned()
            .unwrap_or_default())
    }
}

impl DlqStore for InMemoryPersistence {
    fn insert_dlq(&self, entry: DlqEntry) -> PlatformResult<()> {
        let mut state = self.state.write();
        state.dlq.insert(entry.id, entry);
        Ok(())
    }

    fn get_dlq(&self, id: DlqEntryId) -> PlatformResult<Option<DlqEntry>> {
        Ok(self.state.read().dlq.get(&id).cloned())
    }

    fn list_dlq(&self, tenant_id: TenantId) -> PlatformResult<Vec<DlqEntry>> {
        let mut entries: Vec<_> = self
            .state
            .read()
            .dlq
            .values()
            .filter(|e| e.tenant_id == tenant_id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));
        Ok(entries)
    }

    fn delete_dlq(&self, id: DlqEntryId) -> PlatformResult<()> {
        let mut state = self.state.write();
        if state.dlq.remove(&id).is_none() {
            return Err(PlatformError::NotFound("dlq_entry"));
        }
        Ok(())
    }

    fn list_expired_dlq(&self, cutoff: DateTime<Utc>) -> PlatformResult<Vec<DlqEntry>> {
        let entries: Vec<_> = self
            .state
            .read()
            .dlq
            .values()
            .filter(|e| e.failed_at < cutoff)
            .cloned()
            .collect();
        Ok(entries)
    }
}

impl ScheduleStore for InMemoryPersistence {
    fn insert_schedule(&self, schedule: Schedule) -> PlatformResult<()> {
        let mut state = self.state.write();
        if state.schedules.contains_key(&schedule.id) {
            return Err(PlatformError::Conflict("schedule"));
        }
        state.schedules.insert(schedule.id, schedule);
        Ok(())
    }

    fn get_schedule(&self, id: ScheduleId) -> PlatformResult<Option<Schedule>> {
        Ok(self.state.read().schedules.get(&id).cloned())
    }

    fn update_schedule(&self, schedule: Schedule) -> PlatformResult<()> {
        let mut state = self.state.write();
        if !state.schedules.contains_key(&schedule.id) {
            return Err(PlatformError::NotFound("schedule"));
        }
        state.schedules.insert(schedule.id, schedule);
        Ok(())
    }

    fn list_schedules(&self, tenant_id: TenantId) -> PlatformResult<Vec<Schedule>> {
        let mut schedules: Vec<_> = self
            .state
            .read()
            .schedules
            .values()
            .filter(|s| s.tenant_id == tenant_id)
            .cloned()
            .collect();
        schedules.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(schedules)
    }

    fn claim_due_schedules(&self, now: DateTime<Utc>) -> PlatformResult<Vec<Schedule>> {
        let state = self.state.read();
        let due: Vec<_> = state
            .schedules
            .values()
            .filter(|s| s.enabled && s.next_run.map(|n| n <= now).unwrap_or(false))
            .cloned()
            .collect();
        Ok(due)
    }
}

impl RobotLogStore for InMemoryPersistence {
    fn append_log(&self, log: RobotLog) -> PlatformResult<()> {
        self.state.write().robot_logs.push(log);
        Ok(())
    }

    fn list_logs(
        &self,
        robot_id: RobotId,
        since: Option<DateTime<Utc>>,
    ) -> PlatformResult<Vec<RobotLog>> {
        let logs: Vec<_> = self
            .state
            .read()
            .robot_logs
            .iter()
            .filter(|l| l.robot_id == robot_id && since.map(|s| l.timestamp >= s).unwrap_or(true))
            .cloned()
            .collect();
        Ok(logs)
    }

    fn delete_logs_before(&self, cutoff: DateTime<Utc>) -> PlatformResult<u64> {
        let mut state = self.state.write();
        let before = state.robot_logs.len();
        state.robot_logs.retain(|l| l.timestamp >= cutoff);
        Ok((before - state.robot_logs.len()) as u64)
    }
}

impl ApiKeyStore for InMemoryPersistence {
    fn insert_api_key(&self, record: ApiKeyRecord) -> PlatformResult<()> {
        let mut state = self.state.write();
        if state.api_keys_by_prefix.contains_key(&record.prefix) {
            return Err(PlatformError::Conflict("api_key"));
        }
        state
            .api_keys_by_prefix
            .insert(record.prefix.clone(), record.id);
        state.api_keys.insert(record.id, record);
        Ok(())
    }

    fn get_api_key(&self, id: ApiKeyId) -> PlatformResult<Option<ApiKeyRecord>> {
        Ok(self.state.read().api_keys.get(&id).cloned())
    }

    fn get_api_key_by_prefix(&self, prefix: &str) -> PlatformResult<Option<ApiKeyRecord>> {
        let state = self.state.read();
        if let Some(id) = state.api_keys_by_prefix.get(prefix) {
            Ok(state.api_keys.get(id).cloned())
        } else {
            Ok(None)
        }
    }

    fn list_api_keys(&self, tenant_id: TenantId) -> PlatformResult<Vec<ApiKeyRecord>> {
        let mut keys: Vec<_> = self
            .state
            .read()
            .api_keys
            .values()
            .filter(|k| k.tenant_id == tenant_id)
            .cloned()
            .collect();
        keys.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(keys)
    }

    fn update_api_key(&self, record: ApiKeyRecord) -> PlatformResult<()> {
        let mut state = self.state.write();
        if !state.api_keys.contains_key(&record.id) {
            return Err(PlatformError::NotFound("api_key"));
        }
        state
            .api_keys_by_prefix
            .insert(record.prefix.clone(), record.id);
        state.api_keys.insert(record.id, record);
        Ok(())
    }
}

#[cfg(feature = "db")]
fn map_db_err(err: sqlx::Error) -> PlatformError {
    match err {
        sqlx::Error::RowNotFound => PlatformError::NotFound("record"),
        sqlx::Error::Database(db_err) => {
            if db_err.code().as_deref() == Some("23505") {
                PlatformError::Conflict("record")
            } else {
                PlatformError::Internal("database error")
            }
        }
        _ => PlatformError::Internal("database error"),
    }
}

#[cfg(feature = "db")]
fn parse_job_status(raw: &str) -> PlatformResult<JobStatus> {
    Ok(match raw {
        "pending" => JobStatus::Pending,
        "claimed" => JobStatus::Claimed,
        "running" => JobStatus::Running,
        "completed" => JobStatus::Completed,
        "failed" => JobStatus::Failed,
        "cancelled" => JobStatus::Cancelled,
        "timeout" => JobStatus::Timeout,
        _ => return Err(PlatformError::Internal("unknown job status")),
    })
}

/// Postgres-backed job store, §4.1. The synchronous `JobStore` surface isn't
/// implementable against an async pool, so this type exposes its own async
/// methods and is driven directly by `JobQueue` when the `db` feature is on,
/// rather than through the trait object used for the in-memory backend.
#[cfg(feature = "db")]
pub struct PostgresJobStore {
    pool: Pool<Postgres>,
}

#[cfg(feature = "db")]
impl PostgresJobStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn map_row(row: PgRow) -> PlatformResult<Job> {
        let status: String = row.try_get("status").map_err(|_| PlatformError::Internal("row"))?;
        let status = parse_job_status(&status)?;
        let inputs: serde_json::Value = row.try_get("inputs").map_err(|_| PlatformError::Internal("row"))?;
        let inputs = serde_json::from_value(inputs).unwrap_or_default();
        let required_capabilities: Vec<String> = row
            .try_get("required_capabilities")
            .map_err(|_| PlatformError::Internal("row"))?;
        Ok(Job {
            id: row.try_get("id").map_err(|_| PlatformError::Internal("row"))?,
            tenant_id: row.try_get("tenant_id").map_err(|_| PlatformError::Internal("row"))?,
            workflow_id: row.try_get("workflow_id").map_err(|_| PlatformError::Internal("row"))?,
            workflow_name: row.try_get("workflow_name").map_err(|_| PlatformError::Internal("row"))?,
            status,
            priority: row.try_get("priority").map_err(|_| PlatformError::Internal("row"))?,
            payload: row.try_get("payload").map_err(|_| PlatformError::Internal("row"))?,
            inputs,
            result: row.try_get("result").map_err(|_| PlatformError::Internal("row"))?,
            error: row.try_get("error").map_err(|_| PlatformError::Internal("row"))?,
            error_code: None,
            progress: row.try_get::<i32, _>("progress").map_err(|_| PlatformError::Internal("row"))? as u8,
            current_node: row.try_get("current_node").map_err(|_| PlatformError::Internal("row"))?,
            required_capabilities: required_capabilities.into_iter().collect(),
            retry_count: row.try_get::<i32, _>("retry_count").map_err(|_| PlatformError::Internal("row"))? as u32,
            max_retries: row.try_get::<i32, _>("max_retries").map_err(|_| PlatformError::Internal("row"))? as u32,
            timeout_seconds: row
                .try_get::<i64, _>("timeout_seconds")
                .map_err(|_| PlatformError::Internal("row"))? as u64,
            scheduled_time: row.try_get("scheduled_time").map_err(|_| PlatformError::Internal("row"))?,
            claimed_by: row.try_get("claimed_by").map_err(|_| PlatformError::Internal("row"))?,
            claimed_at: row.try_get("claimed_at").map_err(|_| PlatformError::Internal("row"))?,
            lock_heartbeat: row.try_get("lock_heartbeat").map_err(|_| PlatformError::Internal("row"))?,
            cancel_requested: row.try_get("cancel_requested").map_err(|_| PlatformError::Internal("row"))?,
            cancel_reason: row.try_get("cancel_reason").map_err(|_| PlatformError::Internal("row"))?,
            idempotency_key: row.try_get("idempotency_key").map_err(|_| PlatformError::Internal("row"))?,
            created_at: row.try_get("created_at").map_err(|_| PlatformError::Internal("row"))?,
            started_at: row.try_get("started_at").map_err(|_| PlatformError::Internal("row"))?,
            completed_at: row.try_get("completed_at").map_err(|_| PlatformError::Internal("row"))?,
            last_msg_id: None,
        })
    }

    pub async fn insert_job_async(&self, job: &Job) -> PlatformResult<()> {
        let required: Vec<String> = job.required_capabilities.iter().cloned().collect();
        let inputs = serde_json::to_value(&job.inputs).map_err(|_| PlatformError::InvalidInput("inputs"))?;
        sqlx::query(
            "INSERT INTO jobs (
                id, tenant_id, workflow_id, workflow_name, status, priority, payload,
                inputs, required_capabilities, retry_count, max_retries, timeout_seconds,
                scheduled_time, idempotency_key, created_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)",
        )
        .bind(job.id)
        .bind(job.tenant_id)
        .bind(job.workflow_id)
        .bind(&job.workflow_name)
        .bind("pending")
        .bind(job.priority)
        .bind(&job.payload)
        .bind(inputs)
        .bind(&required)
        .bind(job.retry_count as i32)
        .bind(job.max_retries as i32)
        .bind(job.timeout_seconds as i64)
        .bind(job.scheduled_time)
        .bind(&job.idempotency_key)
        .bind(job.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_db_err)?;
        Ok(())
    }

    pub async fn get_job_async(&self, id: JobId) -> PlatformResult<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_err)?;
        row.map(Self::map_row).transpose()
    }

    pub async fn find_by_idempotency_key_async(
        &self,
        tenant_id: TenantId,
        key: &str,
    ) -> PlatformResult<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE tenant_id = $1 AND idempotency_key = $2")
            .bind(tenant_id)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_err)?;
        row.map(Self::map_row).transpose()
    }

    /// Atomic claim used by the real dispatch path. `FOR UPDATE SKIP LOCKED`
    /// lets concurrent gateway instances race the same table without
    /// blocking on each other, only ever granting a row to one caller, P1.
    pub async fn claim_next_async(
        &self,
        tenant_id: TenantId,
        robot: &Robot,
    ) -> PlatformResult<Option<Job>> {
        let mut tx = self.pool.begin().await.map_err(map_db_err)?;
        let required: Vec<String> = robot.capabilities.iter().cloned().collect();
        let row = sqlx::query(
            "SELECT * FROM jobs
             WHERE tenant_id = $1 AND status = 'pending'
               AND (scheduled_time IS NULL OR scheduled_time <= now())
               AND required_capabilities <@ $2::text[]
             ORDER BY priority DESC, created_at ASC
             LIMIT 1
             FOR UPDATE SKIP LOCKED",
        )
        .bind(tenant_id)
        .bind(&required)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_db_err)?;
        let Some(row) = row else {
            tx.commit().await.map_err(map_db_err)?;
            return Ok(None);
        };
        let mut job = Self::map_row(row)?;
        job.status = JobStatus::Claimed;
        job.claimed_by = Some(robot.id);
        job.claimed_at = Some(Utc::now());
        job.lock_heartbeat = Some(Utc::now());
        sqlx::query(
            "UPDATE jobs SET status = 'claimed', claimed_by = $2, claimed_at = now(), lock_heartbeat = now()
             WHERE id = $1",
        )
        .bind(job.id)
        .bind(job.claimed_by)
        .execute(&mut *tx)
        .await
        .map_err(map_db_err)?;
        tx.commit().await.map_err(map_db_err)?;
        Ok(Some(job))
    }

    pub async fn update_job_async(&self, job: &Job) -> PlatformResult<()> {
        let status = match job.status {
            JobStatus::Pending => "pending",
            JobStatus::Claimed => "claimed",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Timeout => "timeout",
        };
        sqlx::query(
            "UPDATE jobs SET status = $2, progress = $3, result = $4, error = $5,
                claimed_by = $6, claimed_at = $7, lock_heartbeat = $8, cancel_requested = $9,
                cancel_reason = $10, retry_count = $11, started_at = $12, completed_at = $13,
                current_node = $14
             WHERE id = $1",
        )
        .bind(job.id)
        .bind(status)
        .bind(job.progress as i32)
        .bind(&job.result)
        .bind(&job.error)
        .bind(job.claimed_by)
        .bind(job.claimed_at)
        .bind(job.lock_heartbeat)
        .bind(job.cancel_requested)
        .bind(&job.cancel_reason)
        .bind(job.retry_count as i32)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(&job.current_node)
        .execute(&self.pool)
        .await
        .map_err(map_db_err)?;
        Ok(())
    }

    pub async fn list_stale_leases_async(&self, cutoff: DateTime<Utc>) -> PlatformResult<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE status IN ('claimed','running') AND lock_heartbeat < $1",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_err)?;
        rows.into_iter().map(Self::map_row).collect()
    }
}
