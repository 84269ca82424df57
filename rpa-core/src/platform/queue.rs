//! Job Queue & Lease Manager, §4.1.
//!
//! Owns the lifecycle of a `Job` from `Enqueue` through a terminal state,
//! including the at-most-one-claim lease protocol, heartbeat-based lease
//! renewal, exponential-backoff-with-jitter retry, and DLQ handoff on
//! exhausted retries.
use super::error::{PlatformError, PlatformResult};
use super::models::*;
use super::persistence::{DlqStore, JobStore};
use crate::QueueConfig;
use chrono::{Duration, Utc};
use rand::Rng;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

pub struct JobQueue {
    jobs: Arc<dyn JobStore>,
    dlq: Arc<dyn DlqStore>,
    config: QueueConfig,
}

impl JobQueue {
    pub fn new(jobs: Arc<dyn JobStore>, dlq: Arc<dyn DlqStore>, config: QueueConfig) -> Self {
        Self { jobs, dlq, config }
    }

    /// §4.1 `Enqueue`. Deduplicates on `idempotency_key` within a tenant:
    /// a repeat call with the same key returns the existing job rather than
    /// creating a second one.
    pub fn enqueue(&self, request: JobRequest) -> PlatformResult<Job> {
        if request.payload.len() > self.config.max_payload_bytes {
            return Err(PlatformError::InvalidInput("payload exceeds max_payload_bytes"));
        }
        if let Some(key) = &request.idempotency_key {
            if let Some(existing) = self.jobs.find_by_idempotency_key(request.tenant_id, key)? {
                return Ok(existing);
            }
        }
        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            tenant_id: request.tenant_id,
            workflow_id: request.workflow_id,
            workflow_name: request.workflow_name,
            status: JobStatus::Pending,
            priority: request.priority,
            payload: request.payload,
            inputs: request.inputs,
            result: None,
            error: None,
            error_code: None,
            progress: 0,
            current_node: None,
            required_capabilities: request.required_capabilities,
            retry_count: 0,
            max_retries: request.max_retries,
            timeout_seconds: request.timeout_seconds,
            scheduled_time: request.scheduled_time,
            claimed_by: None,
            claimed_at: None,
            lock_heartbeat: None,
            cancel_requested: false,
            cancel_reason: None,
            idempotency_key: request.idempotency_key,
            created_at: now,
            started_at: None,
            completed_at: None,
            last_msg_id: None,
        };
        self.jobs.insert_job(job.clone())?;
        self.record_event(job.id, None, JobHistoryEvent::Created, Value::Null)?;
        Ok(job)
    }

    /// §4.1 `Claim`, P1. Atomic under the store; the highest-priority
    /// eligible pending job for `robot` is claimed or `None` is returned.
    pub fn claim(&self, tenant_id: TenantId, robot: &Robot) -> PlatformResult<Option<Job>> {
        let claimed = self.jobs.claim_next(tenant_id, robot)?;
        if let Some(job) = &claimed {
            self.record_event(
                job.id,
                Some(robot.id),
                JobHistoryEvent::Claimed,
                Value::Null,
            )?;
            tracing::info!(job_id = %job.id, robot_id = %robot.id, "job.claimed");
        }
        Ok(claimed)
    }

    /// §4.1 `Heartbeat`. Extends `lock_heartbeat` on a job held by `robot_id`;
    /// fails with `LeaseLost` if the lease was already reclaimed or the job
    /// is no longer leased, P4.
    pub fn heartbeat(&self, job_id: JobId, robot_id: RobotId) -> PlatformResult<Job> {
        let mut job = self.load_leased(job_id, robot_id)?;
        job.lock_heartbeat = Some(Utc::now());
        self.jobs.update_job(job.clone())?;
        Ok(job)
    }

    /// §4.1 `MarkRunning`. Moves a claimed job into `Running` once the robot
    /// has accepted the assignment over the session protocol.
    pub fn mark_running(&self, job_id: JobId, robot_id: RobotId) -> PlatformResult<Job> {
        let mut job = self.load_leased(job_id, robot_id)?;
        job.status = JobStatus::Running;
        job.started_at.get_or_insert(Utc::now());
        job.lock_heartbeat = Some(Utc::now());
        self.jobs.update_job(job.clone())?;
        self.record_event(job.id, Some(robot_id), JobHistoryEvent::Started, Value::Null)?;
        Ok(job)
    }

    /// §4.1 `UpdateProgress`. Discards updates carrying an `msg_id` older
    /// than the last one already applied, §5/P11.
    pub fn update_progress(
        &self,
        job_id: JobId,
        robot_id: RobotId,
        msg_id: u128,
        progress: u8,
        current_node: Option<String>,
    ) -> PlatformResult<Job> {
        let mut job = self.load_leased(job_id, robot_id)?;
        if let Some(last) = job.last_msg_id {
            if msg_id <= last {
                return Err(PlatformError::StaleUpdate);
            }
        }
        job.last_msg_id = Some(msg_id);
        job.progress = progress.min(100);
        if current_node.is_some() {
            job.current_node = current_node;
        }
        job.lock_heartbeat = Some(Utc::now());
        self.jobs.update_job(job.clone())?;
        self.record_event(
            job.id,
            Some(robot_id),
            JobHistoryEvent::ProgressUpdated,
            Value::Null,
        )?;
        Ok(job)
    }

    /// §4.1 `Complete`. Idempotent per `msg_id`: a repeated `RESULT` with an
    /// already-applied or older `msg_id` is a no-op that returns the
    /// existing terminal job rather than erroring, P11.
    pub fn complete(
        &self,
        job_id: JobId,
        robot_id: RobotId,
        msg_id: u128,
        result: Option<Value>,
    ) -> PlatformResult<Job> {
        let mut job = self
            .jobs
            .get_job(job_id)?
            .ok_or(PlatformError::NotFound("job"))?;
        if job.status.is_terminal() {
            if job.last_msg_id.map(|last| msg_id <= last).unwrap_or(false) {
                return Ok(job);
            }
            return Err(PlatformError::StaleUpdate);
        }
        if job.claimed_by != Some(robot_id) {
            return Err(PlatformError::LeaseLost);
        }
        job.status = JobStatus::Completed;
        job.result = result;
        job.progress = 100;
        job.last_msg_id = Some(msg_id);
        job.completed_at = Some(Utc::now());
        self.jobs.update_job(job.clone())?;
        self.record_event(job.id, Some(robot_id), JobHistoryEvent::Completed, Value::Null)?;
        Ok(job)
    }

    /// §4.1 `Fail`. Retries with exponential-backoff-with-jitter while
    /// `retry_count < max_retries`; otherwise moves the job to `Failed` and
    /// writes a DLQ entry, P2/P3.
    pub fn fail(
        &self,
        job_id: JobId,
        robot_id: RobotId,
        error: impl Into<String>,
        error_code: Option<JobErrorCode>,
    ) -> PlatformResult<Job> {
        let mut job = self
            .jobs
            .get_job(job_id)?
            .ok_or(PlatformError::NotFound("job"))?;
        if job.status.is_terminal() {
            return Ok(job);
        }
        if job.claimed_by != Some(robot_id) {
            return Err(PlatformError::LeaseLost);
        }
        let error_message = error.into();
        job.retry_count += 1;
        job.error = Some(error_message.clone());
        job.error_code = error_code;
        if job.retry_count <= job.max_retries {
            job.status = JobStatus::Pending;
            job.claimed_by = None;
            job.claimed_at = None;
            job.lock_heartbeat = None;
            job.started_at = None;
            job.scheduled_time = Some(Utc::now() + self.backoff_delay(job.retry_count));
            self.jobs.update_job(job.clone())?;
            self.record_event(
                job.id,
                Some(robot_id),
                JobHistoryEvent::FailedRetryable,
                Value::Null,
            )?;
        } else {
            job.status = JobStatus::Failed;
            job.completed_at = Some(Utc::now());
            self.jobs.update_job(job.clone())?;
            self.record_event(
                job.id,
                Some(robot_id),
                JobHistoryEvent::FailedTerminal,
                Value::Null,
            )?;
            self.dlq.insert_dlq(DlqEntry {
                id: Uuid::new_v4(),
                tenant_id: job.tenant_id,
                job_id: job.id,
                workflow_id: job.workflow_id,
                error_message,
                error_stack: None,
                inputs: job.inputs.clone(),
                retry_count: job.retry_count,
                failed_at: Utc::now(),
            })?;
            tracing::warn!(job_id = %job.id, "job.moved_to_dlq");
        }
        Ok(job)
    }

    /// §4.1 `RequestCancel`. Marks the job for cancellation; the robot is
    /// expected to honor it within `cancel_grace_period`, after which
    /// `release_stale_locks` or the dispatcher force-terminates it.
    pub fn request_cancel(
        &self,
        job_id: JobId,
        reason: Option<String>,
    ) -> PlatformResult<Job> {
        let mut job = self
            .jobs
            .get_job(job_id)?
            .ok_or(PlatformError::NotFound("job"))?;
        if job.status.is_terminal() {
            return Err(PlatformError::Conflict("job already terminal"));
        }
        job.cancel_requested = true;
        job.cancel_reason = reason;
        if job.status == JobStatus::Pending {
            job.status = JobStatus::Cancelled;
            job.completed_at = Some(Utc::now());
        }
        self.jobs.update_job(job.clone())?;
        self.record_event(job.id, None, JobHistoryEvent::CancelRequested, Value::Null)?;
        if job.status == JobStatus::Cancelled {
            self.record_event(job.id, None, JobHistoryEvent::Cancelled, Value::Null)?;
        }
        Ok(job)
    }

    /// A robot acknowledges a pending cancellation, finalizing the job.
    pub fn confirm_cancelled(&self, job_id: JobId, robot_id: RobotId) -> PlatformResult<Job> {
        let mut job = self.load_leased(job_id, robot_id)?;
        job.status = JobStatus::Cancelled;
        job.completed_at = Some(Utc::now());
        self.jobs.update_job(job.clone())?;
        self.record_event(job.id, Some(robot_id), JobHistoryEvent::Cancelled, Value::Null)?;
        Ok(job)
    }

    /// §4.1 `ReleaseStaleLocks`, P4. Jobs whose `lock_heartbeat` is older
    /// than `heartbeat_interval * lease_miss_factor` are returned to
    /// `Pending` (or `Failed`/DLQ if past `max_retries`) so another robot
    /// can claim them.
    pub fn release_stale_locks(&self) -> PlatformResult<Vec<Job>> {
        let miss_window = Duration::seconds(
            (self.config.heartbeat_interval_secs * self.config.lease_miss_factor as u64) as i64,
        );
        let cutoff = Utc::now() - miss_window;
        let stale = self.jobs.list_stale_leases(cutoff)?;
        let mut reclaimed = Vec::with_capacity(stale.len());
        for mut job in stale {
            let robot_id = job.claimed_by;
            job.claimed_by = None;
            job.claimed_at = None;
            job.lock_heartbeat = None;
            job.started_at = None;
            if job.cancel_requested {
                job.status = JobStatus::Cancelled;
                job.completed_at = Some(Utc::now());
            } else {
                job.status = JobStatus::Pending;
            }
            self.jobs.update_job(job.clone())?;
            self.record_event(
                job.id,
                robot_id,
                JobHistoryEvent::StaleLockReclaimed,
                Value::Null,
            )?;
            tracing::warn!(job_id = %job.id, "job.stale_lock_reclaimed");
            reclaimed.push(job);
        }
        Ok(reclaimed)
    }

    /// §4.3/§4.5. Reclaims a single job's lease after an assign-ack timeout,
    /// independent of `release_stale_locks`'s periodic sweep window — the
    /// Dispatcher calls this directly instead of waiting out the much longer
    /// heartbeat-miss window. No-op if the robot already acked or another
    /// claim has since taken the job.
    pub fn release_unacked_claim(&self, job_id: JobId, robot_id: RobotId) -> PlatformResult<()> {
        let Some(mut job) = self.jobs.get_job(job_id)? else {
            return Ok(());
        };
        if job.status != JobStatus::Claimed || job.claimed_by != Some(robot_id) {
            return Ok(());
        }
        job.claimed_by = None;
        job.claimed_at = None;
        job.lock_heartbeat = None;
        if job.cancel_requested {
            job.status = JobStatus::Cancelled;
            job.completed_at = Some(Utc::now());
        } else {
            job.status = JobStatus::Pending;
        }
        self.jobs.update_job(job.clone())?;
        self.record_event(
            job.id,
            Some(robot_id),
            JobHistoryEvent::StaleLockReclaimed,
            Value::Null,
        )?;
        tracing::warn!(job_id = %job.id, robot_id = %robot_id, "job.assign_ack_timeout_reclaimed");
        Ok(())
    }

    /// §4.1 `DLQRetry`. Re-enqueues a dead-lettered job as a fresh job with
    /// `retry_count` reset and removes the DLQ entry.
    pub fn dlq_retry(&self, dlq_entry_id: DlqEntryId) -> PlatformResult<Job> {
        let entry = self
            .dlq
            .get_dlq(dlq_entry_id)?
            .ok_or(PlatformError::NotFound("dlq_entry"))?;
        let original = self
            .jobs
            .get_job(entry.job_id)?
            .ok_or(PlatformError::NotFound("job"))?;
        let retried = self.enqueue(JobRequest {
            tenant_id: original.tenant_id,
            workflow_id: original.workflow_id,
            workflow_name: original.workflow_name.clone(),
            priority: original.priority,
            payload: original.payload.clone(),
            inputs: original.inputs.clone(),
            required_capabilities: original.required_capabilities.clone(),
            max_retries: original.max_retries,
            timeout_seconds: original.timeout_seconds,
            scheduled_time: None,
            idempotency_key: None,
        })?;
        self.dlq.delete_dlq(dlq_entry_id)?;
        self.record_event(
            entry.job_id,
            None,
            JobHistoryEvent::DlqRetried {
                new_job_id: retried.id,
            },
            Value::Null,
        )?;
        Ok(retried)
    }

    pub fn get_job(&self, job_id: JobId) -> PlatformResult<Job> {
        self.jobs
            .get_job(job_id)?
            .ok_or(PlatformError::NotFound("job"))
    }

    pub fn list_jobs(&self, tenant_id: TenantId, status: Option<JobStatus>) -> PlatformResult<Vec<Job>> {
        self.jobs.list_jobs(tenant_id, status)
    }

    pub fn list_dlq(&self, tenant_id: TenantId) -> PlatformResult<Vec<DlqEntry>> {
        self.dlq.list_dlq(tenant_id)
    }

    /// Discards a DLQ entry without requeuing it, §6 `purge_dlq_entry`.
    pub fn purge_dlq(&self, dlq_entry_id: DlqEntryId) -> PlatformResult<()> {
        self.dlq
            .get_dlq(dlq_entry_id)?
            .ok_or(PlatformError::NotFound("dlq_entry"))?;
        self.dlq.delete_dlq(dlq_entry_id)
    }

    /// `delay = min(max_delay, initial * multiplier^retry_count) * (1 + U[0, jitter])`
    fn backoff_delay(&self, retry_count: u32) -> Duration {
        let base = self.config.retry_initial_delay_secs
            * self.config.retry_multiplier.powi(retry_count as i32 - 1);
        let capped = base.min(self.config.retry_max_delay_secs);
        let jitter: f64 = rand::thread_rng().gen_range(0.0..=self.config.retry_jitter);
        let delayed = capped * (1.0 + jitter);
        Duration::milliseconds((delayed * 1000.0) as i64)
    }

    fn load_leased(&self, job_id: JobId, robot_id: RobotId) -> PlatformResult<Job> {
        let job = self
            .jobs
            .get_job(job_id)?
            .ok_or(PlatformError::NotFound("job"))?;
        if !job.status.is_leased() {
            return Err(PlatformError::LeaseLost);
        }
        if job.claimed_by != Some(robot_id) {
            return Err(PlatformError::LeaseLost);
        }
        Ok(job)
    }

    fn record_event(
        &self,
        job_id: JobId,
        robot_id: Option<RobotId>,
        event_type: JobHistoryEvent,
        event_data: Value,
    ) -> PlatformResult<()> {
        self.jobs.append_history(JobHistoryEntry {
            id: Uuid::new_v4(),
            job_id,
            robot_id,
            event_type,
            event_data,
            created_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::persistence::InMemoryPersistence;
    use std::collections::HashSet;

    fn test_queue() -> (JobQueue, Arc<InMemoryPersistence>) {
        let store = Arc::new(InMemoryPersistence::new());
        let queue = JobQueue::new(store.clone(), store.clone(), QueueConfig::default());
        (queue, store)
    }

    fn test_robot(tenant_id: TenantId) -> Robot {
        Robot {
            id: Uuid::new_v4(),
            tenant_id,
            name: "robot-1".into(),
            hostname: "host-1".into(),
            status: RobotStatus::Online,
            capabilities: HashSet::from(["excel".to_string()]),
            tags: HashSet::new(),
            max_concurrent_jobs: 1,
            current_job_ids: HashSet::new(),
            last_heartbeat: Some(Utc::now()),
            version: "1.0.0".into(),
            metrics: Default::default(),
            created_at: Utc::now(),
        }
    }

    fn test_request(tenant_id: TenantId) -> JobRequest {
        JobRequest {
            tenant_id,
            workflow_id: Uuid::new_v4(),
            workflow_name: Some("invoice-export".into()),
            priority: 0,
            payload: vec![1, 2, 3],
            inputs: Default::default(),
            required_capabilities: HashSet::from(["excel".to_string()]),
            max_retries: 2,
            timeout_seconds: 60,
            scheduled_time: None,
            idempotency_key: None,
        }
    }

    #[test]
    fn enqueue_and_claim_round_trip() {
        let (queue, _store) = test_queue();
        let tenant_id = Uuid::new_v4();
        let robot = test_robot(tenant_id);
        let job = queue.enqueue(test_request(tenant_id)).unwrap();
        assert_eq!(job.status, JobStatus::Pending);

        let claimed = queue.claim(tenant_id, &robot).unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.status, JobStatus::Claimed);
        assert_eq!(claimed.claimed_by, Some(robot.id));

        assert!(queue.claim(tenant_id, &robot).unwrap().is_none());
    }

    #[test]
    fn enqueue_is_idempotent_on_key() {
        let (queue, _store) = test_queue();
        let tenant_id = Uuid::new_v4();
        let mut request = test_request(tenant_id);
        request.idempotency_key = Some("invoice-42".into());
        let first = queue.enqueue(request.clone()).unwrap();
        let second = queue.enqueue(request).unwrap();
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn claim_skips_robots_missing_capabilities() {
        let (queue, _store) = test_queue();
        let tenant_id = Uuid::new_v4();
        let mut robot = test_robot(tenant_id);
        robot.capabilities = HashSet::new();
        queue.enqueue(test_request(tenant_id)).unwrap();
        assert!(queue.claim(tenant_id, &robot).unwrap().is_none());
    }

    #[test]
    fn progress_update_rejects_stale_msg_id() {
        let (queue, _store) = test_queue();
        let tenant_id = Uuid::new_v4();
        let robot = test_robot(tenant_id);
        let job = queue.enqueue(test_request(tenant_id)).unwrap();
        queue.claim(tenant_id, &robot).unwrap();
        queue.update_progress(job.id, robot.id, 10, 50, None).unwrap();
        let err = queue
            .update_progress(job.id, robot.id, 10, 60, None)
            .unwrap_err();
        assert!(matches!(err, PlatformError::StaleUpdate));
    }

    #[test]
    fn fail_retries_until_max_then_moves_to_dlq() {
        let (queue, store) = test_queue();
        let tenant_id = Uuid::new_v4();
        let robot = test_robot(tenant_id);
        let job = queue.enqueue(test_request(tenant_id)).unwrap();

        let claimed = queue.claim(tenant_id, &robot).unwrap().unwrap();
        let failed_once = queue.fail(claimed.id, robot.id, "boom", None).unwrap();
        assert_eq!(failed_once.status, JobStatus::Pending);
        assert_eq!(failed_once.retry_count, 1);

        // force it claimable again regardless of backoff for the test
        let mut reclaim = failed_once.clone();
        reclaim.scheduled_time = None;
        store.update_job(reclaim).unwrap();

        let reclaimed = queue.claim(tenant_id, &robot).unwrap().unwrap();
        queue.fail(reclaimed.id, robot.id, "boom again", None).unwrap();
        let mut reclaim2 = queue.get_job(job.id).unwrap();
        reclaim2.scheduled_time = None;
        store.update_job(reclaim2).unwrap();

        let reclaimed2 = queue.claim(tenant_id, &robot).unwrap().unwrap();
        let terminal = queue
            .fail(reclaimed2.id, robot.id, "boom final", None)
            .unwrap();
        assert_eq!(terminal.status, JobStatus::Failed);

        let dlq = queue.list_dlq(tenant_id).unwrap();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].job_id, job.id);
    }

    #[test]
    fn dlq_retry_requeues_a_fresh_job() {
        let (queue, _store) = test_queue();
        let tenant_id = Uuid::new_v4();
        let robot = test_robot(tenant_id);
        let mut request = test_request(tenant_id);
        request.max_retries = 0;
        let job = queue.enqueue(request).unwrap();
        let claimed = queue.claim(tenant_id, &robot).unwrap().unwrap();
        queue.fail(claimed.id, robot.id, "fatal", None).unwrap();

        let dlq = queue.list_dlq(tenant_id).unwrap();
        assert_eq!(dlq.len(), 1);

        let retried = queue.dlq_retry(dlq[0].id).unwrap();
        assert_ne!(retried.id, job.id);
        assert_eq!(retried.status, JobStatus::Pending);
        assert!(queue.list_dlq(tenant_id).unwrap().is_empty());
    }

    #[test]
    fn purge_dlq_drops_the_entry_without_requeuing() {
        let (queue, _store) = test_queue();
        let tenant_id = Uuid::new_v4();
        let robot = test_robot(tenant_id);
        let mut request = test_request(tenant_id);
        request.max_retries = 0;
        queue.enqueue(request).unwrap();
        let claimed = queue.claim(tenant_id, &robot).unwrap().unwrap();
        queue.fail(claimed.id, robot.id, "fatal", None).unwrap();

        let dlq = queue.list_dlq(tenant_id).unwrap();
        assert_eq!(dlq.len(), 1);
        queue.purge_dlq(dlq[0].id).unwrap();
        assert!(queue.list_dlq(tenant_id).unwrap().is_empty());
    }

    #[test]
    fn release_stale_locks_reclaims_expired_leases() {
        let (queue, store) = test_queue();
        let tenant_id = Uuid::new_v4();
        let robot = test_robot(tenant_id);
        let job = queue.enqueue(test_request(tenant_id)).unwrap();
        let mut claimed = queue.claim(tenant_id, &robot).unwrap().unwrap();
        claimed.lock_heartbeat = Some(Utc::now() - Duration::hours(1));
        store.update_job(claimed).unwrap();

        let reclaimed = queue.release_stale_locks().unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, job.id);
        assert_eq!(reclaimed[0].status, JobStatus::Pending);
    }

    #[test]
    fn request_cancel_on_pending_job_is_immediate() {
        let (queue, _store) = test_queue();
        let tenant_id = Uuid::new_v4();
        let job = queue.enqueue(test_request(tenant_id)).unwrap();
        let cancelled = queue.request_cancel(job.id, Some("operator request".into())).unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
    }

    #[test]
    fn request_cancel_on_running_job_waits_for_ack() {
        let (queue, _store) = test_queue();
        let tenant_id = Uuid::new_v4();
        let robot = test_robot(tenant_id);
        let job = queue.enqueue(test_request(tenant_id)).unwrap();
        queue.claim(tenant_id, &robot).unwrap();
        queue.mark_running(job.id, robot.id).unwrap();

        let pending_cancel = queue.request_cancel(job.id, None).unwrap();
        assert_eq!(pending_cancel.status, JobStatus::Running);
        assert!(pending_cancel.cancel_requested);

        let confirmed = queue.confirm_cancelled(job.id, robot.id).unwrap();
        assert_eq!(confirmed.status, JobStatus::Cancelled);
    }
}
