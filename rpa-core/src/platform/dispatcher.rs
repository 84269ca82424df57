use super::error::PlatformResult;
use super::models::*;
use super::persistence::JobStore;
use super::queue::JobQueue;
use super::registry_robots::RobotRegistry;
use crate::transport::{Envelope, MessageType, SessionRegistry};
use crate::QueueConfig;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Pulls pending jobs, resolves an eligible robot with a free slot and an
/// `ACTIVE` session, claims atomically, and hands the job off via
/// Transport, §4.5.
pub struct Dispatcher {
    jobs: Arc<dyn JobStore>,
    queue: Arc<JobQueue>,
    robots: Arc<RobotRegistry>,
    sessions: Arc<SessionRegistry>,
    msg_ids: AtomicU64,
    assign_ack_timeout: std::time::Duration,
}

impl Dispatcher {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        queue: Arc<JobQueue>,
        robots: Arc<RobotRegistry>,
        sessions: Arc<SessionRegistry>,
        config: &QueueConfig,
    ) -> Self {
        Self {
            jobs,
            queue,
            robots,
            sessions,
            msg_ids: AtomicU64::new(1),
            assign_ack_timeout: std::time::Duration::from_secs(config.assign_ack_timeout_secs),
        }
    }

    /// One dispatch pass: claim-and-assign every pending job that has an
    /// eligible, free, connected robot. The Dispatcher never holds locks
    /// across the wire; the atomic claim happens before transmission, and
    /// stale-lock recovery handles a robot that vanishes afterward.
    pub async fn tick(&self, tenant_id: TenantId) -> PlatformResult<usize> {
        let mut dispatched = 0;
        loop {
            let pending = self
                .jobs
                .list_jobs(tenant_id, Some(JobStatus::Pending))?;
            if pending.is_empty() {
                break;
            }
            let mut assigned_any = false;
            for job in pending {
                if self.try_dispatch(&job).await? {
                    dispatched += 1;
                    assigned_any = true;
                }
            }
            if !assigned_any {
                break;
            }
        }
        Ok(dispatched)
    }

    async fn try_dispatch(&self, job: &Job) -> PlatformResult<bool> {
        let candidates = self.robots.eligible_robots(job)?;
        let Some(robot) = candidates
            .into_iter()
            .find(|r| r.has_free_slot() && self.sessions.is_active(r.id))
        else {
            return Ok(false);
        };

        self.robots.acquire_slot(robot.id, job.id)?;
        let claimed = match self.queue.claim(job.tenant_id, &robot)? {
            Some(claimed) if claimed.id == job.id => claimed,
            Some(other) => {
                // Another robot's slot reservation raced us onto a different
                // job; release this one's reservation, the other path owns it.
                self.robots.release_slot(robot.id, job.id)?;
                self.robots.acquire_slot(robot.id, other.id)?;
                other
            }
            None => {
                self.robots.release_slot(robot.id, job.id)?;
                return Ok(false);
            }
        };

        let msg_id = self.msg_ids.fetch_add(1, Ordering::Relaxed) as u128;
        let envelope = Envelope::new(
            msg_id,
            MessageType::Assign,
            serde_json::json!({
                "job_id": claimed.id,
                "workflow_id": claimed.workflow_id,
                "payload": claimed.payload,
                "inputs": claimed.inputs,
                "timeout_seconds": claimed.timeout_seconds,
            }),
        );
        if let Err(err) = self.sessions.send(robot.id, envelope) {
            warn!(robot_id = %robot.id, job_id = %claimed.id, error = %err, "assign send failed, reverting slot");
            self.robots.release_slot(robot.id, claimed.id)?;
            return Ok(false);
        }

        info!(job_id = %claimed.id, robot_id = %robot.id, "job assigned");
        self.await_accept(claimed, robot.id).await
    }

    /// Waits up to `assign_ack_timeout` for the robot to move the job past
    /// `Claimed`. No ack within the window releases the slot and reclaims
    /// the job's lease directly in the Queue, §4.3/§4.5 — the periodic
    /// stale-lock sweep runs on a much longer heartbeat-miss window and
    /// can't be relied on to return the job to `pending` promptly.
    async fn await_accept(&self, job: Job, robot_id: RobotId) -> PlatformResult<bool> {
        let deadline = tokio::time::Instant::now() + self.assign_ack_timeout;
        loop {
            if tokio::time::Instant::now() >= deadline {
                warn!(job_id = %job.id, robot_id = %robot_id, "assign ack timed out");
                self.robots.release_slot(robot_id, job.id)?;
                self.queue.release_unacked_claim(job.id, robot_id)?;
                return Ok(false);
            }
            match self.jobs.get_job(job.id)? {
                Some(current) if current.status != JobStatus::Claimed => return Ok(true),
                Some(_) => tokio::time::sleep(std::time::Duration::from_millis(50)).await,
                None => return Ok(true),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::auth::AuthService;
    use crate::platform::persistence::InMemoryPersistence;
    use crate::platform::provisioning::ProvisioningService;
    use std::collections::HashSet;

    fn test_dispatcher() -> (
        Dispatcher,
        Arc<InMemoryPersistence>,
        Arc<RobotRegistry>,
        Arc<SessionRegistry>,
        TenantId,
    ) {
        let store = Arc::new(InMemoryPersistence::new());
        let config = QueueConfig {
            assign_ack_timeout_secs: 0,
            ..QueueConfig::default()
        };
        let auth = Arc::new(AuthService::new(store.clone(), store.clone(), b"secret".to_vec()));
        let provisioning = ProvisioningService::new(store.clone(), store.clone(), auth);
        let tenant = provisioning.create_tenant("acme").unwrap().tenant;
        let queue = Arc::new(JobQueue::new(store.clone(), store.clone(), config.clone()));
        let robots = Arc::new(RobotRegistry::new(
            store.clone(),
            store.clone(),
            store.clone(),
            &config,
        ));
        let sessions = Arc::new(SessionRegistry::new(8));
        let dispatcher = Dispatcher::new(store.clone(), queue, robots.clone(), sessions.clone(), &config);
        (dispatcher, store, robots, sessions, tenant.id)
    }

    #[tokio::test]
    async fn tick_skips_jobs_with_no_active_session() {
        let (dispatcher, store, robots, _sessions, tenant_id) = test_dispatcher();
        robots
            .register(
                tenant_id,
                uuid::Uuid::new_v4(),
                "r1",
                "host",
                HashSet::new(),
                HashSet::new(),
                1,
                "1.0",
            )
            .unwrap();
        store
            .insert_job(Job {
                id: uuid::Uuid::new_v4(),
                tenant_id,
                workflow_id: uuid::Uuid::new_v4(),
                workflow_name: None,
                status: JobStatus::Pending,
                priority: 0,
                payload: vec![],
                inputs: Default::default(),
                result: None,
                error: None,
                error_code: None,
                progress: 0,
                current_node: None,
                required_capabilities: HashSet::new(),
                retry_count: 0,
                max_retries: 3,
                timeout_seconds: 60,
                scheduled_time: None,
                claimed_by: None,
                claimed_at: None,
                lock_heartbeat: None,
                cancel_requested: false,
                cancel_reason: None,
                idempotency_key: None,
                created_at: chrono::Utc::now(),
                started_at: None,
                completed_at: None,
                last_msg_id: None,
            })
            .unwrap();

        let dispatched = dispatcher.tick(tenant_id).await.unwrap();
        assert_eq!(dispatched, 0);
    }

    #[tokio::test]
    async fn tick_assigns_to_an_active_eligible_robot() {
        let store = Arc::new(InMemoryPersistence::new());
        let config = QueueConfig {
            assign_ack_timeout_secs: 5,
            ..QueueConfig::default()
        };
        let auth = Arc::new(AuthService::new(store.clone(), store.clone(), b"secret".to_vec()));
        let provisioning = ProvisioningService::new(store.clone(), store.clone(), auth);
        let tenant = provisioning.create_tenant("acme").unwrap().tenant;
        let tenant_id = tenant.id;
        let queue = Arc::new(JobQueue::new(store.clone(), store.clone(), config.clone()));
        let robots = Arc::new(RobotRegistry::new(
            store.clone(),
            store.clone(),
            store.clone(),
            &config,
        ));
        let sessions = Arc::new(SessionRegistry::new(8));
        let dispatcher = Dispatcher::new(
            store.clone(),
            queue.clone(),
            robots.clone(),
            sessions.clone(),
            &config,
        );
        let robot_id = uuid::Uuid::new_v4();
        robots
            .register(
                tenant_id,
                robot_id,
                "r1",
                "host",
                HashSet::new(),
                HashSet::new(),
                1,
                "1.0",
            )
            .unwrap();
        let _rx = sessions.open(robot_id, tenant_id);
        sessions.set_state(robot_id, crate::transport::SessionState::Active);
        let job_id = uuid::Uuid::new_v4();
        store
            .insert_job(Job {
                id: job_id,
                tenant_id,
                workflow_id: uuid::Uuid::new_v4(),
                workflow_name: None,
                status: JobStatus::Pending,
                priority: 0,
                payload: vec![],
                inputs: Default::default(),
                result: None,
                error: None,
                error_code: None,
                progress: 0,
                current_node: None,
                required_capabilities: HashSet::new(),
                retry_count: 0,
                max_retries: 3,
                timeout_seconds: 60,
                scheduled_time: None,
                claimed_by: None,
                claimed_at: None,
                lock_heartbeat: None,
                cancel_requested: false,
                cancel_reason: None,
                idempotency_key: None,
                created_at: chrono::Utc::now(),
                started_at: None,
                completed_at: None,
                last_msg_id: None,
            })
            .unwrap();

        let acking_queue = queue.clone();
        tokio::spawn(async move {
            loop {
                if let Ok(job) = acking_queue.get_job(job_id) {
                    if job.status == JobStatus::Claimed {
                        let _ = acking_queue.mark_running(job_id, robot_id);
                        break;
                    }
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        });

        let dispatched = dispatcher.tick(tenant_id).await.unwrap();
        assert_eq!(dispatched, 1);
        assert_eq!(queue.get_job(job_id).unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn unacked_assignment_times_out_and_returns_job_to_pending() {
        let (dispatcher, store, robots, sessions, tenant_id) = test_dispatcher();
        let robot_id = uuid::Uuid::new_v4();
        robots
            .register(
                tenant_id,
                robot_id,
                "r1",
                "host",
                HashSet::new(),
                HashSet::new(),
                1,
                "1.0",
            )
            .unwrap();
        let _rx = sessions.open(robot_id, tenant_id);
        sessions.set_state(robot_id, crate::transport::SessionState::Active);
        let job_id = uuid::Uuid::new_v4();
        store
            .insert_job(Job {
                id: job_id,
                tenant_id,
                workflow_id: uuid::Uuid::new_v4(),
                workflow_name: None,
                status: JobStatus::Pending,
                priority: 0,
                payload: vec![],
                inputs: Default::default(),
                result: None,
                error: None,
                error_code: None,
                progress: 0,
                current_node: None,
                required_capabilities: HashSet::new(),
                retry_count: 0,
                max_retries: 3,
                timeout_seconds: 60,
                scheduled_time: None,
                claimed_by: None,
                claimed_at: None,
                lock_heartbeat: None,
                cancel_requested: false,
                cancel_reason: None,
                idempotency_key: None,
                created_at: chrono::Utc::now(),
                started_at: None,
                completed_at: None,
                last_msg_id: None,
            })
            .unwrap();

        // test_dispatcher() sets assign_ack_timeout_secs: 0, so the robot
        // never acks in time and the job must come back to pending.
        let dispatched = dispatcher.tick(tenant_id).await.unwrap();
        assert_eq!(dispatched, 0);
        let job = store.get_job(job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.claimed_by.is_none());
    }
}
