use super::error::{PlatformError, PlatformResult};
use super::models::*;
use super::persistence::{JobStore, RobotStore, TenantStore};
use crate::QueueConfig;
use chrono::{Duration, Utc};
use std::collections::HashSet;
use std::sync::Arc;

/// Tracks robot identity, health, and concurrency slots, and ranks robots
/// against a job's requirement set, §4.2.
#[derive(Clone)]
pub struct RobotRegistry {
    tenants: Arc<dyn TenantStore>,
    robots: Arc<dyn RobotStore>,
    jobs: Arc<dyn JobStore>,
    offline_after: Duration,
}

impl RobotRegistry {
    pub fn new(
        tenants: Arc<dyn TenantStore>,
        robots: Arc<dyn RobotStore>,
        jobs: Arc<dyn JobStore>,
        config: &QueueConfig,
    ) -> Self {
        let offline_after = Duration::seconds(
            (config.heartbeat_interval_secs * config.lease_miss_factor) as i64,
        );
        Self {
            tenants,
            robots,
            jobs,
            offline_after,
        }
    }

    /// Creates or re-registers a robot and marks it online. Returns the
    /// stored record with `status=Online`.
    pub fn register(
        &self,
        tenant_id: TenantId,
        robot_id: RobotId,
        name: impl Into<String>,
        hostname: impl Into<String>,
        capabilities: HashSet<String>,
        tags: HashSet<String>,
        max_concurrent_jobs: u32,
        version: impl Into<String>,
    ) -> PlatformResult<Robot> {
        let now = Utc::now();
        let robot = match self.robots.get_robot(robot_id)? {
            Some(mut existing) if existing.tenant_id == tenant_id => {
                existing.name = name.into();
                existing.hostname = hostname.into();
                existing.capabilities = capabilities;
                existing.tags = tags;
                existing.max_concurrent_jobs = max_concurrent_jobs;
                existing.version = version.into();
                existing.status = RobotStatus::Online;
                existing.last_heartbeat = Some(now);
                existing
            }
            Some(_) => return Err(PlatformError::Forbidden),
            None => Robot {
                id: robot_id,
                tenant_id,
                name: name.into(),
                hostname: hostname.into(),
                status: RobotStatus::Online,
                capabilities,
                tags,
                max_concurrent_jobs,
                current_job_ids: HashSet::new(),
                last_heartbeat: Some(now),
                version: version.into(),
                metrics: Default::default(),
                created_at: now,
            },
        };
        self.robots.update_robot(robot.clone())?;
        Ok(robot)
    }

    pub fn heartbeat(
        &self,
        robot_id: RobotId,
        metrics: std::collections::HashMap<String, f64>,
    ) -> PlatformResult<Robot> {
        let mut robot = self
            .robots
            .get_robot(robot_id)?
            .ok_or(PlatformError::NotFound("robot"))?;
        robot.last_heartbeat = Some(Utc::now());
        robot.metrics = metrics;
        if robot.status == RobotStatus::Offline {
            robot.status = RobotStatus::Online;
        }
        self.robots.update_robot(robot.clone())?;
        Ok(robot)
    }

    pub fn update_capabilities(
        &self,
        robot_id: RobotId,
        capabilities: HashSet<String>,
    ) -> PlatformResult<Robot> {
        let mut robot = self
            .robots
            .get_robot(robot_id)?
            .ok_or(PlatformError::NotFound("robot"))?;
        robot.capabilities = capabilities;
        self.robots.update_robot(robot.clone())?;
        Ok(robot)
    }

    /// Reserves a concurrency slot for `job_id`. Fails with `NoFreeSlot` if
    /// the robot is already at `max_concurrent_jobs`, §4.2.
    pub fn acquire_slot(&self, robot_id: RobotId, job_id: JobId) -> PlatformResult<Robot> {
        let mut robot = self
            .robots
            .get_robot(robot_id)?
            .ok_or(PlatformError::NotFound("robot"))?;
        if !robot.has_free_slot() {
            return Err(PlatformError::NoFreeSlot);
        }
        robot.current_job_ids.insert(job_id);
        if !robot.has_free_slot() {
            robot.status = RobotStatus::Busy;
        }
        self.robots.update_robot(robot.clone())?;
        Ok(robot)
    }

    pub fn release_slot(&self, robot_id: RobotId, job_id: JobId) -> PlatformResult<Robot> {
        let mut robot = self
            .robots
            .get_robot(robot_id)?
            .ok_or(PlatformError::NotFound("robot"))?;
        robot.current_job_ids.remove(&job_id);
        if robot.status == RobotStatus::Busy && robot.has_free_slot() {
            robot.status = RobotStatus::Online;
        }
        self.robots.update_robot(robot.clone())?;
        Ok(robot)
    }

    /// Ranks eligible robots for a job: explicit assignment first (handled
    /// by the caller, which filters `candidate_ids` beforehand), then lower
    /// utilization, then most recent heartbeat.
    pub fn eligible_robots(&self, job: &Job) -> PlatformResult<Vec<Robot>> {
        let mut candidates = self
            .robots
            .list_eligible_robots(job.tenant_id, &job.required_capabilities)?;
        candidates.sort_by(|a, b| {
            let util_a = utilization(a);
            let util_b = utilization(b);
            util_a
                .partial_cmp(&util_b)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.last_heartbeat.cmp(&a.last_heartbeat))
        });
        Ok(candidates)
    }

    /// Flips robots that have missed `heartbeat_interval × miss_factor` to
    /// offline and releases whatever jobs they were leasing, §4.2.
    pub fn sweep_offline_robots(&self) -> PlatformResult<Vec<Robot>> {
        let cutoff = Utc::now() - self.offline_after;
        let mut flipped = Vec::new();
        for tenant in self.tenants.list_tenants()? {
            for mut robot in self.robots.list_stale_heartbeats(tenant.id, cutoff)? {
                robot.status = RobotStatus::Offline;
                for job_id in robot.current_job_ids.drain().collect::<Vec<_>>() {
                    if let Some(mut job) = self.jobs.get_job(job_id)? {
                        if job.status.is_leased() {
                            job.status = JobStatus::Pending;
                            job.claimed_by = None;
                            job.claimed_at = None;
                            job.lock_heartbeat = None;
                            self.jobs.update_job(job)?;
                        }
                    }
                }
                self.robots.update_robot(robot.clone())?;
                flipped.push(robot);
            }
        }
        Ok(flipped)
    }
}

fn utilization(robot: &Robot) -> f64 {
    if robot.max_concurrent_jobs == 0 {
        return f64::MAX;
    }
    robot.current_job_ids.len() as f64 / robot.max_concurrent_jobs as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::persistence::InMemoryPersistence;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn test_registry() -> (RobotRegistry, Arc<InMemoryPersistence>) {
        let store = Arc::new(InMemoryPersistence::new());
        let config = QueueConfig::default();
        let registry = RobotRegistry::new(store.clone(), store.clone(), store.clone(), &config);
        (registry, store)
    }

    #[test]
    fn register_then_heartbeat_keeps_robot_online() {
        let (registry, _store) = test_registry();
        let tenant_id = Uuid::new_v4();
        let robot_id = Uuid::new_v4();
        let robot = registry
            .register(
                tenant_id,
                robot_id,
                "builder-1",
                "host-a",
                HashSet::from(["pdf".to_string()]),
                HashSet::new(),
                2,
                "1.0.0",
            )
            .unwrap();
        assert_eq!(robot.status, RobotStatus::Online);
        let updated = registry.heartbeat(robot_id, HashMap::new()).unwrap();
        assert_eq!(updated.status, RobotStatus::Online);
        assert!(updated.last_heartbeat.is_some());
    }

    #[test]
    fn acquire_slot_fails_once_saturated() {
        let (registry, _store) = test_registry();
        let tenant_id = Uuid::new_v4();
        let robot_id = Uuid::new_v4();
        registry
            .register(
                tenant_id,
                robot_id,
                "builder-1",
                "host-a",
                HashSet::new(),
                HashSet::new(),
                1,
                "1.0.0",
            )
            .unwrap();
        registry.acquire_slot(robot_id, Uuid::new_v4()).unwrap();
        let err = registry.acquire_slot(robot_id, Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, PlatformError::NoFreeSlot));
    }

    #[test]
    fn sweep_offline_robots_releases_their_jobs() {
        let (registry, store) = test_registry();
        let tenant_id = Uuid::new_v4();
        let robot_id = Uuid::new_v4();
        registry
            .register(
                tenant_id,
                robot_id,
                "builder-1",
                "host-a",
                HashSet::new(),
                HashSet::new(),
                2,
                "1.0.0",
            )
            .unwrap();
        let job_id = Uuid::new_v4();
        let mut robot = store.get_robot(robot_id).unwrap().unwrap();
        robot.current_job_ids.insert(job_id);
        robot.last_heartbeat = Some(Utc::now() - Duration::hours(1));
        store.update_robot(robot).unwrap();
        store
            .insert_job(Job {
                id: job_id,
                tenant_id,
                workflow_id: Uuid::new_v4(),
                workflow_name: None,
                status: JobStatus::Running,
                priority: 0,
                payload: vec![],
                inputs: Default::default(),
                result: None,
                error: None,
                error_code: None,
                progress: 10,
                current_node: None,
                required_capabilities: HashSet::new(),
                retry_count: 0,
                max_retries: 3,
                timeout_seconds: 60,
                scheduled_time: None,
                claimed_by: Some(robot_id),
                claimed_at: Some(Utc::now()),
                lock_heartbeat: Some(Utc::now() - Duration::hours(1)),
                cancel_requested: false,
                cancel_reason: None,
                idempotency_key: None,
                created_at: Utc::now(),
                started_at: Some(Utc::now()),
                completed_at: None,
                last_msg_id: None,
            })
            .unwrap();

        let flipped = registry.sweep_offline_robots().unwrap();
        assert_eq!(flipped.len(), 1);
        assert_eq!(flipped[0].status, RobotStatus::Offline);
        let job = store.get_job(job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.claimed_by.is_none());
    }
}
