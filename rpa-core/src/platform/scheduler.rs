use super::error::{PlatformError, PlatformResult};
use super::models::*;
use super::persistence::ScheduleStore;
use super::queue::JobQueue;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, warn};
use uuid::Uuid;

/// Materializes `Schedule`s into jobs at their due times, exactly once per
/// tick, §4.4. Owns `Schedule` mutation; produces jobs through the queue
/// rather than writing them directly.
#[derive(Clone)]
pub struct Scheduler {
    schedules: Arc<dyn ScheduleStore>,
    queue: Arc<JobQueue>,
}

/// `cron = "0.12"` only parses 6/7-field expressions (leading seconds).
/// §8's schedules are standard 5-field Unix cron, so a bare seconds field
/// of `0` is prepended before handing the expression to the crate.
fn normalize_cron(expression: &str) -> String {
    let field_count = expression.split_whitespace().count();
    if field_count == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    }
}

impl Scheduler {
    pub fn new(schedules: Arc<dyn ScheduleStore>, queue: Arc<JobQueue>) -> Self {
        Self { schedules, queue }
    }

    /// Computes the earliest fire time at or after `after` satisfying
    /// `cron_expression` in `timezone`. DST transitions are handled by
    /// `chrono-tz`'s civil calendar: non-existent local times are skipped,
    /// ambiguous ones resolve to their first occurrence.
    pub fn compute_next_run(
        cron_expression: &str,
        timezone: &str,
        after: DateTime<Utc>,
    ) -> PlatformResult<Option<DateTime<Utc>>> {
        let schedule = CronSchedule::from_str(&normalize_cron(cron_expression))
            .map_err(|_| PlatformError::InvalidInput("invalid cron expression"))?;
        let tz: Tz = timezone
            .parse()
            .map_err(|_| PlatformError::InvalidInput("invalid timezone"))?;
        let local_after = after.with_timezone(&tz);
        Ok(schedule
            .after(&local_after)
            .next()
            .map(|next| next.with_timezone(&Utc)))
    }

    pub fn create_schedule(
        &self,
        tenant_id: TenantId,
        workflow_id: WorkflowId,
        cron_expression: impl Into<String>,
        timezone: impl Into<String>,
        priority: i32,
        inputs: std::collections::HashMap<String, serde_json::Value>,
    ) -> PlatformResult<Schedule> {
        let cron_expression = cron_expression.into();
        let timezone = timezone.into();
        let now = Utc::now();
        let next_run = Self::compute_next_run(&cron_expression, &timezone, now)?;
        let schedule = Schedule {
            id: Uuid::new_v4(),
            tenant_id,
            workflow_id,
            cron_expression,
            timezone,
            enabled: true,
            priority,
            inputs,
            last_run: None,
            next_run,
            run_count: 0,
            failure_count: 0,
            created_at: now,
        };
        self.schedules.insert_schedule(schedule.clone())?;
        Ok(schedule)
    }

    pub fn set_enabled(&self, schedule_id: ScheduleId, enabled: bool) -> PlatformResult<Schedule> {
        let mut schedule = self
            .schedules
            .get_schedule(schedule_id)?
            .ok_or(PlatformError::NotFound("schedule"))?;
        schedule.enabled = enabled;
        if enabled && schedule.next_run.is_none() {
            schedule.next_run =
                Self::compute_next_run(&schedule.cron_expression, &schedule.timezone, Utc::now())?;
        }
        self.schedules.update_schedule(schedule.clone())?;
        Ok(schedule)
    }

    /// Enqueues a job immediately without disturbing the schedule's cadence.
    pub fn run_now(&self, schedule_id: ScheduleId) -> PlatformResult<Job> {
        let schedule = self
            .schedules
            .get_schedule(schedule_id)?
            .ok_or(PlatformError::NotFound("schedule"))?;
        self.enqueue_from_schedule(&schedule)
    }

    /// Claims all due schedules exactly-once (the store's row lock) and
    /// materializes each into a job, advancing `next_run` from the prior
    /// `next_run` rather than `now` to avoid drift. A schedule whose enqueue
    /// fails keeps its `next_run` and bumps `failure_count` for retry on the
    /// next tick.
    pub fn tick(&self) -> PlatformResult<Vec<Job>> {
        let now = Utc::now();
        let due = self.schedules.claim_due_schedules(now)?;
        let mut produced = Vec::with_capacity(due.len());
        for mut schedule in due {
            match self.enqueue_from_schedule(&schedule) {
                Ok(job) => {
                    let from = schedule.next_run.unwrap_or(now);
                    schedule.last_run = Some(now);
                    schedule.next_run =
                        Self::compute_next_run(&schedule.cron_expression, &schedule.timezone, from)?;
                    schedule.run_count += 1;
                    if let Err(err) = self.schedules.update_schedule(schedule) {
                        error!(error = %err, "failed to advance schedule after enqueue");
                    }
                    produced.push(job);
                }
                Err(err) => {
                    warn!(schedule_id = %schedule.id, error = %err, "schedule enqueue failed, will retry");
                    schedule.failure_count += 1;
                    if let Err(update_err) = self.schedules.update_schedule(schedule) {
                        error!(error = %update_err, "failed to record schedule failure");
                    }
                }
            }
        }
        Ok(produced)
    }

    fn enqueue_from_schedule(&self, schedule: &Schedule) -> PlatformResult<Job> {
        let request = JobRequest {
            tenant_id: schedule.tenant_id,
            workflow_id: schedule.workflow_id,
            workflow_name: None,
            priority: schedule.priority,
            payload: Vec::new(),
            inputs: schedule.inputs.clone(),
            required_capabilities: Default::default(),
            max_retries: 3,
            timeout_seconds: 3600,
            scheduled_time: None,
            idempotency_key: Some(format!("schedule:{}:{}", schedule.id, Utc::now().timestamp())),
        };
        self.queue.enqueue(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::persistence::InMemoryPersistence;
    use crate::QueueConfig;
    use std::collections::HashMap;

    fn test_scheduler() -> (Scheduler, Arc<InMemoryPersistence>) {
        let store = Arc::new(InMemoryPersistence::new());
        let queue = Arc::new(JobQueue::new(store.clone(), store.clone(), QueueConfig::default()));
        (Scheduler::new(store.clone(), queue), store)
    }

    #[test]
    fn compute_next_run_respects_cron_and_timezone() {
        let now = Utc::now();
        let next = Scheduler::compute_next_run("0 0 * * * *", "UTC", now)
            .unwrap()
            .unwrap();
        assert!(next > now);
    }

    #[test]
    fn compute_next_run_accepts_standard_five_field_cron() {
        let now = Utc::now();
        let next = Scheduler::compute_next_run("*/5 * * * *", "UTC", now)
            .unwrap()
            .unwrap();
        assert!(next > now);
        assert!(next - now <= chrono::Duration::minutes(5));
    }

    #[test]
    fn create_schedule_sets_initial_next_run() {
        let (scheduler, _store) = test_scheduler();
        let schedule = scheduler
            .create_schedule(
                Uuid::new_v4(),
                Uuid::new_v4(),
                "0 * * * * *",
                "UTC",
                0,
                HashMap::new(),
            )
            .unwrap();
        assert!(schedule.enabled);
        assert!(schedule.next_run.is_some());
    }

    #[test]
    fn tick_materializes_due_schedules_and_advances_next_run() {
        let (scheduler, store) = test_scheduler();
        let mut schedule = scheduler
            .create_schedule(
                Uuid::new_v4(),
                Uuid::new_v4(),
                "* * * * * *",
                "UTC",
                0,
                HashMap::new(),
            )
            .unwrap();
        schedule.next_run = Some(Utc::now() - chrono::Duration::seconds(5));
        store.update_schedule(schedule.clone()).unwrap();

        let jobs = scheduler.tick().unwrap();
        assert_eq!(jobs.len(), 1);
        let updated = store.get_schedule(schedule.id).unwrap().unwrap();
        assert_eq!(updated.run_count, 1);
        assert!(updated.last_run.is_some());
        assert!(updated.next_run.unwrap() > schedule.next_run.unwrap());
    }

    #[test]
    fn run_now_does_not_touch_cadence() {
        let (scheduler, store) = test_scheduler();
        let schedule = scheduler
            .create_schedule(
                Uuid::new_v4(),
                Uuid::new_v4(),
                "0 0 * * * *",
                "UTC",
                0,
                HashMap::new(),
            )
            .unwrap();
        let before = schedule.next_run;
        scheduler.run_now(schedule.id).unwrap();
        let after = store.get_schedule(schedule.id).unwrap().unwrap();
        assert_eq!(after.next_run, before);
        assert_eq!(after.run_count, 0);
    }
}
