use super::auth::AuthService;
use super::dispatcher::Dispatcher;
use super::persistence::{
    ApiKeyStore, DlqStore, InMemoryPersistence, JobStore, RobotLogStore, RobotStore,
    ScheduleStore, TenantStore,
};
use super::provisioning::ProvisioningService;
use super::queue::JobQueue;
use super::registry_robots::RobotRegistry;
use super::scheduler::Scheduler;
use crate::transport::SessionRegistry;
use crate::QueueConfig;
use once_cell::sync::OnceCell;
use std::sync::Arc;

static GLOBAL_PLATFORM: OnceCell<Arc<PlatformServices>> = OnceCell::new();

/// Wires the owning components together per the ownership rule in §3: the
/// Queue owns Job/DLQEntry, the Registry owns Robot, the Scheduler owns
/// Schedule. Nothing here mutates an entity it doesn't own.
#[derive(Clone)]
pub struct PlatformServices {
    storage: Arc<InMemoryPersistence>,
    auth: Arc<AuthService>,
    provisioning: Arc<ProvisioningService>,
    queue: Arc<JobQueue>,
    robots: Arc<RobotRegistry>,
    scheduler: Arc<Scheduler>,
    dispatcher: Arc<Dispatcher>,
    sessions: Arc<SessionRegistry>,
}

impl PlatformServices {
    pub fn in_memory(secret: impl Into<Vec<u8>>) -> Arc<Self> {
        Self::in_memory_with_config(secret, QueueConfig::default())
    }

    pub fn in_memory_with_config(secret: impl Into<Vec<u8>>, config: QueueConfig) -> Arc<Self> {
        let storage = Arc::new(InMemoryPersistence::new());
        let tenant_store: Arc<dyn TenantStore> = storage.clone();
        let robot_store: Arc<dyn RobotStore> = storage.clone();
        let job_store: Arc<dyn JobStore> = storage.clone();
        let dlq_store: Arc<dyn DlqStore> = storage.clone();
        let schedule_store: Arc<dyn ScheduleStore> = storage.clone();
        let api_key_store: Arc<dyn ApiKeyStore> = storage.clone();
        let _log_store: Arc<dyn RobotLogStore> = storage.clone();

        let auth = Arc::new(AuthService::new(
            tenant_store.clone(),
            api_key_store,
            secret,
        ));
        let provisioning = Arc::new(ProvisioningService::new(
            tenant_store.clone(),
            robot_store.clone(),
            auth.clone(),
        ));
        let queue = Arc::new(JobQueue::new(job_store.clone(), dlq_store, config.clone()));
        let robots = Arc::new(RobotRegistry::new(
            tenant_store,
            robot_store,
            job_store.clone(),
            &config,
        ));
        let scheduler = Arc::new(Scheduler::new(schedule_store, queue.clone()));
        let sessions = Arc::new(SessionRegistry::new(256));
        let dispatcher = Arc::new(Dispatcher::new(
            job_store,
            queue.clone(),
            robots.clone(),
            sessions.clone(),
            &config,
        ));

        Arc::new(Self {
            storage,
            auth,
            provisioning,
            queue,
            robots,
            scheduler,
            dispatcher,
            sessions,
        })
    }

    pub fn init_global() -> Arc<Self> {
        GLOBAL_PLATFORM
            .get_or_init(|| {
                let secret =
                    std::env::var("RPA_JWT_SECRET").unwrap_or_else(|_| "dev-secret".into());
                PlatformServices::in_memory(secret)
            })
            .clone()
    }

    pub fn set_global(instance: Arc<Self>) {
        let _ = GLOBAL_PLATFORM.set(instance);
    }

    pub fn global() -> Option<Arc<Self>> {
        GLOBAL_PLATFORM.get().cloned()
    }

    pub fn auth(&self) -> Arc<AuthService> {
        self.auth.clone()
    }

    pub fn provisioning(&self) -> Arc<ProvisioningService> {
        self.provisioning.clone()
    }

    pub fn queue(&self) -> Arc<JobQueue> {
        self.queue.clone()
    }

    pub fn robots(&self) -> Arc<RobotRegistry> {
        self.robots.clone()
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        self.scheduler.clone()
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    pub fn sessions(&self) -> Arc<SessionRegistry> {
        self.sessions.clone()
    }

    pub fn storage(&self) -> Arc<InMemoryPersistence> {
        self.storage.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_initializes() {
        let global = PlatformServices::init_global();
        assert!(PlatformServices::global().is_some());
        let auth = global.auth();
        let tenant = global
            .provisioning()
            .create_tenant("demo")
            .expect("tenant created");
        let list = auth.list_keys(tenant.id).unwrap();
        assert_eq!(list.len(), 1);
    }
}
