use super::auth::AuthService;
use super::error::{PlatformError, PlatformResult};
use super::models::*;
use super::persistence::{RobotStore, TenantStore};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct TenantCreateRequest {
    pub name: String,
    pub idempotency_key: Option<String>,
    pub settings: Option<TenantSettings>,
}

impl TenantCreateRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            idempotency_key: None,
            settings: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TenantBootstrap {
    pub tenant: Tenant,
    pub admin_api_key: Option<ApiKey>,
}

#[derive(Debug, Clone, Default)]
pub struct RobotRegistrationOptions {
    pub capabilities: HashSet<String>,
    pub tags: HashSet<String>,
    pub max_concurrent_jobs: Option<u32>,
    pub version: Option<String>,
    pub idempotency_key: Option<String>,
}

/// Creates tenants and enrolls robots, issuing the API key each principal
/// authenticates with thereafter. Mirrors the Robot Registry's view of a
/// robot (§4.2) but owns only the one-time enrollment step; heartbeats and
/// eligibility live in the registry itself.
#[derive(Clone)]
pub struct ProvisioningService {
    tenants: Arc<dyn TenantStore>,
    robots: Arc<dyn RobotStore>,
    auth: Arc<AuthService>,
    tenant_idempotency: Arc<RwLock<HashMap<String, TenantBootstrap>>>,
    robot_idempotency: Arc<RwLock<HashMap<String, ProvisionedRobot>>>,
}

impl ProvisioningService {
    pub fn new(
        tenants: Arc<dyn TenantStore>,
        robots: Arc<dyn RobotStore>,
        auth: Arc<AuthService>,
    ) -> Self {
        Self {
            tenants,
            robots,
            auth,
            tenant_idempotency: Arc::new(RwLock::new(HashMap::new())),
            robot_idempotency: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn create_tenant(&self, name: impl Into<String>) -> PlatformResult<Tenant> {
        Ok(self
            .create_tenant_with_options(TenantCreateRequest::new(name))?
            .tenant)
    }

    pub fn create_tenant_with_options(
        &self,
        request: TenantCreateRequest,
    ) -> PlatformResult<TenantBootstrap> {
        if let Some(key) = request.idempotency_key.as_ref() {
            if let Some(existing) = self.tenant_idempotency.read().get(key).cloned() {
                return Ok(existing);
            }
        }

        let TenantCreateRequest {
            name,
            idempotency_key,
            settings,
        } = request;

        if name.trim().is_empty() {
            return Err(PlatformError::InvalidInput("tenant name required"));
        }

        let tenant = Tenant {
            id: Uuid::new_v4(),
            name,
            created_at: Utc::now(),
            settings: settings.unwrap_or_default(),
        };
        self.tenants.insert_tenant(tenant.clone())?;

        let admin_api_key = Some(self.auth.issue_api_key(
            tenant.id,
            None,
            format!("tenant:{}:admin", tenant.id),
            "admin",
        )?);

        let bundle = TenantBootstrap {
            tenant: tenant.clone(),
            admin_api_key,
        };
        if let Some(key) = idempotency_key {
            self.tenant_idempotency.write().insert(key, bundle.clone());
        }
        Ok(bundle)
    }

    pub fn register_robot(
        &self,
        tenant_id: TenantId,
        name: impl Into<String>,
        hostname: impl Into<String>,
    ) -> PlatformResult<ProvisionedRobot> {
        self.register_robot_with_options(
            tenant_id,
            name,
            hostname,
            RobotRegistrationOptions::default(),
        )
    }

    pub fn register_robot_with_options(
        &self,
        tenant_id: TenantId,
        name: impl Into<String>,
        hostname: impl Into<String>,
        options: RobotRegistrationOptions,
    ) -> PlatformResult<ProvisionedRobot> {
        if self.tenants.get_tenant(tenant_id)?.is_none() {
            return Err(PlatformError::NotFound("tenant"));
        }
        if let Some(key) = options.idempotency_key.as_ref() {
            if let Some(existing) = self.robot_idempotency.read().get(key).cloned() {
                return Ok(existing);
            }
        }
        let hostname = hostname.into();
        let name = name.into();
        if hostname.trim().is_empty() || name.trim().is_empty() {
            return Err(PlatformError::InvalidInput("robot name and hostname required"));
        }
        let RobotRegistrationOptions {
            capabilities,
            tags,
            max_concurrent_jobs,
            version,
            idempotency_key,
        } = options;

        let robot = Robot {
            id: Uuid::new_v4(),
            tenant_id,
            name: name.clone(),
            hostname,
            status: RobotStatus::Offline,
            capabilities,
            tags,
            max_concurrent_jobs: max_concurrent_jobs.unwrap_or(1),
            current_job_ids: HashSet::new(),
            last_heartbeat: None,
            version: version.unwrap_or_else(|| "unknown".to_string()),
            metrics: HashMap::new(),
            created_at: Utc::now(),
        };
        self.robots.insert_robot(robot.clone())?;

        let api_key = self.auth.issue_api_key(
            tenant_id,
            Some(robot.id),
            format!("robot:{}", robot.id),
            "robot",
        )?;

        let bundle = ProvisionedRobot {
            robot: RobotSummary {
                id: robot.id,
                tenant_id,
                name,
            },
            api_key,
        };
        if let Some(key) = idempotency_key {
            self.robot_idempotency.write().insert(key, bundle.clone());
        }
        Ok(bundle)
    }

    pub fn provision_service_account(
        &self,
        tenant_id: TenantId,
        label: impl Into<String>,
        role: impl Into<String>,
    ) -> PlatformResult<ApiKey> {
        if self.tenants.get_tenant(tenant_id)?.is_none() {
            return Err(PlatformError::NotFound("tenant"));
        }
        self.auth.issue_api_key(tenant_id, None, label, role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::persistence::InMemoryPersistence;

    fn test_service() -> ProvisioningService {
        let store = Arc::new(InMemoryPersistence::new());
        let auth = Arc::new(AuthService::new(
            store.clone(),
            store.clone(),
            b"test-secret".to_vec(),
        ));
        ProvisioningService::new(store.clone(), store, auth)
    }

    #[test]
    fn create_tenant_issues_an_admin_key() {
        let service = test_service();
        let bootstrap = service.create_tenant("Acme Corp").unwrap();
        assert_eq!(bootstrap.tenant.name, "Acme Corp");
        assert!(bootstrap.admin_api_key.is_some());
    }

    #[test]
    fn tenant_creation_is_idempotent_on_key() {
        let service = test_service();
        let request = TenantCreateRequest {
            idempotency_key: Some("bootstrap-1".to_string()),
            ..TenantCreateRequest::new("Acme Corp")
        };
        let first = service.create_tenant_with_options(request.clone()).unwrap();
        let second = service.create_tenant_with_options(request).unwrap();
        assert_eq!(first.tenant.id, second.tenant.id);
    }

    #[test]
    fn register_robot_creates_a_robot_scoped_key() {
        let service = test_service();
        let tenant = service.create_tenant("Acme Corp").unwrap().tenant;
        let provisioned = service
            .register_robot(tenant.id, "builder-1", "host-a")
            .unwrap();
        assert_eq!(provisioned.robot.tenant_id, tenant.id);
        assert_eq!(provisioned.api_key.robot_id, Some(provisioned.robot.id));
        assert_eq!(provisioned.api_key.role, "robot");
    }

    #[test]
    fn register_robot_rejects_unknown_tenant() {
        let service = test_service();
        let err = service
            .register_robot(Uuid::new_v4(), "builder-1", "host-a")
            .unwrap_err();
        assert!(matches!(err, PlatformError::NotFound("tenant")));
    }
}
