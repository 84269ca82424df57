use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    Workflow,
    Robot,
    Credential,
    Job,
    Schedule,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Workflow => "workflow",
            ResourceType::Robot => "robot",
            ResourceType::Credential => "credential",
            ResourceType::Job => "job",
            ResourceType::Schedule => "schedule",
        }
    }

    pub const ALL: [ResourceType; 5] = [
        ResourceType::Workflow,
        ResourceType::Robot,
        ResourceType::Credential,
        ResourceType::Job,
        ResourceType::Schedule,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Read,
    Write,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Read => "read",
            Action::Write => "write",
        }
    }
}

/// A scope is either the blanket `admin` grant or a `resource:action` pair
/// (e.g. `job:write`, `robot:read`). `Custom` is an escape hatch for scopes
/// this registry does not yet model explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    Admin,
    Resource(ResourceType, Action),
    Custom(String),
}

impl Scope {
    pub fn as_string(&self) -> String {
        match self {
            Scope::Admin => "admin".to_string(),
            Scope::Resource(resource, action) => {
                format!("{}:{}", resource.as_str(), action.as_str())
            }
            Scope::Custom(value) => value.clone(),
        }
    }

    pub fn is_custom(&self) -> bool {
        matches!(self, Scope::Custom(_))
    }

    pub fn from_str(value: &str) -> Self {
        if value == "admin" {
            return Scope::Admin;
        }
        if let Some((resource, action)) = value.split_once(':') {
            let resource = match resource {
                "workflow" => Some(ResourceType::Workflow),
                "robot" => Some(ResourceType::Robot),
                "credential" => Some(ResourceType::Credential),
                "job" => Some(ResourceType::Job),
                "schedule" => Some(ResourceType::Schedule),
                _ => None,
            };
            let action = match action {
                "read" => Some(Action::Read),
                "write" => Some(Action::Write),
                _ => None,
            };
            if let (Some(resource), Some(action)) = (resource, action) {
                return Scope::Resource(resource, action);
            }
        }
        Scope::Custom(value.to_string())
    }

    /// Whether this scope satisfies a request for `required`. `Admin` satisfies
    /// everything; `write` on a resource implies `read` on the same resource.
    pub fn satisfies(&self, required: &Scope) -> bool {
        match (self, required) {
            (Scope::Admin, _) => true,
            (Scope::Resource(r1, Action::Write), Scope::Resource(r2, _)) if r1 == r2 => true,
            (Scope::Resource(r1, a1), Scope::Resource(r2, a2)) => r1 == r2 && a1 == a2,
            (Scope::Custom(a), Scope::Custom(b)) => a == b,
            _ => false,
        }
    }
}

impl From<&Scope> for String {
    fn from(scope: &Scope) -> Self {
        scope.as_string()
    }
}

impl From<Scope> for String {
    fn from(scope: Scope) -> Self {
        scope.as_string()
    }
}

impl From<&str> for Scope {
    fn from(value: &str) -> Self {
        Scope::from_str(value)
    }
}

impl From<String> for Scope {
    fn from(value: String) -> Self {
        Scope::from_str(&value)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub description: Option<String>,
    pub scopes: Vec<Scope>,
}

impl Role {
    pub fn grants(&self, required: &Scope) -> bool {
        self.scopes.iter().any(|s| s.satisfies(required))
    }
}

#[derive(Debug)]
pub struct ScopeRegistry {
    roles: Vec<Role>,
}

impl Default for ScopeRegistry {
    fn default() -> Self {
        let mut registry = Self { roles: Vec::new() };
        registry.seed_defaults();
        registry
    }
}

impl ScopeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn seed_defaults(&mut self) {
        use Action::*;
        use ResourceType::*;

        self.roles.push(Role {
            name: "admin".to_string(),
            description: Some("Full administrative access to every resource".to_string()),
            scopes: vec![Scope::Admin],
        });
        self.roles.push(Role {
            name: "developer".to_string(),
            description: Some(
                "Author workflows and schedules, inspect jobs and robots".to_string(),
            ),
            scopes: vec![
                Scope::Resource(Workflow, Write),
                Scope::Resource(Schedule, Write),
                Scope::Resource(Job, Write),
                Scope::Resource(Robot, Read),
                Scope::Resource(Credential, Read),
            ],
        });
        self.roles.push(Role {
            name: "operator".to_string(),
            description: Some(
                "Run the fleet day-to-day: robots, jobs, schedules, credentials".to_string(),
            ),
            scopes: vec![
                Scope::Resource(Robot, Write),
                Scope::Resource(Job, Write),
                Scope::Resource(Schedule, Write),
                Scope::Resource(Credential, Write),
                Scope::Resource(Workflow, Read),
            ],
        });
        self.roles.push(Role {
            name: "viewer".to_string(),
            description: Some("Read-only access to every resource type".to_string()),
            scopes: ResourceType::ALL
                .iter()
                .map(|r| Scope::Resource(*r, Read))
                .collect(),
        });
        self.roles.push(Role {
            name: "robot".to_string(),
            description: Some(
                "A robot's own session: report its state and work its own jobs".to_string(),
            ),
            scopes: vec![
                Scope::Resource(Robot, Write),
                Scope::Resource(Job, Write),
            ],
        });
    }

    pub fn register_role(&mut self, role: Role) {
        if let Some(existing) = self.roles.iter_mut().find(|r| r.name == role.name) {
            *existing = role;
        } else {
            self.roles.push(role);
        }
    }

    pub fn get_role(&self, name: &str) -> Option<&Role> {
        self.roles.iter().find(|r| r.name == name)
    }

    pub fn roles(&self) -> &[Role] {
        &self.roles
    }
}

static GLOBAL_SCOPE_REGISTRY: OnceLock<ScopeRegistry> = OnceLock::new();

pub fn default_scope_registry() -> &'static ScopeRegistry {
    GLOBAL_SCOPE_REGISTRY.get_or_init(ScopeRegistry::default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_satisfies_everything() {
        let registry = ScopeRegistry::default();
        let admin = registry.get_role("admin").unwrap();
        assert!(admin.grants(&Scope::Resource(ResourceType::Robot, Action::Write)));
        assert!(admin.grants(&Scope::Resource(ResourceType::Credential, Action::Read)));
    }

    #[test]
    fn write_implies_read() {
        let write = Scope::Resource(ResourceType::Job, Action::Write);
        let read = Scope::Resource(ResourceType::Job, Action::Read);
        assert!(write.satisfies(&read));
        assert!(!read.satisfies(&write));
    }

    #[test]
    fn viewer_cannot_write() {
        let registry = ScopeRegistry::default();
        let viewer = registry.get_role("viewer").unwrap();
        assert!(viewer.grants(&Scope::Resource(ResourceType::Job, Action::Read)));
        assert!(!viewer.grants(&Scope::Resource(ResourceType::Job, Action::Write)));
    }

    #[test]
    fn developer_cannot_write_credentials() {
        let registry = ScopeRegistry::default();
        let developer = registry.get_role("developer").unwrap();
        assert!(developer.grants(&Scope::Resource(ResourceType::Workflow, Action::Write)));
        assert!(!developer.grants(&Scope::Resource(ResourceType::Credential, Action::Write)));
    }

    #[test]
    fn scope_string_round_trip() {
        let scope = Scope::Resource(ResourceType::Schedule, Action::Write);
        let s = scope.as_string();
        assert_eq!(s, "schedule:write");
        assert_eq!(Scope::from_str(&s), scope);
    }
}
