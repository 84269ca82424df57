use super::error::{PlatformError, PlatformResult};
use super::models::*;
use super::persistence::{ApiKeyStore, TenantStore};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use rpa_common::auth::{default_scope_registry, Scope, ScopeRegistry};

type HmacSha256 = Hmac<Sha256>;

/// Issues and verifies HS256 bearer tokens and robot/tenant API keys, and
/// maps a stored `role` onto its RBAC scopes via the scope registry, §6.
#[derive(Clone)]
pub struct AuthService {
    tenants: Arc<dyn TenantStore>,
    api_keys: Arc<dyn ApiKeyStore>,
    secret: Arc<Vec<u8>>,
    scopes: &'static ScopeRegistry,
    default_ttl: Duration,
    issuer: String,
}

impl AuthService {
    pub fn new(
        tenants: Arc<dyn TenantStore>,
        api_keys: Arc<dyn ApiKeyStore>,
        secret: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            tenants,
            api_keys,
            secret: Arc::new(secret.into()),
            scopes: default_scope_registry(),
            default_ttl: Duration::minutes(60),
            issuer: "rpa-orchestration".to_string(),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = issuer.into();
        self
    }

    pub fn issue_api_key(
        &self,
        tenant_id: TenantId,
        robot_id: Option<RobotId>,
        label: impl Into<String>,
        role: impl Into<String>,
    ) -> PlatformResult<ApiKey> {
        let role = role.into();
        if self.scopes.get_role(&role).is_none() {
            return Err(PlatformError::InvalidInput("unknown role"));
        }
        self.create_api_key(tenant_id, robot_id, label.into(), role, None)
    }

    pub fn rotate_api_key(&self, id: ApiKeyId) -> PlatformResult<ApiKey> {
        let mut existing = self
            .api_keys
            .get_api_key(id)?
            .ok_or(PlatformError::NotFound("api_key"))?;
        if existing.revoked {
            return Err(PlatformError::InvalidInput("api key already revoked"));
        }
        let new_key = self.create_api_key(
            existing.tenant_id,
            existing.robot_id,
            existing.label.clone(),
            existing.role.clone(),
            existing.expires_at,
        )?;
        existing.revoked = true;
        self.api_keys.update_api_key(existing)?;
        Ok(new_key)
    }

    pub fn revoke_api_key(&self, id: ApiKeyId) -> PlatformResult<()> {
        let mut record = self
            .api_keys
            .get_api_key(id)?
            .ok_or(PlatformError::NotFound("api_key"))?;
        record.revoked = true;
        self.api_keys.update_api_key(record)
    }

    pub fn authenticate_api_key(&self, token: &str) -> PlatformResult<AuthContext> {
        let (prefix, secret) = parse_api_key(token)?;
        let mut record = self
            .api_keys
            .get_api_key_by_prefix(prefix)?
            .ok_or(PlatformError::Unauthorized)?;
        if record.revoked {
            return Err(PlatformError::Forbidden);
        }
        if let Some(expires_at) = record.expires_at {
            if expires_at < Utc::now() {
                return Err(PlatformError::Unauthorized);
            }
        }
        if record.hash != hash_secret(secret) {
            return Err(PlatformError::Unauthorized);
        }
        let issued_at = Utc::now();
        let ttl = self.resolve_access_ttl(record.tenant_id)?;
        record.last_used_at = Some(issued_at);
        self.api_keys.update_api_key(record.clone())?;
        let scopes = self
            .scopes
            .get_role(&record.role)
            .map(|role| role.scopes.clone())
            .unwrap_or_default();
        Ok(AuthContext {
            principal_id: record.robot_id.unwrap_or(record.id),
            principal_type: if record.robot_id.is_some() {
                PrincipalType::Robot
            } else {
                PrincipalType::Service
            },
            tenant_id: record.tenant_id,
            role: record.role,
            scopes,
            issued_at,
            expires_at: issued_at + ttl,
        })
    }

    pub fn issue_token_from_context(
        &self,
        mut context: AuthContext,
        ttl: Option<Duration>,
    ) -> PlatformResult<AuthToken> {
        let access_ttl = ttl.unwrap_or(self.resolve_access_ttl(context.tenant_id)?);
        context.issued_at = Utc::now();
        context.expires_at = context.issued_at + access_ttl;
        let claims = TokenClaims::from_context(&context, &self.issuer);
        let token = sign_jwt(&claims, &self.secret)?;
        Ok(AuthToken { token, context })
    }

    pub fn issue_token_for_api_key(
        &self,
        token: &str,
        ttl: Option<Duration>,
    ) -> PlatformResult<AuthToken> {
        let ctx = self.authenticate_api_key(token)?;
        self.issue_token_from_context(ctx, ttl)
    }

    pub fn validate_token(&self, token: &str) -> PlatformResult<AuthContext> {
        let claims = verify_jwt(token, &self.secret)?;
        if claims.exp < Utc::now() {
            return Err(PlatformError::Unauthorized);
        }
        if claims.iss != self.issuer {
            return Err(PlatformError::Unauthorized);
        }
        Ok(AuthContext::from(claims))
    }

    pub fn list_keys(&self, tenant_id: TenantId) -> PlatformResult<Vec<ApiKeyRecord>> {
        self.api_keys.list_api_keys(tenant_id)
    }

    fn create_api_key(
        &self,
        tenant_id: TenantId,
        robot_id: Option<RobotId>,
        label: String,
        role: String,
        expires_at: Option<chrono::DateTime<Utc>>,
    ) -> PlatformResult<ApiKey> {
        let mut secret_bytes = [0u8; 32];
        OsRng.fill_bytes(&mut secret_bytes);
        let secret_b64 = URL_SAFE_NO_PAD.encode(secret_bytes);
        let id = Uuid::new_v4();
        let prefix = id.to_string()[..8].to_string();
        let hash = hash_secret(&secret_b64);
        let now = Utc::now();
        let record = ApiKeyRecord {
            id,
            tenant_id,
            robot_id,
            label: label.clone(),
            role: role.clone(),
            prefix: prefix.clone(),
            hash,
            created_at: now,
            expires_at,
            last_used_at: None,
            revoked: false,
        };
        self.api_keys.insert_api_key(record)?;
        let value = format!("{prefix}.{secret_b64}");
        Ok(ApiKey {
            id,
            value,
            tenant_id,
            robot_id,
            label,
            role,
            created_at: now,
        })
    }

    fn resolve_access_ttl(&self, tenant_id: TenantId) -> PlatformResult<Duration> {
        if let Some(tenant) = self.tenants.get_tenant(tenant_id)? {
            if let Some(seconds) = tenant.settings.token_ttl_seconds {
                if seconds > 0 {
                    return Ok(Duration::seconds(seconds));
                }
            }
        }
        Ok(self.default_ttl)
    }
}

fn hash_secret(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    let digest = hasher.finalize();
    URL_SAFE_NO_PAD.encode(digest)
}

fn parse_api_key(token: &str) -> PlatformResult<(&str, &str)> {
    let mut parts = token.split('.');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(prefix), Some(secret), None) if prefix.len() >= 4 => Ok((prefix, secret)),
        _ => Err(PlatformError::InvalidInput("malformed api key")),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenClaims {
    sub: String,
    tenant_id: String,
    role: String,
    scopes: Vec<String>,
    prn_type: String,
    iss: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    iat: chrono::DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds")]
    exp: chrono::DateTime<Utc>,
}

impl TokenClaims {
    fn from_context(ctx: &AuthContext, issuer: &str) -> Self {
        TokenClaims {
            sub: ctx.principal_id.to_string(),
            tenant_id: ctx.tenant_id.to_string(),
            role: ctx.role.clone(),
            scopes: ctx.scopes.iter().map(|s| s.as_string()).collect(),
            prn_type: format!("{:?}", ctx.principal_type),
            iss: issuer.to_string(),
            iat: ctx.issued_at,
            exp: ctx.expires_at,
        }
    }
}

impl From<TokenClaims> for AuthContext {
    fn from(claims: TokenClaims) -> Self {
        AuthContext {
            principal_id: Uuid::parse_str(&claims.sub).unwrap_or_default(),
            principal_type: match claims.prn_type.as_str() {
                "Tenant" => PrincipalType::Tenant,
                "Robot" => PrincipalType::Robot,
                _ => PrincipalType::Service,
            },
            tenant_id: Uuid::parse_str(&claims.tenant_id).unwrap_or_default(),
            role: claims.role,
            scopes: claims.scopes.iter().map(|s| Scope::from(s.as_str())).collect(),
            issued_at: claims.iat,
            expires_at: claims.exp,
        }
    }
}

fn sign_jwt(claims: &TokenClaims, secret: &[u8]) -> PlatformResult<String> {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(
        serde_json::to_vec(claims).map_err(|_| PlatformError::Internal("serialize claims"))?,
    );
    let signing_input = format!("{header}.{payload}");
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|_| PlatformError::Internal("invalid secret"))?;
    mac.update(signing_input.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    Ok(format!("{signing_input}.{signature}"))
}

fn verify_jwt(token: &str, secret: &[u8]) -> PlatformResult<TokenClaims> {
    let mut parts = token.split('.');
    let (header, payload, signature) = match (parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(p), Some(s)) => (h, p, s),
        _ => return Err(PlatformError::Unauthorized),
    };
    if parts.next().is_some() {
        return Err(PlatformError::Unauthorized);
    }
    let header_bytes = URL_SAFE_NO_PAD
        .decode(header)
        .map_err(|_| PlatformError::Unauthorized)?;
    if !header_bytes.windows(5).any(|w| w == b"HS256") {
        return Err(PlatformError::Unauthorized);
    }
    let signing_input = format!("{header}.{payload}");
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|_| PlatformError::Internal("invalid secret"))?;
    mac.update(signing_input.as_bytes());
    let expected = mac.finalize().into_bytes();
    let provided = URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|_| PlatformError::Unauthorized)?;
    if provided.len() != expected.len()
        || !bool::from(provided.as_slice().ct_eq(expected.as_slice()))
    {
        return Err(PlatformError::Unauthorized);
    }
    let claims_bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| PlatformError::Unauthorized)?;
    let claims: TokenClaims =
        serde_json::from_slice(&claims_bytes).map_err(|_| PlatformError::Unauthorized)?;
    Ok(claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::persistence::InMemoryPersistence;

    fn service_with_tenant() -> (AuthService, Arc<InMemoryPersistence>, TenantId) {
        let storage = Arc::new(InMemoryPersistence::new());
        let tenant_store: Arc<dyn TenantStore> = storage.clone();
        let api_store: Arc<dyn ApiKeyStore> = storage.clone();
        let service = AuthService::new(tenant_store.clone(), api_store, b"secret".to_vec());
        let tenant_id = Uuid::new_v4();
        tenant_store
            .insert_tenant(Tenant {
                id: tenant_id,
                name: "Test".into(),
                created_at: Utc::now(),
                settings: TenantSettings::default(),
            })
            .unwrap();
        (service, storage, tenant_id)
    }

    #[test]
    fn api_key_issue_and_authenticate() {
        let (service, _storage, tenant_id) = service_with_tenant();
        let key = service
            .issue_api_key(tenant_id, None, "default", "viewer")
            .unwrap();
        let ctx = service
            .authenticate_api_key(&key.value)
            .expect("should authenticate");
        assert_eq!(ctx.tenant_id, tenant_id);
        assert_eq!(ctx.role, "viewer");
        assert!(!ctx.scopes.is_empty());
    }

    #[test]
    fn robot_bound_key_authenticates_as_robot_principal() {
        let (service, _storage, tenant_id) = service_with_tenant();
        let robot_id = Uuid::new_v4();
        let key = service
            .issue_api_key(tenant_id, Some(robot_id), "robot-1", "operator")
            .unwrap();
        let ctx = service.authenticate_api_key(&key.value).unwrap();
        assert_eq!(ctx.principal_type, PrincipalType::Robot);
        assert_eq!(ctx.principal_id, robot_id);
    }

    #[test]
    fn unknown_role_is_rejected() {
        let (service, _storage, tenant_id) = service_with_tenant();
        let err = service
            .issue_api_key(tenant_id, None, "default", "superuser")
            .unwrap_err();
        assert!(matches!(err, PlatformError::InvalidInput(_)));
    }

    #[test]
    fn token_round_trip() {
        let (service, _storage, tenant_id) = service_with_tenant();
        let context = AuthContext {
            principal_id: Uuid::new_v4(),
            principal_type: PrincipalType::Tenant,
            tenant_id,
            role: "admin".into(),
            scopes: vec![Scope::Admin],
            issued_at: Utc::now(),
            expires_at: Utc::now(),
        };
        let token = service
            .issue_token_from_context(context.clone(), Some(Duration::minutes(5)))
            .unwrap();
        let validated = service.validate_token(&token.token).unwrap();
        assert_eq!(validated.principal_id, context.principal_id);
        assert_eq!(validated.scopes, context.scopes);
    }

    #[test]
    fn api_key_rotation_revokes_the_original() {
        let (service, _storage, tenant_id) = service_with_tenant();
        let key = service
            .issue_api_key(tenant_id, None, "primary", "developer")
            .unwrap();
        let rotated = service.rotate_api_key(key.id).unwrap();
        assert_ne!(rotated.id, key.id);
        let original = service.list_keys(tenant_id).unwrap();
        let original_record = original.iter().find(|r| r.id == key.id).unwrap();
        assert!(original_record.revoked);
        assert!(service.authenticate_api_key(&key.value).is_err());
    }
}
