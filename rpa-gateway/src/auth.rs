use axum::http::HeaderMap;
use rpa_core::platform::auth::AuthService;
use rpa_core::platform::models::AuthContext;
use rpa_common::auth::Scope;

/// Resolves the caller's `AuthContext` from either a bearer JWT or a raw
/// API key header, delegating all cryptographic verification to
/// `AuthService` rather than re-implementing HS256 checking here.
pub fn authenticate(auth: &AuthService, headers: &HeaderMap) -> Option<AuthContext> {
    if let Some(token) = bearer_token(headers) {
        if let Ok(ctx) = auth.validate_token(token) {
            return Some(ctx);
        }
    }
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        if let Ok(ctx) = auth.authenticate_api_key(key) {
            return Some(ctx);
        }
    }
    None
}

pub fn has_scope(ctx: &AuthContext, required: &Scope) -> bool {
    ctx.scopes.iter().any(|s| s.satisfies(required))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use rpa_core::platform::persistence::InMemoryPersistence;
    use std::sync::Arc;

    fn test_auth() -> AuthService {
        let store = Arc::new(InMemoryPersistence::new());
        AuthService::new(store.clone(), store, b"secret".to_vec())
    }

    #[test]
    fn missing_headers_fails_authentication() {
        let auth = test_auth();
        let headers = HeaderMap::new();
        assert!(authenticate(&auth, &headers).is_none());
    }

    #[test]
    fn malformed_bearer_token_fails_authentication() {
        let auth = test_auth();
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer not-a-jwt"));
        assert!(authenticate(&auth, &headers).is_none());
    }
}
