use crate::{
    http::{self, health, metrics as metrics_route, version, ApiDoc},
    metrics::{self, MetricsLayer},
    state::AppState,
};
use axum::{
    body::to_bytes,
    http::{Request, StatusCode},
    routing::get,
    Router,
};
use rpa_core::platform::provisioning::TenantCreateRequest;
use rpa_core::platform::registry::PlatformServices;
use serde_json::json;
use tower::ServiceExt;
use utoipa::OpenApi;
use uuid::Uuid;

fn test_state() -> AppState {
    AppState::new(PlatformServices::in_memory("test-secret"))
}

/// Bootstraps a fresh tenant and returns its id alongside the admin key
/// minted for it.
fn bootstrap_tenant(state: &AppState, name: &str) -> (Uuid, String) {
    let bootstrap = state
        .platform
        .provisioning()
        .create_tenant_with_options(TenantCreateRequest::new(name))
        .unwrap();
    (
        bootstrap.tenant.id,
        bootstrap.admin_api_key.unwrap().value,
    )
}

#[tokio::test]
async fn health_ok() {
    rpa_core::init_tracing();
    let app = Router::new().route("/health", get(health));
    let res = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = to_bytes(res.into_body(), 16 * 1024).await.unwrap();
    let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(v["status"], "ok");
}

#[tokio::test]
async fn version_endpoint_has_build_info() {
    rpa_core::init_tracing();
    let app = Router::new().route("/version", get(version));
    let res = app
        .oneshot(
            Request::builder()
                .uri("/version")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = to_bytes(res.into_body(), 16 * 1024).await.unwrap();
    let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(
        v["service"].as_str().unwrap(),
        rpa_core::config().service_name.as_str()
    );
    for key in ["version", "git_sha", "build_ts"] {
        assert!(v[key].as_str().is_some(), "missing field {:?}: {}", key, v);
        assert!(
            !v[key].as_str().unwrap().is_empty(),
            "empty field {:?}: {}",
            key,
            v
        );
    }
}

#[tokio::test]
async fn metrics_exists() {
    rpa_core::init_tracing();
    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_route))
        .layer(MetricsLayer);
    let _ = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let res = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = to_bytes(res.into_body(), 64 * 1024).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(
        text.contains("gateway_http_requests_total"),
        "metrics output missing custom counter: {}",
        text
    );
    assert!(
        text.contains("gateway_build_info"),
        "missing build info gauge"
    );
}

#[tokio::test]
async fn openapi_has_security_schemes() {
    rpa_core::init_tracing();
    let mut openapi = ApiDoc::openapi();
    {
        use utoipa::openapi::security::{
            ApiKey, ApiKeyValue, Http, HttpAuthScheme, SecurityScheme,
        };
        let mut comps = openapi.components.unwrap_or_default();
        comps.add_security_scheme(
            "ApiKey",
            SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::new("x-api-key"))),
        );
        comps.add_security_scheme(
            "BearerAuth",
            SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer)),
        );
        openapi.components = Some(comps);
    }
    let app = Router::new()
        .merge(utoipa_swagger_ui::SwaggerUi::new("/docs").url("/api-docs/openapi.json", openapi));
    let res = app
        .oneshot(
            Request::builder()
                .uri("/api-docs/openapi.json")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = axum::body::to_bytes(res.into_body(), 128 * 1024)
        .await
        .unwrap();
    let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let comps = &v["components"]["securitySchemes"];
    assert!(
        comps.get("ApiKey").is_some(),
        "ApiKey scheme missing: {}",
        v
    );
    assert!(
        comps.get("BearerAuth").is_some(),
        "BearerAuth scheme missing: {}",
        v
    );
}

#[tokio::test]
async fn robot_registration_and_heartbeat_round_trip() {
    rpa_core::init_tracing();
    let state = test_state();
    let (tenant_id, key) = bootstrap_tenant(&state, "Acme Corp");
    let app = http::router().with_state(state.clone());

    let register_body = json!({
        "name": "builder-1",
        "hostname": "host-a",
        "capabilities": ["excel"],
        "max_concurrent_jobs": 2
    });
    let register_req = Request::builder()
        .method("POST")
        .uri(format!("/tenants/{}/robots", tenant_id))
        .header("content-type", "application/json")
        .header("x-api-key", &key)
        .body(axum::body::Body::from(register_body.to_string()))
        .unwrap();
    let register_res = app.clone().oneshot(register_req).await.unwrap();
    let register_status = register_res.status();
    let register_bytes = to_bytes(register_res.into_body(), 16 * 1024).await.unwrap();
    assert_eq!(
        register_status,
        StatusCode::CREATED,
        "register failed: {}",
        String::from_utf8_lossy(&register_bytes)
    );
    let provisioned: serde_json::Value = serde_json::from_slice(&register_bytes).unwrap();
    let robot_key = provisioned["api_key"].as_str().unwrap().to_string();
    let robot_id = provisioned["robot_id"].as_str().unwrap().to_string();

    let heartbeat_req = Request::builder()
        .method("POST")
        .uri(format!("/robots/{}/heartbeat", robot_id))
        .header("content-type", "application/json")
        .header("x-api-key", &robot_key)
        .body(axum::body::Body::from(json!({"metrics": {"cpu": 12.0}}).to_string()))
        .unwrap();
    let heartbeat_res = app.clone().oneshot(heartbeat_req).await.unwrap();
    assert_eq!(heartbeat_res.status(), StatusCode::OK);

    let list_req = Request::builder()
        .uri(format!("/tenants/{}/robots", tenant_id))
        .header("x-api-key", &key)
        .body(axum::body::Body::empty())
        .unwrap();
    let list_res = app.oneshot(list_req).await.unwrap();
    assert_eq!(list_res.status(), StatusCode::OK);
    let list_bytes = to_bytes(list_res.into_body(), 16 * 1024).await.unwrap();
    let robots: serde_json::Value = serde_json::from_slice(&list_bytes).unwrap();
    assert_eq!(robots.as_array().unwrap().len(), 1);
    assert_eq!(robots[0]["status"], "online");
}

#[tokio::test]
async fn job_enqueue_list_and_cancel_round_trip() {
    rpa_core::init_tracing();
    let state = test_state();
    let (tenant_id, key) = bootstrap_tenant(&state, "Acme Corp");
    let app = http::router().with_state(state.clone());

    let enqueue_body = json!({
        "workflow_id": uuid::Uuid::new_v4(),
        "workflow_name": "invoice-export",
        "priority": 5,
        "required_capabilities": ["excel"]
    });
    let enqueue_req = Request::builder()
        .method("POST")
        .uri(format!("/tenants/{}/jobs", tenant_id))
        .header("content-type", "application/json")
        .header("x-api-key", &key)
        .body(axum::body::Body::from(enqueue_body.to_string()))
        .unwrap();
    let enqueue_res = app.clone().oneshot(enqueue_req).await.unwrap();
    assert_eq!(enqueue_res.status(), StatusCode::CREATED);
    let enqueue_bytes = to_bytes(enqueue_res.into_body(), 16 * 1024).await.unwrap();
    let job: serde_json::Value = serde_json::from_slice(&enqueue_bytes).unwrap();
    let job_id = job["id"].as_str().unwrap().to_string();
    assert_eq!(job["status"], "pending");

    let list_req = Request::builder()
        .uri(format!("/tenants/{}/jobs?status=pending", tenant_id))
        .header("x-api-key", &key)
        .body(axum::body::Body::empty())
        .unwrap();
    let list_res = app.clone().oneshot(list_req).await.unwrap();
    assert_eq!(list_res.status(), StatusCode::OK);
    let list_bytes = to_bytes(list_res.into_body(), 16 * 1024).await.unwrap();
    let jobs: serde_json::Value = serde_json::from_slice(&list_bytes).unwrap();
    assert_eq!(jobs.as_array().unwrap().len(), 1);

    let cancel_req = Request::builder()
        .method("POST")
        .uri(format!("/tenants/{}/jobs/{}/cancel", tenant_id, job_id))
        .header("content-type", "application/json")
        .header("x-api-key", &key)
        .body(axum::body::Body::from(json!({"reason": "operator requested"}).to_string()))
        .unwrap();
    let cancel_res = app.oneshot(cancel_req).await.unwrap();
    assert_eq!(cancel_res.status(), StatusCode::OK);
    let cancel_bytes = to_bytes(cancel_res.into_body(), 16 * 1024).await.unwrap();
    let cancelled: serde_json::Value = serde_json::from_slice(&cancel_bytes).unwrap();
    assert_eq!(cancelled["status"], "cancelled");
}

#[tokio::test]
async fn jobs_endpoint_rejects_cross_tenant_access() {
    rpa_core::init_tracing();
    let state = test_state();
    let (tenant_id, _key) = bootstrap_tenant(&state, "Acme Corp");
    let (_, other_key) = bootstrap_tenant(&state, "Globex");
    let app = http::router().with_state(state.clone());

    let list_req = Request::builder()
        .uri(format!("/tenants/{}/jobs", tenant_id))
        .header("x-api-key", &other_key)
        .body(axum::body::Body::empty())
        .unwrap();
    let res = app.oneshot(list_req).await.unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn schedule_create_and_run_now_round_trip() {
    rpa_core::init_tracing();
    let state = test_state();
    let (tenant_id, key) = bootstrap_tenant(&state, "Acme Corp");
    let app = http::router().with_state(state.clone());

    let create_body = json!({
        "workflow_id": uuid::Uuid::new_v4(),
        "cron_expression": "0 0 * * * *",
        "timezone": "UTC",
        "priority": 0
    });
    let create_req = Request::builder()
        .method("POST")
        .uri(format!("/tenants/{}/schedules", tenant_id))
        .header("content-type", "application/json")
        .header("x-api-key", &key)
        .body(axum::body::Body::from(create_body.to_string()))
        .unwrap();
    let create_res = app.clone().oneshot(create_req).await.unwrap();
    assert_eq!(create_res.status(), StatusCode::CREATED);
    let create_bytes = to_bytes(create_res.into_body(), 16 * 1024).await.unwrap();
    let schedule: serde_json::Value = serde_json::from_slice(&create_bytes).unwrap();
    let schedule_id = schedule["id"].as_str().unwrap().to_string();
    assert!(schedule["enabled"].as_bool().unwrap());

    let run_req = Request::builder()
        .method("POST")
        .uri(format!("/schedules/{}/run-now", schedule_id))
        .header("x-api-key", &key)
        .body(axum::body::Body::empty())
        .unwrap();
    let run_res = app.oneshot(run_req).await.unwrap();
    assert_eq!(run_res.status(), StatusCode::CREATED);
}

#[test]
fn normalize_path_reduces_ids() {
    assert_eq!(metrics::normalize_path("/robots").as_ref(), "/robots");
    assert_eq!(
        metrics::normalize_path("/robots/123").as_ref(),
        "/robots/:id"
    );
    assert_eq!(
        metrics::normalize_path("/robots/550e8400-e29b-41d4-a716-446655440000").as_ref(),
        "/robots/:id"
    );
}
