mod auth;
mod cli;
mod grpc;
mod http;
mod listener;
mod metrics;
mod state;

#[cfg(test)]
mod tests;

use crate::metrics::MetricsLayer;
use crate::state::AppState;
use clap::Parser;
use rpa_core::platform::persistence::TenantStore;
use rpa_core::platform::registry::PlatformServices;
use rpa_core::{config, init_tracing, shutdown_signal};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tonic::transport::Server;
use tower_http::cors::{Any, CorsLayer};
use utoipa::OpenApi;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli::CliArgs {
        print_config,
        command,
    } = cli::CliArgs::parse();

    if print_config {
        println!("{}", serde_json::to_string_pretty(config())?);
        return Ok(());
    }

    if let Some(cmd) = command {
        match cmd {
            cli::CliCommand::IssueKey {
                tenant_id,
                role,
                label,
            } => {
                let platform = PlatformServices::init_global();
                let key = platform
                    .provisioning()
                    .provision_service_account(tenant_id, label, role)?;
                println!("{}", key.value);
                return Ok(());
            }
            cli::CliCommand::Version { json } => {
                let info = rpa_core::build_info();
                let payload = http::VersionResponse {
                    service: config().service_name.clone(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    git_sha: info.git_sha.to_string(),
                    git_tag: info.git_tag.to_string(),
                    build_ts: info.build_timestamp.to_string(),
                };
                if json {
                    println!("{}", serde_json::to_string_pretty(&payload)?);
                } else {
                    println!(
                        "{} v{} (git: {}, tag: {}, built: {})",
                        payload.service,
                        payload.version,
                        payload.git_sha,
                        payload.git_tag,
                        payload.build_ts
                    );
                }
                return Ok(());
            }
        }
    }

    let cfg = config().clone();

    #[cfg(feature = "db")]
    {
        if let Err(e) = rpa_core::run_migrations().await {
            tracing::error!(error = %e, "migrations failed");
        } else {
            tracing::info!("database migrations applied");
        }
    }

    let mut openapi = http::ApiDoc::openapi();
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
    let swagger = utoipa_swagger_ui::SwaggerUi::new("/docs").url("/api-docs/openapi.json", openapi);

    let secret = std::env::var("RPA_JWT_SECRET").unwrap_or_else(|_| "dev-secret".into());
    let platform = rpa_core::platform::registry::PlatformServices::in_memory_with_config(
        secret,
        cfg.queue.clone(),
    );
    PlatformServices::set_global(platform.clone());
    let state = AppState::new(platform);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PATCH,
            axum::http::Method::DELETE,
        ])
        .allow_headers(Any);

    let app = http::router()
        .with_state(state.clone())
        .layer(MetricsLayer)
        .layer(cors)
        .merge(swagger);
    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();

    let addr: SocketAddr = cfg.http.bind_addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "gateway listening (http + grpc on adjacent port)");

    let grpc_service = grpc::Bootstrap::default().into_server();
    let mut grpc_addr = addr;
    grpc_addr.set_port(grpc_addr.port() + 1);
    let grpc = Server::builder().add_service(grpc_service).serve(grpc_addr);
    tracing::info!(%grpc_addr, "grpc listening");
    let background_queue = state.platform.clone();
    tokio::spawn(async move {
        if let Err(e) = grpc.await {
            tracing::error!(error = %e, "grpc server error");
        }
    });
    spawn_background_loops(background_queue);
    spawn_robot_listener(state.platform.clone(), cfg.transport.clone());

    axum::serve(listener, make_service)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// Starts the robot wire-protocol listener when TLS material is configured.
/// `TransportConfig`'s defaults leave cert/key unset so a plain HTTP-only
/// deployment doesn't fail to boot.
fn spawn_robot_listener(platform: std::sync::Arc<PlatformServices>, transport: rpa_core::TransportConfig) {
    if transport.tls_cert_path.is_none() || transport.tls_key_path.is_none() {
        tracing::warn!("transport.tls_cert_path/tls_key_path not set, robot listener disabled");
        return;
    }
    tokio::spawn(async move {
        if let Err(e) = listener::serve(platform, transport).await {
            tracing::error!(error = %e, "robot listener exited");
        }
    });
}

/// Periodic sweeps that don't belong to any single request: lease recovery,
/// offline-robot detection, schedule materialization and dispatch.
fn spawn_background_loops(platform: std::sync::Arc<PlatformServices>) {
    let cfg = config().queue.clone();

    let sweep_platform = platform.clone();
    let sweep_interval = cfg.stale_lock_sweep_interval_secs;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(sweep_interval));
        loop {
            ticker.tick().await;
            if let Err(e) = sweep_platform.queue().release_stale_locks() {
                tracing::error!(error = %e, "stale lock sweep failed");
            }
            if let Err(e) = sweep_platform.robots().sweep_offline_robots() {
                tracing::error!(error = %e, "offline robot sweep failed");
            }
        }
    });

    let scheduler_platform = platform.clone();
    let scheduler_interval = cfg.scheduler_tick_interval_secs;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(scheduler_interval));
        loop {
            ticker.tick().await;
            if let Err(e) = scheduler_platform.scheduler().tick() {
                tracing::error!(error = %e, "scheduler tick failed");
            }
        }
    });

    let dispatch_platform = platform;
    let dispatch_interval = cfg.dispatch_tick_interval_secs;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(dispatch_interval));
        loop {
            ticker.tick().await;
            for tenant in dispatch_platform.storage().list_tenants().unwrap_or_default() {
                if let Err(e) = dispatch_platform.dispatcher().tick(tenant.id).await {
                    tracing::error!(tenant_id = %tenant.id, error = %e, "dispatch tick failed");
                }
            }
        }
    });
}
