//! Core foundational utilities: configuration, tracing init, shutdown signals.
use anyhow::Result;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod build_info;
pub use build_info::{build_info, BuildInfo};
pub mod platform;
pub mod transport;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub service_name: String,
    pub log_level: Option<String>,
    pub http: HttpConfig,
    pub queue: QueueConfig,
    pub transport: TransportConfig,
    #[cfg(feature = "db")]
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpConfig {
    pub bind_addr: String,
}

/// Job Queue & Lease Manager / Scheduler / Dispatcher configuration surface, §6.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    pub heartbeat_interval_secs: u64,
    pub lease_miss_factor: u32,
    pub stale_lock_sweep_interval_secs: u64,
    pub scheduler_tick_interval_secs: u64,
    pub dispatch_tick_interval_secs: u64,
    pub max_retry_attempts: u32,
    pub retry_initial_delay_secs: f64,
    pub retry_multiplier: f64,
    pub retry_max_delay_secs: f64,
    pub retry_jitter: f64,
    pub cancel_grace_period_secs: u64,
    pub assign_ack_timeout_secs: u64,
    pub drain_deadline_secs: u64,
    pub log_retention_days: u32,
    pub dlq_max_age_days: u32,
    pub max_payload_bytes: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            lease_miss_factor: 3,
            stale_lock_sweep_interval_secs: 60,
            scheduler_tick_interval_secs: 1,
            dispatch_tick_interval_secs: 5,
            max_retry_attempts: 3,
            retry_initial_delay_secs: 1.0,
            retry_multiplier: 2.0,
            retry_max_delay_secs: 300.0,
            retry_jitter: 0.1,
            cancel_grace_period_secs: 30,
            assign_ack_timeout_secs: 10,
            drain_deadline_secs: 60,
            log_retention_days: 30,
            dlq_max_age_days: 30,
            max_payload_bytes: 1024 * 1024,
        }
    }
}

/// Robot wire-protocol transport configuration, §4.3/§6.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    pub bind_addr: String,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
    pub tls_client_ca_path: Option<String>,
    pub hello_timeout_secs: u64,
    pub ping_interval_secs: u64,
    pub missed_pong_threshold: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:7443".into(),
            tls_cert_path: None,
            tls_key_path: None,
            tls_client_ca_path: None,
            hello_timeout_secs: 5,
            ping_interval_secs: 15,
            missed_pong_threshold: 2,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            service_name: "rpa-orchestration-gateway".into(),
            log_level: Some("info".into()),
            http: HttpConfig {
                bind_addr: "127.0.0.1:8080".into(),
            },
            queue: QueueConfig::default(),
            transport: TransportConfig::default(),
            #[cfg(feature = "db")]
            database: DatabaseConfig::default(),
        }
    }
}

#[cfg(feature = "db")]
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[cfg(feature = "db")]
impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost:5432/rpa_orchestration".into(),
            max_connections: 5,
        }
    }
}

static GLOBAL_CONFIG: Lazy<AppConfig> = Lazy::new(|| load_config().unwrap_or_default());

pub fn config() -> &'static AppConfig {
    &GLOBAL_CONFIG
}

fn load_config() -> Result<AppConfig> {
    let defaults = QueueConfig::default();
    let transport_defaults = TransportConfig::default();
    #[allow(unused_mut)]
    let mut builder = config::Config::builder()
        .set_default("service_name", "rpa-orchestration-gateway")?
        .set_default("http.bind_addr", "127.0.0.1:8080")?
        .set_default("queue.heartbeat_interval_secs", defaults.heartbeat_interval_secs)?
        .set_default("queue.lease_miss_factor", defaults.lease_miss_factor)?
        .set_default(
            "queue.stale_lock_sweep_interval_secs",
            defaults.stale_lock_sweep_interval_secs,
        )?
        .set_default(
            "queue.scheduler_tick_interval_secs",
            defaults.scheduler_tick_interval_secs,
        )?
        .set_default(
            "queue.dispatch_tick_interval_secs",
            defaults.dispatch_tick_interval_secs,
        )?
        .set_default("queue.max_retry_attempts", defaults.max_retry_attempts)?
        .set_default("queue.retry_initial_delay_secs", defaults.retry_initial_delay_secs)?
        .set_default("queue.retry_multiplier", defaults.retry_multiplier)?
        .set_default("queue.retry_max_delay_secs", defaults.retry_max_delay_secs)?
        .set_default("queue.retry_jitter", defaults.retry_jitter)?
        .set_default("queue.cancel_grace_period_secs", defaults.cancel_grace_period_secs)?
        .set_default("queue.assign_ack_timeout_secs", defaults.assign_ack_timeout_secs)?
        .set_default("queue.drain_deadline_secs", defaults.drain_deadline_secs)?
        .set_default("queue.log_retention_days", defaults.log_retention_days)?
        .set_default("queue.dlq_max_age_days", defaults.dlq_max_age_days)?
        .set_default("queue.max_payload_bytes", defaults.max_payload_bytes as i64)?
        .set_default("transport.bind_addr", transport_defaults.bind_addr.clone())?
        .set_default("transport.hello_timeout_secs", transport_defaults.hello_timeout_secs)?
        .set_default("transport.ping_interval_secs", transport_defaults.ping_interval_secs)?
        .set_default(
            "transport.missed_pong_threshold",
            transport_defaults.missed_pong_threshold,
        )?;
    #[cfg(feature = "db")]
    {
        builder = builder
            .set_default("database.url", "postgres://localhost:5432/rpa_orchestration")?
            .set_default("database.max_connections", 5)?;
    }
    let c = builder
        .add_source(config::Environment::with_prefix("RPA").separator("__"))
        .build()?;
    let cfg: AppConfig = c.try_deserialize()?;
    Ok(cfg)
}

pub fn init_tracing() {
    static START: Lazy<()> = Lazy::new(|| {
        let cfg = config();
        let level = cfg.log_level.clone().unwrap_or_else(|| "info".into());
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    });
    Lazy::force(&START);
}

pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::info!("shutdown signal received");
}

// Database pool singleton (sqlx) behind feature flag
#[cfg(feature = "db")]
use once_cell::sync::OnceCell;
#[cfg(feature = "db")]
static DB: OnceCell<sqlx::Pool<sqlx::Postgres>> = OnceCell::new();

#[cfg(feature = "db")]
pub async fn db() -> Result<&'static sqlx::Pool<sqlx::Postgres>> {
    if let Some(p) = DB.get() {
        return Ok(p);
    }
    let cfg = &config().database;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(cfg.max_connections)
        .connect(&cfg.url)
        .await?;
    let _ = DB.set(pool);
    Ok(DB.get().unwrap())
}

#[cfg(feature = "db")]
pub async fn run_migrations() -> Result<()> {
    let pool = db().await?;
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
