use rpa_common::observability::{InMemoryLogSink, InMemoryMetricsRegistry, LogPipeline};
use rpa_core::platform::registry::PlatformServices;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration as StdDuration;
use std::time::Instant;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub platform: Arc<PlatformServices>,
    pub telemetry: TelemetryState,
    pub rate_limiter: RateLimiter,
}

impl AppState {
    pub fn new(platform: Arc<PlatformServices>) -> Self {
        Self {
            platform,
            telemetry: TelemetryState::default(),
            rate_limiter: RateLimiter::new(),
        }
    }

    pub fn with_dependencies(
        platform: Arc<PlatformServices>,
        telemetry: TelemetryState,
        rate_limiter: RateLimiter,
    ) -> Self {
        Self {
            platform,
            telemetry,
            rate_limiter,
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(PlatformServices::in_memory("dev-secret"))
    }
}

#[derive(Clone)]
pub struct TelemetryState {
    pub metrics: InMemoryMetricsRegistry,
    pub logs: LogPipeline,
    pub log_sink: Arc<InMemoryLogSink>,
}

impl Default for TelemetryState {
    fn default() -> Self {
        let metrics = InMemoryMetricsRegistry::new();
        let logs = LogPipeline::new();
        let sink = Arc::new(InMemoryLogSink::new());
        logs.register_sink(sink.clone());
        Self {
            metrics,
            logs,
            log_sink: sink,
        }
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<RwLock<HashMap<(Uuid, String), RateWindow>>>,
}

#[derive(Clone)]
struct RateWindow {
    window_start: Instant,
    count: u32,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn check_and_increment(
        &self,
        tenant_id: Uuid,
        route: &str,
        limit: u32,
        window: StdDuration,
    ) -> bool {
        let mut guard = self.inner.write().unwrap();
        let key = (tenant_id, route.to_string());
        let entry = guard.entry(key).or_insert(RateWindow {
            window_start: Instant::now(),
            count: 0,
        });
        let now = Instant::now();
        if now.duration_since(entry.window_start) >= window {
            entry.window_start = now;
            entry.count = 0;
        }
        if entry.count >= limit {
            return false;
        }
        entry.count += 1;
        true
    }
}
