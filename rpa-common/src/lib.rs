pub mod auth;
pub mod observability;

pub use auth::{default_scope_registry, Action, ResourceType, Role, Scope, ScopeRegistry};
pub use observability::{InMemoryLogSink, InMemoryMetricsRegistry, LogEvent, LogPipeline, LogSink};
