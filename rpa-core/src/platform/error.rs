use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("not found: {0}")]
    NotFound(&'static str),
    #[error("conflict: {0}")]
    Conflict(&'static str),
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("internal error: {0}")]
    Internal(&'static str),
    /// The caller's lease on a job is no longer valid: it was reclaimed by a
    /// stale-lock sweep or completed/cancelled by another path, §4.1.
    #[error("lease lost for job")]
    LeaseLost,
    /// A job update referenced an `msg_id` older than the last one applied,
    /// and was discarded per the ordering rule in §5.
    #[error("stale update discarded")]
    StaleUpdate,
    /// A robot's declared capabilities do not satisfy a job's requirements, §4.2/P9.
    #[error("capability mismatch: {0}")]
    CapabilityMismatch(&'static str),
    /// `AcquireSlot` failed because the robot is already at `max_concurrent_jobs`, §4.2/P10.
    #[error("no free concurrency slot")]
    NoFreeSlot,
    /// A transport frame or session protocol violation, §4.3/§7.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),
}

pub type PlatformResult<T> = Result<T, PlatformError>;
