use super::envelope::{Envelope, MessageType};
use crate::platform::{PlatformError, PlatformResult, RobotId, TenantId};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::warn;

/// `CONNECTING → AUTHENTICATING → ACTIVE → (DRAINING → CLOSED | CLOSED)`, §4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticating,
    Active,
    Draining,
    Closed,
}

impl MessageType {
    /// Backpressure policy drops non-essential frames (repeated progress,
    /// pings) before essential ones (assignments, cancels) on a full
    /// per-session send queue, §4.3.
    fn is_essential(&self) -> bool {
        matches!(
            self,
            MessageType::Assign | MessageType::Cancel | MessageType::Welcome | MessageType::Error
        )
    }
}

pub struct RobotSession {
    pub robot_id: RobotId,
    pub tenant_id: TenantId,
    pub state: SessionState,
    pub connected_at: DateTime<Utc>,
    pub last_pong: DateTime<Utc>,
    outbound: mpsc::Sender<Envelope>,
}

/// The server's in-memory view of connected robots. Advisory and
/// recomputable: the database remains the source of truth for job and
/// robot state, §5.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<RobotId, RobotSession>>,
    queue_bound: usize,
}

impl SessionRegistry {
    pub fn new(queue_bound: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            queue_bound,
        }
    }

    /// Registers a new session in `Connecting` state and returns the
    /// receiver half the connection-handling task drains to the socket.
    pub fn open(&self, robot_id: RobotId, tenant_id: TenantId) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(self.queue_bound);
        let now = Utc::now();
        self.sessions.write().insert(
            robot_id,
            RobotSession {
                robot_id,
                tenant_id,
                state: SessionState::Connecting,
                connected_at: now,
                last_pong: now,
                outbound: tx,
            },
        );
        rx
    }

    pub fn set_state(&self, robot_id: RobotId, state: SessionState) {
        if let Some(session) = self.sessions.write().get_mut(&robot_id) {
            session.state = state;
        }
    }

    pub fn record_pong(&self, robot_id: RobotId) {
        if let Some(session) = self.sessions.write().get_mut(&robot_id) {
            session.last_pong = Utc::now();
        }
    }

    pub fn is_active(&self, robot_id: RobotId) -> bool {
        self.sessions
            .read()
            .get(&robot_id)
            .map(|s| s.state == SessionState::Active)
            .unwrap_or(false)
    }

    pub fn close(&self, robot_id: RobotId) {
        self.sessions.write().remove(&robot_id);
    }

    /// Sends a frame to `robot_id`'s session. Only `ACTIVE` sessions may
    /// carry `ASSIGN`/`PROGRESS`/`RESULT`; essential frames on a full queue
    /// return `ProtocolViolation` rather than silently dropping, §4.3.
    pub fn send(&self, robot_id: RobotId, envelope: Envelope) -> PlatformResult<()> {
        let sessions = self.sessions.read();
        let session = sessions
            .get(&robot_id)
            .ok_or(PlatformError::ProtocolViolation("no session for robot"))?;
        if session.state != SessionState::Active && envelope.kind != MessageType::Welcome {
            return Err(PlatformError::ProtocolViolation("session not active"));
        }
        match session.outbound.try_send(envelope.clone()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) if !envelope.kind.is_essential() => {
                warn!(robot_id = %robot_id, kind = ?envelope.kind, "dropping non-essential frame, send queue full");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(PlatformError::ProtocolViolation("send queue full"))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(PlatformError::ProtocolViolation("session closed"))
            }
        }
    }

    /// Sessions that have missed `missed_pong_threshold` consecutive pings,
    /// computed from `ping_interval`. The caller tears these down and lets
    /// stale-lock recovery reclaim any in-flight jobs, §4.3/§5.
    pub fn stale_sessions(
        &self,
        ping_interval_secs: u64,
        missed_pong_threshold: u32,
    ) -> Vec<RobotId> {
        let cutoff = Utc::now()
            - chrono::Duration::seconds((ping_interval_secs * missed_pong_threshold as u64) as i64);
        self.sessions
            .read()
            .values()
            .filter(|s| s.last_pong < cutoff)
            .map(|s| s.robot_id)
            .collect()
    }

    pub fn tenant_of(&self, robot_id: RobotId) -> Option<TenantId> {
        self.sessions.read().get(&robot_id).map(|s| s.tenant_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn send_before_active_is_rejected_unless_welcome() {
        let registry = SessionRegistry::new(4);
        let robot_id = Uuid::new_v4();
        let _rx = registry.open(robot_id, Uuid::new_v4());
        let err = registry
            .send(robot_id, Envelope::new(1, MessageType::Assign, serde_json::json!({})))
            .unwrap_err();
        assert!(matches!(err, PlatformError::ProtocolViolation(_)));
        registry
            .send(robot_id, Envelope::new(2, MessageType::Welcome, serde_json::json!({})))
            .unwrap();
    }

    #[test]
    fn send_succeeds_once_active() {
        let registry = SessionRegistry::new(4);
        let robot_id = Uuid::new_v4();
        let _rx = registry.open(robot_id, Uuid::new_v4());
        registry.set_state(robot_id, SessionState::Active);
        assert!(registry.is_active(robot_id));
        registry
            .send(robot_id, Envelope::new(1, MessageType::Assign, serde_json::json!({})))
            .unwrap();
    }

    #[test]
    fn stale_sessions_detected_after_missed_pongs() {
        let registry = SessionRegistry::new(4);
        let robot_id = Uuid::new_v4();
        let _rx = registry.open(robot_id, Uuid::new_v4());
        if let Some(session) = registry.sessions.write().get_mut(&robot_id) {
            session.last_pong = Utc::now() - chrono::Duration::seconds(120);
        }
        let stale = registry.stale_sessions(15, 2);
        assert_eq!(stale, vec![robot_id]);
    }
}
