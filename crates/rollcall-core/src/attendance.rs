//! Dedup/attendance gate: a per-session in-memory cooldown in front of
//! the durable attendance sink.

use crate::clock::Clock;
use crate::types::IdentityId;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Attendance session (class meeting) id in the external store.
pub type SessionId = i64;

/// Cooldown applied in memory before the sink is even consulted.
pub const LOCAL_COOLDOWN: TimeDelta = TimeDelta::seconds(30);

/// Default durable cooldown enforced by the sink.
pub const DEFAULT_COOLDOWN_MINUTES: u32 = 5;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("attendance storage failed: {0}")]
    Storage(String),
    #[error("unknown attendance session {0}")]
    UnknownSession(SessionId),
}

/// A row written by the sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceRecord {
    pub id: i64,
    pub session_id: SessionId,
    pub identity_id: IdentityId,
    pub confidence: f32,
    pub marked_at: DateTime<Utc>,
}

/// Durable attendance storage.
pub trait AttendanceSink: Send + Sync {
    /// Record attendance unless the same identity was already recorded in
    /// this session within `cooldown_minutes`; `Ok(None)` means duplicate.
    fn mark(
        &self,
        session_id: SessionId,
        identity_id: IdentityId,
        confidence: f32,
        cooldown_minutes: u32,
    ) -> Result<Option<AttendanceRecord>, SinkError>;
}

/// Why an offer did not produce a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suppression {
    /// Seen by this streaming session within [`LOCAL_COOLDOWN`]; sink not called.
    LocalCooldown,
    /// The sink reported a record inside its durable window.
    Duplicate,
    /// The sink failed; the attempt may be retried on a later frame.
    SinkFailed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Offer {
    Recorded(AttendanceRecord),
    Suppressed(Suppression),
}

impl Offer {
    pub fn is_recorded(&self) -> bool {
        matches!(self, Offer::Recorded(_))
    }
}

/// Gate owned by exactly one streaming session.
pub struct AttendanceGate {
    sink: Arc<dyn AttendanceSink>,
    clock: Arc<dyn Clock>,
    cooldown_minutes: u32,
    local_cooldown: TimeDelta,
    last_marked: HashMap<IdentityId, DateTime<Utc>>,
}

impl AttendanceGate {
    pub fn new(sink: Arc<dyn AttendanceSink>, clock: Arc<dyn Clock>, cooldown_minutes: u32) -> Self {
        Self {
            sink,
            clock,
            cooldown_minutes,
            local_cooldown: LOCAL_COOLDOWN,
            last_marked: HashMap::new(),
        }
    }

    /// Forget every in-memory cooldown. Called when a session starts.
    pub fn reset(&mut self) {
        self.last_marked.clear();
    }

    /// Offer a recognised identity for attendance. Calls the sink at most once.
    pub fn offer(&mut self, identity_id: IdentityId, confidence: f32, session_id: SessionId) -> Offer {
        let now = self.clock.now();

        if let Some(&last) = self.last_marked.get(&identity_id) {
            let since = now - last;
            if since <= self.local_cooldown {
                tracing::debug!(
                    identity_id,
                    seconds_ago = since.num_seconds(),
                    "attendance skipped: local cooldown"
                );
                return Offer::Suppressed(Suppression::LocalCooldown);
            }
        }

        match self
            .sink
            .mark(session_id, identity_id, confidence, self.cooldown_minutes)
        {
            Ok(Some(record)) => {
                self.last_marked.insert(identity_id, now);
                tracing::info!(
                    identity_id,
                    session_id,
                    confidence,
                    record_id = record.id,
                    "attendance marked"
                );
                Offer::Recorded(record)
            }
            Ok(None) => {
                tracing::debug!(identity_id, session_id, "attendance already marked recently");
                Offer::Suppressed(Suppression::Duplicate)
            }
            Err(e) => {
                tracing::warn!(identity_id, session_id, error = %e, "attendance sink failed");
                Offer::Suppressed(Suppression::SinkFailed)
            }
        }
    }
}
