//! SQLite storage: enrolled identities, face encodings and attendance.
//!
//! One connection behind a mutex serves both the embedding store (reads)
//! and the attendance gate (writes). Timestamps are Unix milliseconds.

use chrono::{DateTime, TimeDelta, Utc};
use rollcall_core::{
    AttendanceRecord, AttendanceSink, Clock, Embedding, EmbeddingRepository, IdentityId, KnownIdentity, SessionId,
    SinkError, StoreError,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS identities (
    id            INTEGER PRIMARY KEY,
    display_name  TEXT NOT NULL,
    status        TEXT NOT NULL DEFAULT 'active',
    created_at    INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS face_encodings (
    id           INTEGER PRIMARY KEY,
    identity_id  INTEGER NOT NULL REFERENCES identities(id) ON DELETE CASCADE,
    encoding     BLOB NOT NULL,
    quality      REAL,
    image_path   TEXT,
    is_active    INTEGER NOT NULL DEFAULT 1,
    created_at   INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS attendance_sessions (
    id          INTEGER PRIMARY KEY,
    name        TEXT NOT NULL,
    started_at  INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS attendance_records (
    id           INTEGER PRIMARY KEY,
    session_id   INTEGER NOT NULL REFERENCES attendance_sessions(id) ON DELETE CASCADE,
    identity_id  INTEGER NOT NULL REFERENCES identities(id) ON DELETE CASCADE,
    confidence   REAL NOT NULL,
    marked_at    INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_attendance_recent
    ON attendance_records(session_id, identity_id, marked_at);
";

#[derive(Error, Debug)]
pub enum DbError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid stored value: {0}")]
    InvalidValue(String),
    #[error("identity {0} not found")]
    UnknownIdentity(IdentityId),
    #[error("embedding has {got} values, enrolled encodings have {expected}")]
    DimensionMismatch { expected: usize, got: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityStatus {
    Active,
    Inactive,
}

impl IdentityStatus {
    fn as_str(self) -> &'static str {
        match self {
            IdentityStatus::Active => "active",
            IdentityStatus::Inactive => "inactive",
        }
    }
}

pub struct Database {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

impl Database {
    /// Open or create the database at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self, DbError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), "database opened");
        Self::init(conn, clock)
    }

    #[cfg(test)]
    pub fn open_in_memory(clock: Arc<dyn Clock>) -> Result<Self, DbError> {
        Self::init(Connection::open_in_memory()?, clock)
    }

    fn init(conn: Connection, clock: Arc<dyn Clock>) -> Result<Self, DbError> {
        conn.pragma_update(None, "foreign_keys", 1)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
            clock,
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn now_millis(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    pub fn add_identity(&self, display_name: &str) -> Result<IdentityId, DbError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO identities (display_name, status, created_at) VALUES (?1, 'active', ?2)",
            params![display_name, self.now_millis()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn set_identity_status(&self, identity_id: IdentityId, status: IdentityStatus) -> Result<(), DbError> {
        let updated = self.conn().execute(
            "UPDATE identities SET status = ?2 WHERE id = ?1",
            params![identity_id, status.as_str()],
        )?;
        if updated == 0 {
            return Err(DbError::UnknownIdentity(identity_id));
        }
        Ok(())
    }

    pub fn identity_name(&self, identity_id: IdentityId) -> Result<Option<String>, DbError> {
        Ok(self
            .conn()
            .query_row(
                "SELECT display_name FROM identities WHERE id = ?1",
                params![identity_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Store one enrollment sample for an existing identity.
    pub fn add_face_encoding(
        &self,
        identity_id: IdentityId,
        embedding: &Embedding,
        quality: f32,
        image_path: Option<&str>,
    ) -> Result<i64, DbError> {
        if self.identity_name(identity_id)?.is_none() {
            return Err(DbError::UnknownIdentity(identity_id));
        }
        let conn = self.conn();
        let stored_bytes: Option<i64> = conn
            .query_row(
                "SELECT length(encoding) FROM face_encodings WHERE is_active = 1 ORDER BY id LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let expected = stored_bytes.map(|bytes| bytes as usize / 4);
        if embedding.values.is_empty() || expected.is_some_and(|dim| dim != embedding.dim()) {
            return Err(DbError::DimensionMismatch {
                expected: expected.unwrap_or_default(),
                got: embedding.dim(),
            });
        }
        conn.execute(
            "INSERT INTO face_encodings (identity_id, encoding, quality, image_path, is_active, created_at)
             VALUES (?1, ?2, ?3, ?4, 1, ?5)",
            params![
                identity_id,
                encode_embedding(&embedding.values),
                quality as f64,
                image_path,
                self.now_millis()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn create_session(&self, name: &str) -> Result<SessionId, DbError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO attendance_sessions (name, started_at) VALUES (?1, ?2)",
            params![name, self.now_millis()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn session_exists(&self, session_id: SessionId) -> Result<bool, DbError> {
        let found: Option<i64> = self
            .conn()
            .query_row(
                "SELECT 1 FROM attendance_sessions WHERE id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Records for one session, oldest first.
    pub fn attendance_for_session(&self, session_id: SessionId) -> Result<Vec<AttendanceRecord>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, identity_id, confidence, marked_at
             FROM attendance_records WHERE session_id = ?1 ORDER BY marked_at, id",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, session_id, identity_id, confidence, marked_at) = row?;
            records.push(AttendanceRecord {
                id,
                session_id,
                identity_id,
                confidence: confidence as f32,
                marked_at: from_millis(marked_at)?,
            });
        }
        Ok(records)
    }

    fn active_encodings(&self) -> Result<Vec<KnownIdentity>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT i.id, e.id, i.display_name, e.encoding
             FROM face_encodings e JOIN identities i ON i.id = e.identity_id
             WHERE i.status = 'active' AND e.is_active = 1
             ORDER BY e.id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Vec<u8>>(3)?,
            ))
        })?;

        let mut known = Vec::new();
        for row in rows {
            let (identity_id, encoding_id, display_name, blob) = row?;
            match decode_embedding(&blob) {
                Ok(values) => known.push(KnownIdentity {
                    identity_id,
                    display_name,
                    embedding: Embedding::new(values),
                }),
                Err(e) => tracing::warn!(encoding_id, identity_id, error = %e, "skipping unreadable face encoding"),
            }
        }
        Ok(known)
    }

    fn mark_attendance(
        &self,
        session_id: SessionId,
        identity_id: IdentityId,
        confidence: f32,
        cooldown_minutes: u32,
    ) -> Result<Option<AttendanceRecord>, DbError> {
        let now = self.clock.now();
        let window_start = (now - TimeDelta::minutes(cooldown_minutes as i64)).timestamp_millis();

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let recent: Option<i64> = tx
            .query_row(
                "SELECT id FROM attendance_records
                 WHERE session_id = ?1 AND identity_id = ?2 AND marked_at >= ?3
                 LIMIT 1",
                params![session_id, identity_id, window_start],
                |row| row.get(0),
            )
            .optional()?;
        if recent.is_some() {
            return Ok(None);
        }

        tx.execute(
            "INSERT INTO attendance_records (session_id, identity_id, confidence, marked_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![session_id, identity_id, confidence as f64, now.timestamp_millis()],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(Some(AttendanceRecord {
            id,
            session_id,
            identity_id,
            confidence,
            marked_at: from_millis(now.timestamp_millis())?,
        }))
    }
}

impl EmbeddingRepository for Database {
    fn list_active_encodings(&self) -> Result<Vec<KnownIdentity>, StoreError> {
        self.active_encodings()
            .map_err(|e| StoreError::Repository(e.to_string()))
    }
}

impl AttendanceSink for Database {
    fn mark(
        &self,
        session_id: SessionId,
        identity_id: IdentityId,
        confidence: f32,
        cooldown_minutes: u32,
    ) -> Result<Option<AttendanceRecord>, SinkError> {
        if !self
            .session_exists(session_id)
            .map_err(|e| SinkError::Storage(e.to_string()))?
        {
            return Err(SinkError::UnknownSession(session_id));
        }
        self.mark_attendance(session_id, identity_id, confidence, cooldown_minutes)
            .map_err(|e| SinkError::Storage(e.to_string()))
    }
}

fn encode_embedding(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(std::mem::size_of_val(values));
    for &value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_embedding(blob: &[u8]) -> Result<Vec<f32>, DbError> {
    if blob.is_empty() || blob.len() % 4 != 0 {
        return Err(DbError::InvalidValue(format!("embedding blob of {} bytes", blob.len())));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, DbError> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| DbError::InvalidValue(format!("timestamp {millis}")))
}
