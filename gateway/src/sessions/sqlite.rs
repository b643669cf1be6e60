use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{Clock, RevokeOutcome, Session, SessionError, SessionStore, SystemClock};

/// SQLite-backed session store. Timestamps are stored as Unix milliseconds.
pub struct SqliteSessionStore {
    conn: Mutex<Connection>,
    ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
}

fn storage_err(e: impl std::fmt::Display) -> SessionError {
    SessionError::Storage(e.to_string())
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_default()
}

/// Open a SQLite connection from a `sqlite:<path>` URL or a plain path.
pub(crate) fn open_connection(database_url: &str) -> Result<Connection, String> {
    let path = database_url.strip_prefix("sqlite:").unwrap_or(database_url);

    if path != ":memory:" {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
            }
        }
    }

    Connection::open(path).map_err(|e| e.to_string())
}

impl SqliteSessionStore {
    pub fn new(database_url: &str, ttl: chrono::Duration) -> Result<Self, SessionError> {
        Self::with_clock(database_url, ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(
        database_url: &str,
        ttl: chrono::Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SessionError> {
        let conn = open_connection(database_url).map_err(SessionError::Storage)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sessions (
                token TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                revoked INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )
        .map_err(storage_err)?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_sessions_expires_at ON sessions(expires_at)",
            [],
        )
        .map_err(storage_err)?;

        Ok(Self {
            conn: Mutex::new(conn),
            ttl,
            clock,
        })
    }

    /// Look up a session row regardless of validity.
    pub fn get(&self, token: &str) -> Result<Option<Session>, SessionError> {
        let conn = self.conn.lock().map_err(storage_err)?;
        conn.query_row(
            "SELECT token, user_id, created_at, expires_at, revoked
             FROM sessions WHERE token = ?1",
            params![token],
            |row| {
                Ok(Session {
                    token: row.get(0)?,
                    user_id: row.get(1)?,
                    created_at: from_millis(row.get(2)?),
                    expires_at: from_millis(row.get(3)?),
                    revoked: row.get::<_, i64>(4)? != 0,
                })
            },
        )
        .optional()
        .map_err(storage_err)
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn create(&self, user_id: &str) -> Result<Session, SessionError> {
        let session = Session::new(user_id, self.clock.now(), self.ttl);
        let conn = self.conn.lock().map_err(storage_err)?;
        conn.execute(
            "INSERT INTO sessions (token, user_id, created_at, expires_at, revoked)
             VALUES (?1, ?2, ?3, ?4, 0)",
            params![
                session.token,
                session.user_id,
                session.created_at.timestamp_millis(),
                session.expires_at.timestamp_millis(),
            ],
        )
        .map_err(storage_err)?;
        Ok(session)
    }

    async fn validate(&self, token: &str) -> Result<String, SessionError> {
        let now = self.clock.now().timestamp_millis();
        let conn = self.conn.lock().map_err(storage_err)?;
        let user_id: Option<String> = conn
            .query_row(
                "SELECT user_id FROM sessions
                 WHERE token = ?1 AND revoked = 0 AND expires_at > ?2",
                params![token, now],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_err)?;

        user_id.ok_or(SessionError::Unauthorized)
    }

    async fn revoke(&self, token: &str) -> Result<RevokeOutcome, SessionError> {
        let now = self.clock.now().timestamp_millis();
        let conn = self.conn.lock().map_err(storage_err)?;
        let updated = conn
            .execute(
                "UPDATE sessions SET revoked = 1
                 WHERE token = ?1 AND revoked = 0 AND expires_at > ?2",
                params![token, now],
            )
            .map_err(storage_err)?;

        Ok(if updated > 0 {
            RevokeOutcome::Revoked
        } else {
            RevokeOutcome::NotFound
        })
    }

    async fn purge_expired(&self) -> Result<usize, SessionError> {
        let now = self.clock.now().timestamp_millis();
        let conn = self.conn.lock().map_err(storage_err)?;
        conn.execute(
            "DELETE FROM sessions WHERE revoked = 1 OR expires_at <= ?1",
            params![now],
        )
        .map_err(storage_err)
    }
}
