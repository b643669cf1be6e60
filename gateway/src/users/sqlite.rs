use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

use super::{validate_password, validate_username, PasswordDigest, User, UserError, UserStore};
use crate::sessions::open_connection;

/// SQLite-backed user store.
pub struct SqliteUserStore {
    conn: Mutex<Connection>,
}

fn storage_err(e: impl std::fmt::Display) -> UserError {
    UserError::Storage(e.to_string())
}

impl SqliteUserStore {
    pub fn new(database_url: &str) -> Result<Self, UserError> {
        let conn = open_connection(database_url).map_err(UserError::Storage)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                password_digest TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )
        .map_err(storage_err)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait]
impl UserStore for SqliteUserStore {
    async fn register(&self, username: &str, password: &str) -> Result<User, UserError> {
        validate_username(username)?;
        validate_password(password)?;

        let user = User {
            id: uuid::Uuid::new_v4().to_string(),
            username: username.to_string(),
            created_at: Utc::now(),
        };
        let digest = PasswordDigest::new(password);

        let conn = self.conn.lock().map_err(storage_err)?;
        let result = conn.execute(
            "INSERT INTO users (id, username, password_digest, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![user.id, user.username, digest.as_str(), user.created_at.to_rfc3339()],
        );

        match result {
            Ok(_) => Ok(user),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(UserError::UsernameTaken)
            }
            Err(e) => Err(storage_err(e)),
        }
    }

    async fn verify(&self, username: &str, password: &str) -> Result<Option<User>, UserError> {
        let conn = self.conn.lock().map_err(storage_err)?;
        let row: Option<(String, String, String)> = conn
            .query_row(
                "SELECT id, password_digest, created_at FROM users WHERE username = ?1",
                params![username],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(storage_err)?;

        let Some((id, stored, created_at)) = row else {
            return Ok(None);
        };
        if !PasswordDigest::from_stored(stored).matches(password) {
            return Ok(None);
        }

        let created_at = DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(storage_err)?;

        Ok(Some(User {
            id,
            username: username.to_string(),
            created_at,
        }))
    }
}
