use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chat_gateway_common::{ChatMessage, ChatTurn, MessageRole};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{Chat, ChatError, ChatStore};
use crate::sessions::{open_connection, Clock, SystemClock};

/// SQLite-backed chat store. Timestamps are stored as Unix milliseconds and
/// messages are ordered by their row id.
pub struct SqliteChatStore {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

fn storage_err(e: impl std::fmt::Display) -> ChatError {
    ChatError::Storage(e.to_string())
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_default()
}

fn chat_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chat> {
    Ok(Chat {
        id: row.get(0)?,
        user_id: row.get(1)?,
        created_at: from_millis(row.get(2)?),
        updated_at: from_millis(row.get(3)?),
    })
}

/// Fail with `NotFound` unless `chat_id` exists and belongs to `user_id`.
fn ensure_owned(conn: &Connection, user_id: &str, chat_id: &str) -> Result<(), ChatError> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM chats WHERE id = ?1 AND user_id = ?2",
            params![chat_id, user_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(storage_err)?;
    found.map(|_| ()).ok_or(ChatError::NotFound)
}

impl SqliteChatStore {
    pub fn new(database_url: &str) -> Result<Self, ChatError> {
        Self::with_clock(database_url, Arc::new(SystemClock))
    }

    pub fn with_clock(database_url: &str, clock: Arc<dyn Clock>) -> Result<Self, ChatError> {
        let conn = open_connection(database_url).map_err(ChatError::Storage)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS chats (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_chats_user ON chats(user_id, updated_at);
            CREATE TABLE IF NOT EXISTS chat_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chat_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_chat_messages_chat ON chat_messages(chat_id, id);",
        )
        .map_err(storage_err)?;

        Ok(Self {
            conn: Mutex::new(conn),
            clock,
        })
    }
}

#[async_trait]
impl ChatStore for SqliteChatStore {
    async fn create(&self, user_id: &str) -> Result<Chat, ChatError> {
        let chat = Chat::new(user_id, self.clock.now());
        let conn = self.conn.lock().map_err(storage_err)?;
        conn.execute(
            "INSERT INTO chats (id, user_id, created_at, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                chat.id,
                chat.user_id,
                chat.created_at.timestamp_millis(),
                chat.updated_at.timestamp_millis(),
            ],
        )
        .map_err(storage_err)?;
        Ok(chat)
    }

    async fn list(&self, user_id: &str) -> Result<Vec<Chat>, ChatError> {
        let conn = self.conn.lock().map_err(storage_err)?;
        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, created_at, updated_at FROM chats
                 WHERE user_id = ?1
                 ORDER BY updated_at DESC, rowid DESC",
            )
            .map_err(storage_err)?;
        let chats = stmt
            .query_map(params![user_id], chat_from_row)
            .map_err(storage_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(storage_err)?;
        Ok(chats)
    }

    async fn get(&self, user_id: &str, chat_id: &str) -> Result<Chat, ChatError> {
        let conn = self.conn.lock().map_err(storage_err)?;
        conn.query_row(
            "SELECT id, user_id, created_at, updated_at FROM chats
             WHERE id = ?1 AND user_id = ?2",
            params![chat_id, user_id],
            chat_from_row,
        )
        .optional()
        .map_err(storage_err)?
        .ok_or(ChatError::NotFound)
    }

    async fn delete(&self, user_id: &str, chat_id: &str) -> Result<(), ChatError> {
        let mut conn = self.conn.lock().map_err(storage_err)?;
        let tx = conn.transaction().map_err(storage_err)?;
        let removed = tx
            .execute(
                "DELETE FROM chats WHERE id = ?1 AND user_id = ?2",
                params![chat_id, user_id],
            )
            .map_err(storage_err)?;
        if removed == 0 {
            return Err(ChatError::NotFound);
        }
        tx.execute("DELETE FROM chat_messages WHERE chat_id = ?1", params![chat_id])
            .map_err(storage_err)?;
        tx.commit().map_err(storage_err)
    }

    async fn messages(&self, user_id: &str, chat_id: &str) -> Result<Vec<ChatMessage>, ChatError> {
        let conn = self.conn.lock().map_err(storage_err)?;
        ensure_owned(&conn, user_id, chat_id)?;

        let mut stmt = conn
            .prepare(
                "SELECT role, content, created_at FROM chat_messages
                 WHERE chat_id = ?1 ORDER BY id",
            )
            .map_err(storage_err)?;
        let rows = stmt
            .query_map(params![chat_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })
            .map_err(storage_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(storage_err)?;

        rows.into_iter()
            .map(|(role, content, created_at)| {
                Ok(ChatMessage {
                    role: role.parse::<MessageRole>().map_err(ChatError::Storage)?,
                    content,
                    created_at: from_millis(created_at),
                })
            })
            .collect()
    }

    async fn append(&self, user_id: &str, chat_id: &str, turns: &[ChatTurn]) -> Result<(), ChatError> {
        let now = self.clock.now().timestamp_millis();
        let mut conn = self.conn.lock().map_err(storage_err)?;
        let tx = conn.transaction().map_err(storage_err)?;

        let updated = tx
            .execute(
                "UPDATE chats SET updated_at = ?3 WHERE id = ?1 AND user_id = ?2",
                params![chat_id, user_id, now],
            )
            .map_err(storage_err)?;
        if updated == 0 {
            return Err(ChatError::NotFound);
        }

        for turn in turns {
            tx.execute(
                "INSERT INTO chat_messages (chat_id, role, content, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![chat_id, turn.role.as_str(), turn.content, now],
            )
            .map_err(storage_err)?;
        }
        tx.commit().map_err(storage_err)
    }
}
