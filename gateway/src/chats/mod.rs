//! Conversation history: chats owned by a user and their ordered messages.
//!
//! Every operation is scoped to the owning user. A chat that belongs to
//! someone else is reported exactly like a missing one.

mod memory;
mod sqlite;

pub use memory::InMemoryChatStore;
pub use sqlite::SqliteChatStore;

use async_trait::async_trait;
use chat_gateway_common::{ChatMessage, ChatSummary, ChatTurn};
use chrono::{DateTime, Utc};

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("Chat not found")]
    NotFound,
    #[error("Chat storage error: {0}")]
    Storage(String),
}

/// A conversation owned by one user.
#[derive(Debug, Clone, PartialEq)]
pub struct Chat {
    pub id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    /// Bumped whenever messages are appended.
    pub updated_at: DateTime<Utc>,
}

impl Chat {
    pub fn new(user_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn summary(&self) -> ChatSummary {
        ChatSummary {
            id: self.id.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Storage for conversations and their messages.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn create(&self, user_id: &str) -> Result<Chat, ChatError>;

    /// Chats of `user_id`, most recently updated first.
    async fn list(&self, user_id: &str) -> Result<Vec<Chat>, ChatError>;

    async fn get(&self, user_id: &str, chat_id: &str) -> Result<Chat, ChatError>;

    /// Remove a chat together with its messages.
    async fn delete(&self, user_id: &str, chat_id: &str) -> Result<(), ChatError>;

    /// Messages in the order they were appended.
    async fn messages(&self, user_id: &str, chat_id: &str) -> Result<Vec<ChatMessage>, ChatError>;

    /// Append `turns` as one unit and bump the chat's `updated_at`.
    async fn append(&self, user_id: &str, chat_id: &str, turns: &[ChatTurn]) -> Result<(), ChatError>;
}
