use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chat_gateway_common::{ChatMessage, ChatTurn};
use tokio::sync::RwLock;

use super::{Chat, ChatError, ChatStore};
use crate::sessions::{Clock, SystemClock};

struct ChatRecord {
    chat: Chat,
    messages: Vec<ChatMessage>,
    /// Breaks `updated_at` ties so listing order is stable.
    touched: u64,
}

/// Chat store kept in process memory. History does not survive a restart.
pub struct InMemoryChatStore {
    chats: RwLock<HashMap<String, ChatRecord>>,
    clock: Arc<dyn Clock>,
    sequence: AtomicU64,
}

impl Default for InMemoryChatStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryChatStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            chats: RwLock::new(HashMap::new()),
            clock,
            sequence: AtomicU64::new(0),
        }
    }

    fn next_touch(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }
}

fn owned<'a>(
    chats: &'a HashMap<String, ChatRecord>,
    user_id: &str,
    chat_id: &str,
) -> Result<&'a ChatRecord, ChatError> {
    chats
        .get(chat_id)
        .filter(|record| record.chat.user_id == user_id)
        .ok_or(ChatError::NotFound)
}

#[async_trait]
impl ChatStore for InMemoryChatStore {
    async fn create(&self, user_id: &str) -> Result<Chat, ChatError> {
        let chat = Chat::new(user_id, self.clock.now());
        let record = ChatRecord {
            chat: chat.clone(),
            messages: Vec::new(),
            touched: self.next_touch(),
        };
        self.chats.write().await.insert(chat.id.clone(), record);
        Ok(chat)
    }

    async fn list(&self, user_id: &str) -> Result<Vec<Chat>, ChatError> {
        let chats = self.chats.read().await;
        let mut records: Vec<&ChatRecord> = chats
            .values()
            .filter(|record| record.chat.user_id == user_id)
            .collect();
        records.sort_by(|a, b| {
            b.chat
                .updated_at
                .cmp(&a.chat.updated_at)
                .then(b.touched.cmp(&a.touched))
        });
        Ok(records.into_iter().map(|record| record.chat.clone()).collect())
    }

    async fn get(&self, user_id: &str, chat_id: &str) -> Result<Chat, ChatError> {
        let chats = self.chats.read().await;
        owned(&chats, user_id, chat_id).map(|record| record.chat.clone())
    }

    async fn delete(&self, user_id: &str, chat_id: &str) -> Result<(), ChatError> {
        let mut chats = self.chats.write().await;
        owned(&chats, user_id, chat_id)?;
        chats.remove(chat_id);
        Ok(())
    }

    async fn messages(&self, user_id: &str, chat_id: &str) -> Result<Vec<ChatMessage>, ChatError> {
        let chats = self.chats.read().await;
        owned(&chats, user_id, chat_id).map(|record| record.messages.clone())
    }

    async fn append(&self, user_id: &str, chat_id: &str, turns: &[ChatTurn]) -> Result<(), ChatError> {
        let now = self.clock.now();
        let touched = self.next_touch();
        let mut chats = self.chats.write().await;
        let record = chats
            .get_mut(chat_id)
            .filter(|record| record.chat.user_id == user_id)
            .ok_or(ChatError::NotFound)?;

        record.messages.extend(turns.iter().map(|turn| ChatMessage {
            role: turn.role,
            content: turn.content.clone(),
            created_at: now,
        }));
        record.chat.updated_at = now;
        record.touched = touched;
        Ok(())
    }
}
