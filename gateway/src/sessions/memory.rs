use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Clock, RevokeOutcome, Session, SessionError, SessionStore, SystemClock};

/// Session store kept in process memory. Sessions do not survive a restart.
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
    ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl InMemorySessionStore {
    pub fn new(ttl: chrono::Duration) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(ttl: chrono::Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl,
            clock,
        }
    }

    /// Number of stored sessions, including expired ones not yet purged.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, user_id: &str) -> Result<Session, SessionError> {
        let session = Session::new(user_id, self.clock.now(), self.ttl);
        self.sessions
            .write()
            .await
            .insert(session.token.clone(), session.clone());
        Ok(session)
    }

    async fn validate(&self, token: &str) -> Result<String, SessionError> {
        let now = self.clock.now();
        let sessions = self.sessions.read().await;
        match sessions.get(token) {
            Some(session) if session.is_valid_at(now) => Ok(session.user_id.clone()),
            _ => Err(SessionError::Unauthorized),
        }
    }

    async fn revoke(&self, token: &str) -> Result<RevokeOutcome, SessionError> {
        let now = self.clock.now();
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(token) {
            Some(session) if session.is_valid_at(now) => {
                session.revoked = true;
                Ok(RevokeOutcome::Revoked)
            }
            _ => Ok(RevokeOutcome::NotFound),
        }
    }

    async fn purge_expired(&self) -> Result<usize, SessionError> {
        let now = self.clock.now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, session| session.is_valid_at(now));
        Ok(before - sessions.len())
    }
}
