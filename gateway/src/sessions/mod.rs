//! Session store: opaque bearer tokens with a fixed lifetime.
//!
//! A session is valid iff it is not revoked and `now < expires_at`. Expired
//! sessions are rejected lazily by `validate`; the reaper only reclaims
//! storage.

mod memory;
mod sqlite;

pub use memory::InMemorySessionStore;
pub use sqlite::SqliteSessionStore;
pub(crate) use sqlite::open_connection;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rand::RngCore;
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session is missing, expired or revoked")]
    Unauthorized,
    #[error("Session storage error: {0}")]
    Storage(String),
}

/// An issued session.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub token: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
}

impl Session {
    pub fn new(user_id: &str, now: DateTime<Utc>, ttl: chrono::Duration) -> Self {
        Self {
            token: generate_token(),
            user_id: user_id.to_string(),
            created_at: now,
            expires_at: now + ttl,
            revoked: false,
        }
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && now < self.expires_at
    }
}

/// Outcome of [`SessionStore::revoke`]. Neither variant is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevokeOutcome {
    Revoked,
    /// Unknown, already revoked, or already expired.
    NotFound,
}

/// Storage for authenticated sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Issue a new session for `user_id`.
    async fn create(&self, user_id: &str) -> Result<Session, SessionError>;

    /// Resolve a token to its owning user id.
    async fn validate(&self, token: &str) -> Result<String, SessionError>;

    /// Revoke a token. Idempotent.
    async fn revoke(&self, token: &str) -> Result<RevokeOutcome, SessionError>;

    /// Drop expired and revoked sessions, returning how many were removed.
    async fn purge_expired(&self) -> Result<usize, SessionError>;
}

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(start.timestamp_millis()),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        self.millis.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let millis = self.millis.load(Ordering::SeqCst);
        Utc.timestamp_millis_opt(millis)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

/// 32 bytes from the OS-seeded thread RNG, hex encoded.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Periodically purge expired sessions until the returned task is aborted.
pub fn spawn_reaper(store: Arc<dyn SessionStore>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match store.purge_expired().await {
                Ok(0) => {}
                Ok(n) => tracing::debug!(purged = n, "Reaped expired sessions"),
                Err(e) => tracing::warn!("Session reaper failed: {}", e),
            }
        }
    })
}
