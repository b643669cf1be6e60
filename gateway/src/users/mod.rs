//! User accounts for `POST /register` and `POST /login`.

mod memory;
mod sqlite;

pub use memory::InMemoryUserStore;
pub use sqlite::SqliteUserStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};

const MIN_USERNAME_LEN: usize = 3;
const MAX_USERNAME_LEN: usize = 64;
const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum UserError {
    #[error("Username already exists")]
    UsernameTaken,
    #[error("Username must be 3-64 characters of letters, digits, '_', '.' or '-'")]
    InvalidUsername,
    #[error("Password must be at least 8 characters")]
    InvalidPassword,
    #[error("User storage error: {0}")]
    Storage(String),
}

/// A registered user.
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub created_at: DateTime<Utc>,
}

/// Storage for user credentials.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn register(&self, username: &str, password: &str) -> Result<User, UserError>;

    /// Returns the user when the credentials match, `None` otherwise.
    async fn verify(&self, username: &str, password: &str) -> Result<Option<User>, UserError>;
}

pub fn validate_username(username: &str) -> Result<(), UserError> {
    let len = username.chars().count();
    let charset_ok = username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if !(MIN_USERNAME_LEN..=MAX_USERNAME_LEN).contains(&len) || !charset_ok {
        return Err(UserError::InvalidUsername);
    }
    Ok(())
}

pub fn validate_password(password: &str) -> Result<(), UserError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(UserError::InvalidPassword);
    }
    Ok(())
}

/// Salted SHA-256 digest, stored as `<salt hex>$<digest hex>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordDigest(String);

impl PasswordDigest {
    pub fn new(password: &str) -> Self {
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        let digest = digest_with_salt(&salt, password);
        Self(format!("{}${}", hex::encode(salt), hex::encode(digest)))
    }

    pub fn from_stored(stored: String) -> Self {
        Self(stored)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, password: &str) -> bool {
        let Some((salt_hex, digest_hex)) = self.0.split_once('$') else {
            return false;
        };
        let (Ok(salt), Ok(expected)) = (hex::decode(salt_hex), hex::decode(digest_hex)) else {
            return false;
        };
        let actual = digest_with_salt(&salt, password);
        constant_time_eq(&actual, &expected)
    }
}

fn digest_with_salt(salt: &[u8], password: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hasher.finalize().to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
