use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{validate_password, validate_username, PasswordDigest, User, UserError, UserStore};

struct UserRecord {
    user: User,
    digest: PasswordDigest,
}

/// User store kept in process memory, keyed by username.
#[derive(Default)]
pub struct InMemoryUserStore {
    users: RwLock<HashMap<String, UserRecord>>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn register(&self, username: &str, password: &str) -> Result<User, UserError> {
        validate_username(username)?;
        validate_password(password)?;

        let mut users = self.users.write().await;
        if users.contains_key(username) {
            return Err(UserError::UsernameTaken);
        }

        let user = User {
            id: uuid::Uuid::new_v4().to_string(),
            username: username.to_string(),
            created_at: Utc::now(),
        };
        users.insert(
            username.to_string(),
            UserRecord {
                user: user.clone(),
                digest: PasswordDigest::new(password),
            },
        );
        Ok(user)
    }

    async fn verify(&self, username: &str, password: &str) -> Result<Option<User>, UserError> {
        let users = self.users.read().await;
        Ok(users
            .get(username)
            .filter(|record| record.digest.matches(password))
            .map(|record| record.user.clone()))
    }
}
