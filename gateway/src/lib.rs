pub mod chats;
pub mod config;
pub mod error;
pub mod gateway;
pub mod llm;
pub mod logging;
pub mod routes;
pub mod sessions;
pub mod test_util;
pub mod users;

pub use chats::{ChatStore, InMemoryChatStore, SqliteChatStore};
pub use config::Config;
pub use error::GatewayError;
pub use gateway::{ChatRouter, RelayFrame, RouterSettings, SessionRateLimiter};
pub use llm::{BackendError, ModelBackend, OllamaClient};
pub use sessions::{InMemorySessionStore, SessionStore, SqliteSessionStore};
pub use users::{InMemoryUserStore, SqliteUserStore, UserStore};

use std::sync::Arc;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub sessions: Arc<dyn SessionStore>,
    pub users: Arc<dyn UserStore>,
    pub chats: Arc<dyn ChatStore>,
    /// Authenticated routing to the model backend.
    pub router: Arc<ChatRouter>,
}

impl AppState {
    /// Wire stores and backend together under `config`'s policies.
    pub fn new(
        config: Config,
        sessions: Arc<dyn SessionStore>,
        users: Arc<dyn UserStore>,
        chats: Arc<dyn ChatStore>,
        backend: Arc<dyn ModelBackend>,
    ) -> Self {
        let mut router = ChatRouter::new(
            sessions.clone(),
            chats.clone(),
            backend,
            RouterSettings::from_config(&config),
        );
        if let Some(limiter) = SessionRateLimiter::from_config(&config.rate_limit) {
            router = router.with_rate_limiter(limiter);
        }

        Self {
            config,
            sessions,
            users,
            chats,
            router: Arc::new(router),
        }
    }
}
