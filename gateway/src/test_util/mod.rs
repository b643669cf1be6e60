//! Helpers shared by unit and integration tests.

pub mod mock_ollama;
pub mod scripted;

pub use scripted::{Reply, ScriptedBackend, StreamEnd};

use std::sync::Arc;

use crate::chats::{ChatStore, InMemoryChatStore};
use crate::config::{AdmissionPolicyKind, Config};
use crate::llm::ModelBackend;
use crate::sessions::{InMemorySessionStore, SessionStore};
use crate::users::{InMemoryUserStore, UserStore};
use crate::AppState;

/// Defaults with fail-fast admission and short timeouts.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.server.host = "127.0.0.1".to_string();
    config.ollama.model = "test-model".to_string();
    config.ollama.request_timeout_secs = 5;
    config.admission.max_in_flight = 4;
    config.admission.policy = AdmissionPolicyKind::Reject;
    config.streaming.idle_timeout_secs = 5;
    config.logging.level = "debug".to_string();
    config
}

/// In-memory state around `backend`.
pub fn create_test_state(config: Config, backend: Arc<dyn ModelBackend>) -> Arc<AppState> {
    let sessions: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new(config.session_ttl()));
    let users: Arc<dyn UserStore> = Arc::new(InMemoryUserStore::new());
    let chats: Arc<dyn ChatStore> = Arc::new(InMemoryChatStore::new());
    Arc::new(AppState::new(config, sessions, users, chats, backend))
}

/// Register `username` and return a fresh session token for it.
pub async fn login_token(state: &AppState, username: &str) -> String {
    let user = state
        .users
        .register(username, "correct horse battery")
        .await
        .expect("register test user");
    state
        .sessions
        .create(&user.id)
        .await
        .expect("create test session")
        .token
}
