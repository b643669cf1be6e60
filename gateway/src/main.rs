use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use chat_gateway::chats::{ChatStore, InMemoryChatStore, SqliteChatStore};
use chat_gateway::config::Config;
use chat_gateway::logging::init_tracing;
use chat_gateway::sessions::{spawn_reaper, InMemorySessionStore, SessionStore, SqliteSessionStore};
use chat_gateway::users::{InMemoryUserStore, SqliteUserStore, UserStore};
use chat_gateway::{routes, AppState, OllamaClient};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::args().skip(1).any(|arg| arg == "--version" || arg == "-V") {
        println!("chat-gateway {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    // Load configuration
    let config = Config::load()?;

    // Initialize tracing
    init_tracing(&config.logging.level);

    tracing::info!("Starting Chat Gateway v{}", env!("CARGO_PKG_VERSION"));

    // Initialize stores
    let (sessions, users, chats): (Arc<dyn SessionStore>, Arc<dyn UserStore>, Arc<dyn ChatStore>) =
        match &config.sessions.database_url {
            Some(url) => {
                tracing::info!("Using SQLite storage at {}", url);
                (
                    Arc::new(SqliteSessionStore::new(url, config.session_ttl())?),
                    Arc::new(SqliteUserStore::new(url)?),
                    Arc::new(SqliteChatStore::new(url)?),
                )
            }
            None => {
                tracing::warn!(
                    "No sessions.database_url set, sessions, users and chats are kept in memory"
                );
                (
                    Arc::new(InMemorySessionStore::new(config.session_ttl())),
                    Arc::new(InMemoryUserStore::new()),
                    Arc::new(InMemoryChatStore::new()),
                )
            }
        };

    let backend = Arc::new(OllamaClient::new(
        &config.ollama.base_url,
        &config.ollama.model,
        config.request_timeout(),
        config.connect_timeout(),
    )?);
    tracing::info!(
        "Model backend: {} model={}",
        config.ollama.base_url,
        config.ollama.model
    );

    let reaper = (config.sessions.reaper_interval_secs > 0).then(|| {
        spawn_reaper(
            sessions.clone(),
            Duration::from_secs(config.sessions.reaper_interval_secs),
        )
    });

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = Arc::new(AppState::new(config, sessions, users, chats, backend));
    tracing::info!(
        max_in_flight = state.router.admission().capacity(),
        policy = ?state.router.admission().policy(),
        "Admission control ready"
    );

    // Idle rate-limit buckets are dropped on the reaper's schedule.
    let limiter_sweeper = match (state.router.rate_limiter(), reaper.is_some()) {
        (Some(_), true) => {
            let router = state.router.clone();
            let period = Duration::from_secs(state.config.sessions.reaper_interval_secs);
            Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    ticker.tick().await;
                    if let Some(limiter) = router.rate_limiter() {
                        limiter.shrink();
                    }
                }
            }))
        }
        _ => None,
    };

    let app = routes::app(state);

    // Start server
    tracing::info!("Listening on {}", addr);
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for task in reaper.into_iter().chain(limiter_sweeper) {
        task.abort();
    }
    tracing::info!("Chat Gateway stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received, draining connections");
}
