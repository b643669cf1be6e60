use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{delete, get},
    Json, Router,
};
use chat_gateway_common::{ChatMessage, ChatSummary};

use super::bearer_token;
use crate::error::GatewayError;
use crate::AppState;

/// POST /chats - start an empty conversation
async fn create_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<ChatSummary>), GatewayError> {
    let user_id = state.router.authenticate(bearer_token(&headers)).await?;
    let chat = state.chats.create(&user_id).await?;
    tracing::info!(user_id = %user_id, chat_id = %chat.id, "Chat created");
    Ok((StatusCode::CREATED, Json(chat.summary())))
}

/// GET /chats - the caller's conversations, most recent first
async fn list_chats(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<ChatSummary>>, GatewayError> {
    let user_id = state.router.authenticate(bearer_token(&headers)).await?;
    let chats = state.chats.list(&user_id).await?;
    Ok(Json(chats.iter().map(|chat| chat.summary()).collect()))
}

/// DELETE /chats/:chat_id
async fn delete_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(chat_id): Path<String>,
) -> Result<StatusCode, GatewayError> {
    let user_id = state.router.authenticate(bearer_token(&headers)).await?;
    state.chats.delete(&user_id, &chat_id).await?;
    tracing::info!(user_id = %user_id, chat_id = %chat_id, "Chat deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// GET /chats/:chat_id/messages - stored turns, oldest first
async fn chat_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(chat_id): Path<String>,
) -> Result<Json<Vec<ChatMessage>>, GatewayError> {
    let user_id = state.router.authenticate(bearer_token(&headers)).await?;
    Ok(Json(state.chats.messages(&user_id, &chat_id).await?))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/chats", get(list_chats).post(create_chat))
        .route("/chats/:chat_id", delete(delete_chat))
        .route("/chats/:chat_id/messages", get(chat_messages))
        .with_state(state)
}
