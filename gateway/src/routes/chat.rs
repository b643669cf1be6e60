use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::{
    extract::State,
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
    routing::post,
    Json, Router,
};
use chat_gateway_common::{stream_event, ChatRequest, ChatResponse, StreamChunk};
use futures_util::{Stream, StreamExt};

use super::bearer_token;
use crate::error::GatewayError;
use crate::gateway::RelayFrame;
use crate::AppState;

/// Parse the body only after the caller is authenticated, so an anonymous
/// caller learns nothing from a malformed request.
async fn authenticated_body(
    state: &AppState,
    token: Option<&str>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<ChatRequest, GatewayError> {
    match payload {
        Ok(Json(request)) => Ok(request),
        Err(rejection) => {
            state.router.authenticate(token).await?;
            Err(GatewayError::InvalidRequest(rejection.body_text()))
        }
    }
}

/// POST /chat - complete a prompt in one response
async fn chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, GatewayError> {
    let token = bearer_token(&headers);
    let request = authenticated_body(&state, token, payload).await?;
    Ok(Json(state.router.chat(token, &request).await?))
}

/// POST /chat/stream - relay a completion as Server-Sent Events
async fn chat_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, GatewayError> {
    let token = bearer_token(&headers);
    let request = authenticated_body(&state, token, payload).await?;
    let relay = state.router.chat_stream(token, &request).await?;

    let events = relay.map(|frame| Ok(frame_event(frame)));
    let keep_alive = Duration::from_secs(state.config.streaming.keep_alive_secs.max(1));
    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(keep_alive)))
}

fn frame_event(frame: RelayFrame) -> Event {
    match frame {
        RelayFrame::Chunk(text) => json_event(stream_event::CHUNK, &StreamChunk { text }),
        RelayFrame::End => Event::default()
            .event(stream_event::DONE)
            .data(stream_event::DONE_DATA),
        RelayFrame::Error(e) => json_event(stream_event::ERROR, &e.to_body()),
    }
}

fn json_event<T: serde::Serialize>(name: &str, data: &T) -> Event {
    // Serializing these plain structs cannot fail.
    let data = serde_json::to_string(data).unwrap_or_default();
    Event::default().event(name).data(data)
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/chat", post(chat))
        .route("/chat/stream", post(chat_stream))
        .with_state(state)
}

