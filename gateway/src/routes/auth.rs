use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use chat_gateway_common::{
    LoginRequest, LoginResponse, LogoutRequest, LogoutResponse, RegisterRequest,
    RegisterResponse,
};

use super::{bearer_token, json_body};
use crate::error::GatewayError;
use crate::sessions::RevokeOutcome;
use crate::AppState;

/// POST /register - create an account
async fn register(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<RegisterResponse>), GatewayError> {
    let request = json_body(payload)?;
    let user = state
        .users
        .register(request.username.trim(), &request.password)
        .await?;
    tracing::info!(user_id = %user.id, "Registered user");

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            user_id: user.id,
            username: user.username,
        }),
    ))
}

/// POST /login - exchange credentials for a session token
async fn login(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<LoginResponse>, GatewayError> {
    let request = json_body(payload)?;
    let user = state
        .users
        .verify(request.username.trim(), &request.password)
        .await?
        .ok_or(GatewayError::InvalidCredentials)?;

    let session = state.sessions.create(&user.id).await?;
    tracing::info!(user_id = %user.id, expires_at = %session.expires_at, "Issued session");

    Ok(Json(LoginResponse {
        token: session.token,
        user_id: user.id,
        username: user.username,
        expires_at: session.expires_at,
    }))
}

/// POST /logout - revoke a session token
///
/// Succeeds whether or not the session still exists.
async fn logout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Option<Json<LogoutRequest>>,
) -> Result<Json<LogoutResponse>, GatewayError> {
    let body_token = payload.and_then(|Json(body)| body.token);
    let token = body_token
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .or_else(|| bearer_token(&headers));

    let Some(token) = token else {
        return Ok(Json(LogoutResponse {
            revoked: false,
            message: "No session token supplied".to_string(),
        }));
    };

    let response = match state.sessions.revoke(token).await? {
        RevokeOutcome::Revoked => LogoutResponse {
            revoked: true,
            message: "Logged out".to_string(),
        },
        RevokeOutcome::NotFound => LogoutResponse {
            revoked: false,
            message: "Session already ended".to_string(),
        },
    };
    Ok(Json(response))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/logout", post(logout))
        .with_state(state)
}
