//! Caller-facing errors for the gateway.

use std::time::Duration;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chat_gateway_common::{ErrorBody, ErrorCode};

use crate::chats::ChatError;
use crate::llm::BackendError;
use crate::sessions::SessionError;
use crate::users::UserError;

/// Every failure a caller can observe.
///
/// The string payloads are internal detail for logs. Callers only ever see
/// [`GatewayError::public_message`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    #[error("Missing, expired or revoked session")]
    Unauthorized,

    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Username already exists")]
    UsernameTaken,

    #[error("Chat not found")]
    ChatNotFound,

    #[error("Rate limit exceeded, retry in {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("No backend capacity, retry in {retry_after:?}")]
    CapacityExceeded { retry_after: Duration },

    #[error("Backend timeout: {0}")]
    BackendTimeout(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Backend stream error: {0}")]
    BackendStreamError(String),

    #[error("Backend invalid response: {0}")]
    BackendInvalidResponse(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl GatewayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            GatewayError::Unauthorized => ErrorCode::Unauthorized,
            GatewayError::InvalidCredentials => ErrorCode::InvalidCredentials,
            GatewayError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            GatewayError::UsernameTaken => ErrorCode::UsernameTaken,
            GatewayError::ChatNotFound => ErrorCode::ChatNotFound,
            GatewayError::RateLimited { .. } => ErrorCode::RateLimited,
            GatewayError::CapacityExceeded { .. } => ErrorCode::CapacityExceeded,
            GatewayError::BackendTimeout(_) => ErrorCode::BackendTimeout,
            GatewayError::BackendUnavailable(_) => ErrorCode::BackendUnavailable,
            GatewayError::BackendStreamError(_) => ErrorCode::BackendStreamError,
            GatewayError::BackendInvalidResponse(_) => ErrorCode::BackendInvalidResponse,
            GatewayError::Storage(_) => ErrorCode::StorageError,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Unauthorized | GatewayError::InvalidCredentials => {
                StatusCode::UNAUTHORIZED
            }
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::UsernameTaken => StatusCode::CONFLICT,
            GatewayError::ChatNotFound => StatusCode::NOT_FOUND,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::CapacityExceeded { .. } | GatewayError::BackendUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::BackendTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::BackendStreamError(_) | GatewayError::BackendInvalidResponse(_) => {
                StatusCode::BAD_GATEWAY
            }
            GatewayError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show a caller. Never includes backend or storage detail.
    pub fn public_message(&self) -> String {
        match self {
            GatewayError::Unauthorized => "Authentication required".to_string(),
            GatewayError::InvalidCredentials => "Invalid username or password".to_string(),
            GatewayError::InvalidRequest(reason) => reason.clone(),
            GatewayError::UsernameTaken => "Username already exists".to_string(),
            GatewayError::ChatNotFound => "Chat not found".to_string(),
            GatewayError::RateLimited { .. } => "Too many requests".to_string(),
            GatewayError::CapacityExceeded { .. } => {
                "The model is busy, please retry shortly".to_string()
            }
            GatewayError::BackendTimeout(_) => "The model did not respond in time".to_string(),
            GatewayError::BackendUnavailable(_) => "The model is unavailable".to_string(),
            GatewayError::BackendStreamError(_) => {
                "The model stream ended unexpectedly".to_string()
            }
            GatewayError::BackendInvalidResponse(_) => {
                "The model returned an invalid response".to_string()
            }
            GatewayError::Storage(_) => "Internal storage error".to_string(),
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody::new(self.code(), self.public_message())
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            GatewayError::RateLimited { retry_after }
            | GatewayError::CapacityExceeded { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

impl From<BackendError> for GatewayError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Timeout(detail) => GatewayError::BackendTimeout(detail),
            BackendError::Unavailable(detail) => GatewayError::BackendUnavailable(detail),
            BackendError::StreamError(detail) => GatewayError::BackendStreamError(detail),
            BackendError::InvalidResponse(detail) => GatewayError::BackendInvalidResponse(detail),
        }
    }
}

impl From<SessionError> for GatewayError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Unauthorized => GatewayError::Unauthorized,
            SessionError::Storage(detail) => GatewayError::Storage(detail),
        }
    }
}

impl From<ChatError> for GatewayError {
    fn from(e: ChatError) -> Self {
        match e {
            ChatError::NotFound => GatewayError::ChatNotFound,
            ChatError::Storage(detail) => GatewayError::Storage(detail),
        }
    }
}

impl From<UserError> for GatewayError {
    fn from(e: UserError) -> Self {
        match e {
            UserError::UsernameTaken => GatewayError::UsernameTaken,
            UserError::InvalidUsername | UserError::InvalidPassword => {
                GatewayError::InvalidRequest(e.to_string())
            }
            UserError::Storage(detail) => GatewayError::Storage(detail),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = %self.code(), "{}", self);
        } else {
            tracing::debug!(code = %self.code(), "{}", self);
        }

        let mut response = (status, Json(self.to_body())).into_response();
        let headers = response.headers_mut();

        if let Some(retry_after) = self.retry_after() {
            // Whole seconds, rounded up, never zero.
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            headers.insert(header::RETRY_AFTER, HeaderValue::from(secs.max(1)));
        }
        if status == StatusCode::UNAUTHORIZED {
            headers.insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }

        response
    }
}
