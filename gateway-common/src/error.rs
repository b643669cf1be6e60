//! Caller-visible error body and the stable error codes.

use serde::{Deserialize, Serialize};

/// Stable, documented error codes. Clients match on these, never on messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    InvalidCredentials,
    InvalidRequest,
    UsernameTaken,
    ChatNotFound,
    RateLimited,
    CapacityExceeded,
    BackendTimeout,
    BackendUnavailable,
    BackendStreamError,
    BackendInvalidResponse,
    StorageError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::InvalidCredentials => "invalid_credentials",
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::UsernameTaken => "username_taken",
            ErrorCode::ChatNotFound => "chat_not_found",
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::CapacityExceeded => "capacity_exceeded",
            ErrorCode::BackendTimeout => "backend_timeout",
            ErrorCode::BackendUnavailable => "backend_unavailable",
            ErrorCode::BackendStreamError => "backend_stream_error",
            ErrorCode::BackendInvalidResponse => "backend_invalid_response",
            ErrorCode::StorageError => "storage_error",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: ErrorCode,
    pub message: String,
}

/// `{"error": {"code": ..., "message": ...}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

impl ErrorBody {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                code,
                message: message.into(),
            },
        }
    }
}
