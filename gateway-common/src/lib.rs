//! Chat Gateway Common Types
//!
//! Wire types shared by the gateway and the UI/CLI clients that talk to it.

pub mod auth;
pub mod chat;
pub mod error;
pub mod history;

pub use auth::{
    LoginRequest, LoginResponse, LogoutRequest, LogoutResponse, RegisterRequest,
    RegisterResponse,
};
pub use chat::{stream_event, ChatRequest, ChatResponse, GenerationParams, StreamChunk};
pub use error::{ErrorBody, ErrorCode, ErrorDetail};
pub use history::{ChatMessage, ChatSummary, ChatTurn, MessageRole};
