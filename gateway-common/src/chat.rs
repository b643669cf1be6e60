//! Chat request and response types.

use serde::{Deserialize, Serialize};

/// Optional generation parameters forwarded to the model backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Sampling temperature, in [0, 1].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Upper bound on generated tokens, must be > 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl GenerationParams {
    pub fn is_empty(&self) -> bool {
        self.temperature.is_none() && self.max_tokens.is_none()
    }
}

/// Body of `POST /chat` and `POST /chat/stream`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub prompt: String,
    /// Continue this conversation: earlier turns are sent as context and the
    /// exchange is saved once it completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    #[serde(flatten)]
    pub params: GenerationParams,
}

impl ChatRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            chat_id: None,
            params: GenerationParams::default(),
        }
    }

    pub fn with_chat_id(mut self, chat_id: impl Into<String>) -> Self {
        self.chat_id = Some(chat_id.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.params.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.params.max_tokens = Some(max_tokens);
        self
    }
}

/// Body of a successful `POST /chat`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub response: String,
    pub model: String,
}

/// Data of a `chunk` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub text: String,
}

/// SSE event names used on `POST /chat/stream`.
///
/// A stream is zero or more `chunk` events followed by exactly one `done` or
/// `error` event.
pub mod stream_event {
    /// A text fragment, in backend order. Data is a `StreamChunk` JSON document.
    pub const CHUNK: &str = "chunk";
    /// Clean end of stream. Data is [`DONE_DATA`].
    pub const DONE: &str = "done";
    /// Abnormal end of stream. Data is an `ErrorBody` JSON document.
    pub const ERROR: &str = "error";

    pub const DONE_DATA: &str = "[DONE]";
}
