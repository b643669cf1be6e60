//! Model backend abstraction.
//!
//! The client is a plain transport: it never retries. Retry and admission
//! policy live in the gateway.

mod ndjson;
mod ollama;

pub use ndjson::{decode_body, NdjsonDecoder};
pub use ollama::OllamaClient;

use async_trait::async_trait;
use chat_gateway_common::{ChatTurn, GenerationParams};
use futures_util::stream::BoxStream;

/// Errors from a model backend.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    #[error("Backend did not respond in time: {0}")]
    Timeout(String),
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
    #[error("Backend stream ended abnormally: {0}")]
    StreamError(String),
    #[error("Invalid backend response: {0}")]
    InvalidResponse(String),
}

/// One item of a backend stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendChunk {
    /// A text fragment, in the order the backend produced it.
    Text(String),
    /// Terminal marker. Nothing follows it.
    Done,
}

/// Lazy, finite, non-restartable sequence of backend chunks.
///
/// A well-formed stream yields `Text` items followed by exactly one `Done`,
/// or ends with an `Err`. Dropping it cancels the underlying request.
pub type ChunkStream = BoxStream<'static, Result<BackendChunk, BackendError>>;

/// A generative model reachable over some transport.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Model identifier reported to callers.
    fn model_name(&self) -> &str;

    /// Answer the last turn of `messages` and return the whole text.
    ///
    /// Earlier turns are conversation context, oldest first.
    async fn generate(
        &self,
        messages: &[ChatTurn],
        params: &GenerationParams,
    ) -> Result<String, BackendError>;

    /// Start a streaming answer to the last turn of `messages`.
    async fn generate_stream(
        &self,
        messages: &[ChatTurn],
        params: &GenerationParams,
    ) -> Result<ChunkStream, BackendError>;

    /// Cheap reachability check.
    async fn health_check(&self) -> Result<(), BackendError> {
        Ok(())
    }
}
