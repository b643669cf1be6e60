//! Routes authenticated chat calls to the model backend.
//!
//! Order of checks for every call: authenticate, validate, rate limit,
//! conversation lookup, admission, dispatch. A rejected call never reaches
//! the backend.

use std::sync::Arc;
use std::time::Duration;

use chat_gateway_common::{ChatRequest, ChatResponse, ChatTurn};
use futures_util::stream::{self, BoxStream, StreamExt};

use super::admission::{AdmissionControl, AdmissionPolicy};
use super::call::{CallState, CallTrace};
use super::rate_limit::SessionRateLimiter;
use super::retry::RetryPolicy;
use crate::chats::ChatStore;
use crate::config::Config;
use crate::error::GatewayError;
use crate::llm::{BackendChunk, BackendError, ChunkStream, ModelBackend};
use crate::sessions::SessionStore;

/// Hint returned with `CapacityExceeded`.
const CAPACITY_RETRY_AFTER: Duration = Duration::from_secs(1);

/// One frame delivered to a streaming caller.
///
/// A relay yields zero or more `Chunk`s and then exactly one `End` or
/// `Error`, after which it is exhausted.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayFrame {
    Chunk(String),
    End,
    Error(GatewayError),
}

impl RelayFrame {
    pub fn is_final(&self) -> bool {
        !matches!(self, RelayFrame::Chunk(_))
    }
}

pub type RelayStream = BoxStream<'static, RelayFrame>;

#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub max_in_flight: usize,
    pub admission_policy: AdmissionPolicy,
    pub retry: RetryPolicy,
    /// Longest wait for the stream to open, and between two chunks.
    pub stream_idle_timeout: Duration,
    /// Stored messages sent as context with a `chat_id` call.
    pub history_window: usize,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl RouterSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_in_flight: config.admission.max_in_flight,
            admission_policy: AdmissionPolicy::from(&config.admission),
            retry: RetryPolicy::from(&config.retry),
            stream_idle_timeout: config.stream_idle_timeout(),
            history_window: config.history.max_context_messages,
        }
    }
}

/// A call that passed every check and holds an admission slot.
struct Admitted {
    user_id: String,
    /// Earlier turns of the conversation followed by the new prompt.
    messages: Vec<ChatTurn>,
}

pub struct ChatRouter {
    sessions: Arc<dyn SessionStore>,
    chats: Arc<dyn ChatStore>,
    backend: Arc<dyn ModelBackend>,
    admission: AdmissionControl,
    retry: RetryPolicy,
    rate_limiter: Option<SessionRateLimiter>,
    stream_idle_timeout: Duration,
    history_window: usize,
}

impl ChatRouter {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        chats: Arc<dyn ChatStore>,
        backend: Arc<dyn ModelBackend>,
        settings: RouterSettings,
    ) -> Self {
        Self {
            sessions,
            chats,
            backend,
            admission: AdmissionControl::new(settings.max_in_flight, settings.admission_policy),
            retry: settings.retry,
            rate_limiter: None,
            stream_idle_timeout: settings.stream_idle_timeout,
            history_window: settings.history_window,
        }
    }

    pub fn with_rate_limiter(mut self, limiter: SessionRateLimiter) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn admission(&self) -> &AdmissionControl {
        &self.admission
    }

    pub fn backend(&self) -> &Arc<dyn ModelBackend> {
        &self.backend
    }

    pub fn rate_limiter(&self) -> Option<&SessionRateLimiter> {
        self.rate_limiter.as_ref()
    }

    /// Resolve a bearer token to its user id.
    pub async fn authenticate(&self, token: Option<&str>) -> Result<String, GatewayError> {
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(GatewayError::Unauthorized)?;
        Ok(self.sessions.validate(token).await?)
    }

    /// Complete a prompt and return the whole response.
    pub async fn chat(
        &self,
        token: Option<&str>,
        request: &ChatRequest,
    ) -> Result<ChatResponse, GatewayError> {
        let mut call = CallTrace::new("chat");
        let result = self.dispatch(&mut call, token, request).await;
        match result {
            Ok(response) => {
                call.advance(CallState::Completed);
                Ok(response)
            }
            Err(e) => {
                call.fail(&e);
                Err(e)
            }
        }
    }

    async fn dispatch(
        &self,
        call: &mut CallTrace,
        token: Option<&str>,
        request: &ChatRequest,
    ) -> Result<ChatResponse, GatewayError> {
        let admitted = self.admit(call, token, request).await?;
        tracing::debug!(
            call_id = %call.id(),
            user_id = %admitted.user_id,
            context_turns = admitted.messages.len() - 1,
            "Dispatching chat"
        );

        let backend = &self.backend;
        let messages = admitted.messages.as_slice();
        let params = &request.params;
        let response = self
            .retry
            .run(move || backend.generate(messages, params))
            .await?;

        if let Some(chat_id) = request.chat_id.as_deref() {
            let exchange = Exchange {
                chats: self.chats.clone(),
                user_id: admitted.user_id,
                chat_id: chat_id.to_string(),
                prompt: request.prompt.clone(),
                reply: response.clone(),
            };
            exchange.save().await;
        }

        Ok(ChatResponse {
            response,
            model: self.backend.model_name().to_string(),
        })
    }

    /// Open a streaming completion.
    ///
    /// Errors before the first chunk are returned directly. Once a relay is
    /// returned, every later failure arrives as its final `Error` frame.
    pub async fn chat_stream(
        &self,
        token: Option<&str>,
        request: &ChatRequest,
    ) -> Result<RelayStream, GatewayError> {
        let mut call = CallTrace::new("chat_stream");
        match self.open_stream(&mut call, token, request).await {
            Ok((chunks, exchange)) => {
                call.advance(CallState::Streaming);
                Ok(relay(chunks, call, exchange, self.stream_idle_timeout))
            }
            Err(e) => {
                call.fail(&e);
                Err(e)
            }
        }
    }

    async fn open_stream(
        &self,
        call: &mut CallTrace,
        token: Option<&str>,
        request: &ChatRequest,
    ) -> Result<(ChunkStream, Option<Exchange>), GatewayError> {
        let admitted = self.admit(call, token, request).await?;
        tracing::debug!(
            call_id = %call.id(),
            user_id = %admitted.user_id,
            context_turns = admitted.messages.len() - 1,
            "Opening chat stream"
        );

        // Retry covers opening the stream only, so nothing has been relayed yet.
        // Each attempt gets the idle window to produce a response head.
        let backend = &self.backend;
        let messages = admitted.messages.as_slice();
        let params = &request.params;
        let open_timeout = self.stream_idle_timeout;
        let chunks = self
            .retry
            .run(move || async move {
                tokio::time::timeout(open_timeout, backend.generate_stream(messages, params))
                    .await
                    .unwrap_or_else(|_| {
                        Err(BackendError::StreamError(format!(
                            "stream not opened within {:?}",
                            open_timeout
                        )))
                    })
            })
            .await?;

        let exchange = request.chat_id.as_deref().map(|chat_id| Exchange {
            chats: self.chats.clone(),
            user_id: admitted.user_id,
            chat_id: chat_id.to_string(),
            prompt: request.prompt.clone(),
            reply: String::new(),
        });
        Ok((chunks, exchange))
    }

    /// Everything that happens before the backend is touched.
    async fn admit(
        &self,
        call: &mut CallTrace,
        token: Option<&str>,
        request: &ChatRequest,
    ) -> Result<Admitted, GatewayError> {
        call.advance(CallState::Authenticating);
        let user_id = self.authenticate(token).await?;

        validate_request(request)?;

        if let (Some(limiter), Some(token)) = (&self.rate_limiter, token) {
            limiter
                .check(token.trim())
                .map_err(|retry_after| GatewayError::RateLimited { retry_after })?;
        }

        let messages = self.conversation(&user_id, request).await?;

        let permit = self
            .admission
            .acquire()
            .await
            .map_err(|_| GatewayError::CapacityExceeded {
                retry_after: CAPACITY_RETRY_AFTER,
            })?;
        call.admit(permit);
        call.advance(CallState::Dispatched);
        Ok(Admitted { user_id, messages })
    }

    /// The most recent stored turns of the caller's chat, then the new prompt.
    async fn conversation(
        &self,
        user_id: &str,
        request: &ChatRequest,
    ) -> Result<Vec<ChatTurn>, GatewayError> {
        let mut turns: Vec<ChatTurn> = match request.chat_id.as_deref() {
            Some(chat_id) => {
                let history = self.chats.messages(user_id, chat_id).await?;
                let skip = history.len().saturating_sub(self.history_window);
                history.into_iter().skip(skip).map(ChatTurn::from).collect()
            }
            None => Vec::new(),
        };
        turns.push(ChatTurn::user(request.prompt.clone()));
        Ok(turns)
    }
}

fn validate_request(request: &ChatRequest) -> Result<(), GatewayError> {
    if request.prompt.trim().is_empty() {
        return Err(GatewayError::InvalidRequest(
            "prompt must not be empty".to_string(),
        ));
    }
    if let Some(chat_id) = &request.chat_id {
        if chat_id.trim().is_empty() {
            return Err(GatewayError::InvalidRequest(
                "chat_id must not be empty".to_string(),
            ));
        }
    }
    if let Some(temperature) = request.params.temperature {
        if !(0.0..=1.0).contains(&temperature) {
            return Err(GatewayError::InvalidRequest(
                "temperature must be between 0 and 1".to_string(),
            ));
        }
    }
    if request.params.max_tokens == Some(0) {
        return Err(GatewayError::InvalidRequest(
            "max_tokens must be positive".to_string(),
        ));
    }
    Ok(())
}

/// A prompt and its answer, saved to the chat once the answer is complete.
struct Exchange {
    chats: Arc<dyn ChatStore>,
    user_id: String,
    chat_id: String,
    prompt: String,
    reply: String,
}

impl Exchange {
    /// The caller already has the answer, so a storage failure is only logged.
    async fn save(self) {
        let turns = [ChatTurn::user(self.prompt), ChatTurn::assistant(self.reply)];
        if let Err(e) = self.chats.append(&self.user_id, &self.chat_id, &turns).await {
            tracing::error!(chat_id = %self.chat_id, "Failed to save chat exchange: {}", e);
        }
    }
}

struct RelayState {
    chunks: Option<ChunkStream>,
    call: Option<CallTrace>,
    exchange: Option<Exchange>,
    idle_timeout: Duration,
    relayed: usize,
}

impl RelayState {
    /// Drop the backend stream and the call, freeing the admission slot.
    /// A partial answer is never saved.
    fn finish(&mut self, outcome: Result<(), &GatewayError>) {
        self.chunks = None;
        if let Some(mut call) = self.call.take() {
            match outcome {
                Ok(()) => call.advance(CallState::Completed),
                Err(e) => {
                    self.exchange = None;
                    tracing::warn!(
                        call_id = %call.id(),
                        relayed_chunks = self.relayed,
                        "Stream failed after partial output"
                    );
                    call.fail(e);
                }
            }
        }
    }
}

/// Forward backend chunks in order, policing the idle gap between them.
///
/// Dropping the relay drops the backend stream, which cancels the backend
/// request, and frees the admission slot.
fn relay(
    chunks: ChunkStream,
    call: CallTrace,
    exchange: Option<Exchange>,
    idle_timeout: Duration,
) -> RelayStream {
    let state = RelayState {
        chunks: Some(chunks),
        call: Some(call),
        exchange,
        idle_timeout,
        relayed: 0,
    };

    stream::unfold(state, |mut state| async move {
        let Some(chunks) = state.chunks.as_mut() else {
            return None;
        };
        let next = tokio::time::timeout(state.idle_timeout, chunks.next()).await;

        let frame = match next {
            Ok(Some(Ok(BackendChunk::Text(text)))) => {
                state.relayed += 1;
                if let Some(exchange) = state.exchange.as_mut() {
                    exchange.reply.push_str(&text);
                }
                return Some((RelayFrame::Chunk(text), state));
            }
            Ok(Some(Ok(BackendChunk::Done))) => {
                let exchange = state.exchange.take();
                state.finish(Ok(()));
                if let Some(exchange) = exchange {
                    exchange.save().await;
                }
                RelayFrame::End
            }
            Ok(Some(Err(e))) => {
                let err = GatewayError::from(e);
                state.finish(Err(&err));
                RelayFrame::Error(err)
            }
            Ok(None) => {
                let err = GatewayError::BackendStreamError(
                    "backend stream ended without a terminal marker".to_string(),
                );
                state.finish(Err(&err));
                RelayFrame::Error(err)
            }
            Err(_) => {
                let err = GatewayError::BackendStreamError(format!(
                    "no chunk within {:?}",
                    state.idle_timeout
                ));
                state.finish(Err(&err));
                RelayFrame::Error(err)
            }
        };
        Some((frame, state))
    })
    .boxed()
}
