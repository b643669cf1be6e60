//! In-process [`ModelBackend`] driven by a queue of scripted replies.
//!
//! Streams are produced as real NDJSON bytes over a channel and decoded with
//! the same decoder the Ollama client uses, so a "disconnect" is simply the
//! body ending without a `done` line.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chat_gateway_common::{ChatTurn, GenerationParams};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;

use super::mock_ollama::ndjson_line;
use crate::llm::{decode_body, BackendError, ChunkStream, ModelBackend};

/// How a scripted stream ends after its chunks.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEnd {
    Done,
    /// Body closes without the terminal marker.
    Disconnect,
    /// Backend reports an error line.
    Error(String),
    /// Nothing more is sent until the consumer goes away.
    Stall,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Text(String),
    Fail(BackendError),
    Stream { chunks: Vec<String>, end: StreamEnd },
    /// Block until [`ScriptedBackend::release`], then behave like the inner reply.
    Held(Box<Reply>),
}

impl Reply {
    pub fn text(text: &str) -> Self {
        Reply::Text(text.to_string())
    }

    pub fn stream(chunks: &[&str], end: StreamEnd) -> Self {
        Reply::Stream {
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            end,
        }
    }

    pub fn held(self) -> Self {
        Reply::Held(Box::new(self))
    }
}

pub struct ScriptedBackend {
    replies: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    gate: watch::Sender<bool>,
    calls: AtomicUsize,
    cancelled: Arc<AtomicUsize>,
    conversations: Mutex<Vec<Vec<ChatTurn>>>,
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedBackend {
    /// Replies `"ok"` (or a one-chunk stream) once the script runs out.
    pub fn new() -> Self {
        let (gate, _) = watch::channel(false);
        Self {
            replies: Mutex::new(VecDeque::new()),
            fallback: Reply::text("ok"),
            gate,
            calls: AtomicUsize::new(0),
            cancelled: Arc::new(AtomicUsize::new(0)),
            conversations: Mutex::new(Vec::new()),
        }
    }

    pub fn with_fallback(mut self, reply: Reply) -> Self {
        self.fallback = reply;
        self
    }

    pub fn push(&self, reply: Reply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    /// Let every `Held` reply, current and future, proceed.
    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    /// Backend calls made so far, including failed ones.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Streams whose consumer went away before the script finished.
    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// The newest turn of every call, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.conversations
            .lock()
            .unwrap()
            .iter()
            .filter_map(|turns| turns.last().map(|turn| turn.content.clone()))
            .collect()
    }

    /// Full message lists received, in call order.
    pub fn conversations(&self) -> Vec<Vec<ChatTurn>> {
        self.conversations.lock().unwrap().clone()
    }

    async fn next_reply(&self, messages: &[ChatTurn]) -> Reply {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.conversations.lock().unwrap().push(messages.to_vec());

        let scripted = self.replies.lock().unwrap().pop_front();
        let mut reply = scripted.unwrap_or_else(|| self.fallback.clone());
        while let Reply::Held(inner) = reply {
            let mut gate = self.gate.subscribe();
            let _ = gate.wait_for(|open| *open).await;
            reply = *inner;
        }
        reply
    }

    fn spawn_stream(&self, chunks: Vec<String>, end: StreamEnd) -> ChunkStream {
        let (tx, rx) = mpsc::channel::<Result<Vec<u8>, std::io::Error>>(1);
        let cancelled = self.cancelled.clone();

        tokio::spawn(async move {
            for chunk in chunks {
                if tx.send(Ok(ndjson_line(&chunk, false).into_bytes())).await.is_err() {
                    cancelled.fetch_add(1, Ordering::SeqCst);
                    return;
                }
            }
            match end {
                StreamEnd::Done => {
                    let _ = tx.send(Ok(ndjson_line("", true).into_bytes())).await;
                }
                StreamEnd::Disconnect => {}
                StreamEnd::Error(message) => {
                    let line = format!("{}\n", serde_json::json!({ "error": message }));
                    let _ = tx.send(Ok(line.into_bytes())).await;
                }
                StreamEnd::Stall => {
                    tx.closed().await;
                    cancelled.fetch_add(1, Ordering::SeqCst);
                }
            }
        });

        decode_body(ReceiverStream::new(rx))
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn generate(
        &self,
        messages: &[ChatTurn],
        _params: &GenerationParams,
    ) -> Result<String, BackendError> {
        match self.next_reply(messages).await {
            Reply::Text(text) => Ok(text),
            Reply::Fail(e) => Err(e),
            Reply::Stream { chunks, end } => match end {
                StreamEnd::Done => Ok(chunks.concat()),
                StreamEnd::Error(message) => Err(BackendError::InvalidResponse(message)),
                StreamEnd::Disconnect | StreamEnd::Stall => {
                    Err(BackendError::Timeout("scripted stall".to_string()))
                }
            },
            Reply::Held(_) => unreachable!("held replies are unwrapped in next_reply"),
        }
    }

    async fn generate_stream(
        &self,
        messages: &[ChatTurn],
        _params: &GenerationParams,
    ) -> Result<ChunkStream, BackendError> {
        match self.next_reply(messages).await {
            Reply::Text(text) => Ok(self.spawn_stream(vec![text], StreamEnd::Done)),
            Reply::Fail(e) => Err(e),
            Reply::Stream { chunks, end } => Ok(self.spawn_stream(chunks, end)),
            Reply::Held(_) => unreachable!("held replies are unwrapped in next_reply"),
        }
    }
}
