//! Incremental decoder for Ollama's newline-delimited JSON chat stream.

use std::collections::VecDeque;
use std::pin::Pin;

use futures_util::stream::{self, StreamExt};
use futures_util::Stream;
use serde::Deserialize;

use super::{BackendChunk, BackendError, ChunkStream};

#[derive(Debug, Deserialize)]
struct StreamLine {
    #[serde(default)]
    message: Option<StreamMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Reassembles NDJSON lines across transport chunk boundaries.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buffer: Vec<u8>,
    finished: bool,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once `Done` or an error has been emitted.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feed raw bytes, returning every item completed by them.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Result<BackendChunk, BackendError>> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        self.buffer.extend_from_slice(bytes);

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.decode_line(&line, &mut out);
            if self.finished {
                self.buffer.clear();
                break;
            }
        }
        out
    }

    /// Signal end of input. Yields an error if the terminal marker never came.
    pub fn finish(&mut self) -> Vec<Result<BackendChunk, BackendError>> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        let rest = std::mem::take(&mut self.buffer);
        self.decode_line(&rest, &mut out);
        if !self.finished {
            self.finished = true;
            out.push(Err(BackendError::StreamError(
                "backend closed the stream before completion".to_string(),
            )));
        }
        out
    }

    fn decode_line(&mut self, raw: &[u8], out: &mut Vec<Result<BackendChunk, BackendError>>) {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        let parsed: StreamLine = match serde_json::from_str(line) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.finished = true;
                out.push(Err(BackendError::StreamError(format!(
                    "undecodable stream line: {}",
                    e
                ))));
                return;
            }
        };

        if let Some(error) = parsed.error {
            self.finished = true;
            out.push(Err(BackendError::StreamError(error)));
            return;
        }

        if let Some(content) = parsed.message.and_then(|m| m.content) {
            if !content.is_empty() {
                out.push(Ok(BackendChunk::Text(content)));
            }
        }

        if parsed.done {
            self.finished = true;
            out.push(Ok(BackendChunk::Done));
        }
    }
}

/// Turn a raw NDJSON byte stream into a [`ChunkStream`].
pub fn decode_body<S, B, E>(body: S) -> ChunkStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    struct State<S> {
        body: Pin<Box<S>>,
        decoder: NdjsonDecoder,
        pending: VecDeque<Result<BackendChunk, BackendError>>,
    }

    let state = State {
        body: Box::pin(body),
        decoder: NdjsonDecoder::new(),
        pending: Default::default(),
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.decoder.is_finished() {
                return None;
            }
            match state.body.next().await {
                Some(Ok(bytes)) => state.pending.extend(state.decoder.feed(bytes.as_ref())),
                Some(Err(e)) => {
                    let items = state.decoder.finish();
                    // The transport failure is the reported cause.
                    state.pending.extend(items.into_iter().filter(|item| item.is_ok()));
                    state
                        .pending
                        .push_back(Err(BackendError::StreamError(e.to_string())));
                }
                None => state.pending.extend(state.decoder.finish()),
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(content: &str, done: bool) -> String {
        format!(
            "{}\n",
            serde_json::json!({
                "model": "llama3.2",
                "message": {"role": "assistant", "content": content},
                "done": done
            })
        )
    }

    #[test]
    fn test_decodes_chunks_in_order() {
        let mut decoder = NdjsonDecoder::new();
        let body = format!("{}{}{}{}", line("a", false), line("b", false), line("c", false), line("", true));
        let items = decoder.feed(body.as_bytes());

        assert_eq!(
            items,
            vec![
                Ok(BackendChunk::Text("a".to_string())),
                Ok(BackendChunk::Text("b".to_string())),
                Ok(BackendChunk::Text("c".to_string())),
                Ok(BackendChunk::Done),
            ]
        );
        assert!(decoder.is_finished());
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn test_line_split_across_feeds() {
        let mut decoder = NdjsonDecoder::new();
        let body = line("Hello", false);
        let (head, tail) = body.as_bytes().split_at(10);

        assert!(decoder.feed(head).is_empty());
        assert_eq!(
            decoder.feed(tail),
            vec![Ok(BackendChunk::Text("Hello".to_string()))]
        );
    }

    #[test]
    fn test_multibyte_char_split_across_feeds() {
        let mut decoder = NdjsonDecoder::new();
        let body = line("héllo", false);
        let split = body.find('é').unwrap() + 1;
        let (head, tail) = body.as_bytes().split_at(split);

        assert!(decoder.feed(head).is_empty());
        assert_eq!(
            decoder.feed(tail),
            vec![Ok(BackendChunk::Text("héllo".to_string()))]
        );
    }

    #[test]
    fn test_missing_done_is_stream_error() {
        let mut decoder = NdjsonDecoder::new();
        let body = format!("{}{}{}", line("a", false), line("b", false), line("c", false));
        assert_eq!(decoder.feed(body.as_bytes()).len(), 3);

        let tail = decoder.finish();
        assert_eq!(tail.len(), 1);
        assert!(matches!(tail[0], Err(BackendError::StreamError(_))));
    }

    #[test]
    fn test_final_line_without_newline() {
        let mut decoder = NdjsonDecoder::new();
        let body = line("", true);
        let body = body.trim_end();
        assert!(decoder.feed(body.as_bytes()).is_empty());
        assert_eq!(decoder.finish(), vec![Ok(BackendChunk::Done)]);
    }

    #[test]
    fn test_error_line_ends_stream() {
        let mut decoder = NdjsonDecoder::new();
        let body = format!("{}{{\"error\":\"model crashed\"}}\n{}", line("a", false), line("b", false));
        let items = decoder.feed(body.as_bytes());

        assert_eq!(items.len(), 2);
        assert_eq!(items[0], Ok(BackendChunk::Text("a".to_string())));
        assert_eq!(
            items[1],
            Err(BackendError::StreamError("model crashed".to_string()))
        );
        assert!(decoder.is_finished());
        assert!(decoder.feed(line("c", false).as_bytes()).is_empty());
    }

    #[test]
    fn test_nothing_after_done() {
        let mut decoder = NdjsonDecoder::new();
        let body = format!("{}{}", line("", true), line("late", false));
        assert_eq!(decoder.feed(body.as_bytes()), vec![Ok(BackendChunk::Done)]);
    }

    #[test]
    fn test_garbage_line_is_stream_error() {
        let mut decoder = NdjsonDecoder::new();
        let items = decoder.feed(b"not json\n");
        assert!(matches!(items[0], Err(BackendError::StreamError(_))));
    }

    #[tokio::test]
    async fn test_decode_body_transport_error_mid_stream() {
        let parts: Vec<Result<Vec<u8>, std::io::Error>> = vec![
            Ok(line("a", false).into_bytes()),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        ];
        let items: Vec<_> = decode_body(stream::iter(parts)).collect().await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0], Ok(BackendChunk::Text("a".to_string())));
        assert!(matches!(items[1], Err(BackendError::StreamError(_))));
    }
}
