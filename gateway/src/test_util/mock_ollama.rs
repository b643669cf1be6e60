use serde::{Deserialize, Serialize};

/// One line of an Ollama `/api/chat` response.
#[derive(Debug, Serialize, Deserialize)]
pub struct MockOllamaResponse {
    pub model: String,
    pub message: MockOllamaMessage,
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_count: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MockOllamaMessage {
    pub role: String,
    pub content: String,
}

impl MockOllamaResponse {
    pub fn text(content: &str, done: bool) -> Self {
        Self {
            model: "test-model".to_string(),
            message: MockOllamaMessage {
                role: "assistant".to_string(),
                content: content.to_string(),
            },
            done,
            eval_count: done.then(|| content.split_whitespace().count() as u32),
        }
    }
}

/// Body of a non-streaming reply.
pub fn chat_json(content: &str) -> serde_json::Value {
    serde_json::to_value(MockOllamaResponse::text(content, true)).unwrap()
}

pub fn error_json(message: &str) -> serde_json::Value {
    serde_json::json!({
        "error": message
    })
}

/// A single NDJSON line including its trailing newline.
pub fn ndjson_line(content: &str, done: bool) -> String {
    let mut line = serde_json::to_string(&MockOllamaResponse::text(content, done)).unwrap();
    line.push('\n');
    line
}

/// A streamed reply: one line per chunk, then a `done` line if `done` is set.
pub fn ndjson_body(chunks: &[&str], done: bool) -> String {
    let mut body: String = chunks.iter().map(|c| ndjson_line(c, false)).collect();
    if done {
        body.push_str(&ndjson_line("", true));
    }
    body
}

/// A local URL nothing is listening on.
pub fn unreachable_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{}", port)
}
