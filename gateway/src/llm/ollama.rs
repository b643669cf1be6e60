use std::time::Duration;

use async_trait::async_trait;
use chat_gateway_common::{ChatTurn, GenerationParams};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use super::{decode_body, BackendError, ChunkStream, ModelBackend};

/// Client for Ollama's `/api/chat` endpoint.
pub struct OllamaClient {
    http_client: Client,
    base_url: String,
    model: String,
    request_timeout: Duration,
    /// Bound for `health_check`, which must answer quickly.
    health_timeout: Duration,
}

/// Ollama chat request format.
#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaOptions>,
}

#[derive(Debug, Serialize)]
struct OllamaMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

/// Ollama chat response format (non-streaming).
#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: OllamaResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OllamaResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OllamaClient {
    pub fn new(
        base_url: &str,
        model: &str,
        request_timeout: Duration,
        connect_timeout: Duration,
    ) -> Result<Self, BackendError> {
        let http_client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            request_timeout,
            health_timeout: connect_timeout,
        })
    }

    fn chat_request<'a>(
        &'a self,
        messages: &'a [ChatTurn],
        params: &GenerationParams,
        stream: bool,
    ) -> OllamaChatRequest<'a> {
        let options = if params.is_empty() {
            None
        } else {
            Some(OllamaOptions {
                temperature: params.temperature,
                num_predict: params.max_tokens,
            })
        };

        OllamaChatRequest {
            model: &self.model,
            messages: messages
                .iter()
                .map(|turn| OllamaMessage {
                    role: turn.role.as_str(),
                    content: &turn.content,
                })
                .collect(),
            stream,
            options,
        }
    }
}

/// Map a transport failure before or during the response head.
fn classify_send_error(e: reqwest::Error) -> BackendError {
    if e.is_timeout() {
        BackendError::Timeout(e.to_string())
    } else {
        BackendError::Unavailable(e.to_string())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let detail = format!("{}: {}", status, body.chars().take(200).collect::<String>());
    Err(match status {
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE => {
            BackendError::Unavailable(detail)
        }
        StatusCode::GATEWAY_TIMEOUT => BackendError::Timeout(detail),
        _ => BackendError::InvalidResponse(detail),
    })
}

#[async_trait]
impl ModelBackend for OllamaClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        messages: &[ChatTurn],
        params: &GenerationParams,
    ) -> Result<String, BackendError> {
        let url = format!("{}/api/chat", self.base_url);
        tracing::debug!("Sending chat request to Ollama: {} model={}", url, self.model);

        let response = self
            .http_client
            .post(&url)
            .timeout(self.request_timeout)
            .json(&self.chat_request(messages, params, false))
            .send()
            .await
            .map_err(classify_send_error)?;

        let response = check_status(response).await?;

        let ollama_response: OllamaChatResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                BackendError::Timeout(e.to_string())
            } else {
                BackendError::InvalidResponse(e.to_string())
            }
        })?;

        Ok(ollama_response.message.content.unwrap_or_default())
    }

    async fn generate_stream(
        &self,
        messages: &[ChatTurn],
        params: &GenerationParams,
    ) -> Result<ChunkStream, BackendError> {
        let url = format!("{}/api/chat", self.base_url);
        tracing::debug!("Opening chat stream to Ollama: {} model={}", url, self.model);

        // No total timeout. The gateway bounds the wait for the response head
        // and the idle gap between chunks.
        let response = self
            .http_client
            .post(&url)
            .json(&self.chat_request(messages, params, true))
            .send()
            .await
            .map_err(classify_send_error)?;

        let response = check_status(response).await?;
        Ok(decode_body(response.bytes_stream()))
    }

    async fn health_check(&self) -> Result<(), BackendError> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .http_client
            .get(&url)
            .timeout(self.health_timeout)
            .send()
            .await
            .map_err(classify_send_error)?;
        check_status(response).await.map(|_| ())
    }
}
