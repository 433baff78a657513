
use std::io::{BufRead, BufReader};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::config::ApiConfig;
use crate::embeddings::openai::classify_http_error;
use crate::{RagError, Result};

const EXPONENTIAL_BACKOFF_BASE: u64 = 2;

/// Buffered tokens between the blocking SSE reader and the async consumer.
/// A bounded channel gives natural backpressure; a dropped receiver stops
/// the reader within one token.
const STREAM_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    #[inline]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    #[inline]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ChatUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// A completed (non-streaming) chat response.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub usage: Option<ChatUsage>,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatStreamChunk {
    choices: Vec<ChatStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatStreamChoice {
    delta: ChatStreamDelta,
}

#[derive(Debug, Deserialize, Default)]
struct ChatStreamDelta {
    content: Option<String>,
}

/// Blocking client for an OpenAI-shaped chat completions endpoint, with a
/// streaming variant that feeds tokens into a bounded channel.
#[derive(Debug, Clone)]
pub struct ChatClient {
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    agent: ureq::Agent,
    retry_attempts: u32,
}

impl ChatClient {
    #[inline]
    pub fn new(config: &ApiConfig) -> Self {
        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(config.timeout_seconds)))
            .build()
            .into();

        Self {
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            model: config.chat_model.clone(),
            temperature: config.chat_temperature,
            max_tokens: config.chat_max_tokens,
            agent,
            retry_attempts: config.retry_attempts.max(1),
        }
    }

    #[inline]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Non-streaming completion, bridged off the async scheduler.
    pub async fn complete(self: &Arc<Self>, messages: Vec<ChatMessage>) -> Result<ChatResponse> {
        let client = Arc::clone(self);
        tokio::task::spawn_blocking(move || client.complete_blocking(&messages))
            .await
            .map_err(|e| RagError::Transient(format!("Chat task failed: {e}")))?
    }

    /// Streaming completion. Tokens arrive on the returned channel in
    /// generation order; the channel closes after the final token or after
    /// one `Err` item. Dropping the receiver cancels the stream.
    pub fn stream(self: &Arc<Self>, messages: Vec<ChatMessage>) -> mpsc::Receiver<Result<String>> {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let client = Arc::clone(self);
        tokio::task::spawn_blocking(move || client.stream_blocking(&messages, &tx));
        rx
    }

    fn complete_blocking(&self, messages: &[ChatMessage]) -> Result<ChatResponse> {
        let request = ChatRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream: false,
        };
        let body = serde_json::to_string(&request)
            .map_err(|e| RagError::Permanent(format!("Failed to serialize chat request: {e}")))?;

        let response_text = self.send_with_retry(&body)?;

        let response: ChatCompletionResponse = serde_json::from_str(&response_text)
            .map_err(|e| RagError::Permanent(format!("Failed to parse chat response: {e}")))?;

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| RagError::Permanent("Chat response had no choices".to_string()))?;

        Ok(ChatResponse {
            content,
            usage: response.usage,
        })
    }

    /// Read an SSE response line by line, forwarding content deltas.
    ///
    /// `blocking_send` fails once the receiver is dropped, which aborts the
    /// read loop and closes the connection.
    fn stream_blocking(&self, messages: &[ChatMessage], tx: &mpsc::Sender<Result<String>>) {
        let request = ChatRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream: true,
        };
        let body = match serde_json::to_string(&request) {
            Ok(body) => body,
            Err(e) => {
                let _ = tx.blocking_send(Err(RagError::Permanent(format!(
                    "Failed to serialize chat request: {e}"
                ))));
                return;
            }
        };

        let mut request = self
            .agent
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream");
        if !self.api_key.is_empty() {
            request = request.header("Authorization", &format!("Bearer {}", self.api_key));
        }

        let mut response = match request.send(&body) {
            Ok(response) => response,
            Err(e) => {
                let _ = tx.blocking_send(Err(classify_http_error(&e, "chat")));
                return;
            }
        };

        let reader = BufReader::new(response.body_mut().as_reader());
        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    let _ = tx.blocking_send(Err(RagError::Transient(format!(
                        "Chat stream read failed: {e}"
                    ))));
                    return;
                }
            };

            let Some(payload) = line.strip_prefix("data:").map(str::trim) else {
                continue;
            };
            if payload == "[DONE]" {
                break;
            }

            match serde_json::from_str::<ChatStreamChunk>(payload) {
                Ok(chunk) => {
                    let Some(content) = chunk
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|c| c.delta.content)
                    else {
                        continue;
                    };
                    if !content.is_empty() && tx.blocking_send(Ok(content)).is_err() {
                        debug!("Chat stream consumer disconnected, stopping");
                        return;
                    }
                }
                Err(e) => {
                    debug!("Skipping malformed stream chunk: {}", e);
                }
            }
        }
    }

    fn send_with_retry(&self, body: &str) -> Result<String> {
        let mut last_error = None;

        for attempt in 1..=self.retry_attempts {
            debug!("Chat request attempt {}/{}", attempt, self.retry_attempts);

            let mut request = self
                .agent
                .post(&self.endpoint)
                .header("Content-Type", "application/json");
            if !self.api_key.is_empty() {
                request = request.header("Authorization", &format!("Bearer {}", self.api_key));
            }

            match request
                .send(body)
                .and_then(|mut resp| resp.body_mut().read_to_string())
            {
                Ok(response_text) => return Ok(response_text),
                Err(error) => {
                    let classified = classify_http_error(&error, "chat");
                    if !classified.is_retryable() {
                        return Err(classified);
                    }
                    warn!(
                        "Retryable chat request failure, attempt {}/{}: {}",
                        attempt, self.retry_attempts, error
                    );
                    last_error = Some(classified);

                    if attempt < self.retry_attempts {
                        let delay =
                            Duration::from_secs(EXPONENTIAL_BACKOFF_BASE.pow(attempt - 1));
                        std::thread::sleep(delay);
                    }
                }
            }
        }

        error!("All chat request attempts to {} failed", self.endpoint);
        Err(last_error.unwrap_or_else(|| RagError::Transient("Chat request failed".to_string())))
    }
}
