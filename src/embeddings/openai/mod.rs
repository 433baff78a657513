
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::config::ApiConfig;
use crate::{RagError, Result};

const EXPONENTIAL_BACKOFF_BASE: u64 = 2;

/// Blocking client for an OpenAI-shaped embeddings endpoint.
///
/// Callers on the async side bridge through `spawn_blocking`; see
/// [`crate::embeddings::EmbeddingService`].
#[derive(Debug, Clone)]
pub struct OpenAiEmbeddingClient {
    endpoint: String,
    api_key: String,
    model: String,
    agent: ureq::Agent,
    retry_attempts: u32,
}

#[derive(Debug, Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: EmbeddingInput<'a>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum EmbeddingInput<'a> {
    Single(&'a str),
    Batch(&'a [String]),
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingData>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

#[derive(Debug, Deserialize)]
struct Usage {
    total_tokens: u64,
}

impl OpenAiEmbeddingClient {
    #[inline]
    pub fn new(config: &ApiConfig) -> Self {
        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(config.timeout_seconds)))
            .build()
            .into();

        Self {
            endpoint: format!("{}/embeddings", config.base_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            model: config.embedding_model.clone(),
            agent,
            retry_attempts: config.retry_attempts.max(1),
        }
    }

    #[inline]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Embed one text. Returns the vector and the reported token usage.
    pub fn embed(&self, text: &str) -> Result<(Vec<f32>, Option<u64>)> {
        debug!("Requesting embedding for text ({} chars)", text.chars().count());

        let (mut vectors, usage) = self.request(EmbeddingInput::Single(text), 1)?;
        let vector = vectors
            .pop()
            .ok_or_else(|| RagError::Permanent("Embedding response was empty".to_string()))?;
        Ok((vector, usage))
    }

    /// Embed a batch in one request; output order matches input order.
    pub fn embed_batch(&self, texts: &[String]) -> Result<(Vec<Vec<f32>>, Option<u64>)> {
        debug!("Requesting embeddings for batch of {}", texts.len());
        self.request(EmbeddingInput::Batch(texts), texts.len())
    }

    fn request(
        &self,
        input: EmbeddingInput<'_>,
        expected: usize,
    ) -> Result<(Vec<Vec<f32>>, Option<u64>)> {
        let request = EmbeddingsRequest {
            model: &self.model,
            input,
        };
        let body = serde_json::to_string(&request)
            .map_err(|e| RagError::Permanent(format!("Failed to serialize request: {e}")))?;

        let response_text = self.send_with_retry(&body)?;

        let response: EmbeddingsResponse = serde_json::from_str(&response_text)
            .map_err(|e| RagError::Permanent(format!("Failed to parse embedding response: {e}")))?;

        if response.data.len() != expected {
            return Err(RagError::Permanent(format!(
                "Embedding count mismatch: requested {}, received {}",
                expected,
                response.data.len()
            )));
        }

        let mut data = response.data;
        data.sort_by_key(|d| d.index);
        let vectors = data.into_iter().map(|d| d.embedding).collect();
        let usage = response.usage.map(|u| u.total_tokens);
        Ok((vectors, usage))
    }

    fn send_with_retry(&self, body: &str) -> Result<String> {
        let mut last_error = None;

        for attempt in 1..=self.retry_attempts {
            debug!("Embedding request attempt {}/{}", attempt, self.retry_attempts);

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
                    let classified = classify_http_error(&error, "embedding");
                    if !classified.is_retryable() {
                        return Err(classified);
                    }
                    warn!(
                        "Retryable embedding request failure, attempt {}/{}: {}",
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

        error!("All embedding request attempts to {} failed", self.endpoint);
        Err(last_error
            .unwrap_or_else(|| RagError::Transient("Embedding request failed".to_string())))
    }
}

/// Map a ureq failure onto the retry taxonomy: 429 and 5xx and transport
/// errors are transient, other status codes are permanent.
pub(crate) fn classify_http_error(error: &ureq::Error, what: &str) -> RagError {
    match error {
        ureq::Error::StatusCode(status) => {
            if *status == 429 {
                RagError::Transient(format!("{what} API rate limited (HTTP 429)"))
            } else if *status >= 500 {
                RagError::Transient(format!("{what} API server error (HTTP {status})"))
            } else {
                RagError::Permanent(format!("{what} API client error (HTTP {status})"))
            }
        }
        ureq::Error::ConnectionFailed
        | ureq::Error::HostNotFound
        | ureq::Error::Timeout(_)
        | ureq::Error::Io(_) => RagError::Transient(format!("{what} API transport error: {error}")),
        other => RagError::Permanent(format!("{what} API request failed: {other}")),
    }
}
