
pub mod openai;

use std::sync::Arc;

use tracing::{debug, warn};

use crate::cache::EmbeddingCache;
use crate::config::PipelineConfig;
use crate::usage::{ApiCategory, UsageMonitor};
use crate::{RagError, Result};

pub use openai::OpenAiEmbeddingClient;

/// Embedding front door: remote API wrapped with the content-addressed
/// cache and the usage monitor.
///
/// The underlying HTTP client is blocking; calls are bridged through
/// `spawn_blocking` so the cooperative scheduler is never stalled.
pub struct EmbeddingService {
    client: Arc<OpenAiEmbeddingClient>,
    cache: Arc<EmbeddingCache>,
    monitor: Arc<UsageMonitor>,
    dimension: usize,
}

impl EmbeddingService {
    #[inline]
    pub fn new(
        config: &PipelineConfig,
        cache: Arc<EmbeddingCache>,
        monitor: Arc<UsageMonitor>,
    ) -> Self {
        Self {
            client: Arc::new(OpenAiEmbeddingClient::new(&config.api)),
            cache,
            monitor,
            dimension: config.api.embedding_dimension,
        }
    }

    /// Vector dimension of the configured model.
    #[inline]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    #[inline]
    pub fn model(&self) -> &str {
        self.client.model()
    }

    /// Embed one text, consulting the cache first.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(RagError::InvalidInput(
                "Cannot embed empty text".to_string(),
            ));
        }

        if let Some(vector) = self.cache.get(text, self.model()).await {
            return Ok(vector);
        }

        self.monitor.track_request_timestamp(ApiCategory::Embeddings);

        let client = Arc::clone(&self.client);
        let owned = text.to_string();
        let (vector, usage) = tokio::task::spawn_blocking(move || client.embed(&owned))
            .await
            .map_err(|e| RagError::Transient(format!("Embedding task failed: {e}")))??;

        let tokens = usage.unwrap_or_else(|| approximate_tokens(text));
        self.monitor.track_embedding_usage(tokens, self.model());

        if vector.len() != self.dimension {
            warn!(
                "Embedding dimension {} does not match configured dimension {}",
                vector.len(),
                self.dimension
            );
        }

        self.cache.set(text, self.model(), &vector).await;
        Ok(vector)
    }

    /// Embed many texts, preserving input order.
    ///
    /// Cached entries are served locally; all misses go out in a single API
    /// call and are merged back by original position.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Err(RagError::InvalidInput(
                "Cannot embed an empty batch".to_string(),
            ));
        }
        if let Some(position) = texts.iter().position(|t| t.trim().is_empty()) {
            return Err(RagError::InvalidInput(format!(
                "Cannot embed empty text at batch position {position}"
            )));
        }

        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut miss_indices = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            match self.cache.get(text, self.model()).await {
                Some(vector) => results[i] = Some(vector),
                None => miss_indices.push(i),
            }
        }

        debug!(
            "Embedding batch of {}: {} cached, {} to fetch",
            texts.len(),
            texts.len() - miss_indices.len(),
            miss_indices.len()
        );

        if !miss_indices.is_empty() {
            self.monitor.track_request_timestamp(ApiCategory::Embeddings);

            let miss_texts: Vec<String> =
                miss_indices.iter().map(|&i| texts[i].clone()).collect();
            let client = Arc::clone(&self.client);
            let request_texts = miss_texts.clone();
            let (vectors, usage) =
                tokio::task::spawn_blocking(move || client.embed_batch(&request_texts))
                    .await
                    .map_err(|e| RagError::Transient(format!("Embedding task failed: {e}")))??;

            let tokens = usage.unwrap_or_else(|| {
                miss_texts.iter().map(|t| approximate_tokens(t)).sum()
            });
            self.monitor.track_embedding_usage(tokens, self.model());

            for (&i, vector) in miss_indices.iter().zip(vectors) {
                self.cache.set(&texts[i], self.model(), &vector).await;
                results[i] = Some(vector);
            }
        }

        results
            .into_iter()
            .map(|v| {
                v.ok_or_else(|| {
                    RagError::Permanent("Embedding batch merge left a gap".to_string())
                })
            })
            .collect()
    }
}

/// Fallback token estimate when the API omits usage: one token per four
/// characters, rounded up.
#[inline]
pub fn approximate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}
