
#[cfg(feature = "fastembed")]
pub mod cross_encoder;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::database::ScoredChunk;
use crate::{RagError, Result};

/// Scores (query, document) pairs jointly. Implementations are expected to
/// be expensive and are called through a thread-pool bridge.
pub trait CrossEncoder: Send + Sync {
    /// One score per document, higher is more relevant.
    fn score(&self, query: &str, documents: &[&str]) -> Result<Vec<f32>>;
}

/// A candidate after reranking; keeps the original retrieval score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankedChunk {
    #[serde(flatten)]
    pub chunk: ScoredChunk,
    pub rerank_score: f32,
}

/// Cross-encoder reranking stage. The model behind the encoder is loaded
/// once and shared for the life of the process.
pub struct Reranker {
    encoder: Arc<dyn CrossEncoder>,
}

impl Reranker {
    #[inline]
    pub fn new(encoder: Arc<dyn CrossEncoder>) -> Self {
        Self { encoder }
    }

    /// Re-score `candidates` against `query` and order them by descending
    /// `rerank_score`, stable with respect to the original order on ties.
    /// Truncates to `top_k` when given.
    pub async fn rerank(
        &self,
        query: &str,
        candidates: Vec<ScoredChunk>,
        top_k: Option<usize>,
    ) -> Result<Vec<RerankedChunk>> {
        if query.trim().is_empty() {
            return Err(RagError::InvalidInput(
                "Cannot rerank with an empty query".to_string(),
            ));
        }
        if candidates.is_empty() {
            return Err(RagError::InvalidInput(
                "Cannot rerank an empty candidate list".to_string(),
            ));
        }

        let encoder = Arc::clone(&self.encoder);
        let query = query.to_string();
        let mut reranked = tokio::task::spawn_blocking(move || {
            let documents: Vec<&str> = candidates.iter().map(|c| c.content.as_str()).collect();
            let scores = encoder.score(&query, &documents)?;
            if scores.len() != candidates.len() {
                return Err(RagError::Permanent(format!(
                    "Cross-encoder returned {} scores for {} candidates",
                    scores.len(),
                    candidates.len()
                )));
            }

            Ok(candidates
                .into_iter()
                .zip(scores)
                .map(|(chunk, rerank_score)| RerankedChunk {
                    chunk,
                    rerank_score,
                })
                .collect::<Vec<_>>())
        })
        .await
        .map_err(|e| RagError::Transient(format!("Rerank task failed: {e}")))??;

        // Vec::sort_by is stable, so ties keep retrieval order.
        reranked.sort_by(|a, b| {
            b.rerank_score
                .partial_cmp(&a.rerank_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        if let Some(top_k) = top_k {
            reranked.truncate(top_k);
        }

        debug!("Reranked to {} candidates", reranked.len());
        Ok(reranked)
    }
}
