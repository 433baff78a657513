use std::sync::Mutex;

use fastembed::{RerankInitOptions, RerankerModel, TextRerank};
use tracing::info;

use crate::rerank::CrossEncoder;
use crate::{RagError, Result};

/// Cross-encoder backed by a local fastembed reranking model.
///
/// Model weights are downloaded on first construction and the loaded model
/// is reused for the life of the process.
pub struct FastembedCrossEncoder {
    model: Mutex<TextRerank>,
}

impl FastembedCrossEncoder {
    pub fn new() -> Result<Self> {
        info!("Loading cross-encoder model {:?}", RerankerModel::BGERerankerBase);
        let model = TextRerank::try_new(RerankInitOptions::new(RerankerModel::BGERerankerBase))
            .map_err(|e| RagError::Permanent(format!("Failed to load reranker model: {e}")))?;
        Ok(Self {
            model: Mutex::new(model),
        })
    }
}

impl CrossEncoder for FastembedCrossEncoder {
    fn score(&self, query: &str, documents: &[&str]) -> Result<Vec<f32>> {
        let model = self
            .model
            .lock()
            .map_err(|e| RagError::Permanent(format!("Reranker model lock poisoned: {e}")))?;

        let results = model
            .rerank(query, documents.to_vec(), false, None)
            .map_err(|e| RagError::Transient(format!("Cross-encoder scoring failed: {e}")))?;

        // fastembed returns results ordered by score; restore input order.
        let mut scores = vec![0.0_f32; documents.len()];
        for result in results {
            if let Some(slot) = scores.get_mut(result.index) {
                *slot = result.score;
            }
        }
        Ok(scores)
    }
}
