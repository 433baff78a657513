// LanceDB vector index module
// Stores one point per context item; a derived projection of the relational
// store, kept fresh by the embedding job runner.

pub mod vector_index;

use serde::{Deserialize, Serialize};

/// Payload stored alongside each vector point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPayload {
    pub context_item_id: i64,
    pub context_id: i64,
    pub title: String,
    pub content: String,
    /// Lowercase context type tag ("pdf", "markdown", "faq", "webscraper").
    pub context_type: String,
    pub chunk_index: u32,
}

/// A candidate returned from filtered kNN search, before reranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub context_item_id: i64,
    pub context_id: i64,
    pub title: String,
    pub content: String,
    pub context_type: String,
    /// Cosine similarity, higher is better.
    pub score: f32,
}
