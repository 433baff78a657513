pub mod lancedb;
pub mod sqlite;

pub use lancedb::{ChunkPayload, ScoredChunk, vector_index::VectorIndex};
pub use sqlite::Database;
