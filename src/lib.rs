use thiserror::Error;

pub type Result<T> = std::result::Result<T, RagError>;

#[derive(Error, Debug)]
pub enum RagError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Permanent error: {0}")]
    Permanent(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Chunk error: {0}")]
    Chunk(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl RagError {
    /// Whether a background job should retry after this error.
    ///
    /// Caller errors and definitively-invalid work are never retried;
    /// everything else is assumed recoverable.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            RagError::InvalidInput(_)
                | RagError::NotFound(_)
                | RagError::Permanent(_)
                | RagError::Config(_)
        )
    }
}

/// Install the default `tracing` subscriber, filtered by `RUST_LOG`.
///
/// Called once at startup by the embedding application; tests leave
/// logging uninitialized.
#[inline]
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}

pub mod cache;
pub mod chunking;
pub mod config;
pub mod database;
pub mod embeddings;
pub mod ingest;
pub mod jobs;
pub mod llm;
pub mod parsers;
pub mod query;
pub mod rerank;
pub mod usage;
