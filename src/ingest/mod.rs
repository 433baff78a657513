#[cfg(test)]
mod tests;

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::chunking::{ChunkerConfig, chunk_for_type};
use crate::config::ScraperConfig;
use crate::database::sqlite::{
    ChunkMetadataJson, Context, ContextItemQueries, ContextQueries, NewContextItem,
    ProcessingStatus,
};
use crate::database::{Database, VectorIndex};
use crate::jobs::JobQueue;
use crate::parsers::{SourceSpec, parse};
use crate::{RagError, Result};

/// Drives a context from raw source to queued embedding work.
///
/// Parsing and chunking run inline; embedding is deferred to the job queue
/// so ingestion latency stays bounded by local work plus one parse. The
/// context's `processing_status` tracks the inline part only.
pub struct IngestionCoordinator {
    database: Database,
    index: Arc<VectorIndex>,
    queue: JobQueue,
    scraper_config: ScraperConfig,
}

impl IngestionCoordinator {
    #[inline]
    pub fn new(
        database: Database,
        index: Arc<VectorIndex>,
        queue: JobQueue,
        scraper_config: ScraperConfig,
    ) -> Self {
        Self {
            database,
            index,
            queue,
            scraper_config,
        }
    }

    /// Ingest a source into an existing context: parse, chunk, persist the
    /// chunks, and queue one embedding job per chunk.
    ///
    /// Re-ingesting replaces the context's previous chunks and vector
    /// points. Returns the number of chunks produced. A source with no
    /// usable text returns zero, leaves any previously ingested chunks in
    /// place, and puts the context back to `Pending`; only a nonzero chunk
    /// count completes the context.
    pub async fn ingest(&self, context_id: i64, source: SourceSpec) -> Result<usize> {
        let pool = self.database.pool();
        let context = ContextQueries::get_by_id(pool, context_id)
            .await?
            .ok_or_else(|| RagError::NotFound(format!("Context {context_id} not found")))?;

        ContextQueries::set_status(pool, context_id, ProcessingStatus::Processing, None).await?;

        match self.ingest_inner(&context, source).await {
            Ok(0) => {
                warn!(
                    "Context {} source produced no chunks; leaving existing chunks untouched",
                    context_id
                );
                ContextQueries::set_status(pool, context_id, ProcessingStatus::Pending, None)
                    .await?;
                Ok(0)
            }
            Ok(chunk_count) => {
                ContextQueries::set_chunk_count(pool, context_id, chunk_count as i64).await?;
                ContextQueries::set_status(pool, context_id, ProcessingStatus::Completed, None)
                    .await?;
                info!(
                    "Ingested context {} into {} chunks",
                    context_id, chunk_count
                );
                Ok(chunk_count)
            }
            Err(e) => {
                let message = e.to_string();
                warn!("Ingestion failed for context {}: {}", context_id, message);
                ContextQueries::set_status(
                    pool,
                    context_id,
                    ProcessingStatus::Failed,
                    Some(&message),
                )
                .await?;
                Err(e)
            }
        }
    }

    async fn ingest_inner(&self, context: &Context, source: SourceSpec) -> Result<usize> {
        let pool = self.database.pool();

        let text = parse(context.context_type, &source, &self.scraper_config).await?;
        if text.trim().is_empty() {
            debug!("Context {} source produced no text", context.id);
            return Ok(0);
        }

        let chunks = chunk_for_type(
            context.context_type,
            &text,
            ChunkerConfig::for_type(context.context_type),
        )?;
        if chunks.is_empty() {
            debug!("Context {} source produced no chunks", context.id);
            return Ok(0);
        }

        self.clear_previous_chunks(context.id).await?;

        let total_chunks = chunks.len();
        let ingestion_timestamp = Utc::now().to_rfc3339();
        let file_path = source.file_path().map(|p| p.display().to_string());

        let items: Vec<NewContextItem> = chunks
            .into_iter()
            .enumerate()
            .map(|(i, content)| {
                let chunk_index = i + 1;
                let metadata = ChunkMetadataJson {
                    chunk_index,
                    total_chunks,
                    chunk_size: content.chars().count(),
                    content_type: context.context_type.as_str().to_string(),
                    ingestion_timestamp: ingestion_timestamp.clone(),
                };
                NewContextItem {
                    context_id: context.id,
                    title: format!("{} - Chunk {chunk_index}", context.name),
                    content,
                    chunk_index: chunk_index as i64,
                    file_path: file_path.clone(),
                    item_metadata: serde_json::to_string(&metadata).ok(),
                }
            })
            .collect();

        ContextItemQueries::insert_batch(pool, items).await?;
        self.queue.enqueue_for_context(context.id).await?;

        Ok(total_chunks)
    }

    /// Drop the chunks and vector points from an earlier ingestion of this
    /// context. Queued jobs cascade away with their chunks.
    async fn clear_previous_chunks(&self, context_id: i64) -> Result<()> {
        let removed =
            ContextItemQueries::delete_by_context(self.database.pool(), context_id).await?;
        if removed > 0 {
            debug!(
                "Replaced {} existing chunks for context {}",
                removed, context_id
            );
        }
        self.index.delete_context(context_id).await?;
        Ok(())
    }

    /// Queue a fresh embedding job for every chunk of a context without
    /// re-parsing or re-chunking. Used after a model or dimension change.
    pub async fn regenerate_embeddings(&self, context_id: i64) -> Result<usize> {
        let pool = self.database.pool();
        ContextQueries::get_by_id(pool, context_id)
            .await?
            .ok_or_else(|| RagError::NotFound(format!("Context {context_id} not found")))?;

        ContextQueries::set_status(pool, context_id, ProcessingStatus::Pending, None).await?;
        let queued = self.queue.enqueue_for_context(context_id).await?;
        info!(
            "Queued {} embedding regenerations for context {}",
            queued, context_id
        );
        Ok(queued as usize)
    }
}
