#[cfg(test)]
mod tests;

pub mod consistency;
pub mod queue;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::Result;
use crate::database::sqlite::{ContextItemQueries, ContextQueries};
use crate::database::{ChunkPayload, Database, VectorIndex};
use crate::embeddings::EmbeddingService;

pub use consistency::{ConsistencyReport, ConsistencyValidator};
pub use queue::{JobQueue, QueueStats};

/// Worker poll interval when the queue is empty.
const WORKER_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Embeds one chunk and writes its vector point.
pub struct EmbeddingJobRunner {
    database: Database,
    embeddings: Arc<EmbeddingService>,
    index: Arc<VectorIndex>,
}

impl EmbeddingJobRunner {
    #[inline]
    pub fn new(
        database: Database,
        embeddings: Arc<EmbeddingService>,
        index: Arc<VectorIndex>,
    ) -> Self {
        Self {
            database,
            embeddings,
            index,
        }
    }

    /// Process one chunk end to end: load it, embed its content, upsert the
    /// vector point.
    ///
    /// `Ok(false)` means there was nothing to do because the chunk or its
    /// context disappeared, or the chunk has no content. The caller treats
    /// that as completion, not failure.
    pub async fn run(&self, context_item_id: i64) -> Result<bool> {
        let Some(item) =
            ContextItemQueries::get_by_id(self.database.pool(), context_item_id).await?
        else {
            warn!(
                "Context item {} no longer exists; skipping embedding",
                context_item_id
            );
            return Ok(false);
        };

        if item.content.trim().is_empty() {
            warn!("Context item {} has no content; skipping embedding", item.id);
            return Ok(false);
        }

        let Some(context) =
            ContextQueries::get_by_id(self.database.pool(), item.context_id).await?
        else {
            warn!(
                "Context {} no longer exists; skipping embedding for item {}",
                item.context_id, item.id
            );
            return Ok(false);
        };

        let vector = self.embeddings.embed(&item.content).await?;

        let chunk_index = item
            .metadata()
            .map_or(item.chunk_index as u32, |m| m.chunk_index as u32);
        let payload = ChunkPayload {
            context_item_id: item.id,
            context_id: item.context_id,
            title: item.title.clone(),
            content: item.content.clone(),
            context_type: context.context_type.as_str().to_string(),
            chunk_index,
        };

        self.index.upsert(item.id, &vector, payload).await?;

        debug!("Embedded context item {}", item.id);
        Ok(true)
    }
}

/// Drains the embedding queue: claims batches, runs each job, records the
/// outcome through the queue's retry policy.
pub struct JobWorker {
    queue: JobQueue,
    runner: EmbeddingJobRunner,
}

impl JobWorker {
    #[inline]
    pub fn new(queue: JobQueue, runner: EmbeddingJobRunner) -> Self {
        Self { queue, runner }
    }

    #[inline]
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Claim and process one batch. Returns the number of jobs handled.
    pub async fn run_pending_once(&self) -> Result<usize> {
        let jobs = self.queue.next_batch().await?;
        let claimed = jobs.len();

        for job in jobs {
            match self.runner.run(job.context_item_id).await {
                Ok(_) => self.queue.mark_completed(job.id).await?,
                Err(e) => {
                    self.queue.mark_failed(job.id, &e).await?;
                }
            }
        }

        Ok(claimed)
    }

    /// Long-running worker loop. Recovers stuck jobs each cycle and sleeps
    /// between polls when the queue is empty.
    pub async fn run_loop(&self) -> Result<()> {
        info!("Embedding job worker started");
        loop {
            self.queue.reset_stuck().await?;
            let handled = self.run_pending_once().await?;
            if handled == 0 {
                tokio::time::sleep(WORKER_POLL_INTERVAL).await;
            }
        }
    }
}
