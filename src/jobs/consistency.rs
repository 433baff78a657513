use std::collections::HashSet;
use std::sync::Arc;

use tracing::{info, warn};

use crate::Result;
use crate::database::sqlite::ContextItemQueries;
use crate::database::{Database, VectorIndex};
use crate::jobs::JobQueue;

/// Differences between the relational store and the vector index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsistencyReport {
    /// Points in the index with no backing chunk row.
    pub orphaned_points: Vec<i64>,
    /// Chunk rows with no point in the index.
    pub missing_points: Vec<i64>,
}

impl ConsistencyReport {
    #[inline]
    pub fn is_consistent(&self) -> bool {
        self.orphaned_points.is_empty() && self.missing_points.is_empty()
    }
}

/// Reconciles the vector index against the relational store.
///
/// The relational store is the source of truth; repair deletes points it no
/// longer vouches for and re-enqueues embedding jobs for chunks the index
/// has lost.
pub struct ConsistencyValidator {
    database: Database,
    index: Arc<VectorIndex>,
    queue: JobQueue,
}

impl ConsistencyValidator {
    #[inline]
    pub fn new(database: Database, index: Arc<VectorIndex>, queue: JobQueue) -> Self {
        Self {
            database,
            index,
            queue,
        }
    }

    /// Compare both stores without modifying either.
    pub async fn check(&self) -> Result<ConsistencyReport> {
        let chunk_ids: HashSet<i64> = ContextItemQueries::list_all_ids(self.database.pool())
            .await?
            .into_iter()
            .collect();
        let point_ids: HashSet<i64> = self.index.list_point_ids().await?.into_iter().collect();

        let mut orphaned_points: Vec<i64> = point_ids.difference(&chunk_ids).copied().collect();
        let mut missing_points: Vec<i64> = chunk_ids.difference(&point_ids).copied().collect();
        orphaned_points.sort_unstable();
        missing_points.sort_unstable();

        Ok(ConsistencyReport {
            orphaned_points,
            missing_points,
        })
    }

    /// Delete orphaned points and re-enqueue embedding jobs for missing
    /// ones. Returns the drift that was found.
    pub async fn repair(&self) -> Result<ConsistencyReport> {
        let report = self.check().await?;
        if report.is_consistent() {
            return Ok(report);
        }

        warn!(
            "Index drift detected: {} orphaned points, {} missing points",
            report.orphaned_points.len(),
            report.missing_points.len()
        );

        for &point_id in &report.orphaned_points {
            self.index.delete_point(point_id).await?;
        }
        for &chunk_id in &report.missing_points {
            self.queue.enqueue(chunk_id).await?;
        }

        info!(
            "Repair complete: deleted {} points, re-enqueued {} chunks",
            report.orphaned_points.len(),
            report.missing_points.len()
        );
        Ok(report)
    }
}
