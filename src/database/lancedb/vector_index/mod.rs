
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arrow::array::{Array, FixedSizeListArray, Float32Array, RecordBatchIterator, StringArray, UInt32Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use futures::TryStreamExt;
use itertools::Itertools;
use lancedb::query::{ExecutableQuery, QueryBase, Select};
use lancedb::{Connection, DistanceType};
use tracing::{debug, info, warn};

use super::{ChunkPayload, ScoredChunk};
use crate::config::PipelineConfig;
use crate::database::sqlite::{Database, TopicQueries};
use crate::{RagError, Result};

/// Vector index over chunk embeddings, keyed by context item id.
///
/// Searches are scoped to the contexts attached to the requested topics; the
/// topic -> context resolution runs through a short-TTL in-memory map to avoid
/// repeated joins.
pub struct VectorIndex {
    connection: Connection,
    table_name: String,
    vector_dimension: usize,
    database: Database,
    resolution_ttl: Duration,
    resolution_cache: Arc<Mutex<HashMap<Vec<i64>, (Instant, Vec<i64>)>>>,
}

impl VectorIndex {
    #[inline]
    pub async fn new(config: &PipelineConfig, database: Database) -> Result<Self> {
        let db_path = config
            .vector_db_path()
            .map_err(|e| RagError::Config(format!("Failed to resolve vector path: {e}")))?;
        debug!("Initializing LanceDB at path: {:?}", db_path);

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                RagError::Database(format!("Failed to create vector database directory: {e}"))
            })?;
        }

        let uri = format!("file://{}", db_path.display());
        let connection = lancedb::connect(&uri)
            .execute()
            .await
            .map_err(|e| RagError::Database(format!("Failed to connect to LanceDB: {e}")))?;

        let index = Self {
            connection,
            table_name: config.search.collection.clone(),
            vector_dimension: config.api.embedding_dimension,
            database,
            resolution_ttl: Duration::from_secs(config.search.topic_resolution_ttl_seconds),
            resolution_cache: Arc::new(Mutex::new(HashMap::new())),
        };

        index.ensure_collection().await?;

        info!("Vector index initialized");
        Ok(index)
    }

    /// Create the collection if it does not exist. Idempotent; an existing
    /// table is treated as success.
    #[inline]
    pub async fn ensure_collection(&self) -> Result<()> {
        let table_names = self
            .connection
            .table_names()
            .execute()
            .await
            .map_err(|e| RagError::Database(format!("Failed to list tables: {e}")))?;

        if table_names.contains(&self.table_name) {
            return Ok(());
        }

        let schema = self.create_schema();
        self.connection
            .create_empty_table(&self.table_name, schema)
            .execute()
            .await
            .map_err(|e| RagError::Database(format!("Failed to create vector table: {e}")))?;

        info!(
            "Created vector table {} with {} dimensions",
            self.table_name, self.vector_dimension
        );
        Ok(())
    }

    /// Destructive recreate, used for full re-index.
    #[inline]
    pub async fn reset_collection(&self) -> Result<()> {
        let table_names = self
            .connection
            .table_names()
            .execute()
            .await
            .map_err(|e| RagError::Database(format!("Failed to list tables: {e}")))?;

        if table_names.contains(&self.table_name) {
            warn!("Dropping vector table {} for full re-index", self.table_name);
            self.connection
                .drop_table(&self.table_name)
                .await
                .map_err(|e| RagError::Database(format!("Failed to drop vector table: {e}")))?;
        }

        self.ensure_collection().await
    }

    fn create_schema(&self) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, false)),
                    self.vector_dimension as i32,
                ),
                false,
            ),
            Field::new("context_item_id", DataType::Utf8, false),
            Field::new("context_id", DataType::Utf8, false),
            Field::new("title", DataType::Utf8, false),
            Field::new("content", DataType::Utf8, false),
            Field::new("context_type", DataType::Utf8, false),
            Field::new("chunk_index", DataType::UInt32, false),
            Field::new("created_at", DataType::Utf8, false),
        ]))
    }

    /// Idempotent overwrite of the point for one context item.
    #[inline]
    pub async fn upsert(
        &self,
        point_id: i64,
        vector: &[f32],
        payload: ChunkPayload,
    ) -> Result<()> {
        if vector.len() != self.vector_dimension {
            return Err(RagError::InvalidInput(format!(
                "Vector dimension mismatch: expected {}, got {}",
                self.vector_dimension,
                vector.len()
            )));
        }

        self.ensure_collection().await?;

        let table = self.open_table().await?;

        // Overwrite-by-id: remove any existing point before inserting.
        table
            .delete(&format!("context_item_id = '{point_id}'"))
            .await
            .map_err(|e| RagError::Database(format!("Failed to delete existing point: {e}")))?;

        let record_batch = self.create_record_batch(point_id, vector, &payload)?;
        let schema = record_batch.schema();
        let reader = RecordBatchIterator::new(std::iter::once(Ok(record_batch)), schema);
        table
            .add(reader)
            .execute()
            .await
            .map_err(|e| RagError::Database(format!("Failed to insert point: {e}")))?;

        debug!("Upserted vector point for context item {}", point_id);
        Ok(())
    }

    fn create_record_batch(
        &self,
        point_id: i64,
        vector: &[f32],
        payload: &ChunkPayload,
    ) -> Result<RecordBatch> {
        let schema = self.create_schema();

        let values_array = Float32Array::from(vector.to_vec());
        let field = Arc::new(Field::new("item", DataType::Float32, false));
        let vector_array = FixedSizeListArray::try_new(
            field,
            self.vector_dimension as i32,
            Arc::new(values_array),
            None,
        )
        .map_err(|e| RagError::Database(format!("Failed to create vector array: {e}")))?;

        let arrays: Vec<Arc<dyn Array>> = vec![
            Arc::new(StringArray::from(vec![point_id.to_string()])),
            Arc::new(vector_array),
            Arc::new(StringArray::from(vec![payload.context_item_id.to_string()])),
            Arc::new(StringArray::from(vec![payload.context_id.to_string()])),
            Arc::new(StringArray::from(vec![payload.title.clone()])),
            Arc::new(StringArray::from(vec![payload.content.clone()])),
            Arc::new(StringArray::from(vec![payload.context_type.clone()])),
            Arc::new(UInt32Array::from(vec![payload.chunk_index])),
            Arc::new(StringArray::from(vec![chrono::Utc::now().to_rfc3339()])),
        ];

        RecordBatch::try_new(schema, arrays)
            .map_err(|e| RagError::Database(format!("Failed to create record batch: {e}")))
    }

    /// Filtered cosine kNN over the contexts attached to `topic_ids`.
    ///
    /// An empty resolved context set short-circuits to an empty result with no
    /// backend call. `limit` is a hard upper bound.
    #[inline]
    pub async fn search(
        &self,
        query_vector: &[f32],
        topic_ids: &[i64],
        limit: usize,
    ) -> Result<Vec<ScoredChunk>> {
        if query_vector.is_empty() {
            return Err(RagError::InvalidInput("Query vector is empty".to_string()));
        }
        if topic_ids.is_empty() {
            return Err(RagError::InvalidInput("No topics selected".to_string()));
        }

        let context_ids = self.resolve_context_ids(topic_ids).await?;
        if context_ids.is_empty() {
            debug!("No contexts attached to topics {:?}; skipping search", topic_ids);
            return Ok(Vec::new());
        }

        let table = self.open_table().await?;

        let filter = format!(
            "context_id IN ({})",
            context_ids.iter().map(|id| format!("'{id}'")).join(", ")
        );

        let results = table
            .vector_search(query_vector)
            .map_err(|e| RagError::Database(format!("Failed to create vector search: {e}")))?
            .column("vector")
            .distance_type(DistanceType::Cosine)
            .only_if(filter)
            .limit(limit)
            .execute()
            .await
            .map_err(|e| RagError::Database(format!("Failed to execute search: {e}")))?;

        let mut chunks = Vec::new();
        let mut stream = results;
        while let Some(batch) = stream
            .try_next()
            .await
            .map_err(|e| RagError::Database(format!("Failed to read result stream: {e}")))?
        {
            chunks.extend(self.parse_search_batch(&batch)?);
        }

        chunks.truncate(limit);
        debug!("Vector search returned {} candidates", chunks.len());
        Ok(chunks)
    }

    fn parse_search_batch(&self, batch: &RecordBatch) -> Result<Vec<ScoredChunk>> {
        fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
            batch
                .column_by_name(name)
                .ok_or_else(|| RagError::Database(format!("Missing {name} column")))?
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(|| RagError::Database(format!("Invalid {name} column type")))
        }

        let item_ids = string_column(batch, "context_item_id")?;
        let context_ids = string_column(batch, "context_id")?;
        let titles = string_column(batch, "title")?;
        let contents = string_column(batch, "content")?;
        let context_types = string_column(batch, "context_type")?;

        let distances = batch
            .column_by_name("_distance")
            .map(|col| col.as_any().downcast_ref::<Float32Array>());

        let mut results = Vec::with_capacity(batch.num_rows());
        for row in 0..batch.num_rows() {
            let distance = distances
                .flatten()
                .map_or(0.0, |d| if d.is_null(row) { 0.0 } else { d.value(row) });

            results.push(ScoredChunk {
                context_item_id: item_ids.value(row).parse().unwrap_or_default(),
                context_id: context_ids.value(row).parse().unwrap_or_default(),
                title: titles.value(row).to_string(),
                content: contents.value(row).to_string(),
                context_type: context_types.value(row).to_string(),
                // Cosine distance -> similarity, higher is better.
                score: 1.0 - distance,
            });
        }

        Ok(results)
    }

    /// Resolve topic ids to context ids through the TTL cache.
    async fn resolve_context_ids(&self, topic_ids: &[i64]) -> Result<Vec<i64>> {
        let key: Vec<i64> = topic_ids.iter().copied().sorted().dedup().collect();

        {
            let cache = self
                .resolution_cache
                .lock()
                .map_err(|e| RagError::Database(format!("Resolution cache lock poisoned: {e}")))?;
            if let Some((stored_at, ids)) = cache.get(&key) {
                if stored_at.elapsed() < self.resolution_ttl {
                    return Ok(ids.clone());
                }
            }
        }

        let ids = TopicQueries::resolve_context_ids(self.database.pool(), &key).await?;

        let mut cache = self
            .resolution_cache
            .lock()
            .map_err(|e| RagError::Database(format!("Resolution cache lock poisoned: {e}")))?;
        cache.insert(key, (Instant::now(), ids.clone()));

        Ok(ids)
    }

    /// Drop cached topic resolutions; used after admin changes to topic or
    /// context membership when bounded staleness is not acceptable.
    #[inline]
    pub fn invalidate_resolution_cache(&self) {
        if let Ok(mut cache) = self.resolution_cache.lock() {
            cache.clear();
        }
    }

    /// Delete all points belonging to one context.
    #[inline]
    pub async fn delete_context(&self, context_id: i64) -> Result<()> {
        let table = self.open_table().await?;
        table
            .delete(&format!("context_id = '{context_id}'"))
            .await
            .map_err(|e| RagError::Database(format!("Failed to delete context points: {e}")))?;
        info!("Deleted vector points for context {}", context_id);
        Ok(())
    }

    /// Delete the point for one context item, if present.
    #[inline]
    pub async fn delete_point(&self, point_id: i64) -> Result<()> {
        let table = self.open_table().await?;
        table
            .delete(&format!("context_item_id = '{point_id}'"))
            .await
            .map_err(|e| RagError::Database(format!("Failed to delete point: {e}")))?;
        Ok(())
    }

    /// All context item ids currently present in the index. Used by the
    /// consistency validator.
    #[inline]
    pub async fn list_point_ids(&self) -> Result<Vec<i64>> {
        let table = self.open_table().await?;

        let mut stream = table
            .query()
            .select(Select::Columns(vec!["context_item_id".to_string()]))
            .execute()
            .await
            .map_err(|e| RagError::Database(format!("Failed to scan point ids: {e}")))?;

        let mut ids = Vec::new();
        while let Some(batch) = stream
            .try_next()
            .await
            .map_err(|e| RagError::Database(format!("Failed to read id scan stream: {e}")))?
        {
            let column = batch
                .column_by_name("context_item_id")
                .ok_or_else(|| RagError::Database("Missing context_item_id column".to_string()))?
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(|| {
                    RagError::Database("Invalid context_item_id column type".to_string())
                })?;
            for row in 0..batch.num_rows() {
                if let Ok(id) = column.value(row).parse() {
                    ids.push(id);
                }
            }
        }

        Ok(ids)
    }

    /// Number of points for one context item; 1 after a successful upsert.
    #[inline]
    pub async fn count_points_for_item(&self, point_id: i64) -> Result<u64> {
        let table = self.open_table().await?;
        let count = table
            .count_rows(Some(format!("context_item_id = '{point_id}'")))
            .await
            .map_err(|e| RagError::Database(format!("Failed to count rows: {e}")))?;
        Ok(count as u64)
    }

    #[inline]
    pub async fn count(&self) -> Result<u64> {
        let table = self.open_table().await?;
        let count = table
            .count_rows(None)
            .await
            .map_err(|e| RagError::Database(format!("Failed to count rows: {e}")))?;
        Ok(count as u64)
    }

    async fn open_table(&self) -> Result<lancedb::Table> {
        self.connection
            .open_table(&self.table_name)
            .execute()
            .await
            .map_err(|e| RagError::Database(format!("Failed to open vector table: {e}")))
    }
}
