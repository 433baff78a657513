use anyhow::{Context as _, Result};
use chrono::Utc;
use itertools::Itertools;
use sqlx::SqlitePool;
use tracing::debug;

use super::models::{
    Context, ContextItem, NewContext, NewContextItem, NewTopic, ProcessingStatus, Topic, slugify,
};

/// Build a `?, ?, ...` placeholder list for an IN clause.
pub(crate) fn placeholders(count: usize) -> String {
    std::iter::repeat_n("?", count).join(", ")
}

pub struct TopicQueries;

impl TopicQueries {
    /// Insert a topic, deriving a unique slug from the name when one is not
    /// supplied. Collisions are disambiguated with a numeric suffix.
    #[inline]
    pub async fn create(pool: &SqlitePool, new_topic: NewTopic) -> Result<Topic> {
        let base_slug = match &new_topic.slug {
            Some(slug) if !slug.trim().is_empty() => slug.clone(),
            _ => slugify(&new_topic.name),
        };

        let mut slug = base_slug.clone();
        let mut suffix = 2;
        while Self::get_by_slug(pool, &slug).await?.is_some() {
            slug = format!("{base_slug}-{suffix}");
            suffix += 1;
        }

        let now = Utc::now().naive_utc();
        let id = sqlx::query(
            "INSERT INTO topics (name, slug, description, system_prompt, created_date, updated_date)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&new_topic.name)
        .bind(&slug)
        .bind(&new_topic.description)
        .bind(&new_topic.system_prompt)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await
        .context("Failed to create topic")?
        .last_insert_rowid();

        debug!("Created topic {} with slug {}", id, slug);

        Self::get_by_id(pool, id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Failed to retrieve created topic"))
    }

    #[inline]
    pub async fn get_by_id(pool: &SqlitePool, id: i64) -> Result<Option<Topic>> {
        sqlx::query_as::<_, Topic>("SELECT * FROM topics WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
            .context("Failed to get topic by id")
    }

    #[inline]
    pub async fn get_by_slug(pool: &SqlitePool, slug: &str) -> Result<Option<Topic>> {
        sqlx::query_as::<_, Topic>("SELECT * FROM topics WHERE slug = ?")
            .bind(slug)
            .fetch_optional(pool)
            .await
            .context("Failed to get topic by slug")
    }

    #[inline]
    pub async fn list_all(pool: &SqlitePool) -> Result<Vec<Topic>> {
        sqlx::query_as::<_, Topic>("SELECT * FROM topics ORDER BY created_date DESC")
            .fetch_all(pool)
            .await
            .context("Failed to list topics")
    }

    #[inline]
    pub async fn delete(pool: &SqlitePool, id: i64) -> Result<bool> {
        let affected = sqlx::query("DELETE FROM topics WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await
            .context("Failed to delete topic")?
            .rows_affected();
        Ok(affected > 0)
    }

    #[inline]
    pub async fn attach_context(pool: &SqlitePool, topic_id: i64, context_id: i64) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO topic_contexts (topic_id, context_id) VALUES (?, ?)",
        )
        .bind(topic_id)
        .bind(context_id)
        .execute(pool)
        .await
        .context("Failed to attach context to topic")?;
        Ok(())
    }

    #[inline]
    pub async fn detach_context(pool: &SqlitePool, topic_id: i64, context_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM topic_contexts WHERE topic_id = ? AND context_id = ?")
            .bind(topic_id)
            .bind(context_id)
            .execute(pool)
            .await
            .context("Failed to detach context from topic")?;
        Ok(())
    }

    /// Resolve the distinct context ids attached to any of the given topics.
    #[inline]
    pub async fn resolve_context_ids(pool: &SqlitePool, topic_ids: &[i64]) -> Result<Vec<i64>> {
        if topic_ids.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT DISTINCT context_id FROM topic_contexts WHERE topic_id IN ({}) ORDER BY context_id",
            placeholders(topic_ids.len())
        );

        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        for id in topic_ids {
            query = query.bind(id);
        }

        query
            .fetch_all(pool)
            .await
            .context("Failed to resolve context ids for topics")
    }
}

pub struct ContextQueries;

impl ContextQueries {
    #[inline]
    pub async fn create(pool: &SqlitePool, new_context: NewContext) -> Result<Context> {
        let now = Utc::now().naive_utc();
        let id = sqlx::query(
            "INSERT INTO contexts (name, description, context_type, original_content, processing_status, created_date, updated_date)
             VALUES (?, ?, ?, ?, 'pending', ?, ?)",
        )
        .bind(&new_context.name)
        .bind(&new_context.description)
        .bind(new_context.context_type)
        .bind(&new_context.original_content)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await
        .context("Failed to create context")?
        .last_insert_rowid();

        Self::get_by_id(pool, id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Failed to retrieve created context"))
    }

    #[inline]
    pub async fn get_by_id(pool: &SqlitePool, id: i64) -> Result<Option<Context>> {
        sqlx::query_as::<_, Context>("SELECT * FROM contexts WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
            .context("Failed to get context by id")
    }

    #[inline]
    pub async fn list_all(pool: &SqlitePool) -> Result<Vec<Context>> {
        sqlx::query_as::<_, Context>("SELECT * FROM contexts ORDER BY created_date DESC")
            .fetch_all(pool)
            .await
            .context("Failed to list contexts")
    }

    #[inline]
    pub async fn delete(pool: &SqlitePool, id: i64) -> Result<bool> {
        let affected = sqlx::query("DELETE FROM contexts WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await
            .context("Failed to delete context")?
            .rows_affected();
        Ok(affected > 0)
    }

    #[inline]
    pub async fn set_status(
        pool: &SqlitePool,
        id: i64,
        status: ProcessingStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().naive_utc();
        sqlx::query(
            "UPDATE contexts SET processing_status = ?, error_message = ?, updated_date = ? WHERE id = ?",
        )
        .bind(status)
        .bind(error_message)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await
        .context("Failed to update context status")?;
        Ok(())
    }

    #[inline]
    pub async fn set_chunk_count(pool: &SqlitePool, id: i64, chunk_count: i64) -> Result<()> {
        let now = Utc::now().naive_utc();
        sqlx::query("UPDATE contexts SET chunk_count = ?, updated_date = ? WHERE id = ?")
            .bind(chunk_count)
            .bind(now)
            .bind(id)
            .execute(pool)
            .await
            .context("Failed to update context chunk count")?;
        Ok(())
    }

    /// Live count of persisted chunks; used for reconciliation against the
    /// cached `chunk_count` column.
    #[inline]
    pub async fn count_items(pool: &SqlitePool, context_id: i64) -> Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM context_items WHERE context_id = ?")
            .bind(context_id)
            .fetch_one(pool)
            .await
            .context("Failed to count context items")
    }
}

pub struct ContextItemQueries;

impl ContextItemQueries {
    /// Insert a batch of chunks in a single transaction and return the stored
    /// rows with their assigned ids.
    #[inline]
    pub async fn insert_batch(
        pool: &SqlitePool,
        items: Vec<NewContextItem>,
    ) -> Result<Vec<ContextItem>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let now = Utc::now().naive_utc();
        let mut tx = pool
            .begin()
            .await
            .context("Failed to begin chunk insert transaction")?;

        let mut ids = Vec::with_capacity(items.len());
        for item in &items {
            let id = sqlx::query(
                "INSERT INTO context_items (context_id, title, content, chunk_index, file_path, item_metadata, created_date)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(item.context_id)
            .bind(&item.title)
            .bind(&item.content)
            .bind(item.chunk_index)
            .bind(&item.file_path)
            .bind(&item.item_metadata)
            .bind(now)
            .execute(&mut *tx)
            .await
            .context("Failed to insert context item")?
            .last_insert_rowid();
            ids.push(id);
        }

        tx.commit()
            .await
            .context("Failed to commit chunk insert transaction")?;

        debug!("Inserted {} context items", ids.len());

        let sql = format!(
            "SELECT * FROM context_items WHERE id IN ({}) ORDER BY chunk_index",
            placeholders(ids.len())
        );
        let mut query = sqlx::query_as::<_, ContextItem>(&sql);
        for id in &ids {
            query = query.bind(id);
        }
        query
            .fetch_all(pool)
            .await
            .context("Failed to fetch inserted context items")
    }

    #[inline]
    pub async fn get_by_id(pool: &SqlitePool, id: i64) -> Result<Option<ContextItem>> {
        sqlx::query_as::<_, ContextItem>("SELECT * FROM context_items WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
            .context("Failed to get context item by id")
    }

    #[inline]
    pub async fn list_by_context(pool: &SqlitePool, context_id: i64) -> Result<Vec<ContextItem>> {
        sqlx::query_as::<_, ContextItem>(
            "SELECT * FROM context_items WHERE context_id = ? ORDER BY chunk_index",
        )
        .bind(context_id)
        .fetch_all(pool)
        .await
        .context("Failed to list context items")
    }

    #[inline]
    pub async fn list_ids_by_context(pool: &SqlitePool, context_id: i64) -> Result<Vec<i64>> {
        sqlx::query_scalar::<_, i64>(
            "SELECT id FROM context_items WHERE context_id = ? ORDER BY chunk_index",
        )
        .bind(context_id)
        .fetch_all(pool)
        .await
        .context("Failed to list context item ids")
    }

    /// Remove all chunks of a context; embedding jobs cascade with them.
    /// Returns the number of rows removed.
    #[inline]
    pub async fn delete_by_context(pool: &SqlitePool, context_id: i64) -> Result<u64> {
        let removed = sqlx::query("DELETE FROM context_items WHERE context_id = ?")
            .bind(context_id)
            .execute(pool)
            .await
            .context("Failed to delete context items")?
            .rows_affected();
        Ok(removed)
    }

    /// Every chunk id in the store; drives reconciliation against the
    /// vector index.
    #[inline]
    pub async fn list_all_ids(pool: &SqlitePool) -> Result<Vec<i64>> {
        sqlx::query_scalar::<_, i64>("SELECT id FROM context_items ORDER BY id")
            .fetch_all(pool)
            .await
            .context("Failed to list all context item ids")
    }

    /// Admin content edit; the caller re-enqueues an embedding job so the
    /// vector point is overwritten.
    #[inline]
    pub async fn update_content(pool: &SqlitePool, id: i64, content: &str) -> Result<bool> {
        let affected = sqlx::query("UPDATE context_items SET content = ? WHERE id = ?")
            .bind(content)
            .bind(id)
            .execute(pool)
            .await
            .context("Failed to update context item content")?
            .rows_affected();
        Ok(affected > 0)
    }
}
