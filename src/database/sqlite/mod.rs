use anyhow::{Context as _, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use tracing::{debug, info};

#[cfg(test)]
mod tests;

pub mod models;
pub mod queries;

pub use models::{
    ChunkMetadataJson, Context, ContextItem, ContextType, EmbeddingJob, JobStatus, NewContext,
    NewContextItem, NewTopic, ProcessingStatus, Topic, slugify,
};
pub use queries::{ContextItemQueries, ContextQueries, TopicQueries};

pub type DbPool = Pool<Sqlite>;

const SCHEMA: &str = include_str!("schema.sql");

/// Relational store owning chunk identity; source of truth for topic and
/// context membership. The vector index is a derived projection.
#[derive(Debug, Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    #[inline]
    pub async fn new<P: AsRef<Path>>(database_path: P) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .context("Failed to create database connection pool")?;

        let database = Self { pool };
        database.initialize_schema().await?;

        Ok(database)
    }

    #[inline]
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    async fn initialize_schema(&self) -> Result<()> {
        info!("Initializing database schema");

        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .context("Failed to initialize database schema")?;

        debug!("Database schema ready");
        Ok(())
    }

    #[inline]
    pub async fn initialize_from_data_dir(data_dir: &Path) -> Result<Self> {
        let db_path = data_dir.join("metadata.db");

        std::fs::create_dir_all(data_dir).with_context(|| {
            format!("Failed to create data directory: {}", data_dir.display())
        })?;

        Self::new(&db_path).await
    }
}
