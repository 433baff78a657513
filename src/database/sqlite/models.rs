use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Type};

use crate::{RagError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Topic {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub description: String,
    pub system_prompt: Option<String>,
    pub created_date: NaiveDateTime,
    pub updated_date: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTopic {
    pub name: String,
    /// Derived from `name` when absent; disambiguated with a numeric suffix.
    pub slug: Option<String>,
    pub description: String,
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Context {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub context_type: ContextType,
    pub original_content: Option<String>,
    pub chunk_count: i64,
    pub processing_status: ProcessingStatus,
    pub error_message: Option<String>,
    pub created_date: NaiveDateTime,
    pub updated_date: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewContext {
    pub name: String,
    pub description: String,
    pub context_type: ContextType,
    pub original_content: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "UPPERCASE")]
pub enum ContextType {
    Pdf,
    Markdown,
    Faq,
    Webscraper,
}

impl ContextType {
    /// Lowercase tag recorded in chunk metadata and vector payloads.
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match *self {
            ContextType::Pdf => "pdf",
            ContextType::Markdown => "markdown",
            ContextType::Faq => "faq",
            ContextType::Webscraper => "webscraper",
        }
    }

    #[inline]
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "pdf" => Ok(ContextType::Pdf),
            "markdown" => Ok(ContextType::Markdown),
            "faq" => Ok(ContextType::Faq),
            "webscraper" => Ok(ContextType::Webscraper),
            other => Err(RagError::InvalidInput(format!(
                "Unknown context type: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for ContextType {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl std::fmt::Display for ProcessingStatus {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            ProcessingStatus::Pending => write!(f, "Pending"),
            ProcessingStatus::Processing => write!(f, "Processing"),
            ProcessingStatus::Completed => write!(f, "Completed"),
            ProcessingStatus::Failed => write!(f, "Failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ContextItem {
    pub id: i64,
    pub context_id: i64,
    pub title: String,
    pub content: String,
    pub chunk_index: i64,
    pub file_path: Option<String>,
    /// Opaque JSON string; see [`ChunkMetadataJson`].
    pub item_metadata: Option<String>,
    pub created_date: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewContextItem {
    pub context_id: i64,
    pub title: String,
    pub content: String,
    pub chunk_index: i64,
    pub file_path: Option<String>,
    pub item_metadata: Option<String>,
}

/// Structured form of `ContextItem::item_metadata`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadataJson {
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub chunk_size: usize,
    pub content_type: String,
    pub ingestion_timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct EmbeddingJob {
    pub id: i64,
    pub context_item_id: i64,
    pub status: JobStatus,
    pub retry_count: i64,
    pub error_message: Option<String>,
    pub run_after: Option<NaiveDateTime>,
    pub created_date: NaiveDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl Context {
    #[inline]
    pub fn is_completed(&self) -> bool {
        self.processing_status == ProcessingStatus::Completed
    }

    #[inline]
    pub fn is_failed(&self) -> bool {
        self.processing_status == ProcessingStatus::Failed
    }
}

impl EmbeddingJob {
    #[inline]
    pub fn can_retry(&self, max_retries: u32) -> bool {
        self.status == JobStatus::Failed && self.retry_count < i64::from(max_retries)
    }
}

impl ContextItem {
    /// Parse the metadata JSON, tolerating absent or malformed values.
    #[inline]
    pub fn metadata(&self) -> Option<ChunkMetadataJson> {
        self.item_metadata
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }
}

/// Derive a URL-safe slug from a topic name, truncated to 50 characters.
#[inline]
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_dash = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    let trimmed = slug.trim_matches('-');
    let truncated: String = trimmed.chars().take(50).collect();
    let final_slug = truncated.trim_end_matches('-').to_string();
    if final_slug.is_empty() {
        "topic".to_string()
    } else {
        final_slug
    }
}
