#[cfg(test)]
mod tests;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use thiserror::Error;
use url::Url;

/// Complete configuration for the retrieval and answer-synthesis pipeline.
///
/// Passed by value into each component constructor; tests substitute alternate
/// configs without touching the environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    pub api: ApiConfig,
    pub search: SearchConfig,
    pub cache: CacheConfig,
    pub rate_limits: RateLimitConfig,
    pub jobs: JobConfig,
    pub scraper: ScraperConfig,
    /// Override for the data directory. Defaults to `~/.ragline`.
    #[serde(default)]
    pub base_dir: Option<PathBuf>,
}

/// Remote embedding and chat completion API settings (OpenAI-compatible).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    pub embedding_model: String,
    pub embedding_dimension: usize,
    pub chat_model: String,
    pub chat_temperature: f32,
    pub chat_max_tokens: u32,
    pub timeout_seconds: u64,
    pub retry_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchConfig {
    /// Default kNN candidate count.
    pub limit: usize,
    /// Default rerank truncation.
    pub rerank_top_k: usize,
    /// Staleness bound for the topic -> context id resolution cache.
    pub topic_resolution_ttl_seconds: u64,
    /// Vector table name.
    pub collection: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    pub enabled: bool,
    pub redis_url: String,
    pub key_prefix: String,
    pub namespace: String,
    pub embedding_ttl_days: u64,
    pub query_ttl_seconds: u64,
    pub empty_query_ttl_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    pub embeddings_per_minute: usize,
    pub chat_completions_per_minute: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobConfig {
    /// Maximum retry attempts for a failed embedding job.
    pub max_retries: u32,
    /// Base delay in seconds; actual delay is `base * 2^attempt`.
    pub retry_base_delay_seconds: u64,
    /// Batch size for the worker poll loop.
    pub batch_size: usize,
    /// Items stuck in `processing` longer than this are reset to `pending`.
    pub processing_timeout_seconds: u64,
    /// Completed/failed items older than this are eligible for cleanup.
    pub cleanup_age_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScraperConfig {
    pub network_idle_timeout_seconds: u64,
    /// Scroll ends after this many consecutive stable scrollHeight readings.
    pub scroll_stable_steps: usize,
    /// Hard cap on traversed text during scrolling, in bytes.
    pub scroll_budget_bytes: usize,
    /// CSS selectors tried in order before falling back to body text.
    pub content_selectors: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration directory not found or could not be created")]
    DirectoryError,
    #[error("Invalid URL format: {0}")]
    InvalidUrl(String),
    #[error("Invalid embedding dimension: {0} (must be nonzero)")]
    InvalidDimension(usize),
    #[error("Invalid model name: cannot be empty")]
    InvalidModel,
    #[error("Invalid search limit: {0} (must be between 1 and 100)")]
    InvalidLimit(usize),
    #[error("Invalid temperature: {0} (must be between 0.0 and 2.0)")]
    InvalidTemperature(f32),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl Default for PipelineConfig {
    #[inline]
    fn default() -> Self {
        Self {
            api: ApiConfig {
                base_url: "https://api.openai.com/v1".to_string(),
                api_key: String::new(),
                embedding_model: "text-embedding-3-large".to_string(),
                embedding_dimension: 3072,
                chat_model: "gpt-4o-mini".to_string(),
                chat_temperature: 0.3,
                chat_max_tokens: 1000,
                timeout_seconds: 30,
                retry_attempts: 3,
            },
            search: SearchConfig {
                limit: 10,
                rerank_top_k: 5,
                topic_resolution_ttl_seconds: 300,
                collection: "chunks".to_string(),
            },
            cache: CacheConfig {
                enabled: true,
                redis_url: "redis://127.0.0.1:6379".to_string(),
                key_prefix: "embedding_cache".to_string(),
                namespace: "default".to_string(),
                embedding_ttl_days: 30,
                query_ttl_seconds: 900,
                empty_query_ttl_seconds: 300,
            },
            rate_limits: RateLimitConfig {
                embeddings_per_minute: 2500,
                chat_completions_per_minute: 8000,
            },
            jobs: JobConfig {
                max_retries: 3,
                retry_base_delay_seconds: 60,
                batch_size: 64,
                processing_timeout_seconds: 300,
                cleanup_age_seconds: 86400,
            },
            scraper: ScraperConfig {
                network_idle_timeout_seconds: 180,
                scroll_stable_steps: 5,
                scroll_budget_bytes: 1024 * 1024,
                content_selectors: vec![
                    "main".to_string(),
                    "article".to_string(),
                    "[role=\"main\"]".to_string(),
                    "#content".to_string(),
                    ".content".to_string(),
                    ".documentation".to_string(),
                ],
            },
            base_dir: None,
        }
    }
}

impl PipelineConfig {
    #[inline]
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        dirs::home_dir()
            .map(|home| home.join(".ragline"))
            .ok_or(ConfigError::DirectoryError)
    }

    #[inline]
    pub fn config_file_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    #[inline]
    pub fn load() -> Result<Self> {
        let config_path =
            Self::config_file_path().context("Failed to determine config file path")?;

        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: PipelineConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config
            .validate()
            .context("Configuration validation failed")?;

        Ok(config)
    }

    #[inline]
    pub fn save(&self) -> Result<()> {
        self.validate()
            .context("Configuration validation failed before saving")?;

        let config_dir = Self::config_dir().context("Failed to determine config directory")?;

        fs::create_dir_all(&config_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                config_dir.display()
            )
        })?;

        let config_path = config_dir.join("config.toml");
        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }

    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        Url::parse(&self.api.base_url)
            .map_err(|_| ConfigError::InvalidUrl(self.api.base_url.clone()))?;

        if self.api.embedding_model.trim().is_empty() || self.api.chat_model.trim().is_empty() {
            return Err(ConfigError::InvalidModel);
        }

        if self.api.embedding_dimension == 0 {
            return Err(ConfigError::InvalidDimension(self.api.embedding_dimension));
        }

        if !(0.0..=2.0).contains(&self.api.chat_temperature) {
            return Err(ConfigError::InvalidTemperature(self.api.chat_temperature));
        }

        if self.search.limit == 0 || self.search.limit > 100 {
            return Err(ConfigError::InvalidLimit(self.search.limit));
        }

        if self.search.rerank_top_k == 0 || self.search.rerank_top_k > self.search.limit {
            return Err(ConfigError::InvalidLimit(self.search.rerank_top_k));
        }

        Ok(())
    }

    /// Base directory for persisted state (sqlite metadata and vector data).
    #[inline]
    pub fn data_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.base_dir {
            Some(dir) => Ok(dir.clone()),
            None => Self::config_dir(),
        }
    }

    #[inline]
    pub fn database_path(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.data_dir()?.join("metadata.db"))
    }

    #[inline]
    pub fn vector_db_path(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.data_dir()?.join("vectors"))
    }

    #[inline]
    pub fn api_base_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.api.base_url)
            .map_err(|_| ConfigError::InvalidUrl(self.api.base_url.clone()))
    }
}
