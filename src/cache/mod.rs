#[cfg(test)]
mod tests;

use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::CacheConfig;

/// Key prefix for cached query results.
const QUERY_KEY_PREFIX: &str = "rag_query";

/// Hex-encoded SHA-256 of `input`.
#[inline]
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Connect to the KV store, degrading to `None` when it is unreachable.
async fn connect(config: &CacheConfig, what: &str) -> Option<ConnectionManager> {
    if !config.enabled {
        debug!("{} disabled by configuration", what);
        return None;
    }

    let client = match redis::Client::open(config.redis_url.as_str()) {
        Ok(client) => client,
        Err(e) => {
            warn!("{} disabled, invalid redis URL: {}", what, e);
            return None;
        }
    };

    match client.get_connection_manager().await {
        Ok(mut conn) => match redis::cmd("PING").query_async::<String>(&mut conn).await {
            Ok(_) => Some(conn),
            Err(e) => {
                warn!("{} disabled, redis ping failed: {}", what, e);
                None
            }
        },
        Err(e) => {
            warn!("{} disabled, redis unreachable: {}", what, e);
            None
        }
    }
}

/// Content-addressed read-through cache for embedding vectors.
///
/// Whether the cache is enabled is decided once at construction and never
/// changes for the lifetime of the instance. Every runtime error degrades to
/// a miss; callers never see cache failures.
pub struct EmbeddingCache {
    conn: Option<ConnectionManager>,
    key_prefix: String,
    namespace: String,
    ttl_seconds: u64,
}

impl EmbeddingCache {
    /// Connect to the backing store; unreachable backends produce a
    /// permanently disabled cache.
    pub async fn new(config: &CacheConfig) -> Self {
        Self {
            conn: connect(config, "Embedding cache").await,
            key_prefix: config.key_prefix.clone(),
            namespace: config.namespace.clone(),
            ttl_seconds: config.embedding_ttl_days * 24 * 60 * 60,
        }
    }

    /// Whether lookups can ever hit. Stable after construction.
    #[inline]
    pub fn enabled(&self) -> bool {
        self.conn.is_some()
    }

    /// Cache key: content-addressed by model and exact text.
    #[inline]
    pub fn key(&self, text: &str, model: &str) -> String {
        format!(
            "{}:{}:{}",
            self.key_prefix,
            self.namespace,
            sha256_hex(&format!("{model}::{text}"))
        )
    }

    /// Look up a cached vector. Any failure is a miss.
    pub async fn get(&self, text: &str, model: &str) -> Option<Vec<f32>> {
        let mut conn = self.conn.clone()?;
        let key = self.key(text, model);

        match conn.get::<_, Option<String>>(&key).await {
            Ok(Some(json)) => match serde_json::from_str::<Vec<f32>>(&json) {
                Ok(vector) => {
                    debug!("Embedding cache hit for key {}", key);
                    Some(vector)
                }
                Err(e) => {
                    warn!("Discarding malformed embedding cache entry {}: {}", key, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                debug!("Embedding cache read failed for {}: {}", key, e);
                None
            }
        }
    }

    /// Store a vector with the configured TTL. Failures are swallowed.
    pub async fn set(&self, text: &str, model: &str, vector: &[f32]) {
        let Some(mut conn) = self.conn.clone() else {
            return;
        };
        let key = self.key(text, model);

        let json = match serde_json::to_string(vector) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize embedding for cache: {}", e);
                return;
            }
        };

        if let Err(e) = conn.set_ex::<_, _, ()>(&key, json, self.ttl_seconds).await {
            debug!("Embedding cache write failed for {}: {}", key, e);
        }
    }
}

/// Deterministic cache key for a query: stable under question whitespace and
/// case variation and under reordering of `topic_ids`.
#[inline]
pub fn query_cache_key(
    question: &str,
    topic_ids: &[i64],
    limit: usize,
    rerank_top_k: usize,
) -> String {
    let mut sorted_ids = topic_ids.to_vec();
    sorted_ids.sort_unstable();
    let ids = sorted_ids
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",");

    let canonical = format!(
        "{}|topics={ids}|limit={limit}|top_k={rerank_top_k}",
        question.trim().to_lowercase()
    );
    format!("{QUERY_KEY_PREFIX}:{}", sha256_hex(&canonical))
}

/// TTL cache for fully-assembled query results, JSON-encoded.
///
/// Shares the embedding cache's degradation contract: unreachable backend
/// means every lookup misses and every write is a no-op.
pub struct QueryResultCache {
    conn: Option<ConnectionManager>,
    ttl_seconds: u64,
    empty_ttl_seconds: u64,
}

impl QueryResultCache {
    pub async fn new(config: &CacheConfig) -> Self {
        Self {
            conn: connect(config, "Query result cache").await,
            ttl_seconds: config.query_ttl_seconds,
            empty_ttl_seconds: config.empty_query_ttl_seconds,
        }
    }

    #[inline]
    pub fn enabled(&self) -> bool {
        self.conn.is_some()
    }

    pub async fn get<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        let mut conn = self.conn.clone()?;

        match conn.get::<_, Option<String>>(key).await {
            Ok(Some(json)) => match serde_json::from_str(&json) {
                Ok(value) => {
                    debug!("Query cache hit for key {}", key);
                    Some(value)
                }
                Err(e) => {
                    warn!("Discarding malformed query cache entry {}: {}", key, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                debug!("Query cache read failed for {}: {}", key, e);
                None
            }
        }
    }

    /// Store a result; empty results get the shorter TTL.
    pub async fn set<T: serde::Serialize>(&self, key: &str, value: &T, empty: bool) {
        let Some(mut conn) = self.conn.clone() else {
            return;
        };

        let json = match serde_json::to_string(value) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize query result for cache: {}", e);
                return;
            }
        };

        let ttl = if empty {
            self.empty_ttl_seconds
        } else {
            self.ttl_seconds
        };
        if let Err(e) = conn.set_ex::<_, _, ()>(key, json, ttl).await {
            debug!("Query cache write failed for {}: {}", key, e);
        }
    }

    /// Drop every cached query result. Used after re-indexing.
    pub async fn flush(&self) {
        let Some(mut conn) = self.conn.clone() else {
            return;
        };

        let pattern = format!("{QUERY_KEY_PREFIX}:*");
        let keys: Vec<String> = {
            let mut iter = match conn.scan_match::<_, String>(&pattern).await {
                Ok(iter) => iter,
                Err(e) => {
                    warn!("Query cache flush scan failed: {}", e);
                    return;
                }
            };
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };

        if keys.is_empty() {
            return;
        }

        if let Err(e) = conn.del::<_, ()>(&keys).await {
            warn!("Query cache flush delete failed: {}", e);
        } else {
            debug!("Flushed {} cached query results", keys.len());
        }
    }
}
