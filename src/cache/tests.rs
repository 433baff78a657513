use super::*;
use crate::config::PipelineConfig;

fn disabled_config() -> CacheConfig {
    CacheConfig {
        enabled: false,
        ..PipelineConfig::default().cache
    }
}

fn unreachable_config() -> CacheConfig {
    CacheConfig {
        enabled: true,
        redis_url: "redis://127.0.0.1:1".to_string(),
        ..PipelineConfig::default().cache
    }
}

#[test]
fn sha256_hex_is_stable_and_lowercase() {
    let hash = sha256_hex("hello");
    assert_eq!(hash.len(), 64);
    assert_eq!(hash, sha256_hex("hello"));
    assert_ne!(hash, sha256_hex("Hello"));
    assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
}

#[tokio::test]
async fn embedding_cache_key_is_content_addressed() {
    let cache = EmbeddingCache::new(&disabled_config()).await;

    let key = cache.key("some text", "model-a");
    assert!(key.starts_with("embedding_cache:"));
    assert_eq!(key, cache.key("some text", "model-a"));
    assert_ne!(key, cache.key("other text", "model-a"));
    assert_ne!(key, cache.key("some text", "model-b"));
}

#[tokio::test]
async fn disabled_embedding_cache_misses_and_ignores_writes() {
    let cache = EmbeddingCache::new(&disabled_config()).await;
    assert!(!cache.enabled());

    cache.set("text", "model", &[1.0, 2.0]).await;
    assert_eq!(cache.get("text", "model").await, None);
}

#[tokio::test]
async fn unreachable_backend_degrades_to_disabled() {
    let cache = EmbeddingCache::new(&unreachable_config()).await;
    assert!(!cache.enabled());
    assert_eq!(cache.get("text", "model").await, None);

    let queries = QueryResultCache::new(&unreachable_config()).await;
    assert!(!queries.enabled());
    assert_eq!(queries.get::<String>("rag_query:abc").await, None);
    queries.set("rag_query:abc", &"value", false).await;
    queries.flush().await;
}

#[test]
fn query_key_is_stable_under_case_whitespace_and_topic_order() {
    let a = query_cache_key("What is X?", &[2, 1], 10, 5);
    let b = query_cache_key("  what is x?  ", &[1, 2], 10, 5);
    assert_eq!(a, b);
    assert!(a.starts_with("rag_query:"));
}

#[test]
fn query_key_varies_with_inputs() {
    let base = query_cache_key("question", &[1], 10, 5);
    assert_ne!(base, query_cache_key("another question", &[1], 10, 5));
    assert_ne!(base, query_cache_key("question", &[2], 10, 5));
    assert_ne!(base, query_cache_key("question", &[1], 20, 5));
    assert_ne!(base, query_cache_key("question", &[1], 10, 3));
}
