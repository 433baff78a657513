use super::*;

#[test]
fn default_config() {
    let config = PipelineConfig::default();
    assert_eq!(config.api.embedding_model, "text-embedding-3-large");
    assert_eq!(config.api.embedding_dimension, 3072);
    assert_eq!(config.api.chat_temperature, 0.3);
    assert_eq!(config.api.chat_max_tokens, 1000);
    assert_eq!(config.search.limit, 10);
    assert_eq!(config.search.rerank_top_k, 5);
    assert_eq!(config.cache.embedding_ttl_days, 30);
    assert_eq!(config.cache.query_ttl_seconds, 900);
    assert_eq!(config.cache.empty_query_ttl_seconds, 300);
    assert_eq!(config.rate_limits.embeddings_per_minute, 2500);
    assert_eq!(config.rate_limits.chat_completions_per_minute, 8000);
    assert_eq!(config.jobs.max_retries, 3);
    assert_eq!(config.jobs.retry_base_delay_seconds, 60);
}

#[test]
fn config_validation() {
    let config = PipelineConfig::default();
    assert!(config.validate().is_ok());

    let mut invalid = config.clone();
    invalid.api.base_url = "not a url".to_string();
    assert!(invalid.validate().is_err());

    let mut invalid = config.clone();
    invalid.api.embedding_model = String::new();
    assert!(invalid.validate().is_err());

    let mut invalid = config.clone();
    invalid.api.embedding_dimension = 0;
    assert!(invalid.validate().is_err());

    let mut invalid = config.clone();
    invalid.api.chat_temperature = 3.0;
    assert!(invalid.validate().is_err());

    let mut invalid = config.clone();
    invalid.search.limit = 0;
    assert!(invalid.validate().is_err());

    // rerank_top_k must not exceed the search limit
    let mut invalid = config;
    invalid.search.rerank_top_k = 50;
    assert!(invalid.validate().is_err());
}

#[test]
fn toml_round_trip() {
    let config = PipelineConfig::default();
    let toml_str = toml::to_string(&config).expect("should serialize toml correctly");
    let parsed: PipelineConfig = toml::from_str(&toml_str).expect("should parse toml correctly");
    assert_eq!(config, parsed);
}

#[test]
fn data_dir_override() {
    let config = PipelineConfig {
        base_dir: Some(std::path::PathBuf::from("/tmp/ragline-test")),
        ..Default::default()
    };
    assert_eq!(
        config.database_path().expect("should resolve database path"),
        std::path::PathBuf::from("/tmp/ragline-test/metadata.db")
    );
    assert_eq!(
        config.vector_db_path().expect("should resolve vector path"),
        std::path::PathBuf::from("/tmp/ragline-test/vectors")
    );
}

#[test]
fn selector_preference_order() {
    let config = PipelineConfig::default();
    assert_eq!(config.scraper.content_selectors[0], "main");
    assert!(
        config
            .scraper
            .content_selectors
            .iter()
            .all(|s| !s.trim().is_empty())
    );
}
