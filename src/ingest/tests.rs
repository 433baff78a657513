use super::*;
use crate::config::PipelineConfig;
use crate::database::sqlite::{ContextType, NewContext};
use tempfile::TempDir;

struct Harness {
    database: Database,
    queue: JobQueue,
    coordinator: IngestionCoordinator,
    dir: TempDir,
}

async fn harness() -> Harness {
    let dir = TempDir::new().expect("should create temp dir");

    let mut config = PipelineConfig::default();
    config.api.embedding_dimension = 3;
    config.base_dir = Some(dir.path().to_path_buf());

    let database = Database::initialize_from_data_dir(dir.path())
        .await
        .expect("should initialize database");
    let index = Arc::new(
        VectorIndex::new(&config, database.clone())
            .await
            .expect("should initialize vector index"),
    );
    let queue = JobQueue::new(database.clone(), config.jobs.clone());
    let coordinator = IngestionCoordinator::new(
        database.clone(),
        index,
        queue.clone(),
        config.scraper.clone(),
    );

    Harness {
        database,
        queue,
        coordinator,
        dir,
    }
}

async fn create_context(database: &Database, name: &str, context_type: ContextType) -> i64 {
    ContextQueries::create(
        database.pool(),
        NewContext {
            name: name.to_string(),
            description: String::new(),
            context_type,
            original_content: None,
        },
    )
    .await
    .expect("should create context")
    .id
}

#[tokio::test]
async fn markdown_text_is_chunked_persisted_and_queued() {
    let harness = harness().await;
    let context_id = create_context(&harness.database, "Guide", ContextType::Markdown).await;

    let count = harness
        .coordinator
        .ingest(
            context_id,
            SourceSpec::Text("# Intro\n\nA short guide body.".to_string()),
        )
        .await
        .expect("should ingest");
    assert_eq!(count, 1);

    let items = ContextItemQueries::list_by_context(harness.database.pool(), context_id)
        .await
        .expect("should list items");
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].title, "Guide - Chunk 1");
    assert_eq!(items[0].chunk_index, 1);
    assert!(items[0].file_path.is_none());

    let metadata = items[0].metadata().expect("metadata should parse");
    assert_eq!(metadata.chunk_index, 1);
    assert_eq!(metadata.total_chunks, 1);
    assert_eq!(metadata.content_type, "markdown");
    assert_eq!(metadata.chunk_size, items[0].content.chars().count());

    let context = ContextQueries::get_by_id(harness.database.pool(), context_id)
        .await
        .expect("should fetch context")
        .expect("context should exist");
    assert_eq!(context.processing_status, ProcessingStatus::Completed);
    assert_eq!(context.chunk_count, 1);
    assert!(context.error_message.is_none());

    let stats = harness.queue.stats().await.expect("should read stats");
    assert_eq!(stats.pending, 1);
}

#[tokio::test]
async fn missing_context_is_not_found() {
    let harness = harness().await;
    let result = harness
        .coordinator
        .ingest(999, SourceSpec::Text("text".to_string()))
        .await;
    assert!(matches!(result, Err(RagError::NotFound(_))));
}

#[tokio::test]
async fn empty_source_leaves_the_context_pending() {
    let harness = harness().await;
    let context_id = create_context(&harness.database, "Empty", ContextType::Markdown).await;

    let count = harness
        .coordinator
        .ingest(context_id, SourceSpec::Text("   \n\n  ".to_string()))
        .await
        .expect("should ingest");
    assert_eq!(count, 0);

    let context = ContextQueries::get_by_id(harness.database.pool(), context_id)
        .await
        .expect("should fetch context")
        .expect("context should exist");
    assert_eq!(context.processing_status, ProcessingStatus::Pending);
    assert_eq!(context.chunk_count, 0);
    assert!(context.error_message.is_none());

    let stats = harness.queue.stats().await.expect("should read stats");
    assert_eq!(stats.pending, 0);
}

#[tokio::test]
async fn empty_reingest_keeps_the_previous_chunks() {
    let harness = harness().await;
    let context_id = create_context(&harness.database, "Sticky", ContextType::Markdown).await;

    let first = harness
        .coordinator
        .ingest(context_id, SourceSpec::Text("One short note.".to_string()))
        .await
        .expect("should ingest");
    assert_eq!(first, 1);

    let second = harness
        .coordinator
        .ingest(context_id, SourceSpec::Text("  \n ".to_string()))
        .await
        .expect("should handle empty re-ingest");
    assert_eq!(second, 0);

    // The earlier chunks and their queued jobs survive the empty source.
    let items = ContextItemQueries::list_by_context(harness.database.pool(), context_id)
        .await
        .expect("should list items");
    assert_eq!(items.len(), 1);
    let stats = harness.queue.stats().await.expect("should read stats");
    assert_eq!(stats.pending, 1);

    let context = ContextQueries::get_by_id(harness.database.pool(), context_id)
        .await
        .expect("should fetch context")
        .expect("context should exist");
    assert_eq!(context.processing_status, ProcessingStatus::Pending);
    assert_eq!(context.chunk_count, 1);
}

#[tokio::test]
async fn mismatched_source_fails_the_context() {
    let harness = harness().await;
    let context_id = create_context(&harness.database, "Mismatch", ContextType::Markdown).await;

    let result = harness
        .coordinator
        .ingest(
            context_id,
            SourceSpec::Url("https://example.com".to_string()),
        )
        .await;
    assert!(matches!(result, Err(RagError::InvalidInput(_))));

    let context = ContextQueries::get_by_id(harness.database.pool(), context_id)
        .await
        .expect("should fetch context")
        .expect("context should exist");
    assert_eq!(context.processing_status, ProcessingStatus::Failed);
    assert!(
        context
            .error_message
            .as_deref()
            .is_some_and(|m| m.contains("not valid"))
    );
}

#[tokio::test]
async fn reingestion_replaces_previous_chunks_and_jobs() {
    let harness = harness().await;
    let context_id = create_context(&harness.database, "Evolving", ContextType::Markdown).await;

    let first = harness
        .coordinator
        .ingest(context_id, SourceSpec::Text("One short note.".to_string()))
        .await
        .expect("should ingest");
    assert_eq!(first, 1);

    // Long enough to exceed one chunk at the markdown default size.
    let long_body = "A sentence about the system under test. ".repeat(60);
    let second = harness
        .coordinator
        .ingest(context_id, SourceSpec::Text(long_body))
        .await
        .expect("should re-ingest");
    assert!(second > 1);

    let items = ContextItemQueries::list_by_context(harness.database.pool(), context_id)
        .await
        .expect("should list items");
    assert_eq!(items.len(), second);

    // The first ingestion's jobs cascaded away with its chunks.
    let stats = harness.queue.stats().await.expect("should read stats");
    assert_eq!(stats.pending, second as u64);

    let context = ContextQueries::get_by_id(harness.database.pool(), context_id)
        .await
        .expect("should fetch context")
        .expect("context should exist");
    assert_eq!(context.chunk_count, second as i64);
}

#[tokio::test]
async fn file_sources_record_their_path() {
    let harness = harness().await;
    let context_id = create_context(&harness.database, "From File", ContextType::Markdown).await;

    let file = harness.dir.path().join("notes.md");
    std::fs::write(&file, "# Notes\n\nRead from disk.").expect("should write file");

    let count = harness
        .coordinator
        .ingest(context_id, SourceSpec::File(file.clone()))
        .await
        .expect("should ingest");
    assert_eq!(count, 1);

    let items = ContextItemQueries::list_by_context(harness.database.pool(), context_id)
        .await
        .expect("should list items");
    assert_eq!(items[0].file_path.as_deref(), Some(file.display().to_string().as_str()));
}

#[tokio::test]
async fn faq_pairs_ingest_with_their_own_content_type() {
    let harness = harness().await;
    let context_id = create_context(&harness.database, "FAQ", ContextType::Faq).await;

    let count = harness
        .coordinator
        .ingest(
            context_id,
            SourceSpec::Text(
                "Q: What is this?\nA: A question answering pipeline.\n\nQ: Is it fast?\nA: Fast enough.".to_string(),
            ),
        )
        .await
        .expect("should ingest");
    assert_eq!(count, 1);

    let items = ContextItemQueries::list_by_context(harness.database.pool(), context_id)
        .await
        .expect("should list items");
    let metadata = items[0].metadata().expect("metadata should parse");
    assert_eq!(metadata.content_type, "faq");
}

#[tokio::test]
async fn regenerate_queues_one_job_per_existing_chunk() {
    let harness = harness().await;
    let context_id = create_context(&harness.database, "Regen", ContextType::Markdown).await;

    harness
        .coordinator
        .ingest(context_id, SourceSpec::Text("Some body text.".to_string()))
        .await
        .expect("should ingest");

    let queued = harness
        .coordinator
        .regenerate_embeddings(context_id)
        .await
        .expect("should regenerate");
    assert_eq!(queued, 1);

    // One job from ingestion plus one from regeneration.
    let stats = harness.queue.stats().await.expect("should read stats");
    assert_eq!(stats.pending, 2);

    let context = ContextQueries::get_by_id(harness.database.pool(), context_id)
        .await
        .expect("should fetch context")
        .expect("context should exist");
    assert_eq!(context.processing_status, ProcessingStatus::Pending);
}

#[tokio::test]
async fn regenerate_on_missing_context_is_not_found() {
    let harness = harness().await;
    let result = harness.coordinator.regenerate_embeddings(999).await;
    assert!(matches!(result, Err(RagError::NotFound(_))));
}
