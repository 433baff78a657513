use super::*;
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::cache::EmbeddingCache;
use crate::config::PipelineConfig;
use crate::database::sqlite::{
    ContextItemQueries, ContextQueries, ContextType, JobStatus, NewContext, NewContextItem,
};
use crate::usage::UsageMonitor;

const DIMENSION: usize = 3;

struct Harness {
    database: Database,
    index: Arc<VectorIndex>,
    queue: JobQueue,
    runner: EmbeddingJobRunner,
    worker: JobWorker,
    _dir: TempDir,
}

async fn harness(server: &MockServer) -> Harness {
    let dir = TempDir::new().expect("should create temp dir");

    let mut config = PipelineConfig::default();
    config.api.base_url = server.uri();
    config.api.api_key = "test-key".to_string();
    config.api.embedding_dimension = DIMENSION;
    config.api.timeout_seconds = 5;
    config.api.retry_attempts = 1;
    config.cache.enabled = false;
    config.jobs.retry_base_delay_seconds = 0;
    config.base_dir = Some(dir.path().to_path_buf());

    let database = Database::initialize_from_data_dir(dir.path())
        .await
        .expect("should initialize database");
    let index = Arc::new(
        VectorIndex::new(&config, database.clone())
            .await
            .expect("should initialize vector index"),
    );

    let cache = Arc::new(EmbeddingCache::new(&config.cache).await);
    let monitor = Arc::new(UsageMonitor::new(config.rate_limits.clone()));
    let embeddings = Arc::new(EmbeddingService::new(&config, cache, monitor));

    let queue = JobQueue::new(database.clone(), config.jobs.clone());
    let runner =
        EmbeddingJobRunner::new(database.clone(), Arc::clone(&embeddings), Arc::clone(&index));
    let worker = JobWorker::new(
        queue.clone(),
        EmbeddingJobRunner::new(database.clone(), embeddings, Arc::clone(&index)),
    );

    Harness {
        database,
        index,
        queue,
        runner,
        worker,
        _dir: dir,
    }
}

async fn seed_chunk(database: &Database, content: &str) -> i64 {
    let context = ContextQueries::create(
        database.pool(),
        NewContext {
            name: "Jobs Test".to_string(),
            description: String::new(),
            context_type: ContextType::Markdown,
            original_content: None,
        },
    )
    .await
    .expect("should create context");

    let items = ContextItemQueries::insert_batch(
        database.pool(),
        vec![NewContextItem {
            context_id: context.id,
            title: "Jobs Test - Chunk 1".to_string(),
            content: content.to_string(),
            chunk_index: 1,
            file_path: None,
            item_metadata: None,
        }],
    )
    .await
    .expect("should insert chunk");

    items[0].id
}

fn embedding_response() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "data": [{"index": 0, "embedding": [0.1, 0.2, 0.3]}],
        "usage": {"total_tokens": 5}
    }))
}

async fn request_count(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .map_or(0, |requests| requests.len())
}

#[tokio::test(flavor = "multi_thread")]
async fn runner_embeds_a_chunk_and_writes_its_point() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(embedding_response())
        .mount(&server)
        .await;

    let harness = harness(&server).await;
    let chunk_id = seed_chunk(&harness.database, "A chunk worth embedding.").await;

    let job_id = harness.queue.enqueue(chunk_id).await.expect("should enqueue");
    let handled = harness
        .worker
        .run_pending_once()
        .await
        .expect("should process batch");
    assert_eq!(handled, 1);

    let job = harness
        .queue
        .get(job_id)
        .await
        .expect("should fetch job")
        .expect("job should exist");
    assert_eq!(job.status, JobStatus::Completed);

    let points = harness
        .index
        .count_points_for_item(chunk_id)
        .await
        .expect("should count points");
    assert_eq!(points, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn runner_reports_nothing_to_do_for_missing_chunks() {
    let server = MockServer::start().await;
    let harness = harness(&server).await;

    let did_work = harness
        .runner
        .run(999)
        .await
        .expect("should tolerate missing chunk");
    assert!(!did_work);
    assert_eq!(request_count(&server).await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_content_completes_without_an_api_call() {
    let server = MockServer::start().await;
    let harness = harness(&server).await;
    let chunk_id = seed_chunk(&harness.database, "   ").await;

    let job_id = harness.queue.enqueue(chunk_id).await.expect("should enqueue");
    harness
        .worker
        .run_pending_once()
        .await
        .expect("should process batch");

    let job = harness
        .queue
        .get(job_id)
        .await
        .expect("should fetch job")
        .expect("job should exist");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(request_count(&server).await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn worker_retries_transient_failures_until_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(embedding_response())
        .mount(&server)
        .await;

    let harness = harness(&server).await;
    let chunk_id = seed_chunk(&harness.database, "Eventually embedded.").await;
    let job_id = harness.queue.enqueue(chunk_id).await.expect("should enqueue");

    // First two attempts fail and requeue with zero backoff.
    for expected_retries in [1, 2] {
        let handled = harness
            .worker
            .run_pending_once()
            .await
            .expect("should process batch");
        assert_eq!(handled, 1);

        let job = harness
            .queue
            .get(job_id)
            .await
            .expect("should fetch job")
            .expect("job should exist");
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, expected_retries);
    }

    let handled = harness
        .worker
        .run_pending_once()
        .await
        .expect("should process batch");
    assert_eq!(handled, 1);

    let job = harness
        .queue
        .get(job_id)
        .await
        .expect("should fetch job")
        .expect("job should exist");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.retry_count, 2);

    assert_eq!(request_count(&server).await, 3);

    let points = harness
        .index
        .count_points_for_item(chunk_id)
        .await
        .expect("should count points");
    assert_eq!(points, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn repair_restores_missing_points_and_drops_orphans() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(embedding_response())
        .mount(&server)
        .await;

    let harness = harness(&server).await;
    let chunk_id = seed_chunk(&harness.database, "Reconciled content.").await;

    harness.queue.enqueue(chunk_id).await.expect("should enqueue");
    harness
        .worker
        .run_pending_once()
        .await
        .expect("should process batch");

    // Induce drift: lose the real point, plant one with no backing row.
    harness
        .index
        .delete_point(chunk_id)
        .await
        .expect("should delete point");
    harness
        .index
        .upsert(
            999,
            &[0.4, 0.5, 0.6],
            ChunkPayload {
                context_item_id: 999,
                context_id: 999,
                title: "orphan".to_string(),
                content: "orphan".to_string(),
                context_type: "markdown".to_string(),
                chunk_index: 1,
            },
        )
        .await
        .expect("should plant orphan point");

    let validator = ConsistencyValidator::new(
        harness.database.clone(),
        Arc::clone(&harness.index),
        harness.queue.clone(),
    );

    let report = validator.check().await.expect("should check");
    assert_eq!(report.orphaned_points, vec![999]);
    assert_eq!(report.missing_points, vec![chunk_id]);
    assert!(!report.is_consistent());

    let report = validator.repair().await.expect("should repair");
    assert!(!report.is_consistent());

    let orphan_points = harness
        .index
        .count_points_for_item(999)
        .await
        .expect("should count points");
    assert_eq!(orphan_points, 0);

    // Repair queued the missing chunk; one worker pass restores it.
    harness
        .worker
        .run_pending_once()
        .await
        .expect("should process batch");
    let report = validator.check().await.expect("should re-check");
    assert!(report.is_consistent());
}
