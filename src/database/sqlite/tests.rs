use super::*;
use tempfile::TempDir;

async fn create_test_database() -> (Database, TempDir) {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let database = Database::initialize_from_data_dir(temp_dir.path())
        .await
        .expect("should initialize database");
    (database, temp_dir)
}

fn new_topic(name: &str) -> NewTopic {
    NewTopic {
        name: name.to_string(),
        slug: None,
        description: String::new(),
        system_prompt: None,
    }
}

fn new_context(name: &str, context_type: ContextType) -> NewContext {
    NewContext {
        name: name.to_string(),
        description: String::new(),
        context_type,
        original_content: None,
    }
}

#[tokio::test]
async fn topic_slug_derivation_and_disambiguation() {
    let (db, _dir) = create_test_database().await;

    let first = TopicQueries::create(db.pool(), new_topic("Rust Programming"))
        .await
        .expect("should create first topic");
    assert_eq!(first.slug, "rust-programming");

    let second = TopicQueries::create(db.pool(), new_topic("Rust Programming"))
        .await
        .expect("should create second topic");
    assert_eq!(second.slug, "rust-programming-2");

    let third = TopicQueries::create(db.pool(), new_topic("Rust Programming"))
        .await
        .expect("should create third topic");
    assert_eq!(third.slug, "rust-programming-3");
}

#[tokio::test]
async fn topic_explicit_slug_is_kept() {
    let (db, _dir) = create_test_database().await;

    let topic = TopicQueries::create(
        db.pool(),
        NewTopic {
            name: "Anything".to_string(),
            slug: Some("custom-slug".to_string()),
            description: "desc".to_string(),
            system_prompt: Some("You are terse.".to_string()),
        },
    )
    .await
    .expect("should create topic");

    assert_eq!(topic.slug, "custom-slug");
    assert_eq!(topic.system_prompt.as_deref(), Some("You are terse."));

    let fetched = TopicQueries::get_by_slug(db.pool(), "custom-slug")
        .await
        .expect("should query by slug")
        .expect("topic should exist");
    assert_eq!(fetched.id, topic.id);
}

#[tokio::test]
async fn context_lifecycle_transitions() {
    let (db, _dir) = create_test_database().await;

    let context = ContextQueries::create(db.pool(), new_context("Manual", ContextType::Markdown))
        .await
        .expect("should create context");
    assert_eq!(context.processing_status, ProcessingStatus::Pending);
    assert_eq!(context.chunk_count, 0);

    ContextQueries::set_status(db.pool(), context.id, ProcessingStatus::Processing, None)
        .await
        .expect("should set processing");
    ContextQueries::set_status(db.pool(), context.id, ProcessingStatus::Completed, None)
        .await
        .expect("should set completed");
    ContextQueries::set_chunk_count(db.pool(), context.id, 4)
        .await
        .expect("should set chunk count");

    let updated = ContextQueries::get_by_id(db.pool(), context.id)
        .await
        .expect("should fetch context")
        .expect("context should exist");
    assert!(updated.is_completed());
    assert_eq!(updated.chunk_count, 4);
}

#[tokio::test]
async fn context_failed_records_error() {
    let (db, _dir) = create_test_database().await;

    let context = ContextQueries::create(db.pool(), new_context("Bad", ContextType::Pdf))
        .await
        .expect("should create context");

    ContextQueries::set_status(
        db.pool(),
        context.id,
        ProcessingStatus::Failed,
        Some("Parse error: invalid PDF"),
    )
    .await
    .expect("should set failed");

    let updated = ContextQueries::get_by_id(db.pool(), context.id)
        .await
        .expect("should fetch context")
        .expect("context should exist");
    assert!(updated.is_failed());
    assert_eq!(
        updated.error_message.as_deref(),
        Some("Parse error: invalid PDF")
    );
}

#[tokio::test]
async fn item_batch_insert_assigns_ids_in_order() {
    let (db, _dir) = create_test_database().await;

    let context = ContextQueries::create(db.pool(), new_context("Doc", ContextType::Faq))
        .await
        .expect("should create context");

    let items = (1..=3)
        .map(|i| NewContextItem {
            context_id: context.id,
            title: format!("Doc - Chunk {i}"),
            content: format!("content {i}"),
            chunk_index: i,
            file_path: Some("/tmp/doc.txt".to_string()),
            item_metadata: None,
        })
        .collect();

    let stored = ContextItemQueries::insert_batch(db.pool(), items)
        .await
        .expect("should insert batch");
    assert_eq!(stored.len(), 3);
    assert_eq!(
        stored.iter().map(|i| i.chunk_index).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );

    let count = ContextQueries::count_items(db.pool(), context.id)
        .await
        .expect("should count items");
    assert_eq!(count, 3);
}

#[tokio::test]
async fn duplicate_chunk_index_rejected() {
    let (db, _dir) = create_test_database().await;

    let context = ContextQueries::create(db.pool(), new_context("Doc", ContextType::Markdown))
        .await
        .expect("should create context");

    let items = vec![
        NewContextItem {
            context_id: context.id,
            title: "a".to_string(),
            content: "a".to_string(),
            chunk_index: 1,
            file_path: None,
            item_metadata: None,
        },
        NewContextItem {
            context_id: context.id,
            title: "b".to_string(),
            content: "b".to_string(),
            chunk_index: 1,
            file_path: None,
            item_metadata: None,
        },
    ];

    assert!(
        ContextItemQueries::insert_batch(db.pool(), items)
            .await
            .is_err()
    );

    // The transaction rolled back; nothing was persisted.
    let count = ContextQueries::count_items(db.pool(), context.id)
        .await
        .expect("should count items");
    assert_eq!(count, 0);
}

#[tokio::test]
async fn cascade_delete_removes_items_and_associations() {
    let (db, _dir) = create_test_database().await;

    let topic = TopicQueries::create(db.pool(), new_topic("T"))
        .await
        .expect("should create topic");
    let context = ContextQueries::create(db.pool(), new_context("C", ContextType::Markdown))
        .await
        .expect("should create context");
    TopicQueries::attach_context(db.pool(), topic.id, context.id)
        .await
        .expect("should attach");

    ContextItemQueries::insert_batch(
        db.pool(),
        vec![NewContextItem {
            context_id: context.id,
            title: "t".to_string(),
            content: "c".to_string(),
            chunk_index: 1,
            file_path: None,
            item_metadata: None,
        }],
    )
    .await
    .expect("should insert item");

    assert!(
        ContextQueries::delete(db.pool(), context.id)
            .await
            .expect("should delete context")
    );

    let count = ContextQueries::count_items(db.pool(), context.id)
        .await
        .expect("should count items");
    assert_eq!(count, 0);

    let resolved = TopicQueries::resolve_context_ids(db.pool(), &[topic.id])
        .await
        .expect("should resolve");
    assert!(resolved.is_empty());
}

#[tokio::test]
async fn resolve_context_ids_is_distinct_across_topics() {
    let (db, _dir) = create_test_database().await;

    let t1 = TopicQueries::create(db.pool(), new_topic("A"))
        .await
        .expect("should create topic A");
    let t2 = TopicQueries::create(db.pool(), new_topic("B"))
        .await
        .expect("should create topic B");
    let shared = ContextQueries::create(db.pool(), new_context("S", ContextType::Webscraper))
        .await
        .expect("should create context");

    TopicQueries::attach_context(db.pool(), t1.id, shared.id)
        .await
        .expect("should attach to A");
    TopicQueries::attach_context(db.pool(), t2.id, shared.id)
        .await
        .expect("should attach to B");

    let resolved = TopicQueries::resolve_context_ids(db.pool(), &[t1.id, t2.id])
        .await
        .expect("should resolve");
    assert_eq!(resolved, vec![shared.id]);

    let empty = TopicQueries::resolve_context_ids(db.pool(), &[])
        .await
        .expect("should resolve empty");
    assert!(empty.is_empty());
}

#[tokio::test]
async fn update_content_for_admin_edit() {
    let (db, _dir) = create_test_database().await;

    let context = ContextQueries::create(db.pool(), new_context("Doc", ContextType::Markdown))
        .await
        .expect("should create context");
    let stored = ContextItemQueries::insert_batch(
        db.pool(),
        vec![NewContextItem {
            context_id: context.id,
            title: "t".to_string(),
            content: "before".to_string(),
            chunk_index: 1,
            file_path: None,
            item_metadata: None,
        }],
    )
    .await
    .expect("should insert item");

    assert!(
        ContextItemQueries::update_content(db.pool(), stored[0].id, "after")
            .await
            .expect("should update content")
    );

    let item = ContextItemQueries::get_by_id(db.pool(), stored[0].id)
        .await
        .expect("should fetch item")
        .expect("item should exist");
    assert_eq!(item.content, "after");
}
