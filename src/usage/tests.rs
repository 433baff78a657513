use super::*;
use crate::config::PipelineConfig;
use std::sync::Arc;

fn monitor() -> UsageMonitor {
    UsageMonitor::new(PipelineConfig::default().rate_limits)
}

#[test]
fn embedding_usage_accumulates() {
    let monitor = monitor();
    monitor.track_embedding_usage(100, "text-embedding-3-large");
    monitor.track_embedding_usage(50, "text-embedding-3-large");

    let metrics = monitor.get_metrics();
    assert_eq!(metrics.embedding_requests, 2);
    assert_eq!(metrics.embedding_tokens, 150);

    let by_model = &metrics.by_model["text-embedding-3-large"];
    assert_eq!(by_model.requests, 2);
    assert_eq!(by_model.total_tokens, 150);
}

#[test]
fn chat_usage_tracks_prompt_and_completion_separately() {
    let monitor = monitor();
    monitor.track_chat_completion_usage(200, 80, "gpt-4o-mini");

    let metrics = monitor.get_metrics();
    assert_eq!(metrics.chat_requests, 1);
    assert_eq!(metrics.chat_prompt_tokens, 200);
    assert_eq!(metrics.chat_completion_tokens, 80);
    assert_eq!(metrics.by_model["gpt-4o-mini"].total_tokens, 280);
}

#[test]
fn metrics_snapshot_is_detached_from_internal_state() {
    let monitor = monitor();
    monitor.track_embedding_usage(10, "text-embedding-3-large");

    let mut snapshot = monitor.get_metrics();
    snapshot.embedding_tokens = 999;
    snapshot.by_model.clear();

    let fresh = monitor.get_metrics();
    assert_eq!(fresh.embedding_tokens, 10);
    assert_eq!(fresh.by_model.len(), 1);
}

#[test]
fn cost_breakdown_uses_pricing_table() {
    let monitor = monitor();
    monitor.track_embedding_usage(1_000_000, "text-embedding-3-large");
    monitor.track_chat_completion_usage(1_000_000, 1_000_000, "gpt-4o-mini");

    let costs = monitor.get_cost_breakdown("text-embedding-3-large");
    assert!((costs.embeddings_usd - 0.13).abs() < 1e-9);
    assert!((costs.chat_usd - 0.75).abs() < 1e-9);
    assert!((costs.total_usd - 0.88).abs() < 1e-9);
}

#[test]
fn unknown_models_cost_nothing() {
    let monitor = monitor();
    monitor.track_chat_completion_usage(5_000_000, 5_000_000, "mystery-model");

    let costs = monitor.get_cost_breakdown("text-embedding-3-large");
    assert_eq!(costs.total_usd, 0.0);
    assert_eq!(costs.by_model_usd["mystery-model"], 0.0);
}

#[test]
fn rate_limit_trips_after_threshold_within_window() {
    let monitor = monitor();
    assert!(!monitor.check_rate_limits());

    for _ in 0..2501 {
        monitor.track_request_timestamp(ApiCategory::Embeddings);
    }
    assert!(monitor.check_rate_limits());
}

#[test]
fn rate_limit_threshold_is_exclusive() {
    let monitor = monitor();
    for _ in 0..2500 {
        monitor.track_request_timestamp(ApiCategory::Embeddings);
    }
    assert!(!monitor.check_rate_limits());
}

#[test]
fn recent_request_count_sees_fresh_timestamps() {
    let monitor = monitor();
    for _ in 0..3 {
        monitor.track_request_timestamp(ApiCategory::ChatCompletions);
    }
    assert_eq!(
        monitor.get_recent_request_count(ApiCategory::ChatCompletions, 1),
        3
    );
    assert_eq!(
        monitor.get_recent_request_count(ApiCategory::Embeddings, 1),
        0
    );
}

#[test]
fn reset_clears_everything() {
    let monitor = monitor();
    monitor.track_embedding_usage(10, "text-embedding-3-large");
    monitor.track_request_timestamp(ApiCategory::Embeddings);

    monitor.reset();

    assert_eq!(monitor.get_metrics(), UsageMetrics::default());
    assert_eq!(
        monitor.get_recent_request_count(ApiCategory::Embeddings, 60),
        0
    );
}

#[test]
fn concurrent_tracking_is_safe() {
    let monitor = Arc::new(monitor());
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let monitor = Arc::clone(&monitor);
            std::thread::spawn(move || {
                for _ in 0..100 {
                    monitor.track_embedding_usage(1, "text-embedding-3-large");
                    monitor.track_request_timestamp(ApiCategory::Embeddings);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("thread should finish");
    }

    let metrics = monitor.get_metrics();
    assert_eq!(metrics.embedding_requests, 800);
    assert_eq!(metrics.embedding_tokens, 800);
}
