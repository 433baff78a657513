#[cfg(test)]
mod tests;

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::warn;

use crate::config::RateLimitConfig;

/// Outbound API categories tracked by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiCategory {
    Embeddings,
    ChatCompletions,
}

impl ApiCategory {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match *self {
            ApiCategory::Embeddings => "embeddings",
            ApiCategory::ChatCompletions => "chat_completions",
        }
    }
}

/// Cumulative token usage for one model in one category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ModelUsage {
    pub requests: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Snapshot of counters; detached from the monitor's internal state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UsageMetrics {
    pub embedding_requests: u64,
    pub embedding_tokens: u64,
    pub chat_requests: u64,
    pub chat_prompt_tokens: u64,
    pub chat_completion_tokens: u64,
    pub by_model: HashMap<String, ModelUsage>,
}

/// Estimated spend in USD, derived from the pricing table.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CostBreakdown {
    pub embeddings_usd: f64,
    pub chat_usd: f64,
    pub total_usd: f64,
    pub by_model_usd: HashMap<String, f64>,
}

/// USD per million tokens: (model, prompt rate, completion rate).
/// Embedding models only use the prompt rate. Unknown models cost 0.
const PRICING_PER_MTOK: &[(&str, f64, f64)] = &[
    ("text-embedding-3-large", 0.13, 0.0),
    ("text-embedding-3-small", 0.02, 0.0),
    ("gpt-4o-mini", 0.15, 0.60),
    ("gpt-4o", 2.50, 10.00),
];

fn model_rates(model: &str) -> (f64, f64) {
    PRICING_PER_MTOK
        .iter()
        .find(|(name, _, _)| *name == model)
        .map_or((0.0, 0.0), |&(_, prompt, completion)| (prompt, completion))
}

/// Timestamps older than this are evicted on every insert.
const TIMESTAMP_RETENTION: Duration = Duration::from_secs(60 * 60);

/// Sliding window for the rate-limit predicate.
const RATE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct UsageState {
    metrics: UsageMetrics,
    timestamps: HashMap<ApiCategory, VecDeque<Instant>>,
}

/// Process-wide usage counters with a sliding-window rate-limit predicate.
///
/// All mutation happens under one mutex; snapshots are deep copies so
/// callers can never mutate shared state.
pub struct UsageMonitor {
    state: Mutex<UsageState>,
    limits: RateLimitConfig,
}

impl UsageMonitor {
    #[inline]
    pub fn new(limits: RateLimitConfig) -> Self {
        Self {
            state: Mutex::new(UsageState::default()),
            limits,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, UsageState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Usage monitor mutex poisoned, continuing with inner state");
                poisoned.into_inner()
            }
        }
    }

    /// Record tokens consumed by one embedding API call.
    pub fn track_embedding_usage(&self, tokens: u64, model: &str) {
        let mut state = self.lock();
        state.metrics.embedding_requests += 1;
        state.metrics.embedding_tokens += tokens;

        let entry = state.metrics.by_model.entry(model.to_string()).or_default();
        entry.requests += 1;
        entry.prompt_tokens += tokens;
        entry.total_tokens += tokens;
    }

    /// Record tokens consumed by one chat completion call.
    pub fn track_chat_completion_usage(
        &self,
        prompt_tokens: u64,
        completion_tokens: u64,
        model: &str,
    ) {
        let mut state = self.lock();
        state.metrics.chat_requests += 1;
        state.metrics.chat_prompt_tokens += prompt_tokens;
        state.metrics.chat_completion_tokens += completion_tokens;

        let entry = state.metrics.by_model.entry(model.to_string()).or_default();
        entry.requests += 1;
        entry.prompt_tokens += prompt_tokens;
        entry.completion_tokens += completion_tokens;
        entry.total_tokens += prompt_tokens + completion_tokens;
    }

    /// Record the wall-clock time of one outbound request.
    pub fn track_request_timestamp(&self, category: ApiCategory) {
        let now = Instant::now();
        let mut state = self.lock();
        let timestamps = state.timestamps.entry(category).or_default();
        timestamps.push_back(now);

        while let Some(&front) = timestamps.front() {
            if now.duration_since(front) > TIMESTAMP_RETENTION {
                timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Deep snapshot of the counters.
    pub fn get_metrics(&self) -> UsageMetrics {
        self.lock().metrics.clone()
    }

    /// Estimated spend from the pricing table. Unknown models contribute 0.
    pub fn get_cost_breakdown(&self, embedding_model: &str) -> CostBreakdown {
        let metrics = self.get_metrics();
        let mut breakdown = CostBreakdown::default();

        for (model, usage) in &metrics.by_model {
            let (prompt_rate, completion_rate) = model_rates(model);
            let cost = (usage.prompt_tokens as f64 * prompt_rate
                + usage.completion_tokens as f64 * completion_rate)
                / 1_000_000.0;

            if model == embedding_model {
                breakdown.embeddings_usd += cost;
            } else {
                breakdown.chat_usd += cost;
            }
            *breakdown.by_model_usd.entry(model.clone()).or_default() += cost;
        }

        breakdown.total_usd = breakdown.embeddings_usd + breakdown.chat_usd;
        breakdown
    }

    /// Whether either category exceeded its per-minute budget in the last
    /// 60 seconds. Advisory: callers may shed load, the monitor never drops
    /// work itself.
    pub fn check_rate_limits(&self) -> bool {
        let state = self.lock();
        let embeddings = count_recent(&state, ApiCategory::Embeddings, RATE_WINDOW);
        let chat = count_recent(&state, ApiCategory::ChatCompletions, RATE_WINDOW);
        embeddings > self.limits.embeddings_per_minute
            || chat > self.limits.chat_completions_per_minute
    }

    /// Requests recorded for `category` in the last `minutes` minutes.
    pub fn get_recent_request_count(&self, category: ApiCategory, minutes: u64) -> usize {
        let state = self.lock();
        count_recent(&state, category, Duration::from_secs(minutes * 60))
    }

    /// Clear all counters and timestamps.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.metrics = UsageMetrics::default();
        state.timestamps.clear();
    }
}

fn count_recent(state: &UsageState, category: ApiCategory, window: Duration) -> usize {
    let now = Instant::now();
    state
        .timestamps
        .get(&category)
        .map_or(0, |timestamps| {
            timestamps
                .iter()
                .filter(|t| now.duration_since(**t) <= window)
                .count()
        })
}
