
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::cache::{QueryResultCache, query_cache_key};
use crate::config::{PipelineConfig, SearchConfig};
use crate::database::{ScoredChunk, VectorIndex};
use crate::embeddings::{EmbeddingService, approximate_tokens};
use crate::llm::{ChatClient, ChatMessage};
use crate::rerank::{RerankedChunk, Reranker};
use crate::usage::{ApiCategory, UsageMonitor};
use crate::{RagError, Result};

const SYSTEM_PROMPT: &str =
    "You are a helpful assistant that provides accurate answers based on the given context.";

const ANSWER_INSTRUCTIONS: &str = "Please provide a comprehensive answer based on the context above. If the context doesn't contain enough information to fully answer the question, acknowledge this in your response. Include relevant details from the sources where appropriate.";

const NO_RESULTS_ANSWER: &str =
    "I couldn't find any relevant information for your question in the selected topics.";

/// Completion token estimate when the API omits usage on a non-streaming
/// call.
const FALLBACK_COMPLETION_TOKENS: u64 = 100;

const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Per-query overrides; config defaults apply where `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// kNN candidate count before reranking.
    pub limit: Option<usize>,
    /// Sources kept after reranking.
    pub rerank_top_k: Option<usize>,
}

/// One supporting chunk cited by an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub title: String,
    pub content: String,
    /// Cross-encoder relevance, higher is better.
    pub score: f32,
    pub context_type: String,
    pub context_item_id: i64,
}

impl From<RerankedChunk> for SourceRef {
    #[inline]
    fn from(reranked: RerankedChunk) -> Self {
        Self {
            title: reranked.chunk.title,
            content: reranked.chunk.content,
            score: reranked.rerank_score,
            context_type: reranked.chunk.context_type,
            context_item_id: reranked.chunk.context_item_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryAnswer {
    pub answer: String,
    pub sources: Vec<SourceRef>,
    /// The retrieved chunk records backing `sources`, with their original
    /// retrieval scores.
    pub context_items: Vec<ScoredChunk>,
}

/// Streaming query protocol: `Sources` always arrives first, then zero or
/// more `Token`s, then exactly one terminal `Done` or `Error`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryEvent {
    Sources { sources: Vec<SourceRef> },
    Token { token: String },
    Done { answer: String },
    Error { message: String },
}

/// What retrieval produced for one question, before answer synthesis.
enum Retrieval {
    Cached(QueryAnswer),
    NoMatch {
        cache_key: String,
    },
    Found {
        cache_key: String,
        sources: Vec<SourceRef>,
        context_items: Vec<ScoredChunk>,
        messages: Vec<ChatMessage>,
    },
}

/// End-to-end question answering: embed the question, retrieve and rerank
/// supporting chunks, synthesize an answer over them.
///
/// Whole results are cached by the canonical (question, topics, parameters)
/// key; empty results get a shorter TTL so newly ingested content shows up
/// quickly.
pub struct QueryPipeline {
    embeddings: Arc<EmbeddingService>,
    index: Arc<VectorIndex>,
    reranker: Arc<Reranker>,
    llm: Arc<ChatClient>,
    cache: Arc<QueryResultCache>,
    monitor: Arc<UsageMonitor>,
    search: SearchConfig,
}

impl QueryPipeline {
    #[inline]
    pub fn new(
        config: &PipelineConfig,
        embeddings: Arc<EmbeddingService>,
        index: Arc<VectorIndex>,
        reranker: Arc<Reranker>,
        llm: Arc<ChatClient>,
        cache: Arc<QueryResultCache>,
        monitor: Arc<UsageMonitor>,
    ) -> Self {
        Self {
            embeddings,
            index,
            reranker,
            llm,
            cache,
            monitor,
            search: config.search.clone(),
        }
    }

    /// Answer a question from the chunks attached to `topic_ids`.
    pub async fn query(
        &self,
        question: &str,
        topic_ids: &[i64],
        options: QueryOptions,
    ) -> Result<QueryAnswer> {
        match self.retrieve(question, topic_ids, options).await? {
            Retrieval::Cached(answer) => Ok(answer),
            Retrieval::NoMatch { cache_key } => {
                let answer = QueryAnswer {
                    answer: NO_RESULTS_ANSWER.to_string(),
                    sources: Vec::new(),
                    context_items: Vec::new(),
                };
                self.cache.set(&cache_key, &answer, true).await;
                Ok(answer)
            }
            Retrieval::Found {
                cache_key,
                sources,
                context_items,
                messages,
            } => {
                let prompt_estimate = estimate_prompt_tokens(&messages);
                self.monitor
                    .track_request_timestamp(ApiCategory::ChatCompletions);

                let response = self.llm.complete(messages).await?;

                let (prompt_tokens, completion_tokens) = match response.usage {
                    Some(usage) => (usage.prompt_tokens, usage.completion_tokens),
                    None => (prompt_estimate, FALLBACK_COMPLETION_TOKENS),
                };
                self.monitor.track_chat_completion_usage(
                    prompt_tokens,
                    completion_tokens,
                    self.llm.model(),
                );

                let answer = QueryAnswer {
                    answer: response.content,
                    sources,
                    context_items,
                };
                self.cache.set(&cache_key, &answer, false).await;
                info!("Answered question with {} sources", answer.sources.len());
                Ok(answer)
            }
        }
    }

    /// Streaming variant of [`query`](Self::query).
    ///
    /// Dropping the receiver cancels generation; in-flight events are
    /// discarded and nothing is cached for that question.
    pub fn query_stream(
        self: &Arc<Self>,
        question: &str,
        topic_ids: Vec<i64>,
        options: QueryOptions,
    ) -> mpsc::Receiver<QueryEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let pipeline = Arc::clone(self);
        let question = question.to_string();

        tokio::spawn(async move {
            if let Err(e) = pipeline
                .stream_inner(&question, &topic_ids, options, &tx)
                .await
            {
                let _ = tx
                    .send(QueryEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
            }
        });

        rx
    }

    async fn stream_inner(
        &self,
        question: &str,
        topic_ids: &[i64],
        options: QueryOptions,
        tx: &mpsc::Sender<QueryEvent>,
    ) -> Result<()> {
        match self.retrieve(question, topic_ids, options).await? {
            Retrieval::Cached(answer) => {
                if tx
                    .send(QueryEvent::Sources {
                        sources: answer.sources,
                    })
                    .await
                    .is_err()
                {
                    return Ok(());
                }
                // A cached answer arrives as a single token.
                if tx
                    .send(QueryEvent::Token {
                        token: answer.answer.clone(),
                    })
                    .await
                    .is_err()
                {
                    return Ok(());
                }
                let _ = tx
                    .send(QueryEvent::Done {
                        answer: answer.answer,
                    })
                    .await;
                Ok(())
            }
            Retrieval::NoMatch { cache_key } => {
                let answer = QueryAnswer {
                    answer: NO_RESULTS_ANSWER.to_string(),
                    sources: Vec::new(),
                    context_items: Vec::new(),
                };
                self.cache.set(&cache_key, &answer, true).await;

                if tx
                    .send(QueryEvent::Sources {
                        sources: Vec::new(),
                    })
                    .await
                    .is_err()
                {
                    return Ok(());
                }
                let _ = tx
                    .send(QueryEvent::Done {
                        answer: answer.answer,
                    })
                    .await;
                Ok(())
            }
            Retrieval::Found {
                cache_key,
                sources,
                context_items,
                messages,
            } => {
                if tx
                    .send(QueryEvent::Sources {
                        sources: sources.clone(),
                    })
                    .await
                    .is_err()
                {
                    return Ok(());
                }

                let prompt_estimate = estimate_prompt_tokens(&messages);
                self.monitor
                    .track_request_timestamp(ApiCategory::ChatCompletions);

                let mut token_rx = self.llm.stream(messages);
                let mut answer = String::new();
                while let Some(item) = token_rx.recv().await {
                    let token = item?;
                    answer.push_str(&token);
                    if tx.send(QueryEvent::Token { token }).await.is_err() {
                        debug!("Stream consumer disconnected; aborting generation");
                        return Ok(());
                    }
                }

                self.monitor.track_chat_completion_usage(
                    prompt_estimate,
                    approximate_tokens(&answer),
                    self.llm.model(),
                );

                let result = QueryAnswer {
                    answer: answer.clone(),
                    sources,
                    context_items,
                };
                self.cache.set(&cache_key, &result, false).await;

                let _ = tx.send(QueryEvent::Done { answer }).await;
                Ok(())
            }
        }
    }

    /// Validate the request, consult the result cache, and run retrieval
    /// plus reranking. Answer synthesis is left to the caller.
    async fn retrieve(
        &self,
        question: &str,
        topic_ids: &[i64],
        options: QueryOptions,
    ) -> Result<Retrieval> {
        if question.trim().is_empty() {
            return Err(RagError::InvalidInput("Question is empty".to_string()));
        }
        if topic_ids.is_empty() {
            return Err(RagError::InvalidInput("No topics selected".to_string()));
        }

        let limit = options.limit.unwrap_or(self.search.limit);
        if limit == 0 || limit > 100 {
            return Err(RagError::InvalidInput(format!(
                "Invalid limit: {limit} (must be between 1 and 100)"
            )));
        }
        let top_k = options
            .rerank_top_k
            .unwrap_or(self.search.rerank_top_k)
            .min(limit);
        if top_k == 0 {
            return Err(RagError::InvalidInput(
                "rerank_top_k must be nonzero".to_string(),
            ));
        }

        let cache_key = query_cache_key(question, topic_ids, limit, top_k);
        if let Some(answer) = self.cache.get::<QueryAnswer>(&cache_key).await {
            debug!("Query cache hit");
            return Ok(Retrieval::Cached(answer));
        }

        if self.monitor.check_rate_limits() {
            return Err(RagError::Transient(
                "API rate limit reached; try again shortly".to_string(),
            ));
        }

        let vector = self.embeddings.embed(question).await?;
        let candidates = self.index.search(&vector, topic_ids, limit).await?;
        if candidates.is_empty() {
            debug!("No candidates for question in topics {:?}", topic_ids);
            return Ok(Retrieval::NoMatch { cache_key });
        }

        let reranked = self
            .reranker
            .rerank(question, candidates, Some(top_k))
            .await?;
        let mut sources = Vec::with_capacity(reranked.len());
        let mut context_items = Vec::with_capacity(reranked.len());
        for candidate in reranked {
            context_items.push(candidate.chunk.clone());
            sources.push(SourceRef::from(candidate));
        }
        let messages = build_messages(question, &sources);

        Ok(Retrieval::Found {
            cache_key,
            sources,
            context_items,
            messages,
        })
    }

    /// Drop all cached query results. Used after re-ingestion when stale
    /// answers within the TTL window are not acceptable.
    #[inline]
    pub async fn flush_cache(&self) {
        self.cache.flush().await;
    }
}

fn build_messages(question: &str, sources: &[SourceRef]) -> Vec<ChatMessage> {
    use std::fmt::Write;

    let mut context = String::new();
    for (i, source) in sources.iter().enumerate() {
        let _ = write!(
            context,
            "[Source {}] {}\n{}\n\n",
            i + 1,
            source.title,
            source.content
        );
    }

    let user = format!(
        "{SYSTEM_PROMPT}\n\nContext:\n{context}Question: {question}\n\n{ANSWER_INSTRUCTIONS}"
    );
    vec![
        ChatMessage::system(SYSTEM_PROMPT),
        ChatMessage::user(user),
    ]
}

fn estimate_prompt_tokens(messages: &[ChatMessage]) -> u64 {
    messages
        .iter()
        .map(|m| approximate_tokens(&m.content))
        .sum()
}
