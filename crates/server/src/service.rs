use crate::generate::{GenerationError, Generator};
use brain_indexer::{ResyncHandle, ResyncStatus};
use brain_query_cache::{CacheError, CacheStats, QueryCache};
use brain_rate_limit::RateLimiter;
use brain_vector_store::{Embedder, IndexCoordinator, SearchHit};
use nucleo_matcher::pattern::{CaseMatching, Normalization, Pattern};
use nucleo_matcher::Matcher;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Weight of the cosine score versus the lexical boost in the final ranking.
const SEMANTIC_WEIGHT: f32 = 0.8;
const LEXICAL_WEIGHT: f32 = 0.2;
const MAX_K: usize = 50;

#[derive(Debug, Clone, Serialize)]
pub struct SearchResultItem {
    pub source: String,
    pub chunk_id: String,
    pub score: f32,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub k: usize,
    pub results: Vec<SearchResultItem>,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub query: String,
    #[serde(default = "default_k")]
    pub k: usize,
    pub system: Option<String>,
    pub model: Option<String>,
}

fn default_k() -> usize {
    5
}

#[derive(Debug, Serialize)]
pub struct Citation {
    pub index: usize,
    pub source: String,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub answer: String,
    pub citations: Vec<Citation>,
}

#[derive(Debug, Serialize)]
pub struct ResyncAccepted {
    pub status: &'static str,
    pub full_rebuild: bool,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub root: String,
    pub index_available: bool,
    pub indexed_chunks: usize,
    pub index_epoch: u64,
    pub cache: CacheStats,
    pub resync: ResyncStatus,
    pub active_clients: usize,
}

#[derive(Error, Debug)]
pub enum ServiceError {
    /// Stable refusal the caller can back off on; never conflated with a
    /// generic failure.
    #[error("rate limit exceeded")]
    RateLimitExceeded,

    /// No successful resync has ever completed; distinct from an empty
    /// result set.
    #[error("no documents have been indexed yet")]
    IndexUnavailable,

    #[error("search failed: {0}")]
    Search(String),

    #[error("generation failed: {0}")]
    Generation(#[from] GenerationError),

    #[error("resync driver unavailable: {0}")]
    Resync(String),
}

/// The request-facing facade. Every operation admits the client through the
/// rate limiter before touching the cache, the coordinator, or the
/// generation service.
pub struct BrainService {
    root: PathBuf,
    embedder: Arc<dyn Embedder>,
    coordinator: Arc<IndexCoordinator>,
    cache: Arc<QueryCache<SearchResponse>>,
    limiter: Arc<RateLimiter>,
    generator: Arc<dyn Generator>,
    resync: ResyncHandle,
}

impl BrainService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        root: PathBuf,
        embedder: Arc<dyn Embedder>,
        coordinator: Arc<IndexCoordinator>,
        cache: Arc<QueryCache<SearchResponse>>,
        limiter: Arc<RateLimiter>,
        generator: Arc<dyn Generator>,
        resync: ResyncHandle,
    ) -> Self {
        Self {
            root,
            embedder,
            coordinator,
            cache,
            limiter,
            generator,
            resync,
        }
    }

    pub async fn search(
        &self,
        query: &str,
        k: usize,
        client: &str,
    ) -> Result<SearchResponse, ServiceError> {
        self.admit(client)?;
        self.cached_search(query, k).await
    }

    pub async fn chat(
        &self,
        request: ChatRequest,
        client: &str,
    ) -> Result<ChatResponse, ServiceError> {
        self.admit(client)?;
        let retrieval = self.cached_search(&request.query, request.k).await?;

        let prompt = build_prompt(&request.query, &retrieval.results);
        let answer = self
            .generator
            .generate(&prompt, request.system.as_deref(), request.model.as_deref())
            .await?;

        let citations = retrieval
            .results
            .iter()
            .enumerate()
            .map(|(i, result)| Citation {
                index: i + 1,
                source: result.source.clone(),
            })
            .collect();
        Ok(ChatResponse { answer, citations })
    }

    /// Queue a resync; returns once the request is accepted. Progress is
    /// visible through [`BrainService::stats`].
    pub async fn trigger_resync(
        &self,
        full_rebuild: bool,
        client: &str,
    ) -> Result<ResyncAccepted, ServiceError> {
        self.admit(client)?;
        self.resync
            .trigger(full_rebuild)
            .await
            .map_err(|err| ServiceError::Resync(err.to_string()))?;
        Ok(ResyncAccepted {
            status: "accepted",
            full_rebuild,
        })
    }

    pub fn stats(&self, client: &str) -> Result<StatusResponse, ServiceError> {
        self.admit(client)?;
        Ok(StatusResponse {
            root: self.root.display().to_string(),
            index_available: self.coordinator.is_available(),
            indexed_chunks: self.coordinator.item_count(),
            index_epoch: self.coordinator.current_epoch(),
            cache: self.cache.stats(),
            resync: self.resync.status(),
            active_clients: self.limiter.active_clients(),
        })
    }

    fn admit(&self, client: &str) -> Result<(), ServiceError> {
        if self.limiter.admit(client) {
            Ok(())
        } else {
            log::warn!("Rate limit exceeded for client {client}");
            Err(ServiceError::RateLimitExceeded)
        }
    }

    /// Retrieval shared by `search` and `chat`: one cache entry per
    /// `(query, k)`, computed at most once concurrently.
    async fn cached_search(&self, query: &str, k: usize) -> Result<SearchResponse, ServiceError> {
        if !self.coordinator.is_available() {
            return Err(ServiceError::IndexUnavailable);
        }
        let k = k.clamp(1, MAX_K);
        let key = cache_key(query, k);

        let query = query.to_string();
        let embedder = self.embedder.clone();
        let coordinator = self.coordinator.clone();
        self.cache
            .get_or_compute(&key, move || async move {
                let vector = embedder.embed(&query).await?;
                let hits = coordinator.search(&vector, k)?;
                let results = blend_lexical(&query, hits);
                Ok(SearchResponse { query, k, results })
            })
            .await
            .map_err(|err| match err {
                CacheError::Compute(message) => ServiceError::Search(message),
            })
    }
}

fn cache_key(query: &str, k: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(query.as_bytes());
    hasher.update([0u8]);
    hasher.update(k.to_le_bytes());
    format!("{:x}", hasher.finalize())
}

/// Re-rank cosine hits with a lexical boost so literal matches of the query
/// rise above merely nearby vectors.
fn blend_lexical(query: &str, hits: Vec<SearchHit>) -> Vec<SearchResultItem> {
    let mut matcher = Matcher::new(nucleo_matcher::Config::DEFAULT);
    let pattern = Pattern::parse(query, CaseMatching::Smart, Normalization::Smart);

    let scored: Vec<(SearchHit, f32)> = hits
        .into_iter()
        .map(|hit| {
            // Safe Unicode truncation: score only the head of long chunks.
            let mut boundary = 800.min(hit.text.len());
            while boundary > 0 && !hit.text.is_char_boundary(boundary) {
                boundary -= 1;
            }
            let haystack = nucleo_matcher::Utf32String::from(&hit.text[..boundary]);
            #[allow(clippy::cast_precision_loss)]
            let lexical = pattern
                .score(haystack.slice(..), &mut matcher)
                .map_or(0.0, |s| s as f32);
            (hit, lexical)
        })
        .collect();

    let max_lexical = scored.iter().map(|(_, s)| *s).fold(0.0f32, f32::max);

    let mut results: Vec<SearchResultItem> = scored
        .into_iter()
        .map(|(hit, lexical)| {
            let normalized = if max_lexical > 0.0 {
                lexical / max_lexical
            } else {
                0.0
            };
            SearchResultItem {
                score: SEMANTIC_WEIGHT * hit.score + LEXICAL_WEIGHT * normalized,
                source: hit.source,
                chunk_id: hit.id,
                content: hit.text,
            }
        })
        .collect();
    results.sort_by(|a, b| b.score.total_cmp(&a.score));
    results
}

fn build_prompt(question: &str, results: &[SearchResultItem]) -> String {
    let context = results
        .iter()
        .enumerate()
        .map(|(i, result)| format!("[{}] {}\nSOURCE: {}", i + 1, result.content, result.source))
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "You are a helpful assistant. Answer the user's question strictly using the CONTEXT.\n\
         If the answer is not present in the context, say you don't know and suggest where to \
         look in the files.\nCite sources as [n] matching the provided context blocks.\n\n\
         QUESTION: {question}\n\nCONTEXT:\n{context}\n\n\
         Provide a concise answer with citations like [1], [2]."
    )
}
