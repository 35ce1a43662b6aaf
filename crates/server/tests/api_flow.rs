//! End-to-end flows through the service facade: resync, cached search, chat,
//! rate limiting, and the not-yet-indexed signal.

use async_trait::async_trait;
use brain_indexer::{
    spawn_resync_driver, FsLoader, LoaderConfig, NotifierSignal, ResyncDriverConfig, ResyncHandle,
    ResyncState, DATA_DIR,
};
use brain_query_cache::{CacheConfig, QueryCache};
use brain_rate_limit::{RateLimitConfig, RateLimiter};
use brain_server::generate::{GenerationError, Generator};
use brain_server::service::{BrainService, ChatRequest, ServiceError};
use brain_vector_store::{Embedder, HashEmbedder, IndexCoordinator};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

struct CannedGenerator;

#[async_trait]
impl Generator for CannedGenerator {
    async fn generate(
        &self,
        prompt: &str,
        _system: Option<&str>,
        _model: Option<&str>,
    ) -> Result<String, GenerationError> {
        assert!(prompt.contains("QUESTION:"));
        Ok("canned answer [1]".to_string())
    }
}

struct Harness {
    service: Arc<BrainService>,
    resync: ResyncHandle,
    coordinator: Arc<IndexCoordinator>,
    // Keeps the notifier channel open so the driver never sees it close.
    _signal_tx: mpsc::Sender<NotifierSignal>,
}

async fn harness(root: &Path, rate: RateLimitConfig) -> Harness {
    let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(64));
    let coordinator =
        Arc::new(IndexCoordinator::open(root.join(DATA_DIR).join("index.json")).await);
    let cache = Arc::new(QueryCache::new(CacheConfig {
        capacity: 50,
        ttl: Duration::from_secs(600),
    }));
    {
        let cache = cache.clone();
        coordinator.add_write_hook(move || cache.invalidate_all());
    }

    let loader = Arc::new(FsLoader::new(root, LoaderConfig::default()).unwrap());
    let (signal_tx, signal_rx) = mpsc::channel(8);
    let resync = spawn_resync_driver(
        loader,
        embedder.clone(),
        coordinator.clone(),
        signal_rx,
        ResyncDriverConfig::default(),
    );

    let service = Arc::new(BrainService::new(
        root.to_path_buf(),
        embedder,
        coordinator.clone(),
        cache,
        Arc::new(RateLimiter::new(rate)),
        Arc::new(CannedGenerator),
        resync.clone(),
    ));

    Harness {
        service,
        resync,
        coordinator,
        _signal_tx: signal_tx,
    }
}

fn generous_rate() -> RateLimitConfig {
    RateLimitConfig {
        capacity: 10_000.0,
        refill_per_sec: 1_000.0,
        idle_horizon: Duration::from_secs(600),
        reap_interval: Duration::from_secs(60),
    }
}

async fn resync_and_wait(harness: &Harness, full_rebuild: bool, runs: u64) {
    harness.resync.trigger(full_rebuild).await.unwrap();
    for _ in 0..250 {
        if harness.resync.status().runs_completed >= runs {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("resync {runs} did not complete");
}

#[tokio::test]
async fn search_before_any_resync_reports_not_indexed() {
    let dir = tempfile::tempdir().unwrap();
    let harness = harness(dir.path(), generous_rate()).await;

    let err = harness
        .service
        .search("anything", 5, "client")
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::IndexUnavailable));
}

#[tokio::test]
async fn search_finds_indexed_content_and_caches_the_result() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("hello.md"), "hello world, this is my note").unwrap();
    std::fs::write(dir.path().join("other.md"), "apples pears plums").unwrap();

    let harness = harness(dir.path(), generous_rate()).await;
    resync_and_wait(&harness, false, 1).await;

    let first = harness
        .service
        .search("hello world", 1, "client")
        .await
        .unwrap();
    assert_eq!(first.results.len(), 1);
    assert_eq!(first.results[0].source, "hello.md");

    let second = harness
        .service
        .search("hello world", 1, "client")
        .await
        .unwrap();
    assert_eq!(second.results[0].chunk_id, first.results[0].chunk_id);

    let stats = harness.service.stats("client").unwrap();
    assert!(stats.cache.hits >= 1, "second lookup must be a cache hit");
    assert_eq!(stats.indexed_chunks, 2);
    assert!(stats.index_available);
}

#[tokio::test]
async fn an_index_write_invalidates_previously_cached_results() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("note.md"), "the door code is 1111").unwrap();

    let harness = harness(dir.path(), generous_rate()).await;
    resync_and_wait(&harness, false, 1).await;

    let before = harness
        .service
        .search("door code", 1, "client")
        .await
        .unwrap();
    assert!(before.results[0].content.contains("1111"));

    std::fs::write(dir.path().join("note.md"), "the door code is 2222").unwrap();
    resync_and_wait(&harness, false, 2).await;

    let after = harness
        .service
        .search("door code", 1, "client")
        .await
        .unwrap();
    assert!(
        after.results[0].content.contains("2222"),
        "stale cached result served after an index write: {}",
        after.results[0].content
    );
}

#[tokio::test]
async fn upserting_the_same_document_replaces_instead_of_duplicating() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.md"), "hello").unwrap();

    let harness = harness(dir.path(), generous_rate()).await;
    resync_and_wait(&harness, false, 1).await;
    assert_eq!(harness.coordinator.item_count(), 1);

    std::fs::write(dir.path().join("a.md"), "world").unwrap();
    resync_and_wait(&harness, false, 2).await;
    assert_eq!(harness.coordinator.item_count(), 1, "replaced, not duplicated");

    let results = harness.service.search("world", 1, "client").await.unwrap();
    assert!(results.results[0].content.contains("world"));
}

#[tokio::test]
async fn budget_of_three_admits_exactly_three_of_five_searches() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("note.md"), "rationed content").unwrap();

    let rate = RateLimitConfig {
        capacity: 3.0,
        refill_per_sec: 0.0001,
        idle_horizon: Duration::from_secs(600),
        reap_interval: Duration::from_secs(60),
    };
    let harness = harness(dir.path(), rate).await;
    resync_and_wait(&harness, false, 1).await;

    let mut admitted = 0;
    let mut refused = 0;
    for _ in 0..5 {
        match harness.service.search("rationed", 1, "greedy").await {
            Ok(_) => admitted += 1,
            Err(ServiceError::RateLimitExceeded) => refused += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(admitted, 3);
    assert_eq!(refused, 2);
}

#[tokio::test]
async fn chat_answers_with_citations_from_retrieval() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("plan.md"), "the launch is on thursday").unwrap();

    let harness = harness(dir.path(), generous_rate()).await;
    resync_and_wait(&harness, false, 1).await;

    let response = harness
        .service
        .chat(
            ChatRequest {
                query: "when is the launch?".to_string(),
                k: 2,
                system: None,
                model: None,
            },
            "client",
        )
        .await
        .unwrap();

    assert_eq!(response.answer, "canned answer [1]");
    assert_eq!(response.citations.len(), 1);
    assert_eq!(response.citations[0].index, 1);
    assert_eq!(response.citations[0].source, "plan.md");
}

#[tokio::test]
async fn full_rebuild_of_an_emptied_folder_reaches_zero_chunks() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.md"), "alpha").unwrap();
    std::fs::write(dir.path().join("b.md"), "beta").unwrap();

    let harness = harness(dir.path(), generous_rate()).await;
    resync_and_wait(&harness, false, 1).await;
    assert_eq!(harness.coordinator.item_count(), 2);
    let epoch_before = harness.coordinator.current_epoch();

    std::fs::remove_file(dir.path().join("a.md")).unwrap();
    std::fs::remove_file(dir.path().join("b.md")).unwrap();
    resync_and_wait(&harness, true, 2).await;

    let stats = harness.service.stats("client").unwrap();
    assert_eq!(stats.indexed_chunks, 0);
    assert!(stats.index_available, "empty but servable");
    assert!(stats.index_epoch > epoch_before);
    assert_eq!(stats.resync.state, ResyncState::Idle);

    // Empty is distinct from unavailable: search succeeds with no results.
    let results = harness.service.search("alpha", 5, "client").await.unwrap();
    assert!(results.results.is_empty());
}
