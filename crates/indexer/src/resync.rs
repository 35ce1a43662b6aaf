use crate::error::{IndexerError, Result};
use crate::loader::Loader;
use crate::notifier::{NotifierSignal, ResyncRequest, ResyncTrigger};
use crate::stats::ResyncStats;
use brain_vector_store::{EmbeddedChunk, Embedder, IndexCoordinator};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{mpsc, watch};
use tokio::time;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResyncState {
    Idle,
    Running,
    PendingRerun,
}

/// Published view of the resync driver.
#[derive(Debug, Clone, Serialize)]
pub struct ResyncStatus {
    pub state: ResyncState,
    pub runs_completed: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_success_unix_ms: Option<u64>,
    pub last_duration_ms: Option<u64>,
    pub last_stats: Option<ResyncStats>,
    /// Set once the watch subscription reports an error; explicit resyncs
    /// still work, but passive change detection can no longer be trusted.
    pub watch_degraded: bool,
}

impl ResyncStatus {
    fn initial() -> Self {
        Self {
            state: ResyncState::Idle,
            runs_completed: 0,
            consecutive_failures: 0,
            last_error: None,
            last_success_unix_ms: None,
            last_duration_ms: None,
            last_stats: None,
            watch_degraded: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResyncDriverConfig {
    /// Per-chunk ceiling on the embedding collaborator, so one unresponsive
    /// item cannot stall the whole run.
    pub embed_timeout: Duration,
    /// Per-document ceiling on parsing, for the same reason.
    pub document_timeout: Duration,
}

impl Default for ResyncDriverConfig {
    fn default() -> Self {
        Self {
            embed_timeout: Duration::from_secs(10),
            document_timeout: Duration::from_secs(30),
        }
    }
}

/// Handle for triggering resyncs and observing driver state.
#[derive(Clone)]
pub struct ResyncHandle {
    request_tx: mpsc::Sender<ResyncRequest>,
    status_rx: watch::Receiver<ResyncStatus>,
}

impl ResyncHandle {
    /// Queue an explicit resync. Returns once the request is accepted, not
    /// once the run completes: a resync has no caller to report to.
    pub async fn trigger(&self, full_rebuild: bool) -> Result<()> {
        self.request_tx
            .send(ResyncRequest::explicit(full_rebuild))
            .await
            .map_err(|e| IndexerError::Other(format!("resync driver unavailable: {e}")))
    }

    #[must_use]
    pub fn status(&self) -> ResyncStatus {
        self.status_rx.borrow().clone()
    }
}

/// Spawn the dedicated resync worker.
///
/// At most one resync executes at a time. Requests arriving while a run is in
/// flight coalesce into exactly one follow-up run (with `full_rebuild` flags
/// merged), so a burst costs at most one extra run and no request is ever
/// dropped.
pub fn spawn_resync_driver(
    loader: Arc<dyn Loader>,
    embedder: Arc<dyn Embedder>,
    coordinator: Arc<IndexCoordinator>,
    mut signals: mpsc::Receiver<NotifierSignal>,
    config: ResyncDriverConfig,
) -> ResyncHandle {
    let (request_tx, mut request_rx) = mpsc::channel::<ResyncRequest>(16);
    let (status_tx, status_rx) = watch::channel(ResyncStatus::initial());

    tokio::spawn(async move {
        let mut status = ResyncStatus::initial();
        let mut requests_open = true;
        let mut watch_open = true;

        loop {
            // Idle: wait for the next request from either source.
            let request = tokio::select! {
                maybe = request_rx.recv(), if requests_open => match maybe {
                    Some(request) => Some(request),
                    None => {
                        requests_open = false;
                        None
                    }
                },
                maybe = signals.recv(), if watch_open => match maybe {
                    Some(NotifierSignal::Resync(request)) => Some(request),
                    Some(NotifierSignal::Degraded { detail }) => {
                        log::warn!("Watch degraded: {detail}");
                        status.watch_degraded = true;
                        let _ = status_tx.send(status.clone());
                        None
                    }
                    None => {
                        watch_open = false;
                        None
                    }
                },
                else => break,
            };
            let Some(request) = request else { continue };

            let mut pending = Some(request);
            while let Some(request) = pending.take() {
                status.state = ResyncState::Running;
                let _ = status_tx.send(status.clone());

                // Absorb further requests while the run executes; they mark a
                // follow-up instead of starting a second concurrent run.
                let run = run_once(&*loader, &*embedder, &coordinator, &request, &config);
                tokio::pin!(run);
                let outcome = loop {
                    tokio::select! {
                        outcome = &mut run => break outcome,
                        maybe = request_rx.recv(), if requests_open => match maybe {
                            Some(next) => coalesce(&mut pending, next),
                            None => requests_open = false,
                        },
                        maybe = signals.recv(), if watch_open => match maybe {
                            Some(NotifierSignal::Resync(next)) => coalesce(&mut pending, next),
                            Some(NotifierSignal::Degraded { detail }) => {
                                log::warn!("Watch degraded: {detail}");
                                status.watch_degraded = true;
                            }
                            None => watch_open = false,
                        },
                    }
                };

                match outcome {
                    Ok(stats) => {
                        log::info!(
                            "Resync finished in {}ms: {} documents, {} chunks",
                            stats.duration_ms,
                            stats.documents,
                            stats.chunks
                        );
                        status.runs_completed += 1;
                        status.consecutive_failures = 0;
                        status.last_error = None;
                        status.last_success_unix_ms = Some(current_unix_ms());
                        status.last_duration_ms = Some(stats.duration_ms);
                        status.last_stats = Some(stats);
                    }
                    Err(err) => {
                        // Fatal to this run only; the previous index content
                        // remains servable.
                        log::error!("Resync failed: {err}");
                        status.consecutive_failures += 1;
                        status.last_error = Some(err);
                    }
                }

                status.state = if pending.is_some() {
                    ResyncState::PendingRerun
                } else {
                    ResyncState::Idle
                };
                let _ = status_tx.send(status.clone());
            }
        }
    });

    ResyncHandle {
        request_tx,
        status_rx,
    }
}

fn coalesce(pending: &mut Option<ResyncRequest>, next: ResyncRequest) {
    match pending {
        Some(current) => {
            current.full_rebuild = current.full_rebuild || next.full_rebuild;
            if next.trigger == ResyncTrigger::ExplicitRebuild {
                current.trigger = ResyncTrigger::ExplicitRebuild;
            }
        }
        None => *pending = Some(next),
    }
}

async fn run_once(
    loader: &dyn Loader,
    embedder: &dyn Embedder,
    coordinator: &IndexCoordinator,
    request: &ResyncRequest,
    config: &ResyncDriverConfig,
) -> std::result::Result<ResyncStats, String> {
    let started = Instant::now();
    let mut stats = ResyncStats::new();

    let documents = loader
        .list_documents()
        .await
        .map_err(|e| format!("listing documents: {e}"))?;
    log::info!(
        "Resync started: {} documents, trigger {:?}, full_rebuild={}",
        documents.len(),
        request.trigger,
        request.full_rebuild
    );

    let mut items: Vec<EmbeddedChunk> = Vec::new();
    for doc in &documents {
        let parsed = time::timeout(config.document_timeout, loader.parse_and_chunk(doc)).await;
        let chunks = match parsed {
            Ok(Ok(chunks)) => chunks,
            Ok(Err(err)) => {
                log::warn!("Skipping document {}: {err}", doc.relative);
                stats.skip_document(format!("{}: {err}", doc.relative));
                continue;
            }
            Err(_elapsed) => {
                log::warn!("Skipping document {}: parse timed out", doc.relative);
                stats.skip_document(format!("{}: parse timed out", doc.relative));
                continue;
            }
        };

        let mut kept = 0usize;
        for chunk in chunks {
            let embedded = time::timeout(config.embed_timeout, embedder.embed(&chunk.text)).await;
            match embedded {
                Ok(Ok(vector)) => {
                    items.push(EmbeddedChunk { chunk, vector });
                    kept += 1;
                }
                Ok(Err(err)) => {
                    log::warn!("Skipping chunk {}: {err}", chunk.id);
                    stats.skip_chunk(format!("{}: {err}", chunk.id));
                }
                Err(_elapsed) => {
                    log::warn!("Skipping chunk {}: embedding timed out", chunk.id);
                    stats.skip_chunk(format!("{}: embedding timed out", chunk.id));
                }
            }
        }
        stats.add_document(kept);
    }

    if request.full_rebuild {
        coordinator
            .reset()
            .await
            .map_err(|e| format!("reset failed: {e}"))?;
    }

    if !items.is_empty() {
        let written = coordinator
            .upsert(items)
            .await
            .map_err(|e| format!("upsert failed: {e}"))?;
        log::debug!("Resync wrote {written} chunks");
    } else if !coordinator.is_available() {
        // A successful resync over an empty folder still yields a servable
        // (empty) index, distinct from "never indexed".
        coordinator
            .reset()
            .await
            .map_err(|e| format!("reset failed: {e}"))?;
    }

    #[allow(clippy::cast_possible_truncation)]
    {
        stats.duration_ms = started.elapsed().as_millis() as u64;
    }
    Ok(stats)
}

fn current_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|dur| dur.as_millis() as u64)
        .unwrap_or(0)
}
