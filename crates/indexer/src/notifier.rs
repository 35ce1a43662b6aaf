use crate::error::{IndexerError, Result};
use crate::loader::LoaderConfig;
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::mpsc;
use tokio::time;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    DirectoryIgnored,
}

/// One raw filesystem change, as delivered by the watcher.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub at: SystemTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResyncTrigger {
    Watcher,
    ExplicitRebuild,
}

/// A coalesced request for the resync driver.
#[derive(Debug, Clone)]
pub struct ResyncRequest {
    pub trigger: ResyncTrigger,
    pub full_rebuild: bool,
    pub requested_at: SystemTime,
}

impl ResyncRequest {
    #[must_use]
    pub fn watcher() -> Self {
        Self {
            trigger: ResyncTrigger::Watcher,
            full_rebuild: false,
            requested_at: SystemTime::now(),
        }
    }

    #[must_use]
    pub fn explicit(full_rebuild: bool) -> Self {
        Self {
            trigger: ResyncTrigger::ExplicitRebuild,
            full_rebuild,
            requested_at: SystemTime::now(),
        }
    }
}

/// What the notifier hands to the resync driver.
#[derive(Debug, Clone)]
pub enum NotifierSignal {
    Resync(ResyncRequest),
    /// The watch subscription errored or was lost; change detection can no
    /// longer be trusted until restart.
    Degraded { detail: String },
}

#[derive(Debug, Clone)]
pub struct NotifierConfig {
    /// Quiescence window: a resync is requested once no relevant event has
    /// arrived for this long.
    pub debounce: Duration,
    /// Ceiling on how long a steady drip of events may defer the resync.
    pub max_batch_wait: Duration,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(1),
            max_batch_wait: Duration::from_secs(5),
        }
    }
}

/// Owns the filesystem watch subscription. Dropping it ends the watch and,
/// shortly after, the debounce task.
pub struct ChangeNotifier {
    _watcher: RecommendedWatcher,
}

impl ChangeNotifier {
    /// Watch `root` recursively and return the signal stream for the resync
    /// driver. The `notify` callback thread only forwards events over a
    /// bounded channel; filtering and coalescing happen on the debounce task.
    pub fn start(
        root: impl Into<PathBuf>,
        loader_config: LoaderConfig,
        config: NotifierConfig,
    ) -> Result<(Self, mpsc::Receiver<NotifierSignal>)> {
        let root = root.into();
        let (event_tx, event_rx) = mpsc::channel(1024);
        let watcher = create_fs_watcher(&root, event_tx)?;
        let signal_rx = spawn_debounce_loop(root, loader_config, config, event_rx);
        Ok((Self { _watcher: watcher }, signal_rx))
    }
}

fn create_fs_watcher(
    root: &Path,
    sender: mpsc::Sender<notify::Result<Event>>,
) -> Result<RecommendedWatcher> {
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = sender.blocking_send(res);
        },
        NotifyConfig::default(),
    )
    .map_err(|e| IndexerError::Watch(format!("watcher init failed: {e}")))?;
    watcher
        .watch(root, RecursiveMode::Recursive)
        .map_err(|e| IndexerError::Watch(format!("failed to watch {}: {e}", root.display())))?;
    Ok(watcher)
}

/// Run the debounce loop over a raw watcher event stream. Split out from
/// [`ChangeNotifier::start`] so tests can feed synthetic events.
pub fn spawn_debounce_loop(
    root: PathBuf,
    loader_config: LoaderConfig,
    config: NotifierConfig,
    mut event_rx: mpsc::Receiver<notify::Result<Event>>,
) -> mpsc::Receiver<NotifierSignal> {
    let (signal_tx, signal_rx) = mpsc::channel(8);

    tokio::spawn(async move {
        let mut window = DebounceWindow::new(config.debounce, config.max_batch_wait);

        loop {
            let deadline = window.next_deadline();

            tokio::select! {
                maybe = event_rx.recv() => match maybe {
                    Some(Ok(event)) => {
                        let relevant = classify(&event)
                            .into_iter()
                            .filter(|change| is_indexable(&root, &loader_config, change))
                            .count();
                        if relevant > 0 {
                            window.record(relevant);
                        }
                    }
                    Some(Err(err)) => {
                        log::warn!("Watch error: {err}");
                        let _ = signal_tx
                            .send(NotifierSignal::Degraded {
                                detail: err.to_string(),
                            })
                            .await;
                    }
                    None => {
                        let _ = signal_tx
                            .send(NotifierSignal::Degraded {
                                detail: "watch subscription closed".to_string(),
                            })
                            .await;
                        break;
                    }
                },
                () = async {
                    if let Some(deadline) = deadline {
                        time::sleep_until(deadline).await;
                    }
                }, if deadline.is_some() => {
                    let pending = window.take();
                    log::info!("Change burst settled ({pending} events), requesting resync");
                    if signal_tx
                        .send(NotifierSignal::Resync(ResyncRequest::watcher()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
    });

    signal_rx
}

/// Map a raw `notify` event onto change events, one per affected path.
fn classify(event: &Event) -> Vec<ChangeEvent> {
    let kind = match event.kind {
        EventKind::Create(_) => ChangeKind::Created,
        EventKind::Modify(_) => ChangeKind::Modified,
        EventKind::Remove(_) => ChangeKind::Deleted,
        _ => return Vec::new(),
    };

    let at = SystemTime::now();
    event
        .paths
        .iter()
        .map(|path| {
            // A deleted path can no longer be stat'ed; assume file.
            let kind = if kind != ChangeKind::Deleted && path.is_dir() {
                ChangeKind::DirectoryIgnored
            } else {
                kind
            };
            ChangeEvent {
                path: path.clone(),
                kind,
                at,
            }
        })
        .collect()
}

fn is_indexable(root: &Path, loader_config: &LoaderConfig, change: &ChangeEvent) -> bool {
    if change.kind == ChangeKind::DirectoryIgnored {
        return false;
    }

    let Ok(relative) = change.path.strip_prefix(root) else {
        return false;
    };
    // Hidden components cover the daemon's own data directory as well as
    // editor droppings like `.git` or `.obsidian`.
    let hidden = relative.components().any(|component| {
        component
            .as_os_str()
            .to_string_lossy()
            .starts_with('.')
    });
    if hidden {
        return false;
    }

    loader_config.allows(&change.path)
}

struct DebounceWindow {
    debounce: Duration,
    max_batch: Duration,
    pending: usize,
    last_event: Option<Instant>,
    first_event: Option<Instant>,
}

impl DebounceWindow {
    const fn new(debounce: Duration, max_batch: Duration) -> Self {
        Self {
            debounce,
            max_batch,
            pending: 0,
            last_event: None,
            first_event: None,
        }
    }

    fn record(&mut self, count: usize) {
        self.pending += count.max(1);
        self.last_event = Some(Instant::now());
        self.first_event.get_or_insert_with(Instant::now);
    }

    fn next_deadline(&self) -> Option<time::Instant> {
        let last = self.last_event?;
        let mut deadline = last + self.debounce;
        if let Some(first) = self.first_event {
            let ceiling = first + self.max_batch;
            if ceiling < deadline {
                deadline = ceiling;
            }
        }
        Some(time::Instant::from_std(deadline))
    }

    fn take(&mut self) -> usize {
        let pending = self.pending;
        self.pending = 0;
        self.last_event = None;
        self.first_event = None;
        pending
    }
}
