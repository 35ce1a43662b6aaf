use crate::error::{Result, VectorStoreError};
use crate::store::{self, EmbeddedChunk, IndexSnapshot, SearchHit};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex as TokioMutex;

pub type WriteHook = Box<dyn Fn() + Send + Sync>;

/// Sole owner of the index handle.
///
/// Reads clone an `Arc` to the current [`IndexSnapshot`] and score outside
/// any lock, so a search observes exactly one epoch of the index and is never
/// blocked for the duration of a write. Writes build a shadow snapshot,
/// persist it, then swap the pointer; they are serialized among themselves by
/// an async gate. A failed persist leaves both the in-memory snapshot and the
/// epoch untouched.
pub struct IndexCoordinator {
    store_path: PathBuf,
    current: RwLock<Option<Arc<IndexSnapshot>>>,
    epoch: AtomicU64,
    write_gate: TokioMutex<()>,
    write_hooks: RwLock<Vec<WriteHook>>,
}

impl IndexCoordinator {
    /// Open the coordinator, restoring the persisted snapshot and its write
    /// epoch when one exists. A corrupt or unreadable index file degrades to
    /// the never-built state rather than failing startup.
    pub async fn open(store_path: impl Into<PathBuf>) -> Self {
        let store_path = store_path.into();
        let (current, epoch) = if store_path.exists() {
            match store::load_snapshot(&store_path).await {
                Ok(snapshot) => {
                    log::info!(
                        "Loaded index from {}: {} chunks, epoch {}",
                        store_path.display(),
                        snapshot.len(),
                        snapshot.epoch()
                    );
                    let epoch = snapshot.epoch();
                    (Some(snapshot), epoch)
                }
                Err(err) => {
                    log::warn!(
                        "Failed to load index {}: {err}; starting unbuilt",
                        store_path.display()
                    );
                    (None, 0)
                }
            }
        } else {
            (None, 0)
        };

        Self {
            store_path,
            current: RwLock::new(current),
            epoch: AtomicU64::new(epoch),
            write_gate: TokioMutex::new(()),
            write_hooks: RwLock::new(Vec::new()),
        }
    }

    /// Register a callback fired after every successful `upsert`/`reset`,
    /// outside all coordinator locks.
    pub fn add_write_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        match self.write_hooks.write() {
            Ok(mut hooks) => hooks.push(Box::new(hook)),
            Err(poisoned) => poisoned.into_inner().push(Box::new(hook)),
        }
    }

    /// Read-only top-k search against the current snapshot.
    ///
    /// Runs concurrently with other searches and with writes; a search that
    /// overlaps a write sees either the pre-write or the post-write snapshot,
    /// never a mix.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        let snapshot = self
            .read_current()
            .ok_or(VectorStoreError::IndexUnavailable)?;
        snapshot.search(query, k)
    }

    /// Apply `items` last-write-wins by chunk id. Bumps the write epoch
    /// exactly once per successful call and returns the number of items
    /// written.
    pub async fn upsert(&self, items: Vec<EmbeddedChunk>) -> Result<usize> {
        let gate = self.write_gate.lock().await;
        let count = items.len();
        let next_epoch = self.epoch.load(Ordering::SeqCst) + 1;
        let base = self
            .read_current()
            .unwrap_or_else(|| Arc::new(IndexSnapshot::empty(0)));
        let next = Arc::new(base.apply_upsert(items, next_epoch));

        store::save_snapshot(&next, &self.store_path).await?;
        self.install(next);
        drop(gate);

        self.fire_write_hooks();
        Ok(count)
    }

    /// Clear all content. The index stays *available* (count 0), which is
    /// distinct from never having been built.
    pub async fn reset(&self) -> Result<()> {
        let gate = self.write_gate.lock().await;
        let next_epoch = self.epoch.load(Ordering::SeqCst) + 1;
        let next = Arc::new(IndexSnapshot::empty(next_epoch));

        store::save_snapshot(&next, &self.store_path).await?;
        self.install(next);
        drop(gate);

        self.fire_write_hooks();
        Ok(())
    }

    /// Monotonically non-decreasing write epoch.
    #[must_use]
    pub fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Whether any index has ever been built (or restored from disk).
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.read_current().is_some()
    }

    #[must_use]
    pub fn item_count(&self) -> usize {
        self.read_current().map_or(0, |snapshot| snapshot.len())
    }

    fn read_current(&self) -> Option<Arc<IndexSnapshot>> {
        // The guard only protects a pointer; even a poisoned lock holds a
        // fully built snapshot.
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn install(&self, snapshot: Arc<IndexSnapshot>) {
        let epoch = snapshot.epoch();
        {
            let mut guard = match self.current.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *guard = Some(snapshot);
        }
        self.epoch.store(epoch, Ordering::SeqCst);
    }

    fn fire_write_hooks(&self) {
        let hooks = match self.write_hooks.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for hook in hooks.iter() {
            hook();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DocumentChunk;
    use std::sync::atomic::AtomicUsize;

    fn item(id: &str, vector: Vec<f32>) -> EmbeddedChunk {
        EmbeddedChunk {
            chunk: DocumentChunk {
                id: id.to_string(),
                source: "doc.md".to_string(),
                text: id.to_string(),
            },
            vector,
        }
    }

    async fn open_in(dir: &tempfile::TempDir) -> IndexCoordinator {
        IndexCoordinator::open(dir.path().join("index.json")).await
    }

    #[tokio::test]
    async fn search_before_any_build_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = open_in(&dir).await;

        assert!(!coordinator.is_available());
        let err = coordinator.search(&[1.0, 0.0], 1).unwrap_err();
        assert!(matches!(err, VectorStoreError::IndexUnavailable));
    }

    #[tokio::test]
    async fn upsert_bumps_epoch_once_per_call() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = open_in(&dir).await;

        let written = coordinator
            .upsert(vec![item("a", vec![1.0, 0.0]), item("b", vec![0.0, 1.0])])
            .await
            .unwrap();
        assert_eq!(written, 2);
        assert_eq!(coordinator.current_epoch(), 1);

        coordinator
            .upsert(vec![item("a", vec![0.5, 0.5])])
            .await
            .unwrap();
        assert_eq!(coordinator.current_epoch(), 2);
        assert_eq!(coordinator.item_count(), 2, "replace, not duplicate");
    }

    #[tokio::test]
    async fn reset_leaves_an_available_empty_index() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = open_in(&dir).await;

        coordinator
            .upsert(vec![item("a", vec![1.0, 0.0])])
            .await
            .unwrap();
        coordinator.reset().await.unwrap();

        assert!(coordinator.is_available());
        assert_eq!(coordinator.item_count(), 0);
        assert_eq!(coordinator.current_epoch(), 2);
        assert!(coordinator.search(&[1.0, 0.0], 5).unwrap().is_empty());
    }

    #[tokio::test]
    async fn epoch_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let coordinator = open_in(&dir).await;
            coordinator
                .upsert(vec![item("a", vec![1.0, 0.0])])
                .await
                .unwrap();
            coordinator
                .upsert(vec![item("b", vec![0.0, 1.0])])
                .await
                .unwrap();
            assert_eq!(coordinator.current_epoch(), 2);
        }

        let reopened = open_in(&dir).await;
        assert_eq!(reopened.current_epoch(), 2);
        assert_eq!(reopened.item_count(), 2);
        assert!(reopened.is_available());
    }

    #[tokio::test]
    async fn write_hooks_fire_on_upsert_and_reset() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = open_in(&dir).await;

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        coordinator.add_write_hook(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        coordinator
            .upsert(vec![item("a", vec![1.0, 0.0])])
            .await
            .unwrap();
        coordinator.reset().await.unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_persist_leaves_previous_state_intact() {
        let dir = tempfile::tempdir().unwrap();
        // The parent of the store path is a regular file, so create_dir_all
        // inside save fails.
        let blocker = dir.path().join("blocker");
        tokio::fs::write(&blocker, b"not a directory").await.unwrap();

        let coordinator = IndexCoordinator::open(blocker.join("index.json")).await;
        let err = coordinator.upsert(vec![item("a", vec![1.0])]).await;

        assert!(err.is_err());
        assert!(!coordinator.is_available());
        assert_eq!(coordinator.current_epoch(), 0);
    }
}
