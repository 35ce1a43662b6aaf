//! # Brain Indexer
//!
//! Keeps the index in step with a folder of documents.
//!
//! ## Pipeline
//!
//! ```text
//! Filesystem events
//!     │
//!     ├──> ChangeNotifier (filter + debounce)
//!     │      └─> ResyncRequest (at most one per quiet window)
//!     │
//!     └──> ResyncDriver (one run at a time, bursts coalesce)
//!            ├─> Loader (enumerate, parse, chunk; per-document skip)
//!            ├─> Embedder (per-chunk timeout and skip)
//!            └─> IndexCoordinator.reset / upsert
//! ```

mod error;
mod loader;
mod notifier;
mod resync;
mod stats;

pub use error::{IndexerError, Result};
pub use loader::{chunk_text, FsLoader, Loader, LoaderConfig, RawDocument, DATA_DIR};
pub use notifier::{
    spawn_debounce_loop, ChangeEvent, ChangeKind, ChangeNotifier, NotifierConfig, NotifierSignal,
    ResyncRequest, ResyncTrigger,
};
pub use resync::{
    spawn_resync_driver, ResyncDriverConfig, ResyncHandle, ResyncState, ResyncStatus,
};
pub use stats::ResyncStats;
