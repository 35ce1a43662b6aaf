//! # Brain Vector Store
//!
//! The shared index and its coordination layer.
//!
//! ## Pipeline
//!
//! ```text
//! EmbeddedChunk batch
//!     │
//!     └──> IndexCoordinator.upsert / reset
//!            ├─> shadow IndexSnapshot (build + persist)
//!            ├─> pointer swap (atomic for readers)
//!            └─> write hooks (cache invalidation)
//!
//! query vector ──> IndexCoordinator.search ──> cosine top-k over snapshot
//! ```
//!
//! Readers never block behind a write for longer than the pointer swap, and
//! never observe a partially applied batch.

mod coordinator;
mod embed;
mod error;
mod store;

pub use coordinator::{IndexCoordinator, WriteHook};
pub use embed::{Embedder, HashEmbedder};
pub use error::{Result, VectorStoreError};
pub use store::{
    load_snapshot, save_snapshot, DocumentChunk, EmbeddedChunk, IndexSnapshot, SearchHit,
    INDEX_SCHEMA_VERSION,
};
