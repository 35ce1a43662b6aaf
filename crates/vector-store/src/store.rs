use crate::error::{Result, VectorStoreError};
use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

pub const INDEX_SCHEMA_VERSION: u32 = 1;

/// One chunk of a source document, before embedding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentChunk {
    /// Stable identity, e.g. `notes/todo.md::chunk_3`. Re-upserting the same
    /// id replaces the previous content.
    pub id: String,
    /// Relative path of the originating document.
    pub source: String,
    pub text: String,
}

/// A chunk together with its embedding vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddedChunk {
    pub chunk: DocumentChunk,
    pub vector: Vec<f32>,
}

/// One search result returned by the index.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub source: String,
    pub text: String,
    pub score: f32,
}

/// Immutable view of the index contents at one write epoch.
///
/// Snapshots are never mutated in place: a write produces a fresh snapshot
/// that is swapped in atomically by the [`crate::IndexCoordinator`]. Readers
/// holding an `Arc` to an old snapshot keep a coherent view for as long as
/// they need it.
#[derive(Debug)]
pub struct IndexSnapshot {
    chunks: Vec<EmbeddedChunk>,
    by_id: HashMap<String, usize>,
    epoch: u64,
}

impl IndexSnapshot {
    #[must_use]
    pub fn empty(epoch: u64) -> Self {
        Self {
            chunks: Vec::new(),
            by_id: HashMap::new(),
            epoch,
        }
    }

    fn from_chunks(chunks: Vec<EmbeddedChunk>, epoch: u64) -> Self {
        let by_id = chunks
            .iter()
            .enumerate()
            .map(|(idx, item)| (item.chunk.id.clone(), idx))
            .collect();
        Self {
            chunks,
            by_id,
            epoch,
        }
    }

    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    #[must_use]
    pub fn chunks(&self) -> &[EmbeddedChunk] {
        &self.chunks
    }

    /// Build the successor snapshot with `items` applied, last-write-wins by
    /// chunk id.
    #[must_use]
    pub fn apply_upsert(&self, items: Vec<EmbeddedChunk>, epoch: u64) -> Self {
        let mut chunks = self.chunks.clone();
        let mut by_id = self.by_id.clone();

        for item in items {
            match by_id.get(&item.chunk.id) {
                Some(&idx) => chunks[idx] = item,
                None => {
                    by_id.insert(item.chunk.id.clone(), chunks.len());
                    chunks.push(item);
                }
            }
        }

        Self {
            chunks,
            by_id,
            epoch,
        }
    }

    /// Cosine top-k over the snapshot contents.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        if k == 0 || self.chunks.is_empty() {
            return Ok(Vec::new());
        }

        let dim = self.chunks[0].vector.len();
        if query.len() != dim {
            return Err(VectorStoreError::DimensionMismatch {
                query: query.len(),
                index: dim,
            });
        }

        let query_view = ArrayView1::from(query);
        let query_norm = query_view.dot(&query_view).sqrt();

        let mut scored: Vec<(usize, f32)> = self
            .chunks
            .iter()
            .enumerate()
            .map(|(idx, item)| {
                let view = ArrayView1::from(item.vector.as_slice());
                let norm = view.dot(&view).sqrt();
                let denom = query_norm * norm;
                let score = if denom > f32::EPSILON {
                    query_view.dot(&view) / denom
                } else {
                    0.0
                };
                (idx, score)
            })
            .collect();

        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(idx, score)| {
                let item = &self.chunks[idx];
                SearchHit {
                    id: item.chunk.id.clone(),
                    source: item.chunk.source.clone(),
                    text: item.chunk.text.clone(),
                    score,
                }
            })
            .collect())
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedIndex {
    schema_version: u32,
    epoch: u64,
    chunks: Vec<EmbeddedChunk>,
}

/// Persist a snapshot as JSON, via temp-file-then-rename so a crashed write
/// never leaves a truncated index behind.
pub async fn save_snapshot(snapshot: &IndexSnapshot, path: &Path) -> Result<()> {
    let persisted = PersistedIndex {
        schema_version: INDEX_SCHEMA_VERSION,
        epoch: snapshot.epoch,
        chunks: snapshot.chunks.clone(),
    };
    let json = serde_json::to_vec(&persisted)?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &json).await?;
    tokio::fs::rename(&tmp, path).await?;

    log::debug!(
        "Saved index: {} chunks, epoch {} -> {}",
        persisted.chunks.len(),
        persisted.epoch,
        path.display()
    );
    Ok(())
}

/// Load a previously persisted snapshot, restoring its write epoch.
pub async fn load_snapshot(path: &Path) -> Result<Arc<IndexSnapshot>> {
    let json = tokio::fs::read(path).await?;
    let persisted: PersistedIndex = serde_json::from_slice(&json)?;
    if persisted.schema_version != INDEX_SCHEMA_VERSION {
        return Err(VectorStoreError::SchemaVersion(persisted.schema_version));
    }
    Ok(Arc::new(IndexSnapshot::from_chunks(
        persisted.chunks,
        persisted.epoch,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn item(id: &str, vector: Vec<f32>) -> EmbeddedChunk {
        EmbeddedChunk {
            chunk: DocumentChunk {
                id: id.to_string(),
                source: "doc.md".to_string(),
                text: format!("text of {id}"),
            },
            vector,
        }
    }

    #[test]
    fn upsert_replaces_by_id_instead_of_duplicating() {
        let base = IndexSnapshot::empty(0);
        let one = base.apply_upsert(vec![item("a", vec![1.0, 0.0])], 1);
        assert_eq!(one.len(), 1);

        let two = one.apply_upsert(vec![item("a", vec![0.0, 1.0])], 2);
        assert_eq!(two.len(), 1);
        assert_eq!(two.chunks()[0].vector, vec![0.0, 1.0]);
    }

    #[test]
    fn search_ranks_by_cosine_similarity() {
        let snapshot = IndexSnapshot::empty(0).apply_upsert(
            vec![
                item("near", vec![1.0, 0.1]),
                item("far", vec![0.0, 1.0]),
                item("mid", vec![0.7, 0.7]),
            ],
            1,
        );

        let hits = snapshot.search(&[1.0, 0.0], 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "near");
        assert_eq!(hits[1].id, "mid");
    }

    #[test]
    fn search_rejects_mismatched_dimensions() {
        let snapshot = IndexSnapshot::empty(0).apply_upsert(vec![item("a", vec![1.0, 0.0])], 1);
        let err = snapshot.search(&[1.0, 0.0, 0.0], 1).unwrap_err();
        assert!(matches!(
            err,
            VectorStoreError::DimensionMismatch { query: 3, index: 2 }
        ));
    }

    #[test]
    fn empty_snapshot_returns_no_hits() {
        let snapshot = IndexSnapshot::empty(0);
        assert!(snapshot.search(&[1.0], 5).unwrap().is_empty());
    }

    #[tokio::test]
    async fn snapshot_roundtrips_through_disk_with_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");

        let snapshot = IndexSnapshot::empty(0).apply_upsert(vec![item("a", vec![0.5, 0.5])], 7);
        save_snapshot(&snapshot, &path).await.unwrap();

        let loaded = load_snapshot(&path).await.unwrap();
        assert_eq!(loaded.epoch(), 7);
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.chunks()[0].chunk.id, "a");
    }
}
