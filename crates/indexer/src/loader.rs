use crate::error::{IndexerError, Result};
use async_trait::async_trait;
use brain_vector_store::DocumentChunk;
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use unicode_segmentation::UnicodeSegmentation;

/// Directory under the data root holding the persisted index and any other
/// daemon-private state. Never indexed, never watched.
pub const DATA_DIR: &str = ".second-brain";

/// A document discovered on disk, not yet parsed.
#[derive(Debug, Clone)]
pub struct RawDocument {
    pub path: PathBuf,
    /// Path relative to the data root, normalized to forward slashes.
    pub relative: String,
    pub size: u64,
}

/// External loading collaborator: enumerate documents, then parse and chunk
/// each one. Either operation may fail per document; the resync driver skips
/// such documents rather than aborting the run.
#[async_trait]
pub trait Loader: Send + Sync {
    async fn list_documents(&self) -> Result<Vec<RawDocument>>;

    async fn parse_and_chunk(&self, doc: &RawDocument) -> Result<Vec<DocumentChunk>>;
}

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Lowercase extensions without the dot.
    pub allowed_extensions: HashSet<String>,
    pub max_file_bytes: u64,
    /// Target chunk size in bytes; chunks are cut on word boundaries.
    pub chunk_chars: usize,
    pub chunk_overlap: usize,
    /// Glob patterns (relative to the root) excluded from indexing.
    pub ignore_patterns: Vec<String>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        let allowed_extensions = [
            "txt", "md", "markdown", "rst", "csv", "tsv", "json", "html", "htm",
        ]
        .into_iter()
        .map(str::to_string)
        .collect();

        Self {
            allowed_extensions,
            max_file_bytes: 80 * 1024 * 1024,
            chunk_chars: 800,
            chunk_overlap: 120,
            ignore_patterns: Vec::new(),
        }
    }
}

impl LoaderConfig {
    /// Whether a path has one of the indexable extensions.
    #[must_use]
    pub fn allows(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| self.allowed_extensions.contains(&ext.to_lowercase()))
    }
}

/// Filesystem loader: walks the data root respecting ignore files, reads
/// documents as UTF-8 text, and cuts them into overlapping chunks.
pub struct FsLoader {
    root: PathBuf,
    config: LoaderConfig,
    ignore: Option<GlobSet>,
}

impl FsLoader {
    pub fn new(root: impl Into<PathBuf>, config: LoaderConfig) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(IndexerError::InvalidRoot(format!(
                "not a directory: {}",
                root.display()
            )));
        }

        let ignore = if config.ignore_patterns.is_empty() {
            None
        } else {
            let mut builder = GlobSetBuilder::new();
            for pattern in &config.ignore_patterns {
                builder.add(Glob::new(pattern)?);
            }
            Some(builder.build()?)
        };

        Ok(Self {
            root,
            config,
            ignore,
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn normalize(&self, path: &Path) -> String {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        let mut normalized = relative.to_string_lossy().to_string();
        if normalized.contains('\\') {
            normalized = normalized.replace('\\', "/");
        }
        normalized
    }
}

#[async_trait]
impl Loader for FsLoader {
    async fn list_documents(&self) -> Result<Vec<RawDocument>> {
        let mut documents = Vec::new();

        let walk = WalkBuilder::new(&self.root)
            .follow_links(false)
            .filter_entry(|entry| entry.file_name().to_string_lossy() != DATA_DIR)
            .build();

        for entry in walk {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    log::warn!("Skipping unreadable entry: {err}");
                    continue;
                }
            };
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            let path = entry.path();
            if !self.config.allows(path) {
                continue;
            }

            let relative = self.normalize(path);
            if let Some(ignore) = &self.ignore {
                if ignore.is_match(&relative) {
                    continue;
                }
            }

            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            if size > self.config.max_file_bytes {
                log::warn!(
                    "Skipping {relative}: {size} bytes exceeds the {} byte cap",
                    self.config.max_file_bytes
                );
                continue;
            }

            documents.push(RawDocument {
                path: path.to_path_buf(),
                relative,
                size,
            });
        }

        documents.sort_by(|a, b| a.relative.cmp(&b.relative));
        Ok(documents)
    }

    async fn parse_and_chunk(&self, doc: &RawDocument) -> Result<Vec<DocumentChunk>> {
        let text = tokio::fs::read_to_string(&doc.path).await?;

        let chunks = chunk_text(&text, self.config.chunk_chars, self.config.chunk_overlap);
        Ok(chunks
            .into_iter()
            .enumerate()
            .map(|(i, text)| DocumentChunk {
                id: format!("{}::chunk_{i}", doc.relative),
                source: doc.relative.clone(),
                text,
            })
            .collect())
    }
}

/// Cut `text` into windows of roughly `size` bytes with `overlap` bytes of
/// carry-over, snapping both edges to word boundaries.
#[must_use]
pub fn chunk_text(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }
    if text.len() <= size || size == 0 {
        return vec![text.to_string()];
    }

    let overlap = overlap.min(size / 2);
    let mut bounds: Vec<usize> = text.split_word_bound_indices().map(|(i, _)| i).collect();
    bounds.push(text.len());

    let mut chunks = Vec::new();
    let mut start = 0usize;
    loop {
        let target = start + size;
        if target >= text.len() {
            chunks.push(text[start..].to_string());
            break;
        }

        // Largest boundary inside the window, or the next one past it when a
        // single word overflows the window.
        let idx = bounds.partition_point(|b| *b <= target);
        let mut end = bounds[idx.saturating_sub(1)];
        if end <= start {
            end = bounds
                .iter()
                .copied()
                .find(|b| *b > start)
                .unwrap_or(text.len());
        }

        chunks.push(text[start..end].to_string());
        if end >= text.len() {
            break;
        }

        let back = end.saturating_sub(overlap);
        let idx = bounds.partition_point(|b| *b <= back);
        let candidate = bounds[idx.saturating_sub(1)];
        start = if candidate > start { candidate } else { end };
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn short_text_is_a_single_chunk() {
        let chunks = chunk_text("a small note", 800, 120);
        assert_eq!(chunks, vec!["a small note".to_string()]);
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        assert!(chunk_text("   \n\t ", 800, 120).is_empty());
    }

    #[test]
    fn long_text_is_windowed_with_overlap() {
        let text = (0..200)
            .map(|i| format!("word{i}"))
            .collect::<Vec<_>>()
            .join(" ");
        let chunks = chunk_text(&text, 200, 40);

        assert!(chunks.len() > 2);
        assert!(text.starts_with(&chunks[0]));
        assert!(text.ends_with(chunks.last().unwrap().trim_start()));
        for chunk in &chunks {
            assert!(!chunk.is_empty());
            assert!(text.contains(chunk.as_str()));
        }
        // Overlap duplicates content, so the windows cover more than the text.
        let total: usize = chunks.iter().map(String::len).sum();
        assert!(total > text.len());
    }

    #[test]
    fn oversized_word_still_makes_progress() {
        let text = format!("{} tail", "x".repeat(500));
        let chunks = chunk_text(&text, 100, 20);
        assert!(chunks.len() >= 2);
        assert!(chunks[0].starts_with("xxx"));
        assert!(chunks.last().unwrap().contains("tail"));
    }

    #[tokio::test]
    async fn loader_lists_only_supported_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("note.md"), "hello").unwrap();
        std::fs::write(dir.path().join("data.bin"), [0u8, 1, 2]).unwrap();
        std::fs::write(dir.path().join(".hidden.md"), "secret").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/deep.txt"), "deep").unwrap();
        std::fs::create_dir(dir.path().join(DATA_DIR)).unwrap();
        std::fs::write(dir.path().join(DATA_DIR).join("index.json"), "{}").unwrap();

        let loader = FsLoader::new(dir.path(), LoaderConfig::default()).unwrap();
        let docs = loader.list_documents().await.unwrap();
        let names: Vec<&str> = docs.iter().map(|d| d.relative.as_str()).collect();

        assert_eq!(names, vec!["note.md", "sub/deep.txt"]);
    }

    #[tokio::test]
    async fn loader_honors_size_cap_and_ignore_patterns() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("keep.md"), "fine").unwrap();
        std::fs::write(dir.path().join("big.md"), "x".repeat(64)).unwrap();
        std::fs::write(dir.path().join("draft.md"), "wip").unwrap();

        let config = LoaderConfig {
            max_file_bytes: 32,
            ignore_patterns: vec!["draft*".to_string()],
            ..LoaderConfig::default()
        };
        let loader = FsLoader::new(dir.path(), config).unwrap();
        let docs = loader.list_documents().await.unwrap();
        let names: Vec<&str> = docs.iter().map(|d| d.relative.as_str()).collect();

        assert_eq!(names, vec!["keep.md"]);
    }

    #[tokio::test]
    async fn chunk_ids_are_stable_and_traceable() {
        let dir = tempfile::tempdir().unwrap();
        let text = (0..300)
            .map(|i| format!("token{i}"))
            .collect::<Vec<_>>()
            .join(" ");
        std::fs::write(dir.path().join("long.md"), &text).unwrap();

        let config = LoaderConfig {
            chunk_chars: 400,
            chunk_overlap: 60,
            ..LoaderConfig::default()
        };
        let loader = FsLoader::new(dir.path(), config).unwrap();
        let docs = loader.list_documents().await.unwrap();
        let chunks = loader.parse_and_chunk(&docs[0]).await.unwrap();

        assert!(chunks.len() > 1);
        assert_eq!(chunks[0].id, "long.md::chunk_0");
        assert_eq!(chunks[1].id, "long.md::chunk_1");
        assert!(chunks.iter().all(|c| c.source == "long.md"));
    }
}
