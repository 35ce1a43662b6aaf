use crate::error::Result;
use async_trait::async_trait;
use unicode_segmentation::UnicodeSegmentation;

/// External embedding collaborator.
///
/// Implementations must be deterministic for identical input within one
/// running process; the cosine geometry of the index depends on it.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Feature-hashing embedder over word unigrams and bigrams.
///
/// No model download, no tokenizer files, fully deterministic. Quality is
/// far below a learned model, but the vectors are stable and cheap, which is
/// what the default offline setup needs. Swap in a real [`Embedder`] for
/// production-quality retrieval.
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub const DEFAULT_DIMENSION: usize = 256;

    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(8),
        }
    }

    fn accumulate(&self, out: &mut [f32], feature: &str) {
        let hash = fnv1a(feature.as_bytes());
        let bucket = (hash % self.dimension as u64) as usize;
        // Sign bit decorrelates features that collide into the same bucket.
        let sign = if hash & (1 << 63) == 0 { 1.0 } else { -1.0 };
        out[bucket] += sign;
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DIMENSION)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut out = vec![0.0f32; self.dimension];

        let words: Vec<String> = text
            .unicode_words()
            .map(|w| w.to_lowercase())
            .collect();

        for word in &words {
            self.accumulate(&mut out, word);
        }
        for pair in words.windows(2) {
            self.accumulate(&mut out, &format!("{} {}", pair[0], pair[1]));
        }

        let norm = out.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut out {
                *v /= norm;
            }
        }
        Ok(out)
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}
