use serde::Serialize;

const MAX_RECORDED_ERRORS: usize = 20;

/// Counters for one resync run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResyncStats {
    pub documents: usize,
    pub chunks: usize,
    pub skipped_documents: usize,
    pub skipped_chunks: usize,
    pub duration_ms: u64,
    /// First few failure messages, for the status surface.
    pub errors: Vec<String>,
}

impl ResyncStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_document(&mut self, chunks: usize) {
        self.documents += 1;
        self.chunks += chunks;
    }

    pub fn skip_document(&mut self, error: String) {
        self.skipped_documents += 1;
        self.record_error(error);
    }

    pub fn skip_chunk(&mut self, error: String) {
        self.skipped_chunks += 1;
        self.record_error(error);
    }

    fn record_error(&mut self, error: String) {
        if self.errors.len() < MAX_RECORDED_ERRORS {
            self.errors.push(error);
        }
    }
}
