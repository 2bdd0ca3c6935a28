//! Typed progress events, replacing the ad-hoc listener pattern with a single
//! sink trait every long-running operation accepts.

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Started { total_candidates: usize },
    FileScanned { relative_path: String },
    BatchDispatched { chunk_count: usize, provider_id: String },
    Retrying { provider_id: String, attempt: u32 },
    FallbackUsed { from: String, to: String },
    Completed {
        files_processed: usize,
        chunks_written: usize,
        elapsed_ms: u64,
    },
    Error { message: String },
}

/// Receives progress notifications from the indexer. Library code never
/// assumes a particular UI; the CLI implements this with an `indicatif`
/// progress bar, tests implement it by collecting into a `Vec`.
pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

/// No-op sink used as the default when a caller doesn't care about progress.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn on_event(&self, _event: ProgressEvent) {}
}

#[cfg(test)]
pub(crate) struct CollectingSink {
    pub events: std::sync::Mutex<Vec<ProgressEvent>>,
}

#[cfg(test)]
impl CollectingSink {
    pub fn new() -> Self {
        Self {
            events: std::sync::Mutex::new(Vec::new()),
        }
    }
}

#[cfg(test)]
impl ProgressSink for CollectingSink {
    fn on_event(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}
