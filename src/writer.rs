//! Index Writer (C8): consumes embedded batches and buffers them into the
//! Repository Store, stamping provider/model identity on first write and
//! asserting consistency thereafter.

use std::time::{Duration, Instant};

use tracing::info;

use crate::errors::Result;
use crate::events::{ProgressEvent, ProgressSink};
use crate::pipeline::EmbeddedBatch;
use crate::store::{ChunkRecord, FileRecord, Store, VectorRecord};

#[derive(Debug, Clone)]
pub struct WriterOptions {
    pub flush_batch_size: usize,
    pub flush_interval: Duration,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            flush_batch_size: 200,
            flush_interval: Duration::from_secs(1),
        }
    }
}

pub struct IndexWriter<'a> {
    store: &'a mut Store,
    options: WriterOptions,
    pending_chunks: Vec<ChunkRecord>,
    pending_vectors: Vec<VectorRecord>,
    last_flush: Instant,
    files_processed: usize,
    chunks_written: usize,
    started: Instant,
}

impl<'a> IndexWriter<'a> {
    pub fn new(store: &'a mut Store, options: WriterOptions) -> Self {
        Self {
            store,
            options,
            pending_chunks: Vec::new(),
            pending_vectors: Vec::new(),
            last_flush: Instant::now(),
            files_processed: 0,
            chunks_written: 0,
            started: Instant::now(),
        }
    }

    /// Removes every chunk/vector owned by `relative_path`'s previous
    /// `file_hash`, as required before writing a modified or deleted file's
    /// replacement chunks.
    pub fn evict_path(&mut self, relative_path: &str) -> Result<()> {
        let ids = self.store.chunk_ids_for_path(relative_path)?;
        self.store.remove(&ids)?;
        Ok(())
    }

    /// Stamps each chunk record with the owning file's content hash; the
    /// orchestrator knows per-file hashes ahead of embedding and groups each
    /// batch down to one file before calling this.
    pub fn write_batch_for_file(&mut self, batch: EmbeddedBatch, file_hash: &str, sink: &dyn ProgressSink) -> Result<()> {
        self.store
            .stamp_provider(&batch.provider_id, &batch.model_id, batch.vectors.first().map(|v| v.len()).unwrap_or(0))?;

        let count = batch.chunks.len();
        for (chunk, vector) in batch.chunks.into_iter().zip(batch.vectors.into_iter()) {
            self.pending_chunks.push(ChunkRecord::from_chunk(&chunk, file_hash));
            self.pending_vectors.push(VectorRecord {
                chunk_id: chunk.chunk_id,
                values: vector,
            });
        }
        self.chunks_written += count;

        if self.pending_chunks.len() >= self.options.flush_batch_size
            || self.last_flush.elapsed() >= self.options.flush_interval
        {
            self.flush(sink)?;
        }
        Ok(())
    }

    pub fn upsert_file_record(&mut self, record: FileRecord) {
        self.store.upsert_file_record(record);
    }

    pub fn remove_file_record(&mut self, relative_path: &str) {
        self.store.remove_file_record(relative_path);
    }

    pub fn note_file_processed(&mut self) {
        self.files_processed += 1;
    }

    pub fn flush(&mut self, sink: &dyn ProgressSink) -> Result<()> {
        if !self.pending_chunks.is_empty() {
            self.store.append_chunks(&self.pending_chunks)?;
            self.pending_chunks.clear();
        }
        if !self.pending_vectors.is_empty() {
            self.store.append_vectors(&self.pending_vectors)?;
            self.pending_vectors.clear();
        }
        self.last_flush = Instant::now();
        sink.on_event(ProgressEvent::Completed {
            files_processed: self.files_processed,
            chunks_written: self.chunks_written,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        });
        Ok(())
    }

    pub fn finish(mut self, sink: &dyn ProgressSink) -> Result<()> {
        self.flush(sink)?;
        // Physically drops every chunk/vector tombstoned by `evict_path` during
        // this run and recomputes `total_chunks` from the survivors, so a
        // modification or deletion doesn't just hide old data in memory — it
        // is gone from the shards before the store is reopened for a query.
        self.store.compact()?;
        self.store.save_file_hashes()?;
        self.store.mark_indexed_now();
        self.store.save_metadata()?;
        info!(
            files_processed = self.files_processed,
            chunks_written = self.chunks_written,
            "index run complete"
        );
        Ok(())
    }
}
