//! Orchestrates a full index run: walk (C2) -> classify (C4) -> chunk (C3)
//! -> embed (C6, via C7) -> write (C8). This is the glue the `index`
//! subcommand drives; library consumers can call it directly too.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::change_detector::{self, Classification};
use crate::chunker::{chunk_text, ChunkerOptions};
use crate::errors::Result;
use crate::events::{NullSink, ProgressEvent, ProgressSink};
use crate::fallback::FallbackCoordinator;
use crate::pipeline::{self, PipelineOptions};
use crate::store::{FileRecord, Store};
use crate::walker::{self, WalkOptions};
use crate::writer::{IndexWriter, WriterOptions};

#[derive(Debug, Clone)]
pub struct IndexRunOptions {
    pub walk: WalkOptions,
    pub chunker: ChunkerOptions,
    pub pipeline: PipelineOptions,
    pub writer: WriterOptions,
    pub force: bool,
}

#[derive(Debug, Clone, Default)]
pub struct IndexRunReport {
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub chunks_written: usize,
    pub elapsed_ms: u64,
}

#[instrument(skip(store, coordinator, options, sink))]
pub async fn run_index(
    store: &mut Store,
    coordinator: Arc<FallbackCoordinator>,
    options: IndexRunOptions,
    sink: Arc<dyn ProgressSink>,
) -> Result<IndexRunReport> {
    let started = Instant::now();
    let (discovered, walk_report) = walker::discover(&options.walk)?;
    sink.on_event(ProgressEvent::Started {
        total_candidates: discovered.len(),
    });

    let classification: Classification = if options.force {
        Classification {
            added: discovered.clone(),
            modified: Vec::new(),
            deleted: store.file_records().keys().cloned().collect(),
            unchanged: Vec::new(),
            skipped: Vec::new(),
            refreshed: Vec::new(),
        }
    } else {
        change_detector::classify(&discovered, store.file_records())
    };

    info!(
        added = classification.added.len(),
        modified = classification.modified.len(),
        deleted = classification.deleted.len(),
        unchanged = classification.unchanged.len(),
        skipped = classification.skipped.len() + walk_report.skipped_binary + walk_report.skipped_oversize + walk_report.skipped_non_utf8,
        "change detection complete"
    );

    let mut writer = IndexWriter::new(store, options.writer.clone());

    for path in &classification.deleted {
        writer.evict_path(path)?;
        writer.remove_file_record(path);
    }

    for record in &classification.refreshed {
        writer.upsert_file_record(record.clone());
    }

    for (file, old_record) in &classification.modified {
        writer.evict_path(&file.relative_path)?;
        let _ = old_record;
    }

    let mut file_hash_by_chunk_path: std::collections::HashMap<String, String> = std::collections::HashMap::new();

    // Chunks are handed to the pipeline through a bounded channel as each
    // file is read and split, rather than collected into one `Vec` up front,
    // so the pipeline's own memory ceiling actually bounds resident chunk
    // bytes instead of being defeated by an unbounded buffer sitting in
    // front of it.
    let channel_capacity = options.pipeline.batch_former_capacity.max(1) * options.pipeline.max_batch_size.max(1);
    let (chunk_tx, chunk_rx) = mpsc::channel(channel_capacity);

    let mut chunks_planned = 0usize;
    let producer = async {
        for file in classification
            .added
            .iter()
            .chain(classification.modified.iter().map(|(f, _)| f))
        {
            let text = match walker::read_utf8(&file.absolute_path) {
                Ok(Some(text)) => text,
                Ok(None) => continue,
                Err(e) => return Err(e),
            };
            let hash = change_detector::content_hash(text.as_bytes());
            let chunks = chunk_text(&file.relative_path, &text, &options.chunker);
            file_hash_by_chunk_path.insert(file.relative_path.clone(), hash.clone());

            for chunk in chunks {
                chunks_planned += 1;
                if chunk_tx.send(chunk).await.is_err() {
                    break;
                }
            }

            writer.upsert_file_record(FileRecord {
                relative_path: file.relative_path.clone(),
                size_bytes: file.size,
                last_modified_ms: file
                    .last_modified
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_millis() as i64)
                    .unwrap_or(0),
                content_hash: hash,
            });
            writer.note_file_processed();
            sink.on_event(ProgressEvent::FileScanned {
                relative_path: file.relative_path.clone(),
            });
        }
        drop(chunk_tx);
        Ok(())
    };

    let (produced, dispatched) = tokio::join!(
        producer,
        pipeline::run(chunk_rx, coordinator, options.pipeline.clone(), sink.clone(), CancellationToken::new())
    );
    produced?;
    let batches = dispatched?;

    for batch in batches {
        // Every chunk in a batch shares a file only incidentally; group
        // by the file each chunk belongs to so the written chunk record
        // carries the right file_hash.
        let mut by_path: std::collections::HashMap<String, (Vec<crate::chunker::Chunk>, Vec<Vec<f32>>)> =
            std::collections::HashMap::new();
        for (chunk, vector) in batch.chunks.into_iter().zip(batch.vectors.into_iter()) {
            let entry = by_path.entry(chunk.relative_path.clone()).or_default();
            entry.0.push(chunk);
            entry.1.push(vector);
        }
        for (path, (chunks, vectors)) in by_path {
            let file_hash = file_hash_by_chunk_path.get(&path).cloned().unwrap_or_default();
            let sub_batch = pipeline::EmbeddedBatch {
                chunks,
                vectors,
                provider_id: batch.provider_id.clone(),
                model_id: batch.model_id.clone(),
                latency_ms: batch.latency_ms,
            };
            writer.write_batch_for_file(sub_batch, &file_hash, sink.as_ref())?;
        }
    }

    let chunks_written = chunks_planned;
    writer.finish(sink.as_ref())?;

    Ok(IndexRunReport {
        added: classification.added.len(),
        modified: classification.modified.len(),
        deleted: classification.deleted.len(),
        unchanged: classification.unchanged.len(),
        skipped: classification.skipped.len(),
        chunks_written,
        elapsed_ms: started.elapsed().as_millis() as u64,
    })
}

pub fn default_sink() -> Arc<dyn ProgressSink> {
    Arc::new(NullSink)
}

pub fn repository_root_or_cwd(target: Option<&Path>) -> std::io::Result<std::path::PathBuf> {
    match target {
        Some(p) => std::fs::canonicalize(p),
        None => std::env::current_dir(),
    }
}
