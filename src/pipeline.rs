//! Embedding Pipeline (C6): turns a stream of chunks into (chunk, vector)
//! results at the maximum safe throughput the providers allow. Modeled as
//! explicit tasks over bounded channels — a Batch Former, a pool of
//! Dispatcher workers, and a Sink — rather than nested async callbacks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::chunker::Chunk;
use crate::errors::{IndexError, ProviderError};
use crate::events::{ProgressEvent, ProgressSink};
use crate::fallback::FallbackCoordinator;

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub batch_former_capacity: usize,
    pub concurrency: usize,
    pub sink_capacity: usize,
    pub flush_interval: Duration,
    pub min_batch_size: usize,
    pub initial_batch_size: usize,
    pub max_batch_size: usize,
    pub fast_threshold: Duration,
    pub slow_threshold: Duration,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_chars_per_chunk: usize,
    pub memory_limit_bytes: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            batch_former_capacity: 2,
            concurrency: 3,
            sink_capacity: 4,
            flush_interval: Duration::from_millis(200),
            min_batch_size: 4,
            initial_batch_size: 16,
            max_batch_size: 64,
            fast_threshold: Duration::from_millis(750),
            slow_threshold: Duration::from_millis(3000),
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_chars_per_chunk: 6000,
            memory_limit_bytes: 256 * 1024 * 1024,
        }
    }
}

impl PipelineOptions {
    /// Rejects configurations whose worst-case resident memory would exceed
    /// `memory_limit_bytes`, per the documented memory discipline.
    pub fn validate(&self) -> Result<(), IndexError> {
        let worst_case = (self.batch_former_capacity + self.concurrency + self.sink_capacity)
            * self.max_batch_size
            * self.max_chars_per_chunk;
        if worst_case > self.memory_limit_bytes {
            return Err(IndexError::configuration(format!(
                "pipeline configuration could use up to {worst_case} bytes, exceeding the {} byte ceiling",
                self.memory_limit_bytes
            )));
        }
        Ok(())
    }
}

pub struct EmbeddedBatch {
    pub chunks: Vec<Chunk>,
    pub vectors: Vec<Vec<f32>>,
    pub provider_id: String,
    pub model_id: String,
    pub latency_ms: u64,
}

struct AdaptiveBatchSize {
    current: AtomicUsize,
    min: usize,
    max: usize,
    fast_threshold: Duration,
    slow_threshold: Duration,
    window: std::sync::Mutex<Vec<Duration>>,
    rate_limited_in_window: std::sync::atomic::AtomicBool,
}

const ADAPT_EVERY_N_SUCCESSES: usize = 8;

impl AdaptiveBatchSize {
    fn new(opts: &PipelineOptions) -> Self {
        Self {
            current: AtomicUsize::new(opts.initial_batch_size),
            min: opts.min_batch_size,
            max: opts.max_batch_size,
            fast_threshold: opts.fast_threshold,
            slow_threshold: opts.slow_threshold,
            window: std::sync::Mutex::new(Vec::new()),
            rate_limited_in_window: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn current(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }

    fn note_rate_limited(&self) {
        self.rate_limited_in_window.store(true, Ordering::Relaxed);
    }

    fn note_success(&self, latency: Duration) {
        let mut window = self.window.lock().unwrap();
        window.push(latency);
        if window.len() < ADAPT_EVERY_N_SUCCESSES {
            return;
        }
        window.sort();
        let p50 = window[window.len() / 2];
        let rate_limited = self.rate_limited_in_window.swap(false, Ordering::Relaxed);
        window.clear();
        drop(window);

        let current = self.current();
        let next = if rate_limited || p50 > self.slow_threshold {
            ((current as f64) * 0.5).floor() as usize
        } else if p50 < self.fast_threshold {
            ((current as f64) * 1.5).ceil() as usize
        } else {
            current
        };
        let clamped = next.clamp(self.min, self.max);
        if clamped != current {
            debug!(from = current, to = clamped, p50_ms = p50.as_millis() as u64, "adapting batch size");
        }
        self.current.store(clamped, Ordering::Relaxed);
    }
}

/// Feeds `chunks` into a bounded channel sized to the Batch Former's own
/// capacity so the pipeline's memory ceiling is respected even when the
/// caller already has every chunk in hand. Real callers (the indexer) should
/// prefer sending chunks to a channel as they're produced instead of
/// collecting them into a `Vec` first; this exists for tests and any caller
/// that has no cheaper way to stream its input.
pub fn chunk_source_from_vec(chunks: Vec<Chunk>, opts: &PipelineOptions) -> mpsc::Receiver<Chunk> {
    let (tx, rx) = mpsc::channel(opts.batch_former_capacity.max(1) * opts.max_batch_size.max(1));
    tokio::spawn(async move {
        for chunk in chunks {
            if tx.send(chunk).await.is_err() {
                break;
            }
        }
    });
    rx
}

/// Runs the full pipeline over `chunks` to completion and returns every
/// successfully embedded batch. A terminal provider error aborts the run.
/// `chunks` is a channel rather than a `Vec` so the Batch Former never holds
/// more of the caller's input in memory than its own bounded capacity —
/// producing chunks (walking files, reading, splitting) can run concurrently
/// with, and stay well ahead of, consuming them.
#[instrument(skip(chunks, coordinator, sink, cancel))]
pub async fn run(
    mut chunks: mpsc::Receiver<Chunk>,
    coordinator: Arc<FallbackCoordinator>,
    opts: PipelineOptions,
    sink: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
) -> Result<Vec<EmbeddedBatch>, IndexError> {
    opts.validate()?;

    let adaptive = Arc::new(AdaptiveBatchSize::new(&opts));
    let (batch_tx, batch_rx) = mpsc::channel::<Vec<Chunk>>(opts.batch_former_capacity);
    let batch_rx = Arc::new(tokio::sync::Mutex::new(batch_rx));
    let (result_tx, mut result_rx) = mpsc::channel::<Result<EmbeddedBatch, IndexError>>(opts.sink_capacity);

    let former_adaptive = adaptive.clone();
    let former_cancel = cancel.clone();
    let flush_interval = opts.flush_interval;
    let former = tokio::spawn(async move {
        let mut upstream_closed = false;
        loop {
            if former_cancel.is_cancelled() {
                break;
            }
            let size = former_adaptive.current().max(1);
            let mut batch: Vec<Chunk> = Vec::with_capacity(size);
            if !upstream_closed {
                let deadline = tokio::time::sleep(flush_interval);
                tokio::pin!(deadline);
                while batch.len() < size {
                    tokio::select! {
                        biased;
                        received = chunks.recv() => {
                            match received {
                                Some(chunk) => batch.push(chunk),
                                None => {
                                    upstream_closed = true;
                                    break;
                                }
                            }
                        }
                        _ = &mut deadline, if !batch.is_empty() => break,
                    }
                }
            }
            if batch.is_empty() {
                break;
            }
            if batch_tx.send(batch).await.is_err() {
                break;
            }
            if upstream_closed {
                break;
            }
        }
    });

    let mut workers = Vec::with_capacity(opts.concurrency);
    for worker_id in 0..opts.concurrency {
        let batch_rx = batch_rx.clone();
        let coordinator = coordinator.clone();
        let adaptive = adaptive.clone();
        let result_tx = result_tx.clone();
        let sink = sink.clone();
        let cancel = cancel.clone();
        let opts = opts.clone();
        workers.push(tokio::spawn(async move {
            loop {
                let batch = {
                    let mut rx = batch_rx.lock().await;
                    rx.recv().await
                };
                let Some(batch) = batch else { break };
                if cancel.is_cancelled() {
                    break;
                }
                let outcome = dispatch_with_retry(&batch, &coordinator, &adaptive, &sink, &opts, worker_id).await;
                if result_tx.send(outcome).await.is_err() {
                    break;
                }
            }
        }));
    }
    drop(result_tx);
    former.await.ok();

    let mut results = Vec::new();
    while let Some(outcome) = result_rx.recv().await {
        match outcome {
            Ok(batch) => results.push(batch),
            Err(e) => {
                cancel.cancel();
                sink.on_event(ProgressEvent::Error { message: e.to_string() });
                return Err(e);
            }
        }
    }
    for worker in workers {
        worker.await.ok();
    }

    Ok(results)
}

/// Dispatches `batch`, retrying a single provider directly across backoff
/// sleeps (§4.6) before ever handing the batch back to the Fallback
/// Coordinator for an alternate provider (§4.7). A `dispatch` call already
/// walks the whole provider ordering once, so a transient failure on a
/// single-provider configuration must be retried against that same
/// provider — re-calling `dispatch` would just see the cooldown it recorded
/// for itself and report every provider exhausted without ever sleeping.
async fn dispatch_with_retry(
    batch: &[Chunk],
    coordinator: &FallbackCoordinator,
    adaptive: &AdaptiveBatchSize,
    sink: &Arc<dyn ProgressSink>,
    opts: &PipelineOptions,
    worker_id: usize,
) -> Result<EmbeddedBatch, IndexError> {
    let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();

    let started = Instant::now();
    let (provider_id, mut last_error) = match coordinator.dispatch(&texts).await {
        Ok((vectors, provider_id, model_id)) => {
            return Ok(finish_success(batch, vectors, provider_id, model_id, started.elapsed(), adaptive, sink));
        }
        Err(IndexError::AllProvidersFailed { attempted, last }) => {
            (attempted.last().cloned().unwrap_or_default(), *last)
        }
        Err(other) => return Err(other),
    };

    let mut attempt = 0u32;
    loop {
        if matches!(last_error, ProviderError::RateLimit { .. }) {
            adaptive.note_rate_limited();
        }
        if !last_error.is_retryable() || attempt >= opts.max_retries {
            break;
        }
        let delay = jittered_delay(&last_error, attempt, opts.base_delay);
        attempt += 1;
        sink.on_event(ProgressEvent::Retrying {
            provider_id: provider_id.clone(),
            attempt,
        });
        warn!(worker_id, attempt, delay_ms = delay.as_millis() as u64, "retrying batch after provider failure");
        tokio::time::sleep(delay).await;

        let started = Instant::now();
        match coordinator.retry_provider(&provider_id, &texts).await {
            Ok((vectors, model_id)) => {
                return Ok(finish_success(batch, vectors, provider_id, model_id, started.elapsed(), adaptive, sink));
            }
            Err(e) => last_error = e,
        }
    }

    // Local retries exhausted (or the failure wasn't retryable at all): hand
    // off to the coordinator. It walks the ordering again, and since this
    // provider is now in cooldown or marked unhealthy, it naturally lands on
    // the next eligible one instead of retrying the one that just failed.
    let started = Instant::now();
    match coordinator.dispatch(&texts).await {
        Ok((vectors, new_provider_id, model_id)) => {
            sink.on_event(ProgressEvent::FallbackUsed {
                from: provider_id,
                to: new_provider_id.clone(),
            });
            Ok(finish_success(batch, vectors, new_provider_id, model_id, started.elapsed(), adaptive, sink))
        }
        Err(IndexError::AllProvidersFailed { attempted: mut escalated, last }) => {
            let mut attempted = vec![provider_id];
            attempted.append(&mut escalated);
            Err(IndexError::AllProvidersFailed { attempted, last })
        }
        Err(IndexError::Configuration { .. }) => Err(IndexError::AllProvidersFailed {
            attempted: vec![provider_id],
            last: Box::new(last_error),
        }),
        Err(other) => Err(other),
    }
}

fn finish_success(
    batch: &[Chunk],
    vectors: Vec<Vec<f32>>,
    provider_id: String,
    model_id: String,
    latency: Duration,
    adaptive: &AdaptiveBatchSize,
    sink: &Arc<dyn ProgressSink>,
) -> EmbeddedBatch {
    adaptive.note_success(latency);
    sink.on_event(ProgressEvent::BatchDispatched {
        chunk_count: batch.len(),
        provider_id: provider_id.clone(),
    });
    EmbeddedBatch {
        chunks: batch.to_vec(),
        vectors,
        provider_id,
        model_id,
        latency_ms: latency.as_millis() as u64,
    }
}

fn jittered_delay(error: &ProviderError, attempt: u32, base_delay: Duration) -> Duration {
    let base = error.retry_delay(attempt, base_delay);
    let jitter_frac = rand::thread_rng().gen_range(-0.1..=0.1);
    let millis = (base.as_millis() as f64) * (1.0 + jitter_frac);
    Duration::from_millis(millis.max(0.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::{chunk_text, ChunkerOptions};
    use crate::events::NullSink;
    use crate::provider::test_support::ScriptedProvider;

    fn sample_chunks(n: usize) -> Vec<Chunk> {
        let text = "fn example() {}\n".repeat(200);
        let mut chunks = chunk_text("f.rs", &text, &ChunkerOptions::default());
        chunks.truncate(n.max(1));
        while chunks.len() < n {
            chunks.push(chunks[0].clone());
        }
        chunks
    }

    #[tokio::test]
    async fn runs_to_completion_with_healthy_provider() {
        let provider = Arc::new(ScriptedProvider::new("local", 3, vec![]));
        let coordinator = Arc::new(FallbackCoordinator::new(vec![provider]));
        let chunks = sample_chunks(10);
        let opts = PipelineOptions {
            initial_batch_size: 4,
            max_batch_size: 8,
            ..Default::default()
        };
        let rx = chunk_source_from_vec(chunks, &opts);
        let results = run(rx, coordinator, opts, Arc::new(NullSink), CancellationToken::new())
            .await
            .unwrap();
        let total: usize = results.iter().map(|b| b.chunks.len()).sum();
        assert_eq!(total, 10);
    }

    #[tokio::test]
    async fn rejects_configuration_exceeding_memory_ceiling() {
        let opts = PipelineOptions {
            memory_limit_bytes: 10,
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }

    #[tokio::test]
    async fn retries_rate_limit_then_succeeds() {
        let provider = Arc::new(ScriptedProvider::new(
            "local",
            2,
            vec![ProviderError::RateLimit { retry_after_ms: Some(1) }],
        ));
        let coordinator = Arc::new(FallbackCoordinator::new(vec![provider]));
        let chunks = sample_chunks(3);
        let opts = PipelineOptions::default();
        let rx = chunk_source_from_vec(chunks, &opts);
        let results = run(rx, coordinator, opts, Arc::new(NullSink), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(results.iter().map(|b| b.chunks.len()).sum::<usize>(), 3);
    }
}
