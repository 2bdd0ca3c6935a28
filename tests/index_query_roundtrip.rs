//! Exercises the full index -> query round trip against a temp directory,
//! standing in for a real embedding backend with a scripted in-process
//! provider (no network, no model download).

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::tempdir;

use codewell::chunker::ChunkerOptions;
use codewell::errors::ProviderError;
use codewell::events::NullSink;
use codewell::fallback::FallbackCoordinator;
use codewell::indexer::{self, IndexRunOptions};
use codewell::pipeline::PipelineOptions;
use codewell::provider::{EmbedProvider, ProviderLimits};
use codewell::query::{self, QueryOptions};
use codewell::store::Store;
use codewell::walker::WalkOptions;
use codewell::writer::WriterOptions;

/// Deterministic 3-dimensional embedding: text containing "Mars" gets
/// `[0, 1, 0]`, everything else gets `[1, 0, 0]` — enough to distinguish
/// "modified" content from the original across these scenarios.
struct ConstantProvider;

#[async_trait]
impl EmbedProvider for ConstantProvider {
    fn provider_id(&self) -> &str {
        "fixture"
    }
    fn model_id(&self) -> &str {
        "fixture-model"
    }
    fn dimension(&self) -> usize {
        3
    }
    fn limits(&self) -> ProviderLimits {
        ProviderLimits {
            max_batch_size: 64,
            max_tokens_per_request: 100_000,
            requests_per_minute: 10_000,
        }
    }
    fn is_ready(&self) -> bool {
        true
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts
            .iter()
            .map(|t| if t.contains("Mars") { vec![0.0, 1.0, 0.0] } else { vec![1.0, 0.0, 0.0] })
            .collect())
    }
}

fn run_options(root: &Path) -> IndexRunOptions {
    IndexRunOptions {
        walk: WalkOptions {
            root: root.to_path_buf(),
            max_file_bytes: 1_000_000,
            exclude_patterns: vec![],
        },
        chunker: ChunkerOptions::default(),
        pipeline: PipelineOptions {
            initial_batch_size: 4,
            max_batch_size: 8,
            concurrency: 1,
            ..Default::default()
        },
        writer: WriterOptions::default(),
        force: false,
    }
}

fn coordinator() -> Arc<FallbackCoordinator> {
    Arc::new(FallbackCoordinator::new(vec![Arc::new(ConstantProvider) as Arc<dyn EmbedProvider>]))
}

#[tokio::test]
async fn first_index_single_file_produces_one_chunk_and_vector() {
    let repo = tempdir().unwrap();
    let base = tempdir().unwrap();
    std::fs::write(repo.path().join("hello.txt"), "hello world\n").unwrap();

    let mut store = Store::open_for_write(repo.path(), base.path()).unwrap();
    let report = indexer::run_index(&mut store, coordinator(), run_options(repo.path()), Arc::new(NullSink))
        .await
        .unwrap();

    assert_eq!(report.added, 1);
    assert_eq!(store.metadata.total_chunks, 1);
    assert_eq!(store.metadata.provider_id.as_deref(), Some("fixture"));
    assert_eq!(store.metadata.dimension, Some(3));

    let mut seen = 0;
    store
        .for_each_vector(|_, v| {
            assert_eq!(v, &[1.0, 0.0, 0.0]);
            seen += 1;
        })
        .unwrap();
    assert_eq!(seen, 1);
}

#[tokio::test]
async fn modifying_a_file_replaces_its_chunk_without_touching_others() {
    let repo = tempdir().unwrap();
    let base = tempdir().unwrap();
    std::fs::write(repo.path().join("hello.txt"), "hello world\n").unwrap();
    std::fs::write(repo.path().join("other.txt"), "unrelated content\n").unwrap();

    let coord = coordinator();
    {
        let mut store = Store::open_for_write(repo.path(), base.path()).unwrap();
        indexer::run_index(&mut store, coord.clone(), run_options(repo.path()), Arc::new(NullSink))
            .await
            .unwrap();
        assert_eq!(store.metadata.total_chunks, 2);
    }

    std::thread::sleep(std::time::Duration::from_millis(20));
    std::fs::write(repo.path().join("hello.txt"), "hello Mars\n").unwrap();

    let mut store = Store::open_for_write(repo.path(), base.path()).unwrap();
    let report = indexer::run_index(&mut store, coord, run_options(repo.path()), Arc::new(NullSink))
        .await
        .unwrap();
    assert_eq!(report.modified, 1);
    assert_eq!(store.metadata.total_chunks, 2);

    let mut mars_seen = false;
    store
        .for_each_vector(|_, v| {
            if v == [0.0, 1.0, 0.0] {
                mars_seen = true;
            }
        })
        .unwrap();
    assert!(mars_seen, "expected the modified file's new vector to be present");
}

#[tokio::test]
async fn deleting_a_file_removes_its_chunks_on_reindex() {
    let repo = tempdir().unwrap();
    let base = tempdir().unwrap();
    std::fs::write(repo.path().join("a.txt"), "hello world\n").unwrap();
    std::fs::write(repo.path().join("b.txt"), "hello world\n").unwrap();

    let coord = coordinator();
    {
        let mut store = Store::open_for_write(repo.path(), base.path()).unwrap();
        indexer::run_index(&mut store, coord.clone(), run_options(repo.path()), Arc::new(NullSink))
            .await
            .unwrap();
        assert_eq!(store.metadata.total_chunks, 2);
    }

    std::fs::remove_file(repo.path().join("b.txt")).unwrap();

    let mut store = Store::open_for_write(repo.path(), base.path()).unwrap();
    let report = indexer::run_index(&mut store, coord, run_options(repo.path()), Arc::new(NullSink))
        .await
        .unwrap();
    assert_eq!(report.deleted, 1);
    assert!(!store.file_records().contains_key("b.txt"));
}

#[tokio::test]
async fn query_returns_top_k_ordered_by_score_desc() {
    let repo = tempdir().unwrap();
    let base = tempdir().unwrap();
    std::fs::write(repo.path().join("a.txt"), "hello world\n").unwrap();
    std::fs::write(repo.path().join("b.txt"), "hello Mars\n").unwrap();

    let coord = coordinator();
    {
        let mut store = Store::open_for_write(repo.path(), base.path()).unwrap();
        indexer::run_index(&mut store, coord.clone(), run_options(repo.path()), Arc::new(NullSink))
            .await
            .unwrap();
    }

    let store = Store::open_for_read(repo.path(), base.path()).unwrap();
    let results = query::query(&[store], "hello world", &coord, QueryOptions { k: 2, min_score: 0.0 })
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    assert!(results[0].score >= results[1].score);
    assert_eq!(results[0].relative_path, "a.txt");
}

#[tokio::test]
async fn reindexing_an_unchanged_repository_is_idempotent() {
    let repo = tempdir().unwrap();
    let base = tempdir().unwrap();
    std::fs::write(repo.path().join("a.txt"), "hello world\n").unwrap();

    let coord = coordinator();
    let mut store = Store::open_for_write(repo.path(), base.path()).unwrap();
    indexer::run_index(&mut store, coord.clone(), run_options(repo.path()), Arc::new(NullSink))
        .await
        .unwrap();
    let first_total = store.metadata.total_chunks;

    let report = indexer::run_index(&mut store, coord, run_options(repo.path()), Arc::new(NullSink))
        .await
        .unwrap();
    assert_eq!(report.added, 0);
    assert_eq!(report.modified, 0);
    assert_eq!(report.deleted, 0);
    assert_eq!(report.unchanged, 1);
    assert_eq!(store.metadata.total_chunks, first_total);
}
