//! Query Engine (C9): embeds the query text once, scans vector shards across
//! the target repositories, and returns the top-k cosine matches with
//! deterministic tie-breaking.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;

use tracing::{instrument, warn};

use crate::errors::Result;
use crate::fallback::FallbackCoordinator;
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub k: usize,
    pub min_score: f32,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self { k: 8, min_score: 0.0 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub chunk_id: String,
    pub score: f32,
    pub relative_path: String,
    pub line_range: (u32, u32),
    pub text: String,
}

/// Ordered so that `Ordering::Greater` means "worse" (lower score, or on a
/// tie, a lexicographically larger chunk_id). A `BinaryHeap<HeapEntry>` then
/// pops its worst element first, which is exactly what bounded top-k
/// eviction needs, and `into_sorted_vec()` yields results already in
/// (score desc, chunk_id asc) order.
#[derive(Debug, Clone, PartialEq)]
struct HeapEntry {
    score: f32,
    chunk_id: String,
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        match other.score.total_cmp(&self.score) {
            Ordering::Equal => self.chunk_id.cmp(&other.chunk_id),
            non_eq => non_eq,
        }
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

fn top_k_in_store(store: &Store, query_vector: &[f32], opts: &QueryOptions) -> Result<Vec<HeapEntry>> {
    let mut heap: BinaryHeap<HeapEntry> = BinaryHeap::with_capacity(opts.k + 1);
    store.for_each_vector(|chunk_id, values| {
        let score = cosine_similarity(query_vector, values);
        if score < opts.min_score {
            return;
        }
        let candidate = HeapEntry {
            score,
            chunk_id: chunk_id.to_string(),
        };
        if heap.len() < opts.k {
            heap.push(candidate);
        } else if let Some(worst) = heap.peek() {
            if candidate < *worst {
                heap.pop();
                heap.push(candidate);
            }
        }
    })?;
    Ok(heap.into_sorted_vec())
}

/// Embeds `query_text` once via the fallback coordinator, scans every store
/// in `stores`, skipping any whose stamped dimension doesn't match the
/// query embedding's dimension, and returns the global top-k.
#[instrument(skip(stores, coordinator))]
pub async fn query(
    stores: &[Store],
    query_text: &str,
    coordinator: &FallbackCoordinator,
    opts: QueryOptions,
) -> Result<Vec<QueryResult>> {
    let (vectors, _, _) = coordinator.dispatch(&[query_text.to_string()]).await?;
    let query_vector = vectors.into_iter().next().unwrap_or_default();

    // Global top-k, keyed to the index of the store each entry came from so
    // we can later load chunk metadata from exactly the right repository.
    let mut global: BinaryHeap<HeapEntry> = BinaryHeap::with_capacity(opts.k + 1);
    let mut owning_store: std::collections::HashMap<String, usize> = std::collections::HashMap::new();

    for (store_index, store) in stores.iter().enumerate() {
        if store.metadata.dimension != Some(query_vector.len()) {
            warn!(
                repository_id = %store.metadata.repository_id,
                "skipping repository: dimension mismatch with current query embedding"
            );
            continue;
        }
        let local_top = top_k_in_store(store, &query_vector, &opts)?;
        for entry in local_top {
            owning_store.insert(entry.chunk_id.clone(), store_index);
            if global.len() < opts.k {
                global.push(entry);
            } else if let Some(worst) = global.peek() {
                if entry < *worst {
                    global.pop();
                    global.push(entry);
                }
            }
        }
    }

    let ranked = global.into_sorted_vec();

    let mut ids_per_store: std::collections::HashMap<usize, HashSet<String>> = std::collections::HashMap::new();
    for entry in &ranked {
        if let Some(&store_index) = owning_store.get(&entry.chunk_id) {
            ids_per_store.entry(store_index).or_default().insert(entry.chunk_id.clone());
        }
    }
    let mut chunk_lookup: std::collections::HashMap<String, crate::store::ChunkRecord> = std::collections::HashMap::new();
    for (store_index, ids_for_store) in &ids_per_store {
        chunk_lookup.extend(stores[*store_index].load_chunks(ids_for_store)?);
    }

    Ok(ranked
        .into_iter()
        .filter_map(|entry| {
            chunk_lookup.get(&entry.chunk_id).map(|record| QueryResult {
                chunk_id: entry.chunk_id,
                score: entry.score,
                relative_path: record.relative_path.clone(),
                line_range: record.line_range,
                text: record.text.clone(),
            })
        })
        .collect())
}

/// Used by callers that already hold an `Arc<FallbackCoordinator>`.
pub async fn query_with_arc(
    stores: &[Store],
    query_text: &str,
    coordinator: Arc<FallbackCoordinator>,
    opts: QueryOptions,
) -> Result<Vec<QueryResult>> {
    query(stores, query_text, &coordinator, opts).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_orders_by_score_desc_then_chunk_id_asc() {
        let mut heap: BinaryHeap<HeapEntry> = BinaryHeap::new();
        heap.push(HeapEntry { score: 1.0, chunk_id: "b".into() });
        heap.push(HeapEntry { score: 1.0, chunk_id: "a".into() });
        heap.push(HeapEntry { score: 0.5, chunk_id: "c".into() });
        let sorted = heap.into_sorted_vec();
        let ids: Vec<&str> = sorted.iter().map(|e| e.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn bounded_heap_keeps_only_top_k() {
        let mut heap: BinaryHeap<HeapEntry> = BinaryHeap::new();
        let k = 2;
        for (score, id) in [(0.1, "a"), (0.9, "b"), (0.5, "c"), (0.95, "d")] {
            let candidate = HeapEntry { score, chunk_id: id.into() };
            if heap.len() < k {
                heap.push(candidate);
            } else if let Some(worst) = heap.peek() {
                if candidate < *worst {
                    heap.pop();
                    heap.push(candidate);
                }
            }
        }
        let sorted = heap.into_sorted_vec();
        let ids: Vec<&str> = sorted.iter().map(|e| e.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["d", "b"]);
    }

    #[test]
    fn cosine_similarity_handles_zero_vectors() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]), 1.0);
    }
}
