//! Repository Store (C1): per-repository on-disk layout, atomic metadata and
//! file-hash catalog, sharded chunk/vector files, and an advisory write lock.
//!
//! Layout under `<base>/repositories/<repository_id>/`:
//! ```text
//! metadata.json
//! file_hashes.json
//! chunks/<shard>.jsonl
//! vectors/<shard>.bin     (f32 LE values, contiguous)
//! vectors/<shard>.index   (JSON lines: chunk_id per vector, same order as .bin)
//! lock                    (presence = active writer)
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::chunker::Chunk;
use crate::errors::{IndexError, Result};

pub const SCHEMA_VERSION: u32 = 1;
const SHARD_CHUNK_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub relative_path: String,
    pub size_bytes: u64,
    pub last_modified_ms: i64,
    pub content_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryMetadata {
    pub repository_id: String,
    pub root_path: PathBuf,
    pub created_at: i64,
    pub last_indexed_at: Option<i64>,
    pub last_cleanup_at: Option<i64>,
    pub total_chunks: usize,
    pub provider_id: Option<String>,
    pub model_id: Option<String>,
    pub dimension: Option<usize>,
    pub schema_version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub chunk_id: String,
    pub relative_path: String,
    pub file_hash: String,
    pub byte_range: (usize, usize),
    pub line_range: (u32, u32),
    pub text: String,
    pub token_estimate: usize,
}

impl ChunkRecord {
    pub fn from_chunk(chunk: &Chunk, file_hash: &str) -> Self {
        Self {
            chunk_id: chunk.chunk_id.clone(),
            relative_path: chunk.relative_path.clone(),
            file_hash: file_hash.to_string(),
            byte_range: chunk.byte_range,
            line_range: chunk.line_range,
            text: chunk.text.clone(),
            token_estimate: chunk.token_estimate,
        }
    }
}

pub struct VectorRecord {
    pub chunk_id: String,
    pub values: Vec<f32>,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub fn repository_id_for(root_path: &Path) -> String {
    let canon = root_path
        .canonicalize()
        .unwrap_or_else(|_| root_path.to_path_buf());
    let mut hasher = Sha256::new();
    hasher.update(canon.to_string_lossy().as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

fn default_base_dir() -> Result<PathBuf> {
    dirs::data_local_dir()
        .map(|d| d.join("codewell"))
        .ok_or_else(|| IndexError::configuration("could not resolve a per-user data directory"))
}

pub struct Store {
    repo_dir: PathBuf,
    pub metadata: RepositoryMetadata,
    file_hashes: HashMap<String, FileRecord>,
    tombstones: HashSet<String>,
    lock_path: Option<PathBuf>,
}

impl Store {
    pub fn base_dir() -> Result<PathBuf> {
        default_base_dir()
    }

    fn repo_dir_for(base_dir: &Path, repository_id: &str) -> PathBuf {
        base_dir.join("repositories").join(repository_id)
    }

    /// Opens (creating if necessary) the store for `root_path`, acquiring the
    /// advisory write lock. Fails if another writer currently holds it.
    pub fn open_for_write(root_path: &Path, base_dir: &Path) -> Result<Self> {
        let mut store = Self::open_internal(root_path, base_dir, true)?;
        store.reconcile()?;
        Ok(store)
    }

    /// Opens the store for read-only access (queries). Does not take the
    /// lock; tolerates concurrent writers appending to shards.
    pub fn open_for_read(root_path: &Path, base_dir: &Path) -> Result<Self> {
        Self::open_internal(root_path, base_dir, false)
    }

    fn open_internal(root_path: &Path, base_dir: &Path, for_write: bool) -> Result<Self> {
        let repository_id = repository_id_for(root_path);
        let repo_dir = Self::repo_dir_for(base_dir, &repository_id);
        std::fs::create_dir_all(repo_dir.join("chunks"))?;
        std::fs::create_dir_all(repo_dir.join("vectors"))?;

        let lock_path = repo_dir.join("lock");
        let mut held_lock = None;
        if for_write {
            let lock_file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path);
            match lock_file {
                Ok(_) => held_lock = Some(lock_path.clone()),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    return Err(IndexError::invariant(
                        "repository is locked by another writer",
                        vec!["wait for the other indexer to finish, or remove the stale lock file".into()],
                    ));
                }
                Err(e) => return Err(e.into()),
            }
        }

        let metadata_path = repo_dir.join("metadata.json");
        let metadata = if metadata_path.exists() {
            let text = std::fs::read_to_string(&metadata_path)?;
            serde_json::from_str(&text)?
        } else {
            RepositoryMetadata {
                repository_id: repository_id.clone(),
                root_path: root_path.to_path_buf(),
                created_at: now_ms(),
                last_indexed_at: None,
                last_cleanup_at: None,
                total_chunks: 0,
                provider_id: None,
                model_id: None,
                dimension: None,
                schema_version: SCHEMA_VERSION,
            }
        };

        let hashes_path = repo_dir.join("file_hashes.json");
        let file_hashes = if hashes_path.exists() {
            let text = std::fs::read_to_string(&hashes_path)?;
            serde_json::from_str(&text)?
        } else {
            HashMap::new()
        };

        Ok(Self {
            repo_dir,
            metadata,
            file_hashes,
            tombstones: HashSet::new(),
            lock_path: held_lock,
        })
    }

    /// Truncates any vector shard past the committed chunk count in metadata,
    /// recovering from a crash between a chunk-shard append and the
    /// corresponding vector-shard append.
    fn reconcile(&mut self) -> Result<()> {
        let committed = self.metadata.total_chunks;
        let mut seen = 0usize;
        for shard_id in self.shard_ids()? {
            let index_path = self.vector_index_path(shard_id);
            let lines = read_lines(&index_path)?;
            if seen + lines.len() <= committed {
                seen += lines.len();
                continue;
            }
            let keep = committed.saturating_sub(seen);
            seen = committed;
            self.truncate_vector_shard(shard_id, keep)?;
        }
        Ok(())
    }

    fn truncate_vector_shard(&self, shard_id: u32, keep: usize) -> Result<()> {
        let index_path = self.vector_index_path(shard_id);
        let bin_path = self.vector_bin_path(shard_id);
        let lines = read_lines(&index_path)?;
        if keep >= lines.len() {
            return Ok(());
        }
        let dimension = self.metadata.dimension.unwrap_or(0);
        std::fs::write(&index_path, lines[..keep].join("\n") + if keep > 0 { "\n" } else { "" })?;
        if dimension > 0 {
            let bytes = std::fs::read(&bin_path)?;
            let keep_bytes = keep * dimension * 4;
            std::fs::write(&bin_path, &bytes[..keep_bytes.min(bytes.len())])?;
        }
        Ok(())
    }

    pub fn file_records(&self) -> &HashMap<String, FileRecord> {
        &self.file_hashes
    }

    pub fn upsert_file_record(&mut self, record: FileRecord) {
        self.file_hashes.insert(record.relative_path.clone(), record);
    }

    pub fn remove_file_record(&mut self, relative_path: &str) {
        self.file_hashes.remove(relative_path);
    }

    pub fn save_file_hashes(&self) -> Result<()> {
        atomic_write_json(&self.repo_dir.join("file_hashes.json"), &self.file_hashes)
    }

    pub fn save_metadata(&self) -> Result<()> {
        atomic_write_json(&self.repo_dir.join("metadata.json"), &self.metadata)
    }

    /// Stamps (or validates) the provider/model/dimension triple. The first
    /// writer after repository creation stamps it; later writes must match,
    /// else the store refuses to mix vector spaces within one repository.
    pub fn stamp_provider(&mut self, provider_id: &str, model_id: &str, dimension: usize) -> Result<()> {
        match (self.metadata.provider_id.clone(), self.metadata.model_id.clone(), self.metadata.dimension) {
            (None, None, None) => {
                self.metadata.provider_id = Some(provider_id.to_string());
                self.metadata.model_id = Some(model_id.to_string());
                self.metadata.dimension = Some(dimension);
                Ok(())
            }
            (Some(p), Some(m), Some(d)) if p == provider_id && m == model_id && d == dimension => Ok(()),
            _ => Err(IndexError::invariant(
                format!(
                    "provider/model/dimension mismatch: repository is stamped for a different embedding space (requested {provider_id}/{model_id}/{dimension})"
                ),
                vec!["reset the index before switching providers or models".into()],
            )),
        }
    }

    fn shard_ids(&self) -> Result<Vec<u32>> {
        let mut ids = Vec::new();
        let dir = self.repo_dir.join("vectors");
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if let Some(name) = entry.path().file_stem().and_then(|s| s.to_str()) {
                if entry.path().extension().and_then(|e| e.to_str()) == Some("index") {
                    if let Ok(id) = name.parse::<u32>() {
                        ids.push(id);
                    }
                }
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    fn vector_bin_path(&self, shard: u32) -> PathBuf {
        self.repo_dir.join("vectors").join(format!("{shard:05}.bin"))
    }

    fn vector_index_path(&self, shard: u32) -> PathBuf {
        self.repo_dir.join("vectors").join(format!("{shard:05}.index"))
    }

    fn chunk_shard_path(&self, shard: u32) -> PathBuf {
        self.repo_dir.join("chunks").join(format!("{shard:05}.jsonl"))
    }

    fn current_shard(&self, dir_ext: &str) -> Result<u32> {
        let ids = self.shard_ids_for(dir_ext)?;
        let Some(&last) = ids.last() else { return Ok(0) };
        let count = read_lines(&self.shard_marker_path(dir_ext, last))?.len();
        if count >= SHARD_CHUNK_CAPACITY {
            Ok(last + 1)
        } else {
            Ok(last)
        }
    }

    fn shard_ids_for(&self, dir_ext: &str) -> Result<Vec<u32>> {
        match dir_ext {
            "vectors" => self.shard_ids(),
            "chunks" => {
                let mut ids = Vec::new();
                let dir = self.repo_dir.join("chunks");
                for entry in std::fs::read_dir(&dir)? {
                    let entry = entry?;
                    if let Some(name) = entry.path().file_stem().and_then(|s| s.to_str()) {
                        if let Ok(id) = name.parse::<u32>() {
                            ids.push(id);
                        }
                    }
                }
                ids.sort_unstable();
                Ok(ids)
            }
            _ => unreachable!(),
        }
    }

    fn shard_marker_path(&self, dir_ext: &str, shard: u32) -> PathBuf {
        match dir_ext {
            "vectors" => self.vector_index_path(shard),
            "chunks" => self.chunk_shard_path(shard),
            _ => unreachable!(),
        }
    }

    pub fn append_chunks(&mut self, records: &[ChunkRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let shard = self.current_shard("chunks")?;
        let path = self.chunk_shard_path(shard);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        for record in records {
            let line = serde_json::to_string(record)?;
            writeln!(file, "{line}")?;
        }
        Ok(())
    }

    pub fn append_vectors(&mut self, records: &[VectorRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let dimension = self.metadata.dimension.ok_or_else(|| {
            IndexError::invariant("writing vectors before provider stamping", vec![])
        })?;
        let shard = self.current_shard("vectors")?;
        let bin_path = self.vector_bin_path(shard);
        let index_path = self.vector_index_path(shard);
        let mut bin_file = OpenOptions::new().create(true).append(true).open(&bin_path)?;
        let mut index_file = OpenOptions::new().create(true).append(true).open(&index_path)?;
        for record in records {
            if record.values.len() != dimension {
                return Err(IndexError::invariant(
                    format!(
                        "vector dimension {} does not match repository dimension {}",
                        record.values.len(),
                        dimension
                    ),
                    vec![],
                ));
            }
            for v in &record.values {
                bin_file.write_all(&v.to_le_bytes())?;
            }
            writeln!(index_file, "{}", record.chunk_id)?;
        }
        self.metadata.total_chunks += records.len();
        Ok(())
    }

    /// Marks chunk_ids as tombstoned (skipped on the next full scan). Actual
    /// reclamation happens in `compact`.
    pub fn remove(&mut self, chunk_ids: &[String]) -> Result<()> {
        self.tombstones.extend(chunk_ids.iter().cloned());
        Ok(())
    }

    /// Rewrites every shard excluding tombstoned chunk_ids, then clears the
    /// tombstone set. Invoked explicitly (the `doctor` surface, or on a
    /// schedule) rather than after every removal, to keep writes cheap.
    pub fn compact(&mut self) -> Result<()> {
        if self.tombstones.is_empty() {
            self.metadata.last_cleanup_at = Some(now_ms());
            return Ok(());
        }
        let dimension = self.metadata.dimension.unwrap_or(0);

        // Compact chunks.
        let mut surviving_ids: HashSet<String> = HashSet::new();
        for shard in self.shard_ids_for("chunks")? {
            let path = self.chunk_shard_path(shard);
            let text = std::fs::read_to_string(&path)?;
            let mut kept = String::new();
            for line in text.lines() {
                if let Ok(record) = serde_json::from_str::<ChunkRecord>(line) {
                    if !self.tombstones.contains(&record.chunk_id) {
                        surviving_ids.insert(record.chunk_id.clone());
                        kept.push_str(line);
                        kept.push('\n');
                    }
                }
            }
            std::fs::write(&path, kept)?;
        }

        // Compact vectors (only keep those whose chunk is still present).
        let mut total = 0usize;
        for shard in self.shard_ids()? {
            let index_path = self.vector_index_path(shard);
            let bin_path = self.vector_bin_path(shard);
            let ids = read_lines(&index_path)?;
            let bytes = if dimension > 0 { std::fs::read(&bin_path)? } else { Vec::new() };
            let mut kept_ids = Vec::new();
            let mut kept_bytes = Vec::with_capacity(bytes.len());
            for (i, id) in ids.iter().enumerate() {
                if self.tombstones.contains(id) {
                    continue;
                }
                kept_ids.push(id.clone());
                if dimension > 0 {
                    let entry_bytes = dimension * 4;
                    let start = i * entry_bytes;
                    kept_bytes.extend_from_slice(&bytes[start..start + entry_bytes]);
                }
            }
            total += kept_ids.len();
            std::fs::write(&index_path, kept_ids.join("\n") + if kept_ids.is_empty() { "" } else { "\n" })?;
            std::fs::write(&bin_path, kept_bytes)?;
        }

        self.metadata.total_chunks = total;
        self.metadata.last_cleanup_at = Some(now_ms());
        self.tombstones.clear();
        Ok(())
    }

    /// Streams vectors shard-by-shard, invoking `f(chunk_id, values)` for
    /// every non-tombstoned entry. Keeps peak memory to one shard at a time.
    pub fn for_each_vector<F: FnMut(&str, &[f32])>(&self, mut f: F) -> Result<()> {
        let dimension = match self.metadata.dimension {
            Some(d) => d,
            None => return Ok(()),
        };
        for shard in self.shard_ids()? {
            let ids = read_lines(&self.vector_index_path(shard))?;
            let mut file = File::open(self.vector_bin_path(shard))?;
            let mut buf = vec![0u8; dimension * 4];
            for id in ids {
                if self.tombstones.contains(&id) {
                    file.read_exact(&mut buf).ok();
                    continue;
                }
                file.read_exact(&mut buf)?;
                let values: Vec<f32> = buf
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect();
                f(&id, &values);
            }
        }
        Ok(())
    }

    /// Loads only the chunk metadata records matching `ids`, streaming each
    /// shard rather than materializing the whole catalog.
    pub fn load_chunks(&self, ids: &HashSet<String>) -> Result<HashMap<String, ChunkRecord>> {
        let mut found = HashMap::new();
        for shard in self.shard_ids_for("chunks")? {
            let path = self.chunk_shard_path(shard);
            let file = File::open(&path)?;
            for line in BufReader::new(file).lines() {
                let line = line?;
                if line.is_empty() {
                    continue;
                }
                let record: ChunkRecord = serde_json::from_str(&line)?;
                if ids.contains(&record.chunk_id) {
                    found.insert(record.chunk_id.clone(), record);
                }
                if found.len() == ids.len() {
                    return Ok(found);
                }
            }
        }
        Ok(found)
    }

    /// Removes all chunk_ids owned by `relative_path` from the catalog,
    /// looking them up from the chunk shards (used on modification/deletion
    /// before re-embedding).
    pub fn chunk_ids_for_path(&self, relative_path: &str) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for shard in self.shard_ids_for("chunks")? {
            let path = self.chunk_shard_path(shard);
            let file = File::open(&path)?;
            for line in BufReader::new(file).lines() {
                let line = line?;
                if line.is_empty() {
                    continue;
                }
                let record: ChunkRecord = serde_json::from_str(&line)?;
                if record.relative_path == relative_path {
                    ids.push(record.chunk_id);
                }
            }
        }
        Ok(ids)
    }

    pub fn mark_indexed_now(&mut self) {
        self.metadata.last_indexed_at = Some(now_ms());
    }

    pub fn delete_repository(root_path: &Path, base_dir: &Path) -> Result<()> {
        let repository_id = repository_id_for(root_path);
        let dir = Self::repo_dir_for(base_dir, &repository_id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Lists the root path of every repository ever indexed under `base_dir`,
    /// read from each repository's `metadata.json`. Backs `query --scope all`.
    pub fn list_repositories(base_dir: &Path) -> Result<Vec<PathBuf>> {
        let repos_dir = base_dir.join("repositories");
        if !repos_dir.exists() {
            return Ok(Vec::new());
        }
        let mut roots = Vec::new();
        for entry in std::fs::read_dir(&repos_dir)? {
            let entry = entry?;
            let metadata_path = entry.path().join("metadata.json");
            if let Ok(text) = std::fs::read_to_string(&metadata_path) {
                if let Ok(metadata) = serde_json::from_str::<RepositoryMetadata>(&text) {
                    roots.push(metadata.root_path);
                }
            }
        }
        Ok(roots)
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Some(path) = &self.lock_path {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn read_lines(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = std::fs::read_to_string(path)?;
    Ok(text.lines().filter(|l| !l.is_empty()).map(|l| l.to_string()).collect())
}

fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, text)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_reopen_round_trips_metadata() {
        let base = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        {
            let mut store = Store::open_for_write(root.path(), base.path()).unwrap();
            store.stamp_provider("local", "potion-32m", 3).unwrap();
            store.save_metadata().unwrap();
        }
        let store = Store::open_for_read(root.path(), base.path()).unwrap();
        assert_eq!(store.metadata.provider_id.as_deref(), Some("local"));
        assert_eq!(store.metadata.dimension, Some(3));
    }

    #[test]
    fn second_writer_is_rejected_while_locked() {
        let base = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let _first = Store::open_for_write(root.path(), base.path()).unwrap();
        let second = Store::open_for_write(root.path(), base.path());
        assert!(second.is_err());
    }

    #[test]
    fn append_and_scan_vectors_round_trip() {
        let base = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let mut store = Store::open_for_write(root.path(), base.path()).unwrap();
        store.stamp_provider("local", "m", 2).unwrap();
        store
            .append_vectors(&[
                VectorRecord { chunk_id: "a".into(), values: vec![1.0, 0.0] },
                VectorRecord { chunk_id: "b".into(), values: vec![0.0, 1.0] },
            ])
            .unwrap();
        let mut seen = Vec::new();
        store.for_each_vector(|id, v| seen.push((id.to_string(), v.to_vec()))).unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, "a");
    }

    #[test]
    fn dimension_mismatch_on_restamp_is_rejected() {
        let base = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let mut store = Store::open_for_write(root.path(), base.path()).unwrap();
        store.stamp_provider("local", "m", 2).unwrap();
        let result = store.stamp_provider("remote", "other", 4);
        assert!(result.is_err());
    }

    #[test]
    fn compact_removes_tombstoned_chunks_and_vectors() {
        let base = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let mut store = Store::open_for_write(root.path(), base.path()).unwrap();
        store.stamp_provider("local", "m", 1).unwrap();
        store
            .append_chunks(&[ChunkRecord {
                chunk_id: "a".into(),
                relative_path: "f.txt".into(),
                file_hash: "h".into(),
                byte_range: (0, 1),
                line_range: (1, 1),
                text: "x".into(),
                token_estimate: 1,
            }])
            .unwrap();
        store.append_vectors(&[VectorRecord { chunk_id: "a".into(), values: vec![1.0] }]).unwrap();
        store.remove(&["a".to_string()]).unwrap();
        store.compact().unwrap();
        assert_eq!(store.metadata.total_chunks, 0);
        let mut seen = 0;
        store.for_each_vector(|_, _| seen += 1).unwrap();
        assert_eq!(seen, 0);
    }
}
