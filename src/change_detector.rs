//! Change Detector (C4): classifies discovered files against the stored file
//! catalog using a stat-based quick-check before falling back to content
//! hashing.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::store::FileRecord;
use crate::walker::DiscoveredFile;

/// Quick-check mtime tolerance (see SPEC_FULL.md Open Questions: the source
/// left this unstated; 1ms matches most filesystems' practical granularity).
const MTIME_TOLERANCE_MS: i64 = 1;

#[derive(Debug, Clone)]
pub struct Classification {
    pub added: Vec<DiscoveredFile>,
    pub modified: Vec<(DiscoveredFile, FileRecord)>,
    pub deleted: Vec<String>,
    pub unchanged: Vec<String>,
    pub skipped: Vec<String>,
    /// Unchanged files whose (size, mtime) drifted from the stored record
    /// without a content change being confirmed by a hash comparison (e.g. a
    /// touch, or a copy that preserves bytes). The caller should persist
    /// these so the next run's quick-check can skip hashing them again.
    pub refreshed: Vec<FileRecord>,
}

impl Classification {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }
}

pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn to_millis(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Classifies `discovered` files against `stored` records. Files present in
/// `stored` but absent from `discovered` are `deleted`. Unreadable files are
/// `skipped`, never treated as deleted (prevents data loss on transient I/O
/// errors).
pub fn classify(
    discovered: &[DiscoveredFile],
    stored: &HashMap<String, FileRecord>,
) -> Classification {
    let mut added = Vec::new();
    let mut modified = Vec::new();
    let mut unchanged = Vec::new();
    let mut skipped = Vec::new();
    let mut refreshed = Vec::new();

    let mut seen = std::collections::HashSet::with_capacity(discovered.len());

    for file in discovered {
        seen.insert(file.relative_path.clone());
        let Some(record) = stored.get(&file.relative_path) else {
            added.push(file.clone());
            continue;
        };

        if record.size_bytes == file.size
            && (to_millis(file.last_modified) - record.last_modified_ms).abs() <= MTIME_TOLERANCE_MS
        {
            unchanged.push(file.relative_path.clone());
            continue;
        }

        match hash_file(&file.absolute_path) {
            Ok(hash) => {
                if hash == record.content_hash {
                    unchanged.push(file.relative_path.clone());
                    // Content is confirmed unchanged but the stat fields drifted
                    // (e.g. a touch) — refresh them so next run's quick-check
                    // matches without re-hashing.
                    refreshed.push(FileRecord {
                        relative_path: file.relative_path.clone(),
                        size_bytes: file.size,
                        last_modified_ms: to_millis(file.last_modified),
                        content_hash: record.content_hash.clone(),
                    });
                } else {
                    modified.push((file.clone(), record.clone()));
                }
            }
            Err(_) => skipped.push(file.relative_path.clone()),
        }
    }

    let deleted: Vec<String> = stored
        .keys()
        .filter(|path| !seen.contains(*path))
        .cloned()
        .collect();

    Classification {
        added,
        modified,
        deleted,
        unchanged,
        skipped,
        refreshed,
    }
}

fn hash_file(path: &Path) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(content_hash(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record(hash: &str, size: u64, mtime_ms: i64) -> FileRecord {
        FileRecord {
            relative_path: String::new(),
            size_bytes: size,
            last_modified_ms: mtime_ms,
            content_hash: hash.to_string(),
        }
    }

    fn discovered(path: &str, content: &[u8], mtime_ms: i64) -> DiscoveredFile {
        DiscoveredFile {
            absolute_path: std::path::PathBuf::from(path),
            relative_path: path.to_string(),
            size: content.len() as u64,
            last_modified: UNIX_EPOCH + Duration::from_millis(mtime_ms as u64),
        }
    }

    #[test]
    fn new_file_is_added() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"hello").unwrap();
        let file = DiscoveredFile {
            absolute_path: path,
            relative_path: "a.txt".into(),
            size: 5,
            last_modified: SystemTime::now(),
        };
        let stored = HashMap::new();
        let c = classify(&[file], &stored);
        assert_eq!(c.added.len(), 1);
        assert!(c.modified.is_empty());
    }

    #[test]
    fn unchanged_via_quick_check_skips_hashing() {
        let file = discovered("a.txt", b"hello", 1000);
        let mut stored = HashMap::new();
        stored.insert(
            "a.txt".to_string(),
            record(&content_hash(b"hello"), 5, 1000),
        );
        let c = classify(&[file], &stored);
        assert_eq!(c.unchanged, vec!["a.txt".to_string()]);
    }

    #[test]
    fn size_changed_triggers_hash_and_detects_modification() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"hello world").unwrap();
        let file = DiscoveredFile {
            absolute_path: path,
            relative_path: "a.txt".into(),
            size: 11,
            last_modified: SystemTime::now(),
        };
        let mut stored = HashMap::new();
        stored.insert("a.txt".to_string(), record(&content_hash(b"hello"), 5, 0));
        let c = classify(&[file], &stored);
        assert_eq!(c.modified.len(), 1);
    }

    #[test]
    fn missing_stored_path_is_deleted() {
        let stored_map = {
            let mut m = HashMap::new();
            m.insert("gone.txt".to_string(), record("deadbeef", 1, 0));
            m
        };
        let c = classify(&[], &stored_map);
        assert_eq!(c.deleted, vec!["gone.txt".to_string()]);
    }

    #[test]
    fn unreadable_file_is_skipped_not_deleted() {
        let file = DiscoveredFile {
            absolute_path: std::path::PathBuf::from("/nonexistent/path/a.txt"),
            relative_path: "a.txt".into(),
            size: 999,
            last_modified: SystemTime::now(),
        };
        let mut stored = HashMap::new();
        stored.insert("a.txt".to_string(), record("deadbeef", 5, 0));
        let c = classify(&[file], &stored);
        assert_eq!(c.skipped, vec!["a.txt".to_string()]);
        assert!(c.deleted.is_empty());
    }
}
