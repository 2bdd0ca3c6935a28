//! File discovery (C2): streams eligible files from a repository root,
//! honoring `.gitignore` plus configured exclusion patterns, and rejects
//! binaries / oversize / non-UTF-8 files before they ever reach the chunker.

use ignore::overrides::{Override, OverrideBuilder};
use ignore::WalkBuilder;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::errors::{IndexError, Result};

/// Default hard skips for noisy directories, independent of `.gitignore`.
const DEFAULT_EXCLUDES: &[&str] = &[
    ".git", "node_modules", "target", "dist", "build", "coverage", ".next", ".nuxt", "out",
];

fn build_overrides(repo_root: &Path, exclude_patterns: &[String]) -> Result<Override> {
    let mut ob = OverrideBuilder::new(repo_root);
    for d in DEFAULT_EXCLUDES {
        ob.add(&format!("**/{d}")).map_err(override_err)?;
        ob.add(&format!("**/{d}/**")).map_err(override_err)?;
    }
    for pattern in exclude_patterns {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            continue;
        }
        ob.add(pattern).map_err(override_err)?;
    }
    ob.build().map_err(override_err)
}

fn override_err(e: ignore::Error) -> IndexError {
    IndexError::configuration(format!("invalid exclude pattern: {e}"))
}

#[derive(Debug, Clone)]
pub struct DiscoveredFile {
    pub absolute_path: PathBuf,
    pub relative_path: String,
    pub size: u64,
    pub last_modified: SystemTime,
}

#[derive(Debug, Clone, Default)]
pub struct WalkReport {
    pub scanned: usize,
    pub skipped_binary: usize,
    pub skipped_oversize: usize,
    pub skipped_io_error: usize,
    pub skipped_non_utf8: usize,
}

#[derive(Debug, Clone)]
pub struct WalkOptions {
    pub root: PathBuf,
    pub max_file_bytes: u64,
    pub exclude_patterns: Vec<String>,
}

/// Walks `opts.root` and returns the eligible files plus a report of what was
/// skipped and why. Binary detection reads only the first 512 bytes of each
/// candidate (a NUL byte in that window is treated as binary).
pub fn discover(opts: &WalkOptions) -> Result<(Vec<DiscoveredFile>, WalkReport)> {
    let overrides = build_overrides(&opts.root, &opts.exclude_patterns)?;
    let walker = WalkBuilder::new(&opts.root)
        .standard_filters(true)
        .overrides(overrides)
        .build();

    let mut files = Vec::new();
    let mut report = WalkReport::default();

    for item in walker {
        let dent = match item {
            Ok(d) => d,
            Err(_) => {
                report.skipped_io_error += 1;
                continue;
            }
        };
        if !dent.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
            continue;
        }
        let absolute_path = dent.into_path();
        let meta = match std::fs::metadata(&absolute_path) {
            Ok(m) => m,
            Err(_) => {
                report.skipped_io_error += 1;
                continue;
            }
        };
        let size = meta.len();
        if size == 0 {
            continue;
        }
        if size > opts.max_file_bytes {
            report.skipped_oversize += 1;
            continue;
        }
        if looks_binary(&absolute_path) {
            report.skipped_binary += 1;
            continue;
        }

        let relative_path = match absolute_path.strip_prefix(&opts.root) {
            Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
            Err(_) => {
                report.skipped_io_error += 1;
                continue;
            }
        };

        let last_modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        report.scanned += 1;
        files.push(DiscoveredFile {
            absolute_path,
            relative_path,
            size,
            last_modified,
        });
    }

    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok((files, report))
}

fn looks_binary(path: &Path) -> bool {
    use std::io::Read;
    let Ok(mut f) = std::fs::File::open(path) else {
        return false;
    };
    let mut buf = [0u8; 512];
    let Ok(n) = f.read(&mut buf) else {
        return false;
    };
    buf[..n].contains(&0u8)
}

/// Reads a discovered file's contents as UTF-8. Returns `Ok(None)` (not an
/// error) when the file fails UTF-8 validation — callers count these as
/// skipped, not fatal, per the input-error policy.
pub fn read_utf8(path: &Path) -> Result<Option<String>> {
    let bytes = std::fs::read(path)?;
    match String::from_utf8(bytes) {
        Ok(text) => Ok(Some(text)),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn discovers_text_files_and_skips_binary() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello world\n").unwrap();
        let mut bin = std::fs::File::create(dir.path().join("b.bin")).unwrap();
        bin.write_all(&[0u8, 1, 2, 3]).unwrap();

        let opts = WalkOptions {
            root: dir.path().to_path_buf(),
            max_file_bytes: 1_000_000,
            exclude_patterns: vec![],
        };
        let (files, report) = discover(&opts).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative_path, "a.txt");
        assert_eq!(report.skipped_binary, 1);
    }

    #[test]
    fn skips_oversize_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big.txt"), vec![b'x'; 100]).unwrap();
        let opts = WalkOptions {
            root: dir.path().to_path_buf(),
            max_file_bytes: 10,
            exclude_patterns: vec![],
        };
        let (files, report) = discover(&opts).unwrap();
        assert!(files.is_empty());
        assert_eq!(report.skipped_oversize, 1);
    }

    #[test]
    fn honors_exclude_patterns() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("generated")).unwrap();
        std::fs::write(dir.path().join("generated/x.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("keep.txt"), b"keep").unwrap();

        let opts = WalkOptions {
            root: dir.path().to_path_buf(),
            max_file_bytes: 1_000_000,
            exclude_patterns: vec!["**/generated/**".into(), "**/generated".into()],
        };
        let (files, _) = discover(&opts).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative_path, "keep.txt");
    }
}
