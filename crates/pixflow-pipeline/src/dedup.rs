//! URL deduplication for the Reader
//!
//! The default [`MemoryDeduplicator`] forgets everything when the process
//! exits, so a restarted Reader republishes. [`FileDeduplicator`] keeps an
//! append-only file of seen URLs and loads it on open.

use dashmap::DashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum DedupError {
    #[error("dedup store {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("dedup store lock poisoned")]
    Poisoned,
}

/// Seen-set consulted before publishing and updated only once a publish lands
pub trait Deduplicator: Send + Sync {
    fn contains(&self, url: &str) -> bool;

    /// Records `url`; `true` if it was not already known
    fn mark_seen(&self, url: &str) -> Result<bool, DedupError>;

    /// Number of distinct URLs seen
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
pub struct MemoryDeduplicator {
    seen: DashSet<String>,
}

impl MemoryDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Deduplicator for MemoryDeduplicator {
    fn contains(&self, url: &str) -> bool {
        self.seen.contains(url)
    }

    fn mark_seen(&self, url: &str) -> Result<bool, DedupError> {
        Ok(self.seen.insert(url.to_string()))
    }

    fn len(&self) -> usize {
        self.seen.len()
    }
}

/// Seen-set persisted as one URL per line
#[derive(Debug)]
pub struct FileDeduplicator {
    path: PathBuf,
    seen: MemoryDeduplicator,
    file: Mutex<File>,
}

impl FileDeduplicator {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DedupError> {
        let path = path.as_ref().to_path_buf();
        let io_err = |source| DedupError::Io {
            path: path.clone(),
            source,
        };

        let seen = MemoryDeduplicator::new();
        match File::open(&path) {
            Ok(existing) => {
                for line in BufReader::new(existing).lines() {
                    let line = line.map_err(io_err)?;
                    let url = line.trim();
                    if !url.is_empty() {
                        seen.seen.insert(url.to_string());
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(e)),
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;

        info!(path = %path.display(), known = seen.len(), "Opened dedup store");

        Ok(Self {
            path,
            seen,
            file: Mutex::new(file),
        })
    }
}

impl Deduplicator for FileDeduplicator {
    fn contains(&self, url: &str) -> bool {
        self.seen.contains(url)
    }

    fn mark_seen(&self, url: &str) -> Result<bool, DedupError> {
        if !self.seen.mark_seen(url)? {
            return Ok(false);
        }
        let mut file = self.file.lock().map_err(|_| DedupError::Poisoned)?;
        writeln!(file, "{}", url)
            .and_then(|_| file.flush())
            .map_err(|source| DedupError::Io {
                path: self.path.clone(),
                source,
            })?;
        Ok(true)
    }

    fn len(&self) -> usize {
        self.seen.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_dedup() {
        let dedup = MemoryDeduplicator::new();
        assert!(!dedup.contains("http://example.com/a.png"));
        assert!(dedup.mark_seen("http://example.com/a.png").unwrap());
        assert!(dedup.contains("http://example.com/a.png"));
        assert!(!dedup.mark_seen("http://example.com/a.png").unwrap());
        assert!(dedup.mark_seen("http://example.com/b.png").unwrap());
        assert_eq!(dedup.len(), 2);
    }

    #[test]
    fn test_file_dedup_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state/seen.txt");

        {
            let dedup = FileDeduplicator::open(&path).unwrap();
            assert!(dedup.is_empty());
            assert!(!dedup.contains("http://example.com/b.png"));
            assert!(dedup.mark_seen("http://example.com/a.png").unwrap());
            assert!(!dedup.mark_seen("http://example.com/a.png").unwrap());
        }

        let reopened = FileDeduplicator::open(&path).unwrap();
        assert_eq!(reopened.len(), 1);
        assert!(reopened.contains("http://example.com/a.png"));
        assert!(!reopened.contains("http://example.com/b.png"));
        assert!(reopened.mark_seen("http://example.com/c.png").unwrap());

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
