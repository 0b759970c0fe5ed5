//! File Cache
//!
//! Prompt files and other workspace inputs are often read by several steps
//! in one run. The cache keys contents by path and modification time, so a
//! file edited mid-run is re-read automatically. The engine clears it at
//! the end of every run.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use log::debug;
use parking_lot::RwLock;

#[derive(Debug)]
struct CachedFile {
    modified: SystemTime,
    contents: Arc<str>,
}

/// Path + mtime keyed text cache, safe to share between tasks.
#[derive(Debug, Default)]
pub struct FileCache {
    entries: RwLock<HashMap<PathBuf, CachedFile>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl FileCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads `path` as UTF-8, serving it from the cache when the file has
    /// not been modified since it was cached.
    pub fn read_to_string(&self, path: impl AsRef<Path>) -> io::Result<Arc<str>> {
        let path = path.as_ref();
        let modified = fs::metadata(path)?.modified()?;

        if let Some(cached) = self.entries.read().get(path) {
            if cached.modified == modified {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Arc::clone(&cached.contents));
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let contents: Arc<str> = fs::read_to_string(path)?.into();
        debug!("Cached {} ({} bytes)", path.display(), contents.len());
        self.entries.write().insert(
            path.to_path_buf(),
            CachedFile {
                modified,
                contents: Arc::clone(&contents),
            },
        );
        Ok(contents)
    }

    pub fn clear(&self) {
        let mut entries = self.entries.write();
        if !entries.is_empty() {
            debug!("Clearing file cache ({} entries)", entries.len());
        }
        entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// (hits, misses) since creation.
    pub fn stats(&self) -> (u64, u64) {
        (self.hits.load(Ordering::Relaxed), self.misses.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_second_read_is_a_hit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("prompt.txt");
        fs::write(&path, "Summarize the report").unwrap();

        let cache = FileCache::new();
        assert_eq!(&*cache.read_to_string(&path).unwrap(), "Summarize the report");
        assert_eq!(&*cache.read_to_string(&path).unwrap(), "Summarize the report");
        assert_eq!(cache.stats(), (1, 1));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_modified_file_is_reread() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("prompt.txt");
        fs::write(&path, "v1").unwrap();

        let cache = FileCache::new();
        cache.read_to_string(&path).unwrap();

        let file = fs::OpenOptions::new().write(true).truncate(true).open(&path).unwrap();
        std::io::Write::write_all(&mut &file, b"v2").unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(5)).unwrap();
        drop(file);

        assert_eq!(&*cache.read_to_string(&path).unwrap(), "v2");
        assert_eq!(cache.stats(), (0, 2));
    }

    #[test]
    fn test_clear() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, "a").unwrap();

        let cache = FileCache::new();
        cache.read_to_string(&path).unwrap();
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_missing_file_is_error() {
        let cache = FileCache::new();
        assert!(cache.read_to_string("/nonexistent/prompt.txt").is_err());
        assert!(cache.is_empty());
    }
}
