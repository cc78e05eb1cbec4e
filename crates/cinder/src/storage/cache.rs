//! Bounded cache of open file handles, least recently used goes first.
use std::{
    fs::{File, OpenOptions},
    num::NonZeroUsize,
    path::Path,
};

use lru::LruCache;
use tracing::{debug, trace};

use crate::error::Error;

#[derive(Debug)]
struct Handle {
    file: File,
    writable: bool,
}

#[derive(Debug)]
pub struct HandleCache {
    lock_files: bool,
    /// key: index in the file set
    handles: LruCache<usize, Handle>,
}

impl HandleCache {
    pub fn new(capacity: usize, lock_files: bool) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self { lock_files, handles: LruCache::new(capacity) }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Handle for `idx`. Writers open `rb+` (creating the file), readers
    /// `rb`. A read-only handle is reopened when write access is needed.
    pub fn get(&mut self, idx: usize, path: &Path, write: bool) -> Result<&mut File, Error> {
        let reopen = match self.handles.get_mut(&idx) {
            Some(h) => write && !h.writable,
            None => true,
        };

        if reopen {
            self.handles.pop(&idx);
            let file = self.open(path, write)?;
            // dropping the evicted handle releases its lock
            if let Some((evicted, _)) = self.handles.push(idx, Handle { file, writable: write }) {
                debug!("closing handle of file {evicted}");
            }
        }

        self.handles
            .get_mut(&idx)
            .map(|h| &mut h.file)
            .ok_or_else(|| Error::FileOpenError(path.display().to_string()))
    }

    fn open(&self, path: &Path, write: bool) -> Result<File, Error> {
        let open_err = |e: std::io::Error| Error::FileOpenError(format!("{}: {e}", path.display()));

        let file = if write {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(open_err)?;
            }
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)
                .map_err(open_err)?
        } else {
            File::open(path).map_err(open_err)?
        };

        if self.lock_files && write {
            file.try_lock().map_err(|_| Error::FileLocked(path.display().to_string()))?;
        }
        trace!("opened {path:?} write: {write}");
        Ok(file)
    }

    /// Close one file, for example before renaming it.
    pub fn close(&mut self, idx: usize) {
        self.handles.pop(&idx);
    }

    /// Sync every writable handle and close them all.
    pub fn close_all(&mut self) -> Result<(), Error> {
        while let Some((_, h)) = self.handles.pop_lru() {
            if h.writable {
                h.file.sync_all()?;
            }
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), Error> {
        for (_, h) in self.handles.iter().filter(|(_, h)| h.writable) {
            h.file.sync_data()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = HandleCache::new(2, false);

        cache.get(0, &dir.path().join("a"), true).unwrap();
        cache.get(1, &dir.path().join("b"), true).unwrap();
        // touch 0 so 1 is the oldest
        cache.get(0, &dir.path().join("a"), true).unwrap();
        cache.get(2, &dir.path().join("c"), true).unwrap();

        assert_eq!(cache.len(), 2);
        assert!(cache.handles.contains(&0));
        assert!(!cache.handles.contains(&1));
    }

    #[test]
    fn read_only_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = HandleCache::new(4, false);
        let r = cache.get(0, &dir.path().join("nope"), false);
        // the OS reason is kept
        assert!(matches!(r, Err(Error::FileOpenError(msg)) if msg.contains("nope: ")));
    }

    #[test]
    fn upgrade_to_writable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub/a");
        let mut cache = HandleCache::new(4, true);
        cache.get(0, &path, true).unwrap();
        cache.close_all().unwrap();

        cache.get(0, &path, false).unwrap();
        assert!(!cache.handles.peek(&0).unwrap().writable);
        cache.get(0, &path, true).unwrap();
        assert!(cache.handles.peek(&0).unwrap().writable);
    }
}
