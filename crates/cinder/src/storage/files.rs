//! The logical payload `[0, total)` laid over a list of files.
use std::{
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};

use tracing::{debug, info};

use super::cache::HandleCache;
use crate::{config::AllocType, error::Error};

/// Bytes zero-filled per allocation write.
const ALLOC_CHUNK: u64 = 256 * 1024;

#[derive(Debug, Clone)]
pub struct FileEntry {
    pub path: PathBuf,
    pub length: u64,
    /// Offset of the first byte in the payload.
    pub start: u64,
    /// Where the bytes actually go, the scratch file while disabled.
    target: PathBuf,
    pub disabled: bool,
}

impl FileEntry {
    pub fn end(&self) -> u64 {
        self.start + self.length
    }

    pub fn target(&self) -> &Path {
        &self.target
    }
}

/// Part of a read or write that falls in one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub file: usize,
    pub offset: u64,
    pub len: u64,
}

#[derive(Debug)]
pub struct FileSet {
    files: Vec<FileEntry>,
    total: u64,
    scratch_dir: PathBuf,
    handles: HandleCache,
    alloc: AllocType,
    /// File and offset the background allocator continues from.
    alloc_cursor: (usize, u64),
}

impl FileSet {
    /// `files` are relative to `root`. Scratch files for disabled files
    /// live in `scratch_dir`.
    pub fn new(
        root: &Path,
        files: Vec<(PathBuf, u64)>,
        scratch_dir: PathBuf,
        max_files_open: usize,
        lock_files: bool,
        alloc: AllocType,
    ) -> Self {
        let mut start = 0;
        let files = files
            .into_iter()
            .map(|(path, length)| {
                let path = root.join(path);
                let entry = FileEntry { target: path.clone(), path, length, start, disabled: false };
                start += length;
                entry
            })
            .collect();

        Self {
            files,
            total: start,
            scratch_dir,
            handles: HandleCache::new(max_files_open, lock_files),
            alloc,
            alloc_cursor: (0, 0),
        }
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Resolve `(pos, len)` into per-file segments. Empty files never
    /// appear.
    pub fn segments(&self, pos: u64, len: u64) -> Vec<Segment> {
        let end = (pos + len).min(self.total);
        let mut out = Vec::new();
        if pos >= end {
            return out;
        }

        // first file whose end is past pos
        let mut i = self.files.partition_point(|f| f.end() <= pos);
        let mut pos = pos;
        while pos < end && i < self.files.len() {
            let f = &self.files[i];
            if f.length > 0 {
                let take = end.min(f.end()) - pos;
                out.push(Segment { file: i, offset: pos - f.start, len: take });
                pos += take;
            }
            i += 1;
        }
        out
    }

    /// Indices of files overlapping `[pos, pos + len)`.
    pub fn files_in_range(&self, pos: u64, len: u64) -> impl Iterator<Item = usize> + '_ {
        self.segments(pos, len).into_iter().map(|s| s.file)
    }

    pub fn read(&mut self, pos: u64, len: u64) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::with_capacity(len as usize);
        for seg in self.segments(pos, len) {
            let entry = &self.files[seg.file];
            let target = entry.target.clone();
            let length = entry.length;

            let file = self.handles.get(seg.file, &target, false)?;
            let on_disk = file.metadata()?.len();
            // a sparse file may still be short, the missing tail reads as zeros
            let have = on_disk.min(length).saturating_sub(seg.offset).min(seg.len);
            let at = buf.len();
            buf.resize(at + seg.len as usize, 0);
            if have > 0 {
                file.seek(SeekFrom::Start(seg.offset))?;
                file.read_exact(&mut buf[at..at + have as usize])?;
            }
        }
        Ok(buf)
    }

    pub fn write(&mut self, pos: u64, data: &[u8]) -> Result<(), Error> {
        let mut written = 0usize;
        for seg in self.segments(pos, data.len() as u64) {
            let target = self.files[seg.file].target.clone();
            let length = self.files[seg.file].length;
            let alloc = self.alloc;

            let file = self.handles.get(seg.file, &target, true)?;
            if alloc == AllocType::Normal && file.metadata()?.len() < length {
                file.set_len(length)?;
            }
            file.seek(SeekFrom::Start(seg.offset))?;
            file.write_all(&data[written..written + seg.len as usize])?;
            written += seg.len as usize;
        }
        Ok(())
    }

    /// Disable or enable a file. Disabled files are redirected to a scratch
    /// file at the same offsets, so boundary pieces can still be assembled.
    /// The data already on disk moves along with the redirection both ways,
    /// pieces we have stay readable while their file is disabled.
    pub fn set_disabled(&mut self, idx: usize, disabled: bool) -> Result<(), Error> {
        let Some(entry) = self.files.get(idx) else {
            return Err(Error::FileOpenError(format!("no file with index {idx}")));
        };
        if entry.disabled == disabled {
            return Ok(());
        }
        let scratch = self.scratch_dir.join(idx.to_string());
        self.handles.close(idx);

        let entry = &mut self.files[idx];
        if disabled {
            debug!("redirecting {:?} to {scratch:?}", entry.path);
            if entry.path.exists() {
                std::fs::create_dir_all(&self.scratch_dir)?;
                std::fs::rename(&entry.path, &scratch)?;
            }
            entry.target = scratch;
        } else {
            if scratch.exists() && !entry.path.exists() {
                if let Some(parent) = entry.path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::rename(&scratch, &entry.path)?;
            }
            entry.target = entry.path.clone();
        }
        entry.disabled = disabled;
        Ok(())
    }

    /// `(size, mtime)` of the file as it is on disk, `None` when missing.
    pub fn stat(&self, idx: usize) -> Option<(u64, i64)> {
        let meta = std::fs::metadata(&self.files.get(idx)?.target).ok()?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Some((meta.len(), mtime))
    }

    /// Zero-fill every enabled file up to its length, for pre-allocation.
    pub fn preallocate(&mut self) -> Result<(), Error> {
        while !self.allocate_step(u64::MAX)? {}
        info!("pre-allocated {} bytes", self.total);
        Ok(())
    }

    /// Extend files with zeros, at most `budget` bytes in this call.
    /// Returns true once every file is allocated. Existing bytes are never
    /// overwritten.
    pub fn allocate_step(&mut self, budget: u64) -> Result<bool, Error> {
        let mut budget = budget;
        while budget > 0 {
            let (idx, _) = self.alloc_cursor;
            let Some(entry) = self.files.get(idx) else { return Ok(true) };
            if entry.disabled || entry.length == 0 {
                self.alloc_cursor = (idx + 1, 0);
                continue;
            }
            let target = entry.target.clone();
            let length = entry.length;

            let file = self.handles.get(idx, &target, true)?;
            let current = file.metadata()?.len();
            if current >= length {
                self.alloc_cursor = (idx + 1, 0);
                continue;
            }
            let n = (length - current).min(ALLOC_CHUNK).min(budget);
            file.seek(SeekFrom::Start(current))?;
            file.write_all(&vec![0u8; n as usize])?;
            budget -= n;
            self.alloc_cursor = (idx, current + n);
        }
        Ok(self.alloc_cursor.0 >= self.files.len())
    }

    /// Progress of the allocation, 0.0 to 1.0.
    pub fn alloc_progress(&self) -> f64 {
        let (idx, offset) = self.alloc_cursor;
        if self.total == 0 || idx >= self.files.len() {
            return 1.0;
        }
        let done: u64 = self.files[..idx].iter().map(|f| f.length).sum::<u64>() + offset;
        (done as f64 / self.total as f64).min(1.0)
    }

    pub fn alloc_type(&self) -> AllocType {
        self.alloc
    }

    pub fn flush(&mut self) -> Result<(), Error> {
        self.handles.flush()
    }

    /// Sync and release every handle and lock.
    pub fn close(&mut self) -> Result<(), Error> {
        self.handles.close_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(dir: &Path, sizes: &[u64]) -> FileSet {
        let files = sizes.iter().enumerate().map(|(i, s)| (PathBuf::from(format!("f{i}")), *s)).collect();
        FileSet::new(dir, files, dir.join(".scratch"), 2, false, AllocType::Sparse)
    }

    #[test]
    fn segments_span_files() {
        let dir = tempfile::tempdir().unwrap();
        let fs = set(dir.path(), &[10, 0, 5, 20]);
        assert_eq!(
            fs.segments(8, 10),
            vec![
                Segment { file: 0, offset: 8, len: 2 },
                Segment { file: 2, offset: 0, len: 5 },
                Segment { file: 3, offset: 0, len: 3 },
            ]
        );
        assert_eq!(fs.segments(34, 100), vec![Segment { file: 3, offset: 19, len: 1 }]);
        assert!(fs.segments(35, 1).is_empty());
    }

    #[test]
    fn write_read_across_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = set(dir.path(), &[3, 4, 5]);
        let data: Vec<u8> = (0..12).collect();
        fs.write(0, &data).unwrap();
        assert_eq!(fs.read(2, 6).unwrap(), vec![2, 3, 4, 5, 6, 7]);
        assert_eq!(std::fs::read(dir.path().join("f1")).unwrap(), vec![3, 4, 5, 6]);
    }

    #[test]
    fn sparse_tail_reads_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = set(dir.path(), &[10]);
        fs.write(2, &[9, 9]).unwrap();
        assert_eq!(fs.read(0, 10).unwrap(), vec![0, 0, 9, 9, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn disabled_file_goes_to_scratch_and_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = set(dir.path(), &[4, 4]);
        fs.set_disabled(1, true).unwrap();
        fs.write(2, &[1, 2, 3, 4]).unwrap();

        assert!(!dir.path().join("f1").exists());
        assert_eq!(std::fs::read(dir.path().join(".scratch/1")).unwrap(), vec![3, 4]);
        assert_eq!(fs.read(2, 4).unwrap(), vec![1, 2, 3, 4]);

        fs.set_disabled(1, false).unwrap();
        assert_eq!(std::fs::read(dir.path().join("f1")).unwrap(), vec![3, 4]);
        assert_eq!(fs.read(4, 2).unwrap(), vec![3, 4]);
    }

    #[test]
    fn disabling_keeps_written_data_readable() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = set(dir.path(), &[4, 4]);
        fs.write(0, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();

        fs.set_disabled(0, true).unwrap();
        assert!(!dir.path().join("f0").exists());
        assert_eq!(fs.read(2, 4).unwrap(), vec![3, 4, 5, 6]);

        fs.set_disabled(0, false).unwrap();
        assert_eq!(std::fs::read(dir.path().join("f0")).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn background_allocation_progress() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = set(dir.path(), &[100, 50]);
        fs.write(0, &[7; 10]).unwrap();

        assert!(!fs.allocate_step(60).unwrap());
        assert!(fs.alloc_progress() < 1.0);
        while !fs.allocate_step(60).unwrap() {}
        assert_eq!(fs.alloc_progress(), 1.0);

        let f0 = std::fs::read(dir.path().join("f0")).unwrap();
        assert_eq!(f0.len(), 100);
        assert_eq!(&f0[..10], &[7; 10]);
        assert_eq!(std::fs::read(dir.path().join("f1")).unwrap().len(), 50);
    }
}
