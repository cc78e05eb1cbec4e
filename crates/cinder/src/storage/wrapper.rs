//! Piece bookkeeping on top of [`FileSet`]: which blocks are still to be
//! requested, which are in flight, buffering of partial pieces and hash
//! verification.
//!
//! Blocks of a partial piece stay in memory until the piece is complete and
//! its hash matches, only then they are written. When the buffered bytes go
//! past `write_buffer_size`, the largest partial piece is spilled to disk
//! early; its bytes are unverified but the piece is not marked as had until
//! the full hash matches.
use std::path::PathBuf;

use bytes::Bytes;
use hashbrown::{HashMap, HashSet};
use tracing::{debug, info, warn};

use super::{
    files::FileSet,
    resume::{FileStat, ResumeRecord, ScratchStat},
};
use crate::{
    bitfield::Bitfield,
    config::{AllocType, Config},
    error::Error,
    metainfo::Info,
    peer::ConnectionId,
    tcp_wire::{Block, BlockInfo},
};

/// What happened to a block handed to [`StorageWrapper::piece_came_in`].
#[derive(Debug, PartialEq, Eq)]
pub enum PieceOutcome {
    /// Stored, the piece is still missing blocks.
    Partial,
    /// Already had it, nothing was stored.
    Duplicate,
    /// Last block of the piece, the hash matched and the piece is on disk.
    Verified,
    /// Last block of the piece, the hash did not match. Every block of the
    /// piece is requestable again, `flunked` credits each contributor.
    Failed { flunked: Vec<(ConnectionId, u64)> },
}

#[derive(Debug, Default)]
struct Partial {
    /// key: begin. `None` once spilled to disk.
    blocks: std::collections::BTreeMap<u32, Option<Bytes>>,
    received: u64,
    in_memory: usize,
    contributors: HashMap<ConnectionId, u64>,
}

#[derive(Debug)]
pub struct StorageWrapper {
    info: Info,
    files: FileSet,
    have: Bitfield,
    /// Blocks nobody asked for yet, `None` until the piece is first touched.
    inactive: Vec<Option<Vec<BlockInfo>>>,
    /// Blocks requested and not yet received.
    active: Vec<HashSet<BlockInfo>>,
    partials: HashMap<usize, Partial>,
    buffered: usize,
    write_buffer_size: usize,
    amount_left: u64,
    resume_path: Option<PathBuf>,
}

impl StorageWrapper {
    pub fn new(info: &Info, config: &Config) -> Self {
        let hex = info.info_hash.to_string();
        let scratch_dir = config.download_dir.join(".cinder").join(&hex);
        let files = FileSet::new(
            &config.download_dir,
            info.file_list(),
            scratch_dir,
            config.max_files_open,
            config.lock_files,
            config.alloc_type,
        );
        let pieces = info.pieces();

        Self {
            info: info.clone(),
            files,
            have: Bitfield::new(pieces),
            inactive: vec![None; pieces],
            active: vec![HashSet::new(); pieces],
            partials: HashMap::new(),
            buffered: 0,
            write_buffer_size: config.write_buffer_size,
            amount_left: info.get_torrent_size(),
            resume_path: config.resume_dir.as_ref().map(|d| d.join(format!("{hex}.resume"))),
        }
    }

    pub fn info(&self) -> &Info {
        &self.info
    }

    pub fn files(&self) -> &FileSet {
        &self.files
    }

    pub fn have(&self) -> &Bitfield {
        &self.have
    }

    pub fn is_have(&self, index: usize) -> bool {
        self.have.get(index)
    }

    /// Bytes of unverified pieces.
    pub fn left(&self) -> u64 {
        self.amount_left
    }

    pub fn is_complete(&self) -> bool {
        self.have.complete()
    }

    fn init_inactive(&mut self, index: usize) {
        if self.inactive[index].is_none() {
            let blocks = self.info.block_infos_of_piece(index);
            self.inactive[index] = Some(blocks);
        }
    }

    /// There are unrequested blocks in this piece.
    pub fn do_i_have_requests(&self, index: usize) -> bool {
        if index >= self.have.len() || self.have.get(index) {
            return false;
        }
        // untouched pieces have every block left
        self.inactive[index].as_ref().map_or(true, |b| !b.is_empty())
    }

    /// Some block of this piece was already requested or received.
    pub fn is_started(&self, index: usize) -> bool {
        !self.active[index].is_empty() || self.partials.contains_key(&index)
    }

    /// Hand out the next unrequested block of the piece.
    pub fn new_request(&mut self, index: usize) -> Option<BlockInfo> {
        if !self.do_i_have_requests(index) {
            return None;
        }
        self.init_inactive(index);
        let blocks = self.inactive[index].as_mut()?;
        let block = blocks.remove(0);
        self.active[index].insert(block);
        Some(block)
    }

    /// Blocks in flight for a piece, for endgame.
    pub fn active_requests(&self, index: usize) -> Vec<BlockInfo> {
        let mut v: Vec<_> = self.active.get(index).map(|a| a.iter().copied().collect()).unwrap_or_default();
        v.sort();
        v
    }

    /// A request was cancelled or its peer went away, make the block
    /// requestable again.
    pub fn request_lost(&mut self, block: &BlockInfo) {
        let index = block.index as usize;
        if index >= self.active.len() || !self.active[index].remove(block) {
            return;
        }
        if let Some(inactive) = self.inactive[index].as_mut() {
            let at = inactive.partition_point(|b| b.begin < block.begin);
            inactive.insert(at, *block);
        }
    }

    pub fn piece_came_in(&mut self, from: ConnectionId, block: Block) -> Result<PieceOutcome, Error> {
        let index = block.index as usize;
        let info = block.info();
        if index >= self.have.len() {
            return Err(Error::ProtocolViolation("piece index out of range"));
        }
        if self.have.get(index) {
            return Ok(PieceOutcome::Duplicate);
        }
        if !self.info.block_infos_of_piece(index).contains(&info) {
            return Err(Error::ProtocolViolation("block does not match a request"));
        }
        if self.partials.get(&index).is_some_and(|p| p.blocks.contains_key(&block.begin)) {
            self.active[index].remove(&info);
            return Ok(PieceOutcome::Duplicate);
        }

        self.init_inactive(index);
        self.active[index].remove(&info);
        if let Some(inactive) = self.inactive[index].as_mut() {
            inactive.retain(|b| *b != info);
        }

        let len = block.block.len();
        let partial = self.partials.entry(index).or_default();
        partial.blocks.insert(block.begin, Some(block.block));
        partial.received += len as u64;
        partial.in_memory += len;
        *partial.contributors.entry(from).or_default() += len as u64;
        self.buffered += len;

        if partial.received < self.info.piece_size(index) as u64 {
            if self.buffered > self.write_buffer_size {
                self.spill()?;
            }
            return Ok(PieceOutcome::Partial);
        }

        self.finish_piece(index)
    }

    /// Write the largest in-memory partial piece to disk.
    fn spill(&mut self) -> Result<(), Error> {
        let Some(index) =
            self.partials.iter().max_by_key(|(_, p)| p.in_memory).map(|(i, _)| *i)
        else {
            return Ok(());
        };
        let offset = index as u64 * self.info.piece_length as u64;
        let Some(partial) = self.partials.get_mut(&index) else { return Ok(()) };

        for (begin, data) in partial.blocks.iter_mut() {
            if let Some(bytes) = data.take() {
                self.files.write(offset + *begin as u64, &bytes)?;
            }
        }
        debug!("spilled {} buffered bytes of piece {index}", partial.in_memory);
        self.buffered -= partial.in_memory;
        partial.in_memory = 0;
        Ok(())
    }

    fn finish_piece(&mut self, index: usize) -> Result<PieceOutcome, Error> {
        let Some(partial) = self.partials.remove(&index) else {
            return Ok(PieceOutcome::Partial);
        };
        self.buffered -= partial.in_memory;

        let offset = index as u64 * self.info.piece_length as u64;
        let mut hasher = sha1_smol::Sha1::new();
        for (begin, data) in &partial.blocks {
            match data {
                Some(bytes) => hasher.update(bytes),
                None => {
                    let len = self.block_len(index, *begin);
                    hasher.update(&self.files.read(offset + *begin as u64, len)?);
                }
            }
        }
        let digest = hasher.digest().bytes();

        if self.info.piece_hash(index) != Some(digest.as_slice()) {
            warn!("piece {index} failed its hash check");
            // everything not currently in flight is requestable again
            let active = &self.active[index];
            let blocks =
                self.info.block_infos_of_piece(index).into_iter().filter(|b| !active.contains(b)).collect();
            self.inactive[index] = Some(blocks);
            let flunked = partial.contributors.into_iter().collect();
            return Ok(PieceOutcome::Failed { flunked });
        }

        for (begin, data) in &partial.blocks {
            if let Some(bytes) = data {
                self.files.write(offset + *begin as u64, bytes)?;
            }
        }
        self.mark_have(index);
        debug!("piece {index} verified");
        Ok(PieceOutcome::Verified)
    }

    fn block_len(&self, index: usize, begin: u32) -> u64 {
        self.info
            .block_infos_of_piece(index)
            .iter()
            .find(|b| b.begin == begin)
            .map(|b| b.len as u64)
            .unwrap_or(0)
    }

    fn mark_have(&mut self, index: usize) {
        if !self.have.set(index, true) {
            self.amount_left -= self.info.piece_size(index) as u64;
        }
        self.inactive[index] = Some(Vec::new());
        self.active[index].clear();
    }

    /// Read a block of a piece we have, to upload it.
    pub fn get_piece(&mut self, index: usize, begin: u32, len: u32) -> Result<Bytes, Error> {
        if !self.have.get(index) {
            return Err(Error::ProtocolViolation("requested a piece we do not have"));
        }
        if begin as u64 + len as u64 > self.info.piece_size(index) as u64 {
            return Err(Error::ProtocolViolation("request past the end of the piece"));
        }
        let offset = index as u64 * self.info.piece_length as u64 + begin as u64;
        Ok(Bytes::from(self.files.read(offset, len as u64)?))
    }

    /// Hash a piece from disk and mark it had on a match. Missing files
    /// simply fail the check.
    pub fn check_piece(&mut self, index: usize) -> Result<bool, Error> {
        let offset = index as u64 * self.info.piece_length as u64;
        let data = match self.files.read(offset, self.info.piece_size(index) as u64) {
            Ok(data) => data,
            Err(Error::FileOpenError(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        let digest = sha1_smol::Sha1::from(&data).digest().bytes();
        let ok = self.info.piece_hash(index) == Some(digest.as_slice());
        if ok {
            self.mark_have(index);
        }
        Ok(ok)
    }

    /// Disable or enable a file, the picker is told separately.
    pub fn set_file_disabled(&mut self, file: usize, disabled: bool) -> Result<(), Error> {
        self.files.set_disabled(file, disabled)
    }

    /// Pieces overlapping a file.
    pub fn pieces_of_file(&self, file: usize) -> std::ops::Range<usize> {
        let Some(f) = self.files.files().get(file) else { return 0..0 };
        if f.length == 0 {
            return 0..0;
        }
        let pl = self.info.piece_length as u64;
        (f.start / pl) as usize..(f.end().div_ceil(pl)) as usize
    }

    /// Files overlapping a piece.
    pub fn files_of_piece(&self, index: usize) -> Vec<usize> {
        let pl = self.info.piece_length as u64;
        self.files.files_in_range(index as u64 * pl, self.info.piece_size(index) as u64).collect()
    }

    /// Prepare files according to the allocation mode. Background
    /// allocation continues through [`StorageWrapper::allocate`].
    pub fn start_allocation(&mut self) -> Result<(), Error> {
        if self.files.alloc_type() == AllocType::PreAllocate {
            self.files.preallocate()?;
        }
        Ok(())
    }

    /// One slice of background allocation, true when done.
    pub fn allocate(&mut self, budget: u64) -> Result<bool, Error> {
        if self.files.alloc_type() != AllocType::Background {
            return Ok(true);
        }
        self.files.allocate_step(budget)
    }

    pub fn alloc_progress(&self) -> f64 {
        match self.files.alloc_type() {
            AllocType::Background | AllocType::PreAllocate => self.files.alloc_progress(),
            _ => 1.0,
        }
    }

    /// Compare the record with the files on disk. Pieces the record had
    /// and whose files are unchanged are trusted; pieces touching a changed
    /// file are returned for hashing. Without a usable record every piece
    /// is returned.
    pub fn unpickle(&mut self, record: Option<ResumeRecord>) -> Vec<usize> {
        let pieces = self.have.len();
        let Some(record) = record.filter(|r| r.have.len() == pieces) else {
            return (0..pieces).collect();
        };

        let files = self.files.files();
        let mut unchanged = vec![false; files.len()];
        for stat in &record.files {
            if let Some(f) = files.get(stat.index) {
                unchanged[stat.index] =
                    !f.disabled && self.files.stat(stat.index) == Some((stat.size, stat.mtime));
            }
        }
        for stat in &record.partial_files {
            let Ok(idx) = stat.name.parse::<usize>() else { continue };
            if files.get(idx).is_some_and(|f| f.disabled) {
                unchanged[idx] = self.files.stat(idx) == Some((stat.size, stat.mtime));
            }
        }

        let mut to_check = Vec::new();
        for index in 0..pieces {
            let touching = self.files_of_piece(index);
            let intact = touching.iter().all(|f| unchanged[*f]);
            if intact && record.have.get(index) {
                self.mark_have(index);
            } else if !intact {
                to_check.push(index);
            }
        }
        info!("resume: trusted {} pieces, {} to check", self.have.num_true(), to_check.len());
        to_check
    }

    pub fn resume_record(&self) -> ResumeRecord {
        let mut files = Vec::new();
        let mut partial_files = Vec::new();
        for (index, f) in self.files.files().iter().enumerate() {
            let Some((size, mtime)) = self.files.stat(index) else { continue };
            if f.disabled {
                partial_files.push(ScratchStat { name: index.to_string(), size, mtime });
            } else {
                files.push(FileStat { index, size, mtime });
            }
        }
        ResumeRecord { files, partial_files, have: self.have.clone() }
    }

    pub fn resume_path(&self) -> Option<&PathBuf> {
        self.resume_path.as_ref()
    }

    pub fn flush(&mut self) -> Result<(), Error> {
        self.files.flush()
    }

    /// Flush, release locks, and write the resume record.
    pub fn close(&mut self) -> Result<(), Error> {
        self.files.close()?;
        if let Some(path) = &self.resume_path {
            self.resume_record().write(path)?;
        }
        Ok(())
    }
}
