//! Upload side of one connection.
//!
//! Requests are queued here and read from storage a couple at a time, so a
//! peer that asks for a lot does not pin megabytes of our memory in its
//! send queue. The writer task paces the bytes through the upload limiter.
use std::collections::VecDeque;

use crate::{
    counter::Measure,
    error::Error,
    storage::StorageWrapper,
    tcp_wire::{Block, BlockInfo},
};

/// PIECEs handed to the writer and not yet on the wire.
const MAX_IN_FLIGHT: usize = 2;

/// Requests accepted from one peer and not read yet.
const MAX_PENDING: usize = 256;

/// What to do with a REQUEST.
#[derive(Debug, PartialEq, Eq)]
pub enum RequestVerdict {
    Queued,
    /// Choked, not interested or a duplicate; dropped without a word.
    Ignored,
    /// Longer than `max_slice_length`, the connection must be closed.
    TooLong,
}

#[derive(Debug)]
pub struct Uploader {
    pending: VecDeque<BlockInfo>,
    in_flight: usize,
    measure: Measure,
    max_slice_length: u32,
}

impl Uploader {
    pub fn new(max_rate_period: f64, max_slice_length: u32) -> Self {
        Self {
            pending: VecDeque::new(),
            in_flight: 0,
            measure: Measure::new(max_rate_period),
            max_slice_length,
        }
    }

    pub fn rate(&mut self) -> f64 {
        self.measure.rate()
    }

    pub fn rate_noupdate(&self) -> f64 {
        self.measure.rate_noupdate()
    }

    pub fn total(&self) -> u64 {
        self.measure.total()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn got_request(
        &mut self,
        info: BlockInfo,
        am_choking: bool,
        peer_interested: bool,
    ) -> RequestVerdict {
        if info.len > self.max_slice_length {
            return RequestVerdict::TooLong;
        }
        if am_choking || !peer_interested {
            return RequestVerdict::Ignored;
        }
        if self.pending.len() >= MAX_PENDING || self.pending.contains(&info) {
            return RequestVerdict::Ignored;
        }
        self.pending.push_back(info);
        RequestVerdict::Queued
    }

    /// Remove a queued request. Returns false when it already went to the
    /// writer, which then has to drop it if it has not started yet.
    pub fn got_cancel(&mut self, info: &BlockInfo) -> bool {
        let before = self.pending.len();
        self.pending.retain(|b| b != info);
        before != self.pending.len()
    }

    /// Everything queued is dropped on choke. PIECEs already handed to the
    /// writer are dropped there and come back through
    /// [`Uploader::dropped`].
    pub fn choked(&mut self) {
        self.pending.clear();
    }

    /// Read the next blocks to send, keeping at most `MAX_IN_FLIGHT` in the
    /// writer's queue.
    pub fn flush(&mut self, storage: &mut StorageWrapper) -> Result<Vec<Block>, Error> {
        let mut out = Vec::new();
        while self.in_flight < MAX_IN_FLIGHT {
            let Some(info) = self.pending.pop_front() else { break };
            let block = storage.get_piece(info.index as usize, info.begin, info.len)?;
            self.in_flight += 1;
            out.push(Block { index: info.index, begin: info.begin, block });
        }
        Ok(out)
    }

    /// The writer put a PIECE on the wire.
    pub fn sent(&mut self, info: &BlockInfo) {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.measure.update(info.len as u64);
    }

    /// The writer threw PIECEs away before sending them.
    pub fn dropped(&mut self, n: usize) {
        self.in_flight = self.in_flight.saturating_sub(n);
    }
}
