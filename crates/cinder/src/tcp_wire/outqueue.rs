//! The send side of a connection.
//!
//! Messages leave in the order they were queued. A PIECE is written in
//! slices so the upload limiter can interleave connections at slice
//! boundaries; whatever is queued while a PIECE is partway out waits
//! behind it. Choking drops every PIECE that has not started yet. A choke
//! issued mid-PIECE is held until the partial completes, and an unchoke
//! arriving before then cancels it.
use std::collections::VecDeque;

use bytes::{Buf, Bytes};

use super::{BlockInfo, Message};

/// Upload limiter granularity.
pub const SLICE_LEN: usize = 4096;

/// A run of bytes ready for the socket.
#[derive(Debug, PartialEq, Eq)]
pub struct Chunk {
    pub bytes: Bytes,
    /// How many of `bytes` belong to a PIECE frame, counted by the upload
    /// limiter.
    pub payload: usize,
    /// Set on the chunk that finishes a PIECE.
    pub completed: Option<BlockInfo>,
}

#[derive(Debug)]
struct Partial {
    info: BlockInfo,
    frame: Bytes,
}

#[derive(Debug, Default)]
pub struct OutQueue {
    queue: VecDeque<Message>,
    partial: Option<Partial>,
    /// A CHOKE was queued while `partial` was going out, an UNCHOKE
    /// before the partial completes takes it back.
    held_choke: bool,
}

impl OutQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nothing left to write.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty() && self.partial.is_none()
    }

    /// PIECE messages queued or in flight.
    pub fn pieces(&self) -> usize {
        self.queue.iter().filter(|m| matches!(m, Message::Piece(_))).count()
            + self.partial.is_some() as usize
    }

    /// Queue a message. Returns the PIECEs that a choke threw away.
    pub fn push(&mut self, msg: Message) -> Vec<BlockInfo> {
        match msg {
            Message::Choke => {
                let dropped = self.drop_pieces();
                // the queue only drains after the partial, so the choke
                // waits for it in order
                self.held_choke = self.partial.is_some();
                self.queue.push_back(Message::Choke);
                dropped
            }
            Message::Unchoke if self.held_choke => {
                self.held_choke = false;
                if let Some(at) = self.queue.iter().rposition(|m| *m == Message::Choke) {
                    self.queue.remove(at);
                }
                Vec::new()
            }
            msg => {
                self.queue.push_back(msg);
                Vec::new()
            }
        }
    }

    /// Remove a PIECE that has not started. A PIECE already partway out is
    /// left to finish.
    pub fn cancel(&mut self, info: &BlockInfo) -> bool {
        let before = self.queue.len();
        self.queue.retain(|m| !matches!(m, Message::Piece(b) if b.info() == *info));
        before != self.queue.len()
    }

    fn drop_pieces(&mut self) -> Vec<BlockInfo> {
        let mut dropped = Vec::new();
        self.queue.retain(|m| match m {
            Message::Piece(b) => {
                dropped.push(b.info());
                false
            }
            _ => true,
        });
        dropped
    }

    /// The next bytes to write, at most `SLICE_LEN` of PIECE payload at a
    /// time. Control messages are coalesced into one chunk.
    pub fn next_chunk(&mut self) -> Option<Chunk> {
        if let Some(partial) = self.partial.as_mut() {
            let n = partial.frame.len().min(SLICE_LEN);
            let bytes = partial.frame.split_to(n);
            let mut completed = None;
            if !partial.frame.has_remaining() {
                completed = self.partial.take().map(|p| p.info);
                self.held_choke = false;
            }
            return Some(Chunk { payload: n, bytes, completed });
        }

        if matches!(self.queue.front()?, Message::Piece(_)) {
            if let Some(Message::Piece(block)) = self.queue.pop_front() {
                let frame = Message::Piece(block.clone()).to_bytes();
                self.partial = Some(Partial { info: block.info(), frame });
            }
            return self.next_chunk();
        }

        let mut out = Vec::new();
        while let Some(m) = self.queue.front() {
            if matches!(m, Message::Piece(_)) {
                break;
            }
            if let Some(m) = self.queue.pop_front() {
                out.extend_from_slice(&m.to_bytes());
            }
        }
        Some(Chunk { bytes: Bytes::from(out), payload: 0, completed: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp_wire::Block;

    fn piece(index: u32, len: usize) -> Message {
        Message::Piece(Block { index, begin: 0, block: Bytes::from(vec![1u8; len]) })
    }

    fn drain(q: &mut OutQueue) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(c) = q.next_chunk() {
            out.extend_from_slice(&c.bytes);
        }
        out
    }

    #[test]
    fn control_messages_coalesce() {
        let mut q = OutQueue::new();
        q.push(Message::Interested);
        q.push(Message::Have(3));
        let c = q.next_chunk().unwrap();
        assert_eq!(c.bytes.len(), 5 + 9);
        assert_eq!(c.payload, 0);
        assert!(q.next_chunk().is_none());
        assert!(q.is_empty());
    }

    #[test]
    fn piece_goes_out_in_slices() {
        let mut q = OutQueue::new();
        q.push(piece(0, 10_000));

        let first = q.next_chunk().unwrap();
        assert_eq!(first.bytes.len(), SLICE_LEN);
        assert!(first.completed.is_none());

        // control message queued behind the partial
        q.push(Message::Have(1));
        let second = q.next_chunk().unwrap();
        assert_eq!(second.bytes.len(), SLICE_LEN);
        let third = q.next_chunk().unwrap();
        assert_eq!(third.bytes.len(), 10_000 + 13 - 2 * SLICE_LEN);
        assert_eq!(third.completed.unwrap().index, 0);

        let have = q.next_chunk().unwrap();
        assert_eq!(&have.bytes[..], &[0, 0, 0, 5, 4, 0, 0, 0, 1]);
    }

    #[test]
    fn choke_drops_queued_pieces_only() {
        let mut q = OutQueue::new();
        q.push(piece(0, 5000));
        q.push(piece(1, 5000));
        q.next_chunk().unwrap();

        let dropped = q.push(Message::Choke);
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].index, 1);

        // the partial completes, then the held choke follows
        let rest = q.next_chunk().unwrap();
        assert_eq!(rest.completed.unwrap().index, 0);
        let choke = q.next_chunk().unwrap();
        assert_eq!(&choke.bytes[..], &[0, 0, 0, 1, 0]);
        assert!(q.is_empty());
    }

    #[test]
    fn held_choke_keeps_its_place() {
        let mut q = OutQueue::new();
        q.push(piece(0, 5000));
        q.next_chunk().unwrap();

        q.push(Message::Have(2));
        q.push(Message::Choke);
        q.push(Message::Interested);
        let out = drain(&mut q);
        let control = &out[5000 + 13 - SLICE_LEN..];
        assert_eq!(control, &[0, 0, 0, 5, 4, 0, 0, 0, 2, 0, 0, 0, 1, 0, 0, 0, 0, 1, 2]);
        assert!(q.is_empty());
    }

    #[test]
    fn unchoke_cancels_held_choke() {
        let mut q = OutQueue::new();
        q.push(piece(0, 5000));
        q.next_chunk().unwrap();

        q.push(Message::Choke);
        q.push(Message::Unchoke);
        let out = drain(&mut q);
        assert_eq!(out.len(), 5000 + 13 - SLICE_LEN);
        assert!(q.is_empty());
    }

    #[test]
    fn choke_without_partial_is_immediate() {
        let mut q = OutQueue::new();
        q.push(piece(0, 100));
        q.push(Message::Choke);
        q.push(Message::Unchoke);
        assert_eq!(drain(&mut q), vec![0, 0, 0, 1, 0, 0, 0, 0, 1, 1]);
    }

    #[test]
    fn cancel_unstarted_piece() {
        let mut q = OutQueue::new();
        q.push(piece(0, 5000));
        q.push(piece(1, 100));
        q.next_chunk().unwrap();

        let started = BlockInfo { index: 0, begin: 0, len: 5000 };
        let queued = BlockInfo { index: 1, begin: 0, len: 100 };
        assert!(!q.cancel(&started));
        assert!(q.cancel(&queued));
        assert_eq!(q.pieces(), 1);
    }
}
