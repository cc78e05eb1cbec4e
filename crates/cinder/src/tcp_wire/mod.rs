//! The "TCP Wire" protocol between peers.
//!
//! Every message after the handshake is `length:u32 | id:u8 | payload`,
//! a zero length being a keepalive.
pub mod handshake;
pub mod messages;
pub mod outqueue;

use bytes::{BufMut, Bytes, BytesMut};

pub use handshake::{Handshake, HandshakeCodec};
pub use messages::{Message, MessageCodec, MessageId};
pub use outqueue::OutQueue;

/// The default block_len that most clients support, some clients drop
/// the connection on blocks larger than this value.
///
/// The last block of a piece might be smaller.
pub const BLOCK_LEN: u32 = 16384;

/// Protocol String
/// String identifier of the string "BitTorrent protocol", in bytes.
pub const PSTR: [u8; 19] = *b"BitTorrent protocol";

/// A Block is a subset of a Piece, sent in the "Piece" message.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Block {
    /// The index of the piece this block belongs to.
    pub index: u32,
    /// The zero-based byte offset into the piece.
    pub begin: u32,
    /// The block's data. 16 KiB most of the times,
    /// but the last block of a piece *might* be smaller.
    pub block: Bytes,
}

impl Block {
    pub fn info(&self) -> BlockInfo {
        BlockInfo { index: self.index, begin: self.begin, len: self.block.len() as u32 }
    }

    /// Encodes the block in the network binary protocol's format into the
    /// given buffer.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.index);
        buf.put_u32(self.begin);
        buf.extend_from_slice(&self.block);
    }
}

/// The representation of a [`Block`].
///
/// When we ask a peer to give us a [`Block`], we send this struct,
/// using the "Request" message of the tcp wire protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockInfo {
    /// The index of the piece of which this is a block.
    pub index: u32,
    /// The zero-based byte offset into the piece.
    pub begin: u32,
    /// The block's length in bytes.
    pub len: u32,
}

impl Default for BlockInfo {
    fn default() -> Self {
        Self { index: 0, begin: 0, len: BLOCK_LEN }
    }
}

impl BlockInfo {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn index(mut self, index: u32) -> Self {
        self.index = index;
        self
    }
    pub fn begin(mut self, begin: u32) -> Self {
        self.begin = begin;
        self
    }
    pub fn len(mut self, len: u32) -> Self {
        self.len = len;
        self
    }
    /// Encodes the block info in the network binary protocol's format into the
    /// given buffer.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.index);
        buf.put_u32(self.begin);
        buf.put_u32(self.len);
    }
}
