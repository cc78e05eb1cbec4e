use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{Block, BlockInfo};
use crate::error::Error;

/// Default cap on a single frame, 8 MiB.
pub const MAX_MESSAGE_LEN: usize = 8 * 1024 * 1024;

/// Messages exchanged after a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    /// Raw wire bytes. Their length depends on the torrent, so they are
    /// validated by the connection, not the codec.
    Bitfield(Bytes),
    Request(BlockInfo),
    Piece(Block),
    Cancel(BlockInfo),
    /// An id we do not speak, kept so the connection can ignore it.
    Unknown(u8),
}

/// The IDs of the [`Message`]s.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl TryFrom<u8> for MessageId {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use MessageId::*;
        Ok(match value {
            0 => Choke,
            1 => Unchoke,
            2 => Interested,
            3 => NotInterested,
            4 => Have,
            5 => Bitfield,
            6 => Request,
            7 => Piece,
            8 => Cancel,
            other => return Err(other),
        })
    }
}

impl Message {
    /// Bytes this message occupies on the wire, prefix included.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        use Message::*;
        match self {
            KeepAlive => 4,
            Choke | Unchoke | Interested | NotInterested | Unknown(_) => 4 + 1,
            Have(_) => 4 + 1 + 4,
            Bitfield(b) => 4 + 1 + b.len(),
            Request(_) | Cancel(_) => 4 + 1 + 12,
            Piece(b) => 4 + 1 + 8 + b.block.len(),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.len());
        encode_message(self, &mut buf);
        buf.freeze()
    }
}

fn encode_message(item: &Message, buf: &mut BytesMut) {
    match item {
        Message::KeepAlive => buf.put_u32(0),
        Message::Choke => control(buf, MessageId::Choke),
        Message::Unchoke => control(buf, MessageId::Unchoke),
        Message::Interested => control(buf, MessageId::Interested),
        Message::NotInterested => control(buf, MessageId::NotInterested),
        Message::Unknown(id) => {
            buf.put_u32(1);
            buf.put_u8(*id);
        }
        Message::Have(index) => {
            buf.put_u32(1 + 4);
            buf.put_u8(MessageId::Have as u8);
            buf.put_u32(*index);
        }
        Message::Bitfield(bytes) => {
            buf.put_u32(1 + bytes.len() as u32);
            buf.put_u8(MessageId::Bitfield as u8);
            buf.extend_from_slice(bytes);
        }
        // <len=0013><id=6><index><begin><length>
        Message::Request(info) => {
            buf.put_u32(1 + 12);
            buf.put_u8(MessageId::Request as u8);
            info.encode(buf);
        }
        Message::Cancel(info) => {
            buf.put_u32(1 + 12);
            buf.put_u8(MessageId::Cancel as u8);
            info.encode(buf);
        }
        // <len=0009+X><id=7><index><begin><block>
        Message::Piece(block) => {
            buf.put_u32(1 + 8 + block.block.len() as u32);
            buf.put_u8(MessageId::Piece as u8);
            block.encode(buf);
        }
    }
}

fn control(buf: &mut BytesMut, id: MessageId) {
    buf.put_u32(1);
    buf.put_u8(id as u8);
}

/// Frames [`Message`]s. Shape errors (wrong payload length for the id, or
/// a frame above `max_len`) are protocol violations that end the
/// connection.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    pub max_len: usize,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self { max_len: MAX_MESSAGE_LEN }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = Error;

    fn encode(&mut self, item: Message, buf: &mut BytesMut) -> Result<(), Self::Error> {
        encode_message(&item, buf);
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, Self::Error> {
        // the message length header must be present at the minimum, otherwise
        // we can't determine the message type
        if buf.len() < 4 {
            return Ok(None);
        }

        // peek, the whole frame may not be here yet
        let msg_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

        if msg_len > self.max_len {
            return Err(Error::MessageTooLarge(msg_len));
        }

        if buf.len() < 4 + msg_len {
            buf.reserve(4 + msg_len - buf.len());
            return Ok(None);
        }

        buf.advance(4);

        if msg_len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let mut payload = buf.split_to(msg_len);
        let id = payload.get_u8();
        let body = payload.len();

        let expect = |ok: bool, what: &'static str| {
            if ok {
                Ok(())
            } else {
                Err(Error::ProtocolViolation(what))
            }
        };

        let msg = match MessageId::try_from(id) {
            Ok(MessageId::Choke) => {
                expect(body == 0, "choke with payload")?;
                Message::Choke
            }
            Ok(MessageId::Unchoke) => {
                expect(body == 0, "unchoke with payload")?;
                Message::Unchoke
            }
            Ok(MessageId::Interested) => {
                expect(body == 0, "interested with payload")?;
                Message::Interested
            }
            Ok(MessageId::NotInterested) => {
                expect(body == 0, "not interested with payload")?;
                Message::NotInterested
            }
            Ok(MessageId::Have) => {
                expect(body == 4, "have must be 4 bytes")?;
                Message::Have(payload.get_u32())
            }
            Ok(MessageId::Bitfield) => Message::Bitfield(payload.freeze()),
            Ok(MessageId::Request) => {
                expect(body == 12, "request must be 12 bytes")?;
                Message::Request(block_info(&mut payload))
            }
            Ok(MessageId::Cancel) => {
                expect(body == 12, "cancel must be 12 bytes")?;
                Message::Cancel(block_info(&mut payload))
            }
            Ok(MessageId::Piece) => {
                expect(body >= 8, "piece shorter than its header")?;
                let index = payload.get_u32();
                let begin = payload.get_u32();
                Message::Piece(Block { index, begin, block: payload.freeze() })
            }
            Err(other) => Message::Unknown(other),
        };

        Ok(Some(msg))
    }
}

fn block_info(payload: &mut BytesMut) -> BlockInfo {
    BlockInfo { index: payload.get_u32(), begin: payload.get_u32(), len: payload.get_u32() }
}
