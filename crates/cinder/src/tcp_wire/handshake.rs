//! Codec for encoding and decoding handshakes.
//!
//! This has to be a separate codec as the handshake has a different
//! structure than the rest of the messages. Moreover, handshakes may only
//! be sent once at the beginning of a connection, preceding all other
//! messages. Thus, after receiving and sending a handshake the codec
//! should be switched to [`MessageCodec`], but care should be taken not to
//! discard the underlying receive and send buffers.
//!
//! [`MessageCodec`]: super::MessageCodec
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use super::PSTR;
use crate::{bitfield::Reserved, error::Error, peer::PeerId, torrent::InfoHash};

/// Bytes on the wire: 1 + 19 + 8 + 20 + 20.
pub const HANDSHAKE_LEN: usize = 68;

/// pstrlen = 19
/// pstr = "BitTorrent protocol"
/// This is the very first message exchanged. If the peer's protocol string
/// or the info hash differs from ours, the connection is severed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: Reserved,
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self { reserved: Reserved::supported(), info_hash, peer_id }
    }

    /// The info hash is the only field we can verify.
    pub fn validate(&self, target: &InfoHash) -> bool {
        if self.info_hash != *target {
            warn!("! handshake for {} while expecting {target}", self.info_hash);
            return false;
        }
        true
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        encode(self, &mut buf);
        buf
    }
}

fn encode(handshake: &Handshake, buf: &mut BytesMut) {
    buf.put_u8(PSTR.len() as u8);
    buf.extend_from_slice(&PSTR);
    buf.extend_from_slice(&handshake.reserved.into_bytes());
    buf.extend_from_slice(&handshake.info_hash.0);
    buf.extend_from_slice(&handshake.peer_id.0);
}

#[derive(Debug, Default)]
pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(&mut self, handshake: Handshake, buf: &mut BytesMut) -> Result<(), Error> {
        encode(&handshake, buf);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>, Error> {
        if buf.is_empty() {
            return Ok(None);
        }

        // fail early on a wrong protocol string, without waiting for the rest
        if buf[0] as usize != PSTR.len() {
            return Err(Error::HandshakeInvalid);
        }
        let have = (buf.len() - 1).min(PSTR.len());
        if buf[1..1 + have] != PSTR[..have] {
            return Err(Error::HandshakeInvalid);
        }

        if buf.len() < HANDSHAKE_LEN {
            return Ok(None);
        }

        buf.advance(1 + PSTR.len());

        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            reserved: Reserved::from(reserved),
            info_hash: InfoHash(info_hash),
            peer_id: PeerId(peer_id),
        }))
    }
}
