use std::{fmt::Display, net::SocketAddr};

use rand::{distributions::Alphanumeric, Rng};
use slotmap::new_key_type;

use crate::tcp_wire::{BlockInfo, Message};

new_key_type! {
    /// Slot of a live connection in the torrent's arena. Ids of closed
    /// connections are simply not found anymore.
    pub struct ConnectionId;
}

/// Client prefix in Azureus style.
const CLIENT_PREFIX: &[u8; 8] = b"-CN0100-";

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    /// A fresh id for the local client, `-CN0100-` followed by 12 random
    /// alphanumerics.
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(CLIENT_PREFIX);
        let mut rng = rand::thread_rng();
        for b in id[8..].iter_mut() {
            *b = rng.sample(Alphanumeric);
        }
        Self(id)
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.to_string();
        f.write_str(&s)
    }
}

impl From<[u8; 20]> for PeerId {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

impl From<PeerId> for [u8; 20] {
    fn from(value: PeerId) -> Self {
        value.0
    }
}

impl TryFrom<&[u8]> for PeerId {
    type Error = &'static str;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let buff: [u8; 20] =
            value.try_into().map_err(|_| "The PeerId must have exactly 20 bytes")?;
        Ok(PeerId(buff))
    }
}

impl TryFrom<Vec<u8>> for PeerId {
    type Error = &'static str;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        PeerId::try_from(value.as_slice())
    }
}

/// Who opened the TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The remote peer dialed us.
    Inbound,
    /// We dialed the remote peer.
    Outbound,
}

/// A peer to dial, as learned from a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerAddr {
    pub addr: SocketAddr,
    /// The id the tracker claims the peer has, checked at handshake.
    pub peer_id: Option<PeerId>,
    /// The tracker says the peer speaks the obfuscated handshake.
    pub crypto: bool,
}

impl From<SocketAddr> for PeerAddr {
    fn from(addr: SocketAddr) -> Self {
        Self { addr, peer_id: None, crypto: false }
    }
}

/// Commands from the torrent to a connection's writer task.
#[derive(Debug)]
pub enum PeerMsg {
    /// Queue a message, in order.
    Send(Message),
    /// Drop a PIECE that has not started flushing yet.
    Cancel(BlockInfo),
    /// Flush what is queued and close the socket.
    Close,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_carry_the_client_prefix() {
        let a = PeerId::generate();
        let b = PeerId::generate();
        assert_eq!(&a.0[..8], CLIENT_PREFIX);
        assert!(a.0[8..].iter().all(|b| b.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn try_from_wrong_length() {
        assert!(PeerId::try_from(vec![0u8; 19]).is_err());
        assert_eq!(PeerId::try_from(vec![1u8; 20]).unwrap(), PeerId([1; 20]));
    }
}
