//! Pre-encoded peer entries of one swarm.
//!
//! Every peer that may be handed out has its compact form and both
//! dictionary forms encoded once, when it joins or changes. Entries are
//! bucketed by what the peer can do with obfuscation and by whether it
//! seeds, so answering an announce only picks buckets and samples them.
//! The swarm state must call [`BeCache::insert`] and [`BeCache::remove`]
//! on every membership change, or stale peers are handed out.
use std::net::SocketAddr;

use bytes::Bytes;
use hashbrown::HashMap;
use rand::seq::SliceRandom;

use super::query::CryptoSupport;
use crate::{
    addr,
    bencode::{Bencached, Value},
    peer::PeerId,
};

#[derive(Debug, Clone)]
pub struct Entry {
    /// 6 bytes for IPv4, 18 for IPv6.
    pub compact: Bytes,
    /// `{ip, peer id, port}`
    pub dict: Bencached,
    /// `{ip, port}`
    pub dict_no_id: Bencached,
    pub crypto: CryptoSupport,
}

impl Entry {
    pub fn new(peer_id: PeerId, addr: SocketAddr, crypto: CryptoSupport) -> Self {
        let mut dict = Value::dict();
        dict.insert(b"ip", addr.ip().to_string());
        dict.insert(b"port", addr.port());
        let dict_no_id = Bencached::new(&dict);
        dict.insert(b"peer id", &peer_id.0[..]);
        Self {
            compact: Bytes::from(addr::compact(addr)),
            dict: Bencached::new(&dict),
            dict_no_id,
            crypto,
        }
    }

    pub fn is_v6(&self) -> bool {
        self.compact.len() == 18
    }
}

#[derive(Debug, Default)]
pub struct BeCache {
    /// `[crypto class][leech = 0, seed = 1]`
    buckets: [[HashMap<PeerId, Entry>; 2]; 3],
}

impl BeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or move a peer.
    pub fn insert(&mut self, peer_id: PeerId, addr: SocketAddr, crypto: CryptoSupport, seed: bool) {
        self.remove(&peer_id);
        self.buckets[crypto.index()][seed as usize].insert(peer_id, Entry::new(peer_id, addr, crypto));
    }

    pub fn remove(&mut self, peer_id: &PeerId) -> bool {
        let mut removed = false;
        for bucket in self.buckets.iter_mut().flatten() {
            removed |= bucket.remove(peer_id).is_some();
        }
        removed
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.buckets.iter().flatten().any(|b| b.contains_key(peer_id))
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().flatten().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Up to `n` random peers for a requester. Requesters that cannot
    /// speak obfuscation never get peers that require it, requesters that
    /// require it only get peers that support it. Seeders only get
    /// leechers.
    pub fn sample(&self, requester: CryptoSupport, is_seed: bool, exclude: &PeerId, n: usize) -> Vec<&Entry> {
        let classes: &[CryptoSupport] = match requester {
            CryptoSupport::Plain => &[CryptoSupport::Plain, CryptoSupport::Supported],
            CryptoSupport::Supported => {
                &[CryptoSupport::Plain, CryptoSupport::Supported, CryptoSupport::Required]
            }
            CryptoSupport::Required => &[CryptoSupport::Supported, CryptoSupport::Required],
        };
        let statuses: &[usize] = if is_seed { &[0] } else { &[0, 1] };

        let candidates: Vec<&Entry> = classes
            .iter()
            .flat_map(|c| statuses.iter().map(move |s| &self.buckets[c.index()][*s]))
            .flat_map(|bucket| bucket.iter())
            .filter(|(id, _)| *id != exclude)
            .map(|(_, e)| e)
            .collect();

        candidates.choose_multiple(&mut rand::thread_rng(), n).copied().collect()
    }
}

/// Peer lists of one announce response.
#[derive(Debug, Default, PartialEq)]
pub struct CompactPeers {
    pub peers: Vec<u8>,
    pub peers6: Vec<u8>,
    /// One byte per IPv4 peer, 1 when it speaks obfuscation.
    pub crypto_flags: Vec<u8>,
}

impl CompactPeers {
    pub fn from_entries(entries: &[&Entry]) -> Self {
        let mut out = Self::default();
        for e in entries {
            if e.is_v6() {
                out.peers6.extend_from_slice(&e.compact);
            } else {
                out.peers.extend_from_slice(&e.compact);
                out.crypto_flags.push(u8::from(e.crypto != CryptoSupport::Plain));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> PeerId {
        PeerId([n; 20])
    }

    fn addr(n: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, n], 6881))
    }

    #[test]
    fn seeders_only_get_leechers() {
        let mut c = BeCache::new();
        c.insert(id(1), addr(1), CryptoSupport::Plain, true);
        c.insert(id(2), addr(2), CryptoSupport::Plain, false);
        c.insert(id(3), addr(3), CryptoSupport::Plain, false);

        let got = c.sample(CryptoSupport::Plain, true, &id(3), 10);
        assert_eq!(got.len(), 1);
        assert_eq!(&got[0].compact[..4], &[10, 0, 0, 2]);

        assert_eq!(c.sample(CryptoSupport::Plain, false, &id(9), 10).len(), 3);
        assert_eq!(c.sample(CryptoSupport::Plain, false, &id(9), 2).len(), 2);
    }

    #[test]
    fn crypto_buckets() {
        let mut c = BeCache::new();
        c.insert(id(1), addr(1), CryptoSupport::Plain, false);
        c.insert(id(2), addr(2), CryptoSupport::Supported, false);
        c.insert(id(3), addr(3), CryptoSupport::Required, false);

        assert_eq!(c.sample(CryptoSupport::Plain, false, &id(0), 10).len(), 2);
        assert_eq!(c.sample(CryptoSupport::Required, false, &id(0), 10).len(), 2);

        let all = c.sample(CryptoSupport::Supported, false, &id(0), 10);
        let compact = CompactPeers::from_entries(&all);
        assert_eq!(compact.peers.len(), 18);
        assert_eq!(compact.crypto_flags.iter().filter(|f| **f == 1).count(), 2);
    }

    #[test]
    fn insert_moves_between_buckets() {
        let mut c = BeCache::new();
        c.insert(id(1), addr(1), CryptoSupport::Plain, false);
        c.insert(id(1), addr(1), CryptoSupport::Plain, true);
        assert_eq!(c.len(), 1);
        assert!(c.sample(CryptoSupport::Plain, true, &id(0), 10).is_empty());
        assert!(c.remove(&id(1)));
        assert!(c.is_empty());
    }

    #[test]
    fn v6_peers_go_to_peers6() {
        let mut c = BeCache::new();
        c.insert(id(1), "[::1]:80".parse().unwrap(), CryptoSupport::Plain, false);
        let compact = CompactPeers::from_entries(&c.sample(CryptoSupport::Plain, false, &id(0), 1));
        assert!(compact.peers.is_empty());
        assert_eq!(compact.peers6.len(), 18);
    }
}
