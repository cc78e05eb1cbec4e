//! Swarm membership, as seen by the tracker.
use std::net::{IpAddr, SocketAddr};

use bytes::Bytes;
use hashbrown::HashMap;
use tracing::{debug, trace};

use super::{
    becache::{BeCache, CompactPeers},
    query::{AnnounceEvent, AnnounceParams, CryptoSupport},
};
use crate::{addr, bencode::Value, peer::PeerId, torrent::InfoHash};

/// Reachability of a peer's listening port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatStatus {
    /// Reachable, or not checked by configuration. Only these peers are
    /// handed out.
    Reachable,
    /// A dial-back is in flight, after this many failed ones.
    Checking(u32),
    /// Dial-backs that failed so far.
    Failed(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwarmPeer {
    pub ip: IpAddr,
    pub port: u16,
    pub left: u64,
    pub crypto: CryptoSupport,
    /// Sent by the client, proves later announces come from the same
    /// client when its address changes.
    pub key: Option<String>,
    pub nat: NatStatus,
    /// Unix seconds.
    pub last_seen: u64,
}

impl SwarmPeer {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    pub fn is_seed(&self) -> bool {
        self.left == 0
    }
}

/// What the caller has to do after an announce was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Followup {
    Nothing,
    /// Dial the peer back.
    NatCheck(SocketAddr, CryptoSupport),
}

#[derive(Debug, Default)]
pub struct SwarmState {
    pub downloads: HashMap<InfoHash, HashMap<PeerId, SwarmPeer>>,
    /// `completed` events seen per swarm.
    pub completed: HashMap<InfoHash, u64>,
    becache: HashMap<InfoHash, BeCache>,
    /// Dial-backs before a peer counts as NATted, 0 disables checking.
    nat_check: u32,
}

impl SwarmState {
    pub fn new(nat_check: u32) -> Self {
        Self { nat_check, ..Default::default() }
    }

    pub fn contains(&self, info_hash: &InfoHash, peer_id: &PeerId) -> bool {
        self.downloads.get(info_hash).is_some_and(|s| s.contains_key(peer_id))
    }

    pub fn peer(&self, info_hash: &InfoHash, peer_id: &PeerId) -> Option<&SwarmPeer> {
        self.downloads.get(info_hash)?.get(peer_id)
    }

    /// `(complete, incomplete)`
    pub fn counts(&self, info_hash: &InfoHash) -> (u64, u64) {
        let Some(swarm) = self.downloads.get(info_hash) else {
            return (0, 0);
        };
        let seeds = swarm.values().filter(|p| p.is_seed()).count() as u64;
        (seeds, swarm.len() as u64 - seeds)
    }

    /// Apply an announce from `ip`. Errors are the `failure reason` for the
    /// client.
    pub fn announce(&mut self, p: &AnnounceParams, ip: IpAddr, now: u64) -> Result<Followup, String> {
        if p.event == AnnounceEvent::Snooped {
            return Ok(Followup::Nothing);
        }
        let swarm = self.downloads.entry(p.info_hash).or_default();

        if let Some(old) = swarm.get(&p.peer_id) {
            let authorized = match (&old.key, &p.key) {
                (Some(a), Some(b)) => a == b,
                _ => old.ip == ip,
            };
            if !authorized {
                return Err("peer id already in use from another address".into());
            }
        }

        let port = match (p.crypto, p.cryptoport) {
            (CryptoSupport::Required, Some(cp)) => cp,
            _ => p.port,
        };

        match p.event {
            AnnounceEvent::Stopped => {
                if swarm.remove(&p.peer_id).is_some() {
                    debug!("{} left {:?}", p.peer_id, p.info_hash);
                }
                if swarm.is_empty() {
                    self.downloads.remove(&p.info_hash);
                }
                if let Some(c) = self.becache.get_mut(&p.info_hash) {
                    c.remove(&p.peer_id);
                }
                Ok(Followup::Nothing)
            }
            AnnounceEvent::Update
            | AnnounceEvent::Started
            | AnnounceEvent::Completed
            | AnnounceEvent::Snooped => {
                let old = swarm.get(&p.peer_id).cloned();
                if p.event == AnnounceEvent::Completed && old.as_ref().is_some_and(|o| !o.is_seed()) {
                    *self.completed.entry(p.info_hash).or_default() += 1;
                }

                let moved = old.as_ref().map_or(true, |o| o.ip != ip || o.port != port || o.crypto != p.crypto);
                let nat = match old.as_ref().map(|o| o.nat) {
                    Some(nat) if !moved => nat,
                    _ if self.nat_check == 0 || addr::is_local(ip) => NatStatus::Reachable,
                    _ => NatStatus::Failed(0),
                };

                let mut peer = SwarmPeer {
                    ip,
                    port,
                    left: p.left,
                    crypto: p.crypto,
                    key: p.key.clone().or_else(|| old.as_ref().and_then(|o| o.key.clone())),
                    nat,
                    last_seen: now,
                };

                let mut followup = Followup::Nothing;
                if let NatStatus::Failed(tries) = nat {
                    if tries < self.nat_check {
                        peer.nat = NatStatus::Checking(tries);
                        followup = Followup::NatCheck(peer.addr(), peer.crypto);
                    }
                }

                let cache = self.becache.entry(p.info_hash).or_default();
                if peer.nat == NatStatus::Reachable {
                    cache.insert(p.peer_id, peer.addr(), peer.crypto, peer.is_seed());
                } else {
                    cache.remove(&p.peer_id);
                }
                trace!("{} in {:?}: {peer:?}", p.peer_id, p.info_hash);
                swarm.insert(p.peer_id, peer);
                Ok(followup)
            }
        }
    }

    /// Result of a dial-back.
    pub fn nat_checked(&mut self, info_hash: &InfoHash, peer_id: &PeerId, reachable: bool) {
        let Some(peer) = self.downloads.get_mut(info_hash).and_then(|s| s.get_mut(peer_id)) else {
            return;
        };
        let NatStatus::Checking(failed) = peer.nat else {
            return;
        };
        if reachable {
            peer.nat = NatStatus::Reachable;
            self.becache.entry(*info_hash).or_default().insert(
                *peer_id,
                peer.addr(),
                peer.crypto,
                peer.is_seed(),
            );
        } else {
            let tries = failed + 1;
            debug!("{peer_id} at {} is NATted ({tries} tries)", peer.addr());
            peer.nat = NatStatus::Failed(tries);
        }
    }

    /// Drop peers not seen since `cutoff`. Returns how many went.
    pub fn expire(&mut self, cutoff: u64) -> usize {
        let mut gone = 0;
        for (info_hash, swarm) in self.downloads.iter_mut() {
            let stale: Vec<PeerId> =
                swarm.iter().filter(|(_, p)| p.last_seen < cutoff).map(|(id, _)| *id).collect();
            for id in stale {
                swarm.remove(&id);
                if let Some(c) = self.becache.get_mut(info_hash) {
                    c.remove(&id);
                }
                gone += 1;
            }
        }
        self.downloads.retain(|_, s| !s.is_empty());
        let downloads = &self.downloads;
        self.becache.retain(|h, _| downloads.contains_key(h));
        gone
    }

    /// The peer list part of an announce response.
    pub fn peer_list(&self, p: &AnnounceParams, n: usize) -> Vec<(&'static [u8], Value)> {
        let empty = BeCache::default();
        let cache = self.becache.get(&p.info_hash).unwrap_or(&empty);
        let entries = if p.event == AnnounceEvent::Stopped {
            Vec::new()
        } else {
            cache.sample(p.crypto, p.is_seed(), &p.peer_id, n)
        };

        if !p.compact {
            let list = entries
                .iter()
                .map(|e| Value::from(if p.no_peer_id { e.dict_no_id.clone() } else { e.dict.clone() }))
                .collect::<Vec<_>>();
            return vec![(b"peers".as_slice(), Value::List(list))];
        }

        let compact = CompactPeers::from_entries(&entries);
        let mut out = vec![(b"peers".as_slice(), Value::Bytes(Bytes::from(compact.peers)))];
        if !compact.peers6.is_empty() {
            out.push((b"peers6".as_slice(), Value::Bytes(Bytes::from(compact.peers6))));
        }
        if p.crypto == CryptoSupport::Supported {
            out.push((b"crypto_flags".as_slice(), Value::Bytes(Bytes::from(compact.crypto_flags))));
        }
        out
    }

    /// Peers loaded from the state file join the becache without being
    /// checked again.
    pub fn restore(&mut self, info_hash: InfoHash, peer_id: PeerId, peer: SwarmPeer) {
        if peer.nat == NatStatus::Reachable {
            self.becache.entry(info_hash).or_default().insert(
                peer_id,
                peer.addr(),
                peer.crypto,
                peer.is_seed(),
            );
        }
        self.downloads.entry(info_hash).or_default().insert(peer_id, peer);
    }

    pub fn num_swarms(&self) -> usize {
        self.downloads.len()
    }
}
