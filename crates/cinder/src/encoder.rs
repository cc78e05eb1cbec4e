//! Dial queue of a torrent.
//!
//! Peers learned from trackers wait here until the torrent has room for
//! them. A dial is started only while:
//! - connections stay under `max_connections`, 0 being unbounded,
//! - connections stay under `max_initiate`, raised by half once some peer
//!   managed to connect to us, so that a client behind a NAT keeps trying
//!   others,
//! - the torrent has fewer than `max_half_open` dials in flight.
//!
//! The process wide half-open limit is a semaphore held by the daemon,
//! each dial task takes a permit before its TCP connect.
use std::{
    collections::VecDeque,
    net::{IpAddr, SocketAddr},
};

use hashbrown::HashSet;
use tracing::trace;

use crate::{config::Config, peer::PeerAddr};

#[derive(Debug)]
pub struct Encoder {
    queue: VecDeque<PeerAddr>,
    /// Dials in flight.
    pending: HashSet<SocketAddr>,
    max_initiate: usize,
    max_half_open: usize,
    max_connections: usize,
}

impl Encoder {
    pub fn new(config: &Config) -> Self {
        Self {
            queue: VecDeque::new(),
            pending: HashSet::new(),
            max_initiate: config.max_initiate,
            max_half_open: config.max_half_open.max(1),
            max_connections: config.max_connections,
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn half_open(&self) -> usize {
        self.pending.len()
    }

    /// Queue peers from an announce. Addresses already queued or being
    /// dialed are skipped, the caller filters live connections.
    pub fn start_connections(&mut self, peers: impl IntoIterator<Item = PeerAddr>) {
        for peer in peers {
            if self.pending.contains(&peer.addr) || self.queue.iter().any(|p| p.addr == peer.addr) {
                continue;
            }
            self.queue.push_back(peer);
        }
        trace!("dial queue has {} peers", self.queue.len());
    }

    /// Whether an inbound connection fits under `max_connections`.
    pub fn can_accept(&self, connected: usize) -> bool {
        self.max_connections == 0 || connected < self.max_connections
    }

    /// Pop the peers to dial now. `connected` is the number of live
    /// connections, `has_inbound` whether any of them dialed us.
    /// `skip` is called with every candidate and drops it when true, for
    /// banned or already connected peers.
    pub fn next_dials(
        &mut self,
        connected: usize,
        has_inbound: bool,
        skip: impl Fn(&PeerAddr) -> bool,
    ) -> Vec<PeerAddr> {
        let initiate = if has_inbound { self.max_initiate * 3 / 2 } else { self.max_initiate };
        let mut out = Vec::new();

        loop {
            let total = connected + self.pending.len();
            if total >= initiate || !self.can_accept(total) || self.pending.len() >= self.max_half_open {
                break;
            }
            let Some(peer) = self.queue.pop_front() else { break };
            if skip(&peer) {
                continue;
            }
            self.pending.insert(peer.addr);
            out.push(peer);
        }
        out
    }

    /// A dial finished, successfully or not.
    pub fn dial_done(&mut self, addr: &SocketAddr) {
        self.pending.remove(addr);
    }

    /// Forget queued peers from a banned IP.
    pub fn ban(&mut self, ip: IpAddr) {
        self.queue.retain(|p| p.addr.ip() != ip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers(n: u16) -> Vec<PeerAddr> {
        (0..n).map(|i| SocketAddr::from(([10, 0, 0, 1], 1000 + i)).into()).collect()
    }

    #[test]
    fn half_open_limit() {
        let config = Config::default();
        let mut encoder = Encoder::new(&config);
        encoder.start_connections(peers(20));
        // duplicates are dropped
        encoder.start_connections(peers(3));
        assert_eq!(encoder.queued(), 20);

        let dials = encoder.next_dials(0, false, |_| false);
        assert_eq!(dials.len(), 8);
        assert!(encoder.next_dials(0, false, |_| false).is_empty());

        encoder.dial_done(&dials[0].addr);
        assert_eq!(encoder.next_dials(1, false, |_| false).len(), 1);
    }

    #[test]
    fn initiate_limit_grows_with_inbound() {
        let config = Config { max_initiate: 4, ..Default::default() };
        let mut encoder = Encoder::new(&config);
        encoder.start_connections(peers(10));

        assert!(encoder.next_dials(4, false, |_| false).is_empty());
        assert_eq!(encoder.next_dials(4, true, |_| false).len(), 2);
    }

    #[test]
    fn connection_cap_and_skip() {
        let config = Config { max_connections: 3, ..Default::default() };
        let mut encoder = Encoder::new(&config);
        encoder.start_connections(peers(5));

        let dials = encoder.next_dials(1, false, |p| p.addr.port() == 1000);
        assert_eq!(dials.len(), 2);
        assert!(dials.iter().all(|p| p.addr.port() != 1000));
        assert!(!encoder.can_accept(3));

        encoder.ban(IpAddr::from([10, 0, 0, 1]));
        assert_eq!(encoder.queued(), 0);
    }
}
