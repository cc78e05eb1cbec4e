//! Decides which piece to request next.
//!
//! Pieces are grouped in priority bands, high before normal before low,
//! disabled pieces are never returned. Inside a band, pieces that are
//! already started come first so half-finished pieces get finished. Among
//! unstarted pieces the choice is random until `rarest_first_cutoff`
//! pieces are complete, rarest first afterwards, ties going to the lowest
//! index.
//!
//! Once no wanted piece is left unstarted the picker is in endgame: the
//! caller may request every outstanding block from every peer that has it.
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::bitfield::Bitfield;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Priority {
    /// Never requested.
    Disabled,
    Low,
    #[default]
    Normal,
    High,
}

const BANDS: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

#[derive(Debug, Clone)]
pub struct Picker {
    /// How many connected peers advertise each piece.
    counts: Vec<u32>,
    have: Bitfield,
    priority: Vec<Priority>,
    started: Vec<bool>,
    cutoff: usize,
}

impl Picker {
    pub fn new(pieces: usize, rarest_first_cutoff: usize) -> Self {
        Self {
            counts: vec![0; pieces],
            have: Bitfield::new(pieces),
            priority: vec![Priority::Normal; pieces],
            started: vec![false; pieces],
            cutoff: rarest_first_cutoff,
        }
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn count(&self, index: usize) -> u32 {
        self.counts.get(index).copied().unwrap_or(0)
    }

    pub fn num_complete(&self) -> usize {
        self.have.num_true()
    }

    pub fn got_have(&mut self, index: usize) {
        if let Some(c) = self.counts.get_mut(index) {
            *c += 1;
        }
    }

    pub fn lost_have(&mut self, index: usize) {
        if let Some(c) = self.counts.get_mut(index) {
            *c = c.saturating_sub(1);
        }
    }

    pub fn got_bitfield(&mut self, bitfield: &Bitfield) {
        for i in bitfield.iter_ones() {
            self.got_have(i);
        }
    }

    /// A peer went away, forget what it advertised.
    pub fn lost_bitfield(&mut self, bitfield: &Bitfield) {
        for i in bitfield.iter_ones() {
            self.lost_have(i);
        }
    }

    /// The piece was verified.
    pub fn complete(&mut self, index: usize) {
        if index < self.counts.len() {
            self.have.set(index, true);
            self.started[index] = false;
        }
    }

    /// A block of the piece was requested.
    pub fn requested(&mut self, index: usize) {
        if let Some(s) = self.started.get_mut(index) {
            *s = true;
        }
    }

    /// The piece failed its hash check and goes back to the pool.
    pub fn bump(&mut self, index: usize) {
        if let Some(s) = self.started.get_mut(index) {
            *s = false;
        }
    }

    pub fn is_started(&self, index: usize) -> bool {
        self.started.get(index).copied().unwrap_or(false)
    }

    pub fn set_priority(&mut self, index: usize, priority: Priority) {
        if let Some(p) = self.priority.get_mut(index) {
            *p = priority;
        }
    }

    pub fn priority(&self, index: usize) -> Priority {
        self.priority.get(index).copied().unwrap_or(Priority::Disabled)
    }

    fn wanted(&self, index: usize) -> bool {
        !self.have.get(index) && self.priority[index] != Priority::Disabled
    }

    fn candidates<'a>(
        &'a self,
        peer: &'a Bitfield,
        band: Priority,
        started: bool,
    ) -> impl Iterator<Item = usize> + 'a {
        peer.iter_ones().filter(move |&i| {
            i < self.counts.len()
                && self.priority[i] == band
                && self.started[i] == started
                && self.wanted(i)
        })
    }

    fn rarest(&self, it: impl Iterator<Item = usize>) -> Option<usize> {
        it.min_by_key(|&i| (self.counts[i], i))
    }

    /// Pick a piece `peer` has and `want` accepts.
    pub fn next(&self, peer: &Bitfield, want: impl Fn(usize) -> bool) -> Option<usize> {
        for band in BANDS {
            if let Some(i) = self.rarest(self.candidates(peer, band, true).filter(|&i| want(i))) {
                return Some(i);
            }

            let fresh = self.candidates(peer, band, false).filter(|&i| want(i));
            let pick = if self.num_complete() < self.cutoff {
                let all: Vec<usize> = fresh.collect();
                all.choose(&mut rand::thread_rng()).copied()
            } else {
                self.rarest(fresh)
            };
            if pick.is_some() {
                return pick;
            }
        }
        None
    }

    /// Every wanted piece is complete or started.
    pub fn is_endgame(&self) -> bool {
        (0..self.counts.len()).all(|i| !self.wanted(i) || self.started[i])
    }

    /// Whether `peer` has anything we want, for the interested flag.
    pub fn is_interesting(&self, peer: &Bitfield) -> bool {
        peer.iter_ones().any(|i| i < self.counts.len() && self.wanted(i))
    }

    /// Copies of the rarest piece in the swarm, with the fraction of pieces
    /// that have more copies than that as the decimal part.
    pub fn distributed_copies(&self) -> f64 {
        let Some(&min) = self.counts.iter().min() else { return 0.0 };
        let above = self.counts.iter().filter(|&&c| c > min).count();
        min as f64 + above as f64 / self.counts.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bf(bits: &str) -> Bitfield {
        let mut b = Bitfield::new(bits.len());
        for (i, c) in bits.chars().enumerate() {
            b.set(i, c == '1');
        }
        b
    }

    #[test]
    fn rarest_first_order() {
        let mut p = Picker::new(4, 0);
        let peers = [bf("1111"), bf("0111"), bf("0011")];
        for b in &peers {
            p.got_bitfield(b);
        }

        let mut order = Vec::new();
        for _ in 0..4 {
            let i = p.next(&peers[0], |_| true).unwrap();
            p.complete(i);
            order.push(i);
        }
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[test]
    fn never_picks_what_the_peer_lacks() {
        let mut p = Picker::new(8, 2);
        let peer = bf("00100100");
        p.got_bitfield(&peer);
        p.got_bitfield(&bf("11111111"));
        for _ in 0..50 {
            let i = p.next(&peer, |_| true).unwrap();
            assert!(peer.get(i));
        }
    }

    #[test]
    fn counts_follow_peers() {
        let mut p = Picker::new(3, 2);
        let only = bf("010");
        p.got_bitfield(&only);
        assert_eq!(p.count(1), 1);
        p.lost_bitfield(&only);
        assert_eq!(p.count(1), 0);
        p.got_have(1);
        assert_eq!(p.count(1), 1);
    }

    #[test]
    fn started_pieces_first_then_bands() {
        let mut p = Picker::new(4, 0);
        let peer = bf("1111");
        p.got_bitfield(&peer);
        p.got_bitfield(&bf("1100"));

        p.requested(1);
        assert_eq!(p.next(&peer, |_| true), Some(1));
        // piece 1 has nothing left to request
        assert_eq!(p.next(&peer, |i| i != 1), Some(2));

        p.set_priority(0, Priority::High);
        assert_eq!(p.next(&peer, |i| i != 1), Some(0));

        p.set_priority(0, Priority::Disabled);
        p.set_priority(2, Priority::Low);
        assert_eq!(p.next(&peer, |i| i != 1), Some(3));
    }

    #[test]
    fn endgame_when_pool_is_empty() {
        let mut p = Picker::new(3, 0);
        p.complete(0);
        p.requested(1);
        assert!(!p.is_endgame());
        p.set_priority(2, Priority::Disabled);
        assert!(p.is_endgame());
        p.bump(1);
        assert!(!p.is_endgame());
    }

    #[test]
    fn distributed_copies() {
        let mut p = Picker::new(4, 0);
        p.got_bitfield(&bf("1111"));
        p.got_bitfield(&bf("1100"));
        assert_eq!(p.distributed_copies(), 1.5);
    }
}
