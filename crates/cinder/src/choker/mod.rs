//! Decides who we upload to.
//!
//! Every round the interested peers are ranked by rate: the rate they give
//! us while we download, the rate we give them while we seed. The top
//! `max_uploads - 1` are unchoked, snubbed peers ranking after everyone
//! else. One more slot goes to the optimistic unchoke, the first
//! interested peer in round-robin order that did not make the cut. The
//! order rotates every `optimistic_rounds` rounds, three times slower when
//! seeding, and new peers enter it at a random position.
pub mod super_seed;

pub use super_seed::SuperSeeder;

use hashbrown::HashSet;
use rand::Rng;
use tracing::debug;

use crate::peer::ConnectionId;

/// What a round needs to know about a connection.
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub id: ConnectionId,
    pub interested: bool,
    pub snubbed: bool,
    /// Bytes per second, the direction depends on whether we seed.
    pub rate: f64,
}

/// Result of a round.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Unchoked {
    pub preferred: Vec<ConnectionId>,
    pub optimistic: Option<ConnectionId>,
}

impl Unchoked {
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.optimistic == Some(id) || self.preferred.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.preferred.len() + self.optimistic.is_some() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
pub struct Choker {
    /// Round-robin order, the optimistic candidate is searched from the
    /// head.
    order: Vec<ConnectionId>,
    max_uploads: usize,
    optimistic_rounds: usize,
    round: usize,
    last: Unchoked,
}

impl Choker {
    pub fn new(max_uploads: usize, optimistic_rounds: usize) -> Self {
        Self {
            order: Vec::new(),
            max_uploads: max_uploads.max(1),
            optimistic_rounds: optimistic_rounds.max(1),
            round: 0,
            last: Unchoked::default(),
        }
    }

    pub fn connection_made(&mut self, id: ConnectionId) {
        let at = rand::thread_rng().gen_range(0..=self.order.len());
        self.order.insert(at, id);
    }

    /// Returns true when the peer held an upload slot, so a new round is
    /// worth running.
    pub fn connection_lost(&mut self, id: ConnectionId) -> bool {
        self.order.retain(|&c| c != id);
        let held = self.last.contains(id);
        self.last.preferred.retain(|&c| c != id);
        if self.last.optimistic == Some(id) {
            self.last.optimistic = None;
        }
        held
    }

    pub fn unchoked(&self) -> &Unchoked {
        &self.last
    }

    /// Whether a slot is free, so an interested peer would not have to wait
    /// for the next round.
    pub fn has_free_slot(&self) -> bool {
        self.last.len() < self.max_uploads
    }

    /// Run a round. `advance` is false for the extra rounds run between
    /// periods, which do not count towards the optimistic rotation.
    pub fn rechoke(&mut self, candidates: &[Candidate], seeding: bool, advance: bool) -> &Unchoked {
        if advance {
            self.round += 1;
            let period = self.optimistic_rounds * if seeding { 3 } else { 1 };
            if self.round % period == 0 && !self.order.is_empty() {
                let head = self.order.remove(0);
                self.order.push(head);
            }
        }

        let mut ranked: Vec<&Candidate> = candidates.iter().filter(|c| c.interested).collect();
        ranked.sort_by(|a, b| {
            a.snubbed.cmp(&b.snubbed).then(b.rate.total_cmp(&a.rate))
        });

        let preferred: Vec<ConnectionId> =
            ranked.iter().take(self.max_uploads - 1).map(|c| c.id).collect();

        let optimistic = self.order.iter().copied().find(|id| {
            !preferred.contains(id) && candidates.iter().any(|c| c.id == *id && c.interested)
        });

        debug!("rechoke: {} preferred, optimistic {optimistic:?}", preferred.len());
        self.last = Unchoked { preferred, optimistic };
        &self.last
    }
}

#[cfg(test)]
mod tests {
    use slotmap::SlotMap;

    use super::*;

    fn ids(n: usize) -> Vec<ConnectionId> {
        let mut sm = SlotMap::<ConnectionId, ()>::with_key();
        (0..n).map(|_| sm.insert(())).collect()
    }

    fn cand(id: ConnectionId, rate: f64) -> Candidate {
        Candidate { id, interested: true, snubbed: false, rate }
    }

    #[test]
    fn preferred_slots_match_interested_count() {
        for n in 0..10 {
            let ids = ids(n);
            let mut choker = Choker::new(4, 3);
            for &id in &ids {
                choker.connection_made(id);
            }
            let candidates: Vec<_> =
                ids.iter().enumerate().map(|(i, &id)| cand(id, i as f64)).collect();
            let round = choker.rechoke(&candidates, false, true);
            assert_eq!(round.preferred.len(), 3.min(n));
            assert_eq!(round.optimistic.is_some(), n > 3);
        }
    }

    #[test]
    fn fastest_win_and_snubbed_rank_last() {
        let ids = ids(5);
        let mut choker = Choker::new(3, 3);
        for &id in &ids {
            choker.connection_made(id);
        }
        let mut candidates: Vec<_> =
            ids.iter().enumerate().map(|(i, &id)| cand(id, i as f64 * 10.0)).collect();
        candidates[4].snubbed = true;
        candidates[0].interested = false;

        let round = choker.rechoke(&candidates, false, true).clone();
        assert_eq!(round.preferred, vec![ids[3], ids[2]]);
        let opt = round.optimistic.unwrap();
        assert!(opt == ids[1] || opt == ids[4]);
        assert!(!round.contains(ids[0]));
    }

    #[test]
    fn optimistic_rotates_every_period() {
        let ids = ids(4);
        let mut choker = Choker::new(2, 3);
        for &id in &ids {
            choker.connection_made(id);
        }
        // rates make the preferred slot fixed
        let candidates: Vec<_> = ids
            .iter()
            .enumerate()
            .map(|(i, &id)| cand(id, if i == 0 { 100.0 } else { 0.0 }))
            .collect();

        let first = choker.rechoke(&candidates, false, true).optimistic;
        let second = choker.rechoke(&candidates, false, true).optimistic;
        assert_eq!(first, second);
        let third = choker.rechoke(&candidates, false, true).optimistic;
        let fourth = choker.rechoke(&candidates, false, true).optimistic;
        assert_eq!(third, fourth);

        // across a full cycle every choked peer gets a turn
        let mut seen = HashSet::new();
        for _ in 0..9 {
            if let Some(id) = choker.rechoke(&candidates, false, true).optimistic {
                seen.insert(id);
            }
        }
        assert_eq!(seen.len(), 3);
        assert!(!seen.contains(&ids[0]));
    }

    #[test]
    fn lost_connection_frees_its_slot() {
        let ids = ids(2);
        let mut choker = Choker::new(4, 3);
        choker.connection_made(ids[0]);
        choker.connection_made(ids[1]);
        choker.rechoke(&[cand(ids[0], 1.0)], false, true);
        assert!(choker.connection_lost(ids[0]));
        assert!(!choker.connection_lost(ids[1]));
        assert!(choker.has_free_slot());
    }
}
