//! Super-seeding: a seed that hides its bitfield and hands each peer one
//! piece at a time.
//!
//! Every peer is offered a single piece with a HAVE, chosen among the
//! least offered pieces it lacks. The next offer comes once the piece
//! shows up in the swarm, either because the peer announced it or because
//! some other peer got it from the peer. Requests for pieces a peer was
//! not offered are ignored. Upload slots rotate round robin among
//! interested peers, rates do not matter.
use hashbrown::HashMap;
use tracing::debug;

use super::{Candidate, Unchoked};
use crate::{bitfield::Bitfield, peer::ConnectionId, picker::Picker};

#[derive(Debug)]
pub struct SuperSeeder {
    /// Pieces advertised to each peer, the last one is outstanding.
    offered: HashMap<ConnectionId, Vec<usize>>,
    times_offered: Vec<u32>,
    order: Vec<ConnectionId>,
    max_uploads: usize,
}

impl SuperSeeder {
    pub fn new(pieces: usize, max_uploads: usize) -> Self {
        Self {
            offered: HashMap::new(),
            times_offered: vec![0; pieces],
            order: Vec::new(),
            max_uploads: max_uploads.max(1),
        }
    }

    pub fn connection_made(&mut self, id: ConnectionId) {
        self.order.push(id);
        self.offered.insert(id, Vec::new());
    }

    pub fn connection_lost(&mut self, id: ConnectionId) {
        self.order.retain(|&c| c != id);
        self.offered.remove(&id);
    }

    /// Pick the next piece to advertise to `id`: one it lacks, not offered
    /// to it before, offered the fewest times overall, rarest in the swarm
    /// on a tie. The caller sends the HAVE.
    pub fn next_offer(&mut self, id: ConnectionId, peer_have: &Bitfield, picker: &Picker) -> Option<usize> {
        let offered = self.offered.get(&id)?;
        let index = (0..self.times_offered.len())
            .filter(|&i| !peer_have.get(i) && !offered.contains(&i))
            .min_by_key(|&i| (self.times_offered[i], picker.count(i), i))?;

        self.times_offered[index] += 1;
        self.offered.entry(id).or_default().push(index);
        debug!("super-seed: offering piece {index} to {id:?}");
        Some(index)
    }

    /// A peer announced a piece. Returns the peers whose outstanding offer
    /// was that piece: the announcer itself, or whoever passed it on.
    pub fn got_have(&self, index: usize) -> Vec<ConnectionId> {
        self.offered
            .iter()
            .filter(|(_, offered)| offered.last() == Some(&index))
            .map(|(&peer, _)| peer)
            .collect()
    }

    /// Whether a REQUEST for `index` from `id` gets served.
    pub fn may_serve(&self, id: ConnectionId, index: usize) -> bool {
        self.offered.get(&id).is_some_and(|o| o.contains(&index))
    }

    /// Round-robin the upload slots among interested peers. The order
    /// moves by one each round.
    pub fn rechoke(&mut self, candidates: &[Candidate]) -> Unchoked {
        if !self.order.is_empty() {
            self.order.rotate_left(1);
        }
        let preferred = self
            .order
            .iter()
            .copied()
            .filter(|id| candidates.iter().any(|c| c.id == *id && c.interested))
            .take(self.max_uploads)
            .collect();
        Unchoked { preferred, optimistic: None }
    }
}
