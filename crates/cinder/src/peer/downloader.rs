//! Download side of one connection.
//!
//! Keeps `backlog` requests in flight, where the backlog grows with the
//! measured rate so the pipeline covers `request_backlog_period` seconds of
//! transfer, capped at `max_backlog`. A peer that holds our requests for
//! `snub_time` without delivering is snubbed: its requests go back to the
//! pool and it keeps a single probe request until it delivers again.
use std::time::Duration;

use tokio::time::Instant;

use crate::{
    bitfield::Bitfield,
    config::Config,
    counter::Measure,
    picker::Picker,
    storage::StorageWrapper,
    tcp_wire::{BlockInfo, BLOCK_LEN},
};

#[derive(Debug)]
pub struct Downloader {
    /// Requests sent and not answered, oldest first.
    active: Vec<BlockInfo>,
    measure: Measure,
    last_block: Instant,
    pub snubbed: bool,
    /// Bytes this peer contributed to pieces that failed their hash.
    pub flunked: u64,
}

impl Downloader {
    pub fn new(max_rate_period: f64) -> Self {
        Self {
            active: Vec::new(),
            measure: Measure::new(max_rate_period),
            last_block: Instant::now(),
            snubbed: false,
            flunked: 0,
        }
    }

    pub fn active(&self) -> &[BlockInfo] {
        &self.active
    }

    pub fn has_requested(&self, info: &BlockInfo) -> bool {
        self.active.contains(info)
    }

    pub fn rate(&mut self) -> f64 {
        self.measure.rate()
    }

    pub fn rate_noupdate(&self) -> f64 {
        self.measure.rate_noupdate()
    }

    pub fn total(&self) -> u64 {
        self.measure.total()
    }

    /// How many requests to keep in flight.
    pub fn backlog(&self, max_backlog: usize, period: f64) -> usize {
        if self.snubbed {
            return 1;
        }
        let in_flight = self.measure.rate_noupdate() * period / BLOCK_LEN as f64;
        (2 + in_flight as usize).min(max_backlog)
    }

    /// Top up the pipeline from the picker, and in endgame with blocks
    /// other peers are already fetching. The returned requests are already
    /// registered with storage and the picker.
    pub fn fill(
        &mut self,
        have: &Bitfield,
        storage: &mut StorageWrapper,
        picker: &mut Picker,
        config: &Config,
    ) -> Vec<BlockInfo> {
        let backlog = self.backlog(config.max_backlog, config.request_backlog_period);
        if self.active.is_empty() {
            // the snub clock runs only while something is outstanding
            self.last_block = Instant::now();
        }

        let mut out = Vec::new();
        while self.active.len() < backlog {
            let Some(index) = picker.next(have, |i| storage.do_i_have_requests(i)) else {
                break;
            };
            let Some(block) = storage.new_request(index) else { break };
            picker.requested(index);
            self.active.push(block);
            out.push(block);
        }

        if self.active.len() < backlog && picker.is_endgame() {
            for index in have.iter_ones() {
                if index >= picker.len() || storage.is_have(index) {
                    continue;
                }
                for block in storage.active_requests(index) {
                    if self.active.len() >= backlog {
                        return out;
                    }
                    if !self.active.contains(&block) {
                        self.active.push(block);
                        out.push(block);
                    }
                }
            }
        }
        out
    }

    /// A PIECE arrived. Returns false when it answers nothing we asked
    /// for, like a block cancelled in endgame.
    pub fn got_piece(&mut self, info: &BlockInfo) -> bool {
        let Some(pos) = self.active.iter().position(|b| b == info) else {
            return false;
        };
        self.active.remove(pos);
        self.measure.update(info.len as u64);
        self.last_block = Instant::now();
        self.snubbed = false;
        true
    }

    /// Forget one request, when another peer delivered it first.
    pub fn cancel(&mut self, info: &BlockInfo) -> bool {
        let before = self.active.len();
        self.active.retain(|b| b != info);
        before != self.active.len()
    }

    /// Forget every outstanding request, on choke, snub or disconnect. The
    /// caller puts them back in storage.
    pub fn take_requests(&mut self) -> Vec<BlockInfo> {
        std::mem::take(&mut self.active)
    }

    /// Mark the peer as snubbed once it sat on our requests for too long.
    /// Returns true on the transition.
    pub fn check_snub(&mut self, peer_choking: bool, snub_time: Duration) -> bool {
        if self.snubbed || peer_choking || self.active.is_empty() {
            return false;
        }
        if self.last_block.elapsed() < snub_time {
            return false;
        }
        self.snubbed = true;
        true
    }

    /// Credit bytes of a piece that failed its hash. Returns true once the
    /// peer went past `threshold` and should be kicked.
    pub fn flunk(&mut self, bytes: u64, threshold: u64) -> bool {
        self.flunked += bytes;
        self.flunked > threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::tests::single_file;

    const PIECE: u32 = 2 * BLOCK_LEN;

    fn setup(pieces: usize) -> (tempfile::TempDir, Config, StorageWrapper, Picker) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_test(dir.path());
        let payload = vec![7u8; pieces * PIECE as usize];
        let meta = single_file("dl.bin", &payload, PIECE);
        let storage = StorageWrapper::new(&meta.info, &config);
        let picker = Picker::new(pieces, 0);
        (dir, config, storage, picker)
    }

    #[test]
    fn backlog_follows_rate() {
        let mut d = Downloader::new(20.0);
        assert_eq!(d.backlog(10, 3.0), 2);
        d.snubbed = true;
        assert_eq!(d.backlog(10, 3.0), 1);
    }

    #[tokio::test]
    async fn fill_stops_at_backlog() {
        let (_dir, config, mut storage, mut picker) = setup(4);
        let have = Bitfield::full(4);
        picker.got_bitfield(&have);

        let mut d = Downloader::new(config.max_rate_period);
        let sent = d.fill(&have, &mut storage, &mut picker, &config);
        assert_eq!(sent.len(), 2);
        // the started piece is finished first
        assert!(sent.iter().all(|b| b.index == sent[0].index));
        assert!(d.fill(&have, &mut storage, &mut picker, &config).is_empty());

        assert!(d.got_piece(&sent[0]));
        assert!(!d.got_piece(&sent[0]));
        // one block delivered in about a second deepens the pipeline
        let more = d.fill(&have, &mut storage, &mut picker, &config);
        assert!(more.len() > 1);
        assert_eq!(d.active().len(), d.backlog(config.max_backlog, config.request_backlog_period));
    }

    #[tokio::test]
    async fn endgame_duplicates_outstanding_blocks() {
        let (_dir, config, mut storage, mut picker) = setup(1);
        let have = Bitfield::full(1);
        picker.got_bitfield(&have);
        picker.got_bitfield(&have);

        let mut a = Downloader::new(config.max_rate_period);
        let mut b = Downloader::new(config.max_rate_period);
        let first = a.fill(&have, &mut storage, &mut picker, &config);
        assert_eq!(first.len(), 2);
        assert!(picker.is_endgame());

        let second = b.fill(&have, &mut storage, &mut picker, &config);
        assert_eq!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn snub_after_silence() {
        let (_dir, config, mut storage, mut picker) = setup(2);
        let have = Bitfield::full(2);
        picker.got_bitfield(&have);

        let mut d = Downloader::new(config.max_rate_period);
        let sent = d.fill(&have, &mut storage, &mut picker, &config);
        assert!(!d.check_snub(false, config.snub()));

        tokio::time::advance(config.snub() + Duration::from_secs(1)).await;
        // choked peers are not expected to deliver
        assert!(!d.check_snub(true, config.snub()));
        assert!(d.check_snub(false, config.snub()));
        assert!(!d.check_snub(false, config.snub()));
        assert_eq!(d.backlog(config.max_backlog, 3.0), 1);

        for b in d.take_requests() {
            storage.request_lost(&b);
        }
        assert!(storage.do_i_have_requests(sent[0].index as usize));

        let probe = d.fill(&have, &mut storage, &mut picker, &config);
        assert_eq!(probe.len(), 1);
        assert!(d.got_piece(&probe[0]));
        assert!(!d.snubbed);
    }

    #[test]
    fn flunk_threshold() {
        let mut d = Downloader::new(20.0);
        assert!(!d.flunk(BLOCK_LEN as u64, 100 * 1024));
        assert!(!d.flunk(5 * BLOCK_LEN as u64, 100 * 1024));
        assert!(d.flunk(BLOCK_LEN as u64, 100 * 1024));
    }
}
