//! The announce schedule of one torrent.
//!
//! Tiers are tried in order and trackers within a tier in a shuffled
//! order; the first tracker to answer moves to the front of its tier. The
//! torrent publishes its transfer totals on a watch channel, so an
//! announce never has to wait on the torrent's mailbox.
use std::{sync::Arc, time::Duration};

use rand::seq::SliceRandom;
use tokio::{
    select,
    sync::{mpsc, oneshot, watch},
    time::{sleep_until, timeout, Instant},
};
use tracing::{debug, info, warn};

use super::{AnnounceRequest, AnnounceResponse, AnnouncerPool, Event, TrackerFailure};
use crate::torrent::{AnnounceData, TorrentMsg};

/// Delay between attempts until one announce got through.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// Budget of the `stopped` announce.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Lower bound for whatever interval a tracker asks for.
const MIN_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum TrackerMsg {
    /// The last piece was verified.
    Completed,
    /// Send `stopped` with the final numbers, then ack and return.
    Stop { data: AnnounceData, ack: oneshot::Sender<()> },
}

#[derive(Debug)]
pub struct Reannouncer {
    tiers: Vec<Vec<String>>,
    pool: Arc<AnnouncerPool>,
    /// Everything but the event and the transfer numbers.
    base: AnnounceRequest,
    data: watch::Receiver<AnnounceData>,
    torrent_tx: mpsc::Sender<TorrentMsg>,
    rx: mpsc::Receiver<TrackerMsg>,
    /// Whether any announce succeeded so far.
    announced: bool,
    /// Delay asked for by the last tracker that answered.
    interval: Duration,
}

impl Reannouncer {
    pub fn new(
        mut tiers: Vec<Vec<String>>,
        pool: Arc<AnnouncerPool>,
        base: AnnounceRequest,
        data: watch::Receiver<AnnounceData>,
        torrent_tx: mpsc::Sender<TorrentMsg>,
        rx: mpsc::Receiver<TrackerMsg>,
    ) -> Self {
        let mut rng = rand::thread_rng();
        for tier in &mut tiers {
            tier.shuffle(&mut rng);
        }
        tiers.retain(|t| !t.is_empty());
        Self {
            tiers,
            pool,
            base,
            data,
            torrent_tx,
            rx,
            announced: false,
            interval: RETRY_INTERVAL,
        }
    }

    #[tracing::instrument(name = "reannouncer", skip_all, fields(info_hash = %self.base.info_hash))]
    pub async fn run(mut self) {
        let mut event = Event::Started;
        let mut next = Instant::now();

        loop {
            select! {
                _ = sleep_until(next) => {
                    let data = *self.data.borrow();
                    let delay = match self.announce(event, data).await {
                        Ok(res) => {
                            self.interval = next_delay(&res);
                            self.deliver(res);
                            self.announced = true;
                            event = Event::None;
                            self.interval
                        }
                        Err(e) => {
                            let _ = self.torrent_tx.try_send(TorrentMsg::TrackerError(e.to_string()));
                            if self.announced { self.interval } else { RETRY_INTERVAL }
                        }
                    };
                    debug!("next announce in {delay:?}");
                    next = Instant::now() + delay;
                }
                msg = self.rx.recv() => match msg {
                    Some(TrackerMsg::Completed) => {
                        // a tracker that never heard `started` gets that first
                        if self.announced {
                            event = Event::Completed;
                        }
                        next = Instant::now();
                    }
                    Some(TrackerMsg::Stop { data, ack }) => {
                        if self.announced {
                            match timeout(STOP_TIMEOUT, self.announce(Event::Stopped, data)).await {
                                Ok(Ok(_)) => info!("announced stopped"),
                                Ok(Err(e)) => debug!("stopped announce failed: {e}"),
                                Err(_) => debug!("stopped announce timed out"),
                            }
                        }
                        let _ = ack.send(());
                        return;
                    }
                    None => return,
                }
            }
        }
    }

    /// Hand the peers, shuffled, and the swarm numbers to the torrent.
    fn deliver(&self, res: AnnounceResponse) {
        let stats = res.stats();
        let mut peers = res.peers;
        peers.shuffle(&mut rand::thread_rng());
        let _ = self.torrent_tx.try_send(TorrentMsg::TrackerStats(stats));
        if !peers.is_empty() && self.torrent_tx.try_send(TorrentMsg::AddPeers(peers)).is_err() {
            debug!("torrent is busy, dropping announced peers");
        }
    }

    /// One announce cycle over every tier. On total failure the error of
    /// the first tracker tried is returned.
    async fn announce(&mut self, event: Event, data: AnnounceData) -> Result<AnnounceResponse, TrackerFailure> {
        let req = AnnounceRequest {
            event,
            uploaded: data.uploaded,
            downloaded: data.downloaded,
            left: data.left,
            ..self.base
        };
        let mut first_err = None;

        for tier in self.tiers.iter_mut() {
            for i in 0..tier.len() {
                let announcer = match self.pool.get(&tier[i]) {
                    Ok(a) => a,
                    Err(e) => {
                        warn!("skipping tracker {}: {e}", tier[i]);
                        first_err.get_or_insert(TrackerFailure::Trouble(e.to_string()));
                        continue;
                    }
                };
                let res = announcer.lock().await.announce(&req).await;
                match res {
                    Ok(res) => {
                        let url = tier.remove(i);
                        debug!("announced {event:?} to {url}");
                        tier.insert(0, url);
                        return Ok(res);
                    }
                    Err(e) => {
                        warn!("announce to {} failed: {e}", tier[i]);
                        first_err.get_or_insert(e);
                    }
                }
            }
        }

        Err(first_err.unwrap_or_else(|| TrackerFailure::Trouble("no trackers".into())))
    }
}

/// The tracker's interval, raised to its `min interval`.
fn next_delay(res: &AnnounceResponse) -> Duration {
    let secs = res.interval.max(res.min_interval.unwrap_or(0));
    Duration::from_secs(secs.into()).max(MIN_DELAY)
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;
    use crate::{crypto::CryptoPolicy, peer::PeerId, torrent::InfoHash};

    fn base() -> AnnounceRequest {
        AnnounceRequest {
            info_hash: InfoHash([1; 20]),
            peer_id: PeerId([2; 20]),
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 0,
            event: Event::None,
            key: 0,
            numwant: 50,
            crypto: CryptoPolicy::default(),
        }
    }

    /// Answers every request with `body`, returns the announce URL.
    async fn http_tracker(body: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut s, _) = listener.accept().await.unwrap();
                let mut buf = vec![0u8; 4096];
                let _ = s.read(&mut buf).await;
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = s.write_all(head.as_bytes()).await;
                let _ = s.write_all(body).await;
            }
        });
        format!("http://{addr}/announce")
    }

    async fn dead_tracker() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{addr}/announce")
    }

    struct Harness {
        torrent_rx: mpsc::Receiver<TorrentMsg>,
        _tx: mpsc::Sender<TrackerMsg>,
        _data_tx: watch::Sender<AnnounceData>,
    }

    fn reannouncer(tiers: Vec<Vec<String>>) -> (Reannouncer, Harness) {
        let (torrent_tx, torrent_rx) = mpsc::channel(16);
        let (_tx, rx) = mpsc::channel(1);
        let (_data_tx, data) = watch::channel(AnnounceData::default());
        let pool = Arc::new(AnnouncerPool::new(Duration::from_secs(2)));
        let r = Reannouncer::new(tiers, pool, base(), data, torrent_tx, rx);
        (r, Harness { torrent_rx, _tx, _data_tx })
    }

    #[tokio::test]
    async fn falls_through_tiers_and_promotes_the_winner() {
        let dead = dead_tracker().await;
        let good = http_tracker(b"d8:intervali900e5:peers6:\x0a\x00\x00\x01\x1a\xe1e").await;
        let (mut r, _rx) = reannouncer(vec![vec![dead.clone()], vec![dead.clone(), good.clone()]]);

        let res = r.announce(Event::Started, AnnounceData::default()).await.unwrap();
        assert_eq!(res.peers.len(), 1);
        assert_eq!(r.tiers[1][0], good);
        assert_eq!(next_delay(&res), Duration::from_secs(900));
    }

    #[tokio::test]
    async fn reports_the_first_error_when_every_tier_fails() {
        let rejecting = http_tracker(b"d14:failure reason6:bannede").await;
        let dead = dead_tracker().await;
        let (mut r, _rx) = reannouncer(vec![vec![rejecting], vec![dead]]);

        let err = r.announce(Event::None, AnnounceData::default()).await.unwrap_err();
        assert_eq!(err, TrackerFailure::Rejected("banned".into()));
    }

    #[tokio::test]
    async fn run_delivers_peers_and_stats() {
        let good = http_tracker(b"d8:completei5e10:incompletei2e8:intervali900e5:peers6:\x0a\x00\x00\x01\x1a\xe1e").await;
        let (r, mut h) = reannouncer(vec![vec![good]]);
        tokio::spawn(r.run());

        let mut got_stats = false;
        let mut got_peers = false;
        while !(got_stats && got_peers) {
            match h.torrent_rx.recv().await.unwrap() {
                TorrentMsg::TrackerStats(s) => {
                    assert_eq!(s.seeders, 5);
                    got_stats = true;
                }
                TorrentMsg::AddPeers(p) => {
                    assert_eq!(p.len(), 1);
                    got_peers = true;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn min_interval_is_a_floor() {
        let res = AnnounceResponse { interval: 60, min_interval: Some(300), ..Default::default() };
        assert_eq!(next_delay(&res), Duration::from_secs(300));
        let res = AnnounceResponse { interval: 0, ..Default::default() };
        assert_eq!(next_delay(&res), MIN_DELAY);
    }
}
