//! A tracker is a server that manages peers and stats of multiple torrents.
//!
//! One [`Announcer`] exists per tracker URL and is shared by every torrent
//! of the process through the [`AnnouncerPool`]. Its mutex serializes
//! announces, so a tracker never sees two requests in flight from us.
pub mod action;
pub mod announce;
pub mod connect;
pub mod event;
pub mod http;
pub mod reannounce;
pub mod udp;

pub use event::Event;
pub use reannounce::{Reannouncer, TrackerMsg};

use std::{sync::Arc, time::Duration};

use hashbrown::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    crypto::CryptoPolicy,
    error::Error,
    peer::{PeerAddr, PeerId},
    torrent::{InfoHash, Stats},
};

/// Why an announce failed, as reported to the user once every tier
/// failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackerFailure {
    /// The tracker answered with a `failure reason`.
    #[error("rejected by the tracker: {0}")]
    Rejected(String),

    /// The tracker answered with something we could not read.
    #[error("bad data from the tracker: {0}")]
    BadData(String),

    /// Could not reach the tracker, or it answered with an HTTP error.
    #[error("problem connecting to the tracker: {0}")]
    Trouble(String),
}

/// What is sent on every announce.
#[derive(Debug, Clone, Copy)]
pub struct AnnounceRequest {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Event,
    /// Random per torrent, lets the tracker recognize us if our IP changes.
    pub key: u32,
    pub numwant: u32,
    pub crypto: CryptoPolicy,
}

/// A successful announce.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnnounceResponse {
    pub interval: u32,
    pub min_interval: Option<u32>,
    pub complete: u32,
    pub incomplete: u32,
    pub peers: Vec<PeerAddr>,
    pub warning: Option<String>,
}

impl AnnounceResponse {
    pub fn stats(&self) -> Stats {
        Stats { interval: self.interval, leechers: self.incomplete, seeders: self.complete }
    }
}

/// A tracker, dispatched on the URL scheme.
#[derive(Debug)]
pub enum Announcer {
    Http(http::HttpAnnouncer),
    Udp(udp::UdpAnnouncer),
}

impl Announcer {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, Error> {
        match url.split_once("://").map(|(scheme, _)| scheme.to_ascii_lowercase()) {
            Some(s) if s == "http" || s == "https" => {
                Ok(Self::Http(http::HttpAnnouncer::new(url, timeout)?))
            }
            Some(s) if s == "udp" => Ok(Self::Udp(udp::UdpAnnouncer::new(url, timeout)?)),
            _ => Err(Error::TrackerUrlInvalid(url.to_string())),
        }
    }

    pub async fn announce(&mut self, req: &AnnounceRequest) -> Result<AnnounceResponse, TrackerFailure> {
        match self {
            Self::Http(t) => t.announce(req).await,
            Self::Udp(t) => t.announce(req).await,
        }
    }

    /// Where the next announce goes, after redirects.
    pub fn url(&self) -> String {
        match self {
            Self::Http(t) => t.url().to_string(),
            Self::Udp(t) => t.url().to_string(),
        }
    }
}

/// Announcers shared by the torrents of one client, keyed by URL.
#[derive(Debug)]
pub struct AnnouncerPool {
    timeout: Duration,
    announcers: std::sync::Mutex<HashMap<String, Arc<Mutex<Announcer>>>>,
}

impl AnnouncerPool {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout, announcers: std::sync::Mutex::new(HashMap::new()) }
    }

    pub fn get(&self, url: &str) -> Result<Arc<Mutex<Announcer>>, Error> {
        let mut announcers = self.announcers.lock().map_err(|_| Error::PoisonedLock)?;
        if let Some(a) = announcers.get(url) {
            return Ok(a.clone());
        }
        debug!("new announcer for {url}");
        let a = Arc::new(Mutex::new(Announcer::new(url, self.timeout)?));
        announcers.insert(url.to_string(), a.clone());
        Ok(a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_dispatch() {
        let t = Duration::from_secs(5);
        assert!(matches!(Announcer::new("http://t/announce", t), Ok(Announcer::Http(_))));
        assert!(matches!(Announcer::new("HTTPS://t/announce", t), Ok(Announcer::Http(_))));
        assert!(matches!(Announcer::new("udp://t:80/announce", t), Ok(Announcer::Udp(_))));
        assert!(matches!(Announcer::new("wss://t", t), Err(Error::TrackerUrlInvalid(_))));
    }

    #[test]
    fn pool_shares_announcers() {
        let pool = AnnouncerPool::new(Duration::from_secs(5));
        let a = pool.get("http://t/announce").unwrap();
        let b = pool.get("http://t/announce").unwrap();
        let c = pool.get("http://u/announce").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
