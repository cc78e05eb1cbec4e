use std::{fmt::Display, net::SocketAddr, ops::Deref};

use tokio::sync::oneshot;

use crate::{
    error::Error,
    peer::{ConnectionId, Handshaked, PeerAddr},
    picker::Priority,
    tcp_wire::{BlockInfo, Message},
};

/// Messages used to control the torrent or report what happened to its
/// connections. Every protocol state change passes through here.
#[derive(Debug)]
pub enum TorrentMsg {
    /// A handshake finished, the torrent takes the stream over.
    Connected(Box<Handshaked>),

    /// An outbound dial failed before or during the handshake.
    DialFailed(SocketAddr),

    /// A frame read from a connection.
    Incoming(ConnectionId, Message),

    /// The writer finished sending a PIECE.
    PieceSent(ConnectionId, BlockInfo),

    /// PIECEs thrown away by a choke or a cancel before they started.
    PiecesDropped(ConnectionId, Vec<BlockInfo>),

    /// The reader or the writer of a connection stopped.
    Closed(ConnectionId, Error),

    /// Peers from an announce, to be dialed.
    AddPeers(Vec<PeerAddr>),

    /// Swarm numbers from the last successful announce.
    TrackerStats(Stats),

    /// Every tracker failed in one announce cycle.
    TrackerError(String),

    SetFilePriority(usize, Priority),

    GetState(oneshot::Sender<TorrentState>),

    /// Choke and close every connection, flush storage and stop.
    Quit,
}

/// Numbers sent on every announce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnnounceData {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash(pub [u8; 20]);

impl Display for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "InfoHash({self})")
    }
}

impl Deref for InfoHash {
    type Target = [u8; 20];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<[u8; 20]> for InfoHash {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

impl From<InfoHash> for [u8; 20] {
    fn from(value: InfoHash) -> Self {
        value.0
    }
}

impl TryFrom<&[u8]> for InfoHash {
    type Error = Error;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let buf: [u8; 20] = value.try_into().map_err(|_| Error::InfoHashInvalid)?;
        Ok(Self(buf))
    }
}

impl TryFrom<Vec<u8>> for InfoHash {
    type Error = Error;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        Self::try_from(value.as_slice())
    }
}

impl std::str::FromStr for InfoHash {
    type Err = Error;

    /// Parse the 40 character hex form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let buf = hex::decode(s).map_err(|_| Error::InfoHashInvalid)?;
        Self::try_from(buf)
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub enum TorrentStatus {
    /// Files are being created on disk.
    Allocating,
    /// Hashing data already on disk.
    #[default]
    Checking,
    Downloading,
    Seeding,
    Stopped,
    /// Storage failed, the torrent no longer transfers data.
    Error(String),
}

impl From<&TorrentStatus> for &str {
    fn from(val: &TorrentStatus) -> Self {
        use TorrentStatus::*;
        match val {
            Allocating => "Allocating",
            Checking => "Checking",
            Downloading => "Downloading",
            Seeding => "Seeding",
            Stopped => "Stopped",
            Error(_) => "Error",
        }
    }
}

/// State of a torrent, published every second to whoever owns it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TorrentState {
    pub name: String,
    pub info_hash: InfoHash,
    pub status: TorrentStatus,
    pub stats: Stats,
    pub size: u64,
    pub downloaded: u64,
    pub uploaded: u64,
    pub left: u64,
    pub download_rate: f64,
    pub upload_rate: f64,
    pub peers: usize,
    pub seeds: usize,
    pub distributed_copies: f64,
    /// 0.0 to 1.0
    pub alloc_progress: f64,
    /// 0.0 to 1.0
    pub check_progress: f64,
    pub tracker_error: Option<String>,
}

/// Swarm numbers returned by the tracker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Stats {
    pub interval: u32,
    pub leechers: u32,
    pub seeders: u32,
}
