//! A library for the BitTorrent protocol V1, peer side and tracker side.
//!
//! This is the library behind the `cinder` binary, which uses it to
//! download, seed and track torrents.
//!
//! The peer side is a tree of actors. The [daemon] owns the listening
//! socket and spawns one [torrent] per metafile. A torrent owns storage,
//! the piece picker and the choker, and talks to its peer connections and
//! its trackers through channels.
//!
//! The tracker side is the [tracker_server], an HTTP tracker with
//! scrape, NAT checking and an on-disk state file.
//!
//! # Example
//!
//! Downloading a torrent with just the daemon:
//!
//! ```no_run
//! use cinder::{config::Config, daemon::Daemon, metainfo::MetaInfo};
//!
//! # async fn run() -> Result<(), cinder::error::Error> {
//! let daemon = Daemon::bind(Config::load()?).await?;
//! let handle = daemon.handle();
//! tokio::spawn(daemon.run());
//!
//! let meta = MetaInfo::read("debian.torrent".as_ref())?;
//! let mut torrent = handle.add_torrent(meta, false).await?;
//! torrent.wait_for(|s| s.left == 0).await?;
//! handle.quit().await?;
//! # Ok(())
//! # }
//! ```

pub mod addr;
pub mod bencode;
pub mod bitfield;
pub mod choker;
pub mod config;
pub mod counter;
pub mod crypto;
pub mod daemon;
pub mod encoder;
pub mod error;
pub mod metainfo;
pub mod peer;
pub mod picker;
pub mod ratelimiter;
pub mod sched;
pub mod storage;
pub mod tcp_wire;
pub mod torrent;
pub mod tracker;
pub mod tracker_server;
pub mod utils;
