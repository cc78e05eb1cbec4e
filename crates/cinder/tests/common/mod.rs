#![allow(dead_code)]

use cinder::{
    bencode::{self, Value},
    config::Config,
    daemon::{Daemon, DaemonHandle},
    metainfo::MetaInfo,
};

/// Bytes that differ from piece to piece, so a misplaced block fails its
/// hash.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

/// A single file metafile without trackers.
pub fn metainfo(name: &str, payload: &[u8], piece_length: u32) -> MetaInfo {
    let pieces: Vec<u8> = payload
        .chunks(piece_length as usize)
        .flat_map(|c| sha1_smol::Sha1::from(c).digest().bytes())
        .collect();

    let mut info = Value::dict();
    info.insert(b"length", payload.len() as u64);
    info.insert(b"name", name);
    info.insert(b"piece length", piece_length);
    info.insert(b"pieces", pieces);

    let mut root = Value::dict();
    root.insert(b"announce", "");
    root.insert(b"info", info);
    MetaInfo::from_bytes(&bencode::encode(&root)).unwrap()
}

/// Log to the test output, filtered by `RUST_LOG`.
pub fn tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub async fn daemon(config: Config) -> DaemonHandle {
    tracing();
    let daemon = Daemon::bind(config).await.unwrap();
    let handle = daemon.handle();
    tokio::spawn(daemon.run());
    handle
}
