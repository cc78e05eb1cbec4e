use std::{path::Path, time::Duration};

use bytes::Bytes;
use cinder::{
    bitfield::Bitfield,
    config::Config,
    daemon::DaemonHandle,
    metainfo::MetaInfo,
    peer::PeerId,
    tcp_wire::{Block, Handshake, HandshakeCodec, Message, MessageCodec},
    torrent::{InfoHash, TorrentHandle, TorrentStatus},
};
use futures::{SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    spawn,
    time::timeout,
};
use tokio_util::codec::{Framed, FramedParts};

mod common;
use common::{daemon, metainfo, payload};

const LIMIT: Duration = Duration::from_secs(30);

/// A daemon seeding `data` as `name`.
async fn seeder(dir: &Path, config: Config, meta: &MetaInfo, data: &[u8]) -> (DaemonHandle, TorrentHandle) {
    std::fs::write(dir.join(&meta.info.name), data).unwrap();
    let seed = daemon(config).await;
    let mut torrent = seed.add_torrent(meta.clone(), true).await.unwrap();
    torrent.wait_for(|s| s.status == TorrentStatus::Seeding).await.unwrap();
    (seed, torrent)
}

async fn leecher(config: Config, meta: &MetaInfo) -> (DaemonHandle, TorrentHandle) {
    let leech = daemon(config).await;
    let mut torrent = leech.add_torrent(meta.clone(), false).await.unwrap();
    torrent.wait_for(|s| s.status == TorrentStatus::Downloading).await.unwrap();
    (leech, torrent)
}

#[tokio::test(flavor = "multi_thread")]
async fn two_peer_transfer() {
    let data = payload(1 << 20);
    let meta = metainfo("s1.bin", &data, 256 * 1024);
    let (seed_dir, leech_dir) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());

    let config = |dir: &Path| Config { max_uploads: 4, ..Config::load_test(dir) };
    let (seed, seeding) = seeder(seed_dir.path(), config(seed_dir.path()), &meta, &data).await;
    let (leech, mut leeching) = leecher(config(leech_dir.path()), &meta).await;

    leeching.add_peers(vec![seed.local_addr().into()]).await.unwrap();
    let done = timeout(LIMIT, leeching.wait_for(|s| s.left == 0)).await.unwrap().unwrap();

    assert_eq!(done.status, TorrentStatus::Seeding);
    assert_eq!(done.downloaded, data.len() as u64);
    assert_eq!(seeding.state().left, 0);

    leech.quit().await.unwrap();
    seed.quit().await.unwrap();
    assert_eq!(std::fs::read(leech_dir.path().join("s1.bin")).unwrap(), data);
}

#[tokio::test(flavor = "multi_thread")]
async fn obfuscated_transfer() {
    let data = payload(300_000);
    let meta = metainfo("s5.bin", &data, 64 * 1024);
    let (seed_dir, leech_dir) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());

    let config = |dir: &Path| Config { crypto_only: true, crypto_stealth: true, ..Config::load_test(dir) };
    let (seed, _seeding) = seeder(seed_dir.path(), config(seed_dir.path()), &meta, &data).await;
    let (leech, mut leeching) = leecher(config(leech_dir.path()), &meta).await;

    // a stealthy seed does not answer a plaintext handshake
    let socket = TcpStream::connect(seed.local_addr()).await.unwrap();
    let mut plain = Framed::new(socket, HandshakeCodec);
    plain.send(Handshake::new(meta.info.info_hash, PeerId([1; 20]))).await.unwrap();
    assert!(timeout(LIMIT, plain.next()).await.unwrap().is_none());

    leeching.add_peers(vec![seed.local_addr().into()]).await.unwrap();
    timeout(LIMIT, leeching.wait_for(|s| s.left == 0)).await.unwrap().unwrap();

    leech.quit().await.unwrap();
    seed.quit().await.unwrap();
    assert_eq!(std::fs::read(leech_dir.path().join("s5.bin")).unwrap(), data);
}

/// Answers every request with garbage until the other side hangs up.
/// Returns the bytes served.
async fn garbage_seed(listener: TcpListener, info_hash: InfoHash, pieces: usize) -> usize {
    let (socket, _) = listener.accept().await.unwrap();
    let mut socket = Framed::new(socket, HandshakeCodec);
    let theirs = socket.next().await.unwrap().unwrap();
    assert_eq!(theirs.info_hash, info_hash);
    socket.send(Handshake::new(info_hash, PeerId([9; 20]))).await.unwrap();

    let old = socket.into_parts();
    let mut parts = FramedParts::new(old.io, MessageCodec::default());
    parts.read_buf = old.read_buf;
    let mut socket = Framed::from_parts(parts);

    socket.send(Message::Bitfield(Bitfield::full(pieces).to_bytes().into())).await.unwrap();
    socket.send(Message::Unchoke).await.unwrap();

    let mut served = 0;
    while let Some(Ok(msg)) = socket.next().await {
        let Message::Request(info) = msg else { continue };
        let block = Block { index: info.index, begin: info.begin, block: Bytes::from(vec![0xee; info.len as usize]) };
        if socket.send(Message::Piece(block)).await.is_err() {
            break;
        }
        served += info.len as usize;
    }
    served
}

#[tokio::test(flavor = "multi_thread")]
async fn hash_failure_kicks_and_recovers() {
    let data = payload(4 * 32 * 1024);
    let meta = metainfo("s3.bin", &data, 32 * 1024);
    let (seed_dir, leech_dir) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());

    let config = Config { kick_threshold: 16 * 1024, ..Config::load_test(leech_dir.path()) };
    let (leech, mut leeching) = leecher(config, &meta).await;

    // the offender is banned by IP, so it lives on another loopback address
    let listener = TcpListener::bind("127.0.0.2:0").await.unwrap();
    let bad = listener.local_addr().unwrap();
    let garbage = spawn(garbage_seed(listener, meta.info.info_hash, meta.info.pieces()));
    leeching.add_peers(vec![bad.into()]).await.unwrap();

    let served = timeout(LIMIT, garbage).await.unwrap().unwrap();
    assert!(served >= 32 * 1024);
    let state = leeching.fetch_state().await.unwrap();
    assert_eq!(state.left, data.len() as u64);
    assert_eq!(state.peers, 0);

    // the pieces went back to the pool and come from an honest seed
    let (seed, _seeding) = seeder(seed_dir.path(), Config::load_test(seed_dir.path()), &meta, &data).await;
    leeching.add_peers(vec![seed.local_addr().into(), bad.into()]).await.unwrap();
    timeout(LIMIT, leeching.wait_for(|s| s.left == 0)).await.unwrap().unwrap();

    leech.quit().await.unwrap();
    seed.quit().await.unwrap();
    assert_eq!(std::fs::read(leech_dir.path().join("s3.bin")).unwrap(), data);
}

#[tokio::test(flavor = "multi_thread")]
async fn seeding_incomplete_data_is_an_integrity_error() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(100_000);
    let meta = metainfo("half.bin", &data, 32 * 1024);
    std::fs::write(dir.path().join("half.bin"), &data[..50_000]).unwrap();

    let seed = daemon(Config::load_test(dir.path())).await;
    let mut torrent = seed.add_torrent(meta, true).await.unwrap();
    let state = timeout(LIMIT, torrent.wait_for(|s| matches!(s.status, TorrentStatus::Error(_))))
        .await
        .unwrap()
        .unwrap();
    assert!(state.left > 0);

    let err = seed.quit().await.unwrap_err();
    assert_eq!(err.kind().exit_code(), 5);
}
