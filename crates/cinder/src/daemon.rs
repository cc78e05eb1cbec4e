//! The daemon owns the listening socket and the torrents of the process.
//!
//! Inbound connections are told apart by their first bytes: a plaintext
//! handshake starts with the protocol string, anything else is treated as
//! the start of an obfuscated handshake. Either way the connection is
//! handed to the torrent whose info hash it asked for.
//!
//! Things shared by every torrent live in [`DaemonCtx`]: the local peer
//! id, the rate limiters, the process wide half-open limit and the tracker
//! announcers.
use std::{
    net::SocketAddr,
    sync::{Arc, RwLock},
    time::Duration,
};

use bytes::BytesMut;
use hashbrown::HashMap;
use tokio::{
    io::AsyncReadExt,
    net::{TcpListener, TcpStream},
    select, spawn,
    sync::{mpsc, oneshot, Semaphore},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    crypto::{self, CryptoStream},
    error::Error,
    metainfo::MetaInfo,
    peer::{handshake_inbound, PeerId},
    ratelimiter::RateLimiter,
    torrent::{InfoHash, Torrent, TorrentHandle, TorrentMsg},
    tracker::AnnouncerPool,
};

/// Bytes needed to recognize a plaintext handshake.
const PREFIX_LEN: usize = 20;

/// State shared by every torrent of the daemon.
#[derive(Debug)]
pub struct DaemonCtx {
    pub config: Arc<Config>,
    pub local_peer_id: PeerId,
    /// Port we listen on, announced to trackers.
    pub port: u16,
    pub half_open: Arc<Semaphore>,
    pub upload: Arc<RateLimiter>,
    pub download: Arc<RateLimiter>,
    pub pool: Arc<AnnouncerPool>,
    torrents: RwLock<HashMap<InfoHash, mpsc::Sender<TorrentMsg>>>,
}

impl DaemonCtx {
    pub fn new(config: Config, port: u16) -> Arc<Self> {
        let mut upload = RateLimiter::new(config.max_upload_rate);
        if config.auto_upload_rate {
            upload = upload.with_auto(Duration::from_millis(config.ping_target));
        }
        Arc::new(Self {
            local_peer_id: PeerId::generate(),
            port,
            half_open: Arc::new(Semaphore::new(config.max_half_open.max(1))),
            upload,
            download: RateLimiter::new(config.max_download_rate),
            pool: Arc::new(AnnouncerPool::new(Duration::from_secs(config.http_timeout))),
            torrents: RwLock::new(HashMap::new()),
            config: Arc::new(config),
        })
    }

    /// Info hashes of the running torrents.
    pub fn hosted(&self) -> Vec<InfoHash> {
        match self.torrents.read() {
            Ok(t) => t.keys().copied().collect(),
            Err(_) => Vec::new(),
        }
    }

    fn torrent_tx(&self, info_hash: &InfoHash) -> Option<mpsc::Sender<TorrentMsg>> {
        self.torrents.read().ok()?.get(info_hash).cloned()
    }

    fn register(&self, info_hash: InfoHash, tx: mpsc::Sender<TorrentMsg>) -> Result<(), Error> {
        let mut torrents = self.torrents.write().map_err(|_| Error::PoisonedLock)?;
        if torrents.contains_key(&info_hash) {
            return Err(Error::NoDuplicateTorrent);
        }
        torrents.insert(info_hash, tx);
        Ok(())
    }

    fn unregister(&self, info_hash: &InfoHash) {
        if let Ok(mut torrents) = self.torrents.write() {
            torrents.remove(info_hash);
        }
    }
}

#[derive(Debug)]
pub enum DaemonMsg {
    AddTorrent {
        meta: Box<MetaInfo>,
        /// Fail with an integrity error instead of downloading what is
        /// missing.
        seed_only: bool,
        reply: oneshot::Sender<Result<TorrentHandle, Error>>,
    },
    /// Stop every torrent and return the first error one of them ended
    /// with.
    Quit(oneshot::Sender<Result<(), Error>>),
}

/// Talks to a running [`Daemon`].
#[derive(Debug, Clone)]
pub struct DaemonHandle {
    tx: mpsc::Sender<DaemonMsg>,
    ctx: Arc<DaemonCtx>,
}

impl DaemonHandle {
    pub async fn add_torrent(&self, meta: MetaInfo, seed_only: bool) -> Result<TorrentHandle, Error> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(DaemonMsg::AddTorrent { meta: Box::new(meta), seed_only, reply }).await?;
        rx.await?
    }

    pub async fn quit(&self) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(DaemonMsg::Quit(reply)).await?;
        rx.await?
    }

    pub fn ctx(&self) -> &Arc<DaemonCtx> {
        &self.ctx
    }

    /// Where peers can reach us.
    pub fn local_addr(&self) -> SocketAddr {
        let ip = self.ctx.config.listen.ip();
        let ip = if ip.is_unspecified() { [127, 0, 0, 1].into() } else { ip };
        SocketAddr::new(ip, self.ctx.port)
    }
}

struct Running {
    handle: TorrentHandle,
    task: JoinHandle<Result<(), Error>>,
}

pub struct Daemon {
    ctx: Arc<DaemonCtx>,
    listener: TcpListener,
    tx: mpsc::Sender<DaemonMsg>,
    rx: mpsc::Receiver<DaemonMsg>,
    torrents: HashMap<InfoHash, Running>,
}

impl Daemon {
    /// Bind the listening socket. The port is known from here on, so
    /// torrents added later can announce it.
    pub async fn bind(config: Config) -> Result<Self, Error> {
        config.validate()?;
        let listener = TcpListener::bind(config.listen).await?;
        let port = listener.local_addr()?.port();
        let ctx = DaemonCtx::new(config, port);
        let (tx, rx) = mpsc::channel(100);
        Ok(Self { ctx, listener, tx, rx, torrents: HashMap::new() })
    }

    pub fn handle(&self) -> DaemonHandle {
        DaemonHandle { tx: self.tx.clone(), ctx: self.ctx.clone() }
    }

    #[tracing::instrument(name = "daemon", skip_all, fields(port = self.ctx.port))]
    pub async fn run(mut self) -> Result<(), Error> {
        info!("listening for peers, local id {}", self.ctx.local_peer_id);
        loop {
            select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, addr)) => {
                        let ctx = self.ctx.clone();
                        spawn(async move {
                            if let Err(e) = accept_inbound(socket, addr, ctx).await {
                                debug!("{addr} inbound handshake failed: {e}");
                            }
                        });
                    }
                    Err(e) => warn!("accept failed: {e}"),
                },
                Some(msg) = self.rx.recv() => match msg {
                    DaemonMsg::AddTorrent { meta, seed_only, reply } => {
                        let _ = reply.send(self.add_torrent(*meta, seed_only));
                    }
                    DaemonMsg::Quit(reply) => {
                        let r = self.quit().await;
                        let _ = reply.send(r);
                        return Ok(());
                    }
                },
            }
        }
    }

    fn add_torrent(&mut self, meta: MetaInfo, seed_only: bool) -> Result<TorrentHandle, Error> {
        let info_hash = meta.info.info_hash;
        if self.torrents.contains_key(&info_hash) {
            return Err(Error::NoDuplicateTorrent);
        }
        let torrent = Torrent::new(meta, self.ctx.clone(), seed_only);
        let handle = torrent.handle();
        self.ctx.register(info_hash, handle.tx.clone())?;
        let ctx = self.ctx.clone();
        let task = spawn(async move {
            let r = torrent.run().await;
            // inbound peers for a torrent that stopped on its own are
            // turned away at the handshake
            ctx.unregister(&info_hash);
            r
        });
        self.torrents.insert(info_hash, Running { handle: handle.clone(), task });
        Ok(handle)
    }

    async fn quit(&mut self) -> Result<(), Error> {
        let mut first_err = None;
        for (info_hash, running) in self.torrents.drain() {
            let _ = running.handle.quit().await;
            let r = match running.task.await {
                Ok(r) => r,
                Err(e) => Err(e.into()),
            };
            self.ctx.unregister(&info_hash);
            if let Err(e) = r {
                warn!("torrent {info_hash} ended with: {e}");
                first_err.get_or_insert(e);
            }
        }
        info!("daemon stopped");
        first_err.map_or(Ok(()), Err)
    }
}

/// Run the handshakes of an inbound connection and hand it to its
/// torrent.
async fn accept_inbound(mut socket: TcpStream, addr: SocketAddr, ctx: Arc<DaemonCtx>) -> Result<(), Error> {
    let policy = ctx.config.crypto();
    let handshake = async {
        let mut prefix = BytesMut::with_capacity(68);
        while prefix.len() < PREFIX_LEN {
            if socket.read_buf(&mut prefix).await? == 0 {
                return Err(Error::PeerClosedSocket);
            }
        }

        let hosted = ctx.hosted();
        let (stream, expected) = if crypto::is_plaintext_handshake(&prefix) {
            if policy.stealth {
                return Err(Error::PlaintextRefused);
            }
            (CryptoStream::with_prefix(socket, prefix), None)
        } else {
            let accepted = crypto::respond(socket, prefix, &hosted, policy).await?;
            (accepted.stream, Some(accepted.info_hash))
        };
        let r = handshake_inbound(stream, addr, expected, |ih| hosted.contains(ih), ctx.local_peer_id).await?;
        // answered, so the peer can retry obfuscated, then hung up
        if policy.only && expected.is_none() {
            return Err(Error::PlaintextRefused);
        }
        Ok(r)
    };

    let limit = Duration::from_secs(ctx.config.handshake_timeout);
    let (info_hash, h) = timeout(limit, handshake).await.map_err(|_| Error::Timeout)??;
    let tx = ctx.torrent_tx(&info_hash).ok_or(Error::TorrentDoesNotExist)?;
    tx.send(TorrentMsg::Connected(Box::new(h))).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use futures::{SinkExt, StreamExt};
    use tokio_util::codec::Framed;

    use super::*;
    use crate::{
        tcp_wire::{Handshake, HandshakeCodec},
        torrent::TorrentStatus,
    };

    async fn daemon(config: Config) -> DaemonHandle {
        let daemon = Daemon::bind(config).await.unwrap();
        let handle = daemon.handle();
        spawn(daemon.run());
        handle
    }

    #[tokio::test]
    async fn unknown_info_hash_gets_no_answer() {
        let dir = tempfile::tempdir().unwrap();
        let handle = daemon(Config::load_test(dir.path())).await;

        let socket = TcpStream::connect(handle.local_addr()).await.unwrap();
        let mut socket = Framed::new(socket, HandshakeCodec);
        socket.send(Handshake::new(InfoHash([4; 20]), PeerId([1; 20]))).await.unwrap();
        // the daemon hangs up without a handshake
        assert!(socket.next().await.is_none());
        handle.quit().await.unwrap();
    }

    /// Run one plaintext handshake against `config`, returning the
    /// handshakes the client got back before the connection closed.
    async fn plaintext_attempt(config: Config) -> (Result<(), Error>, usize) {
        let ctx = DaemonCtx::new(config, 0);
        ctx.register(InfoHash([4; 20]), mpsc::channel(1).0).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = spawn(async move {
            let socket = TcpStream::connect(addr).await.unwrap();
            let mut socket = Framed::new(socket, HandshakeCodec);
            socket.send(Handshake::new(InfoHash([4; 20]), PeerId([1; 20]))).await.unwrap();
            let mut answers = 0;
            while let Some(Ok(_)) = socket.next().await {
                answers += 1;
            }
            answers
        });
        let (socket, remote) = listener.accept().await.unwrap();
        let r = accept_inbound(socket, remote, ctx).await;
        (r, client.await.unwrap())
    }

    #[tokio::test]
    async fn crypto_only_answers_plaintext_then_hangs_up() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config { crypto_only: true, ..Config::load_test(dir.path()) };
        let (r, answers) = plaintext_attempt(config).await;
        assert!(matches!(r, Err(Error::PlaintextRefused)));
        assert_eq!(answers, 1);
    }

    #[tokio::test]
    async fn stealth_never_answers_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config { crypto_only: true, crypto_stealth: true, ..Config::load_test(dir.path()) };
        let (r, answers) = plaintext_attempt(config).await;
        assert!(matches!(r, Err(Error::PlaintextRefused)));
        assert_eq!(answers, 0);
    }

    #[tokio::test]
    async fn halted_torrent_is_no_longer_hosted() {
        let dir = tempfile::tempdir().unwrap();
        let handle = daemon(Config::load_test(dir.path())).await;
        let mut meta = crate::metainfo::tests::single_file("gone.bin", &[3u8; 100], 32 * 1024);
        meta.announce = String::new();

        // seeding data that is not there halts the torrent
        let mut torrent = handle.add_torrent(meta, true).await.unwrap();
        torrent.wait_for(|s| matches!(s.status, TorrentStatus::Error(_))).await.unwrap();
        timeout(Duration::from_secs(5), async {
            while !handle.ctx().hosted().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let r = handle.quit().await;
        assert!(matches!(r, Err(Error::IntegrityFailure(1))));
    }

    #[tokio::test]
    async fn duplicate_torrents_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let handle = daemon(Config::load_test(dir.path())).await;
        let meta = crate::metainfo::tests::single_file("d.bin", &[3u8; 100], 32 * 1024);

        handle.add_torrent(meta.clone(), false).await.unwrap();
        let again = handle.add_torrent(meta, false).await;
        assert!(matches!(again, Err(Error::NoDuplicateTorrent)));
        handle.quit().await.unwrap();
    }
}
