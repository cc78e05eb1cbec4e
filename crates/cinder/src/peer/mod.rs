//! A remote peer in the network that downloads and uploads data.
//!
//! After the handshake a connection is split in two tasks. The reader
//! decodes frames and forwards them to the torrent, paced by the download
//! limiter. The writer owns the [`OutQueue`] and paces PIECE slices
//! through the upload limiter. All protocol state lives in the torrent,
//! which talks to the writer with [`PeerMsg`].
pub mod downloader;
pub mod session;
pub mod uploader;
mod types;

// re-exports
pub use types::*;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    select, spawn,
    sync::mpsc,
    task::JoinHandle,
    time::{interval_at, Instant},
};
use tokio_util::codec::{Framed, FramedRead};
use tracing::{debug, trace};

use crate::{
    bitfield::Bitfield,
    config::Config,
    crypto::{self, CryptoPolicy, CryptoStream},
    error::Error,
    peer::{downloader::Downloader, session::ConnectionState, uploader::Uploader},
    ratelimiter::RateLimiter,
    tcp_wire::{BlockInfo, Handshake, HandshakeCodec, Message, MessageCodec, OutQueue},
    torrent::{InfoHash, TorrentMsg},
};

/// A connection whose handshake completed, on its way to the torrent.
#[derive(Debug)]
pub struct Handshaked {
    pub stream: CryptoStream<TcpStream>,
    /// Bytes read past the handshake, the start of the message stream.
    pub read_buf: BytesMut,
    pub addr: SocketAddr,
    pub peer_id: PeerId,
    pub direction: Direction,
    pub encrypted: bool,
}

/// Limits and timers shared by every connection of a torrent.
#[derive(Debug, Clone)]
pub struct IoParams {
    pub upload: Arc<RateLimiter>,
    pub download: Arc<RateLimiter>,
    pub tcp_ack_fudge: f64,
    pub keepalive: Duration,
    pub timeout: Duration,
    pub max_message_length: usize,
}

impl IoParams {
    pub fn new(config: &Config, upload: Arc<RateLimiter>, download: Arc<RateLimiter>) -> Self {
        Self {
            upload,
            download,
            tcp_ack_fudge: config.tcp_ack_fudge,
            keepalive: config.keepalive(),
            timeout: config.idle_timeout(),
            max_message_length: config.max_message_length,
        }
    }
}

/// A live connection, owned by the torrent's arena.
#[derive(Debug)]
pub struct Connection {
    pub addr: SocketAddr,
    pub peer_id: PeerId,
    pub direction: Direction,
    pub encrypted: bool,
    pub state: ConnectionState,
    /// Pieces the peer advertised.
    pub have: Bitfield,
    pub downloader: Downloader,
    pub uploader: Uploader,
    tx: mpsc::UnboundedSender<PeerMsg>,
    reader: JoinHandle<()>,
}

impl Connection {
    /// Take over a handshaked stream: spawn its reader and writer and
    /// start with both sides choked and not interested.
    pub fn new(
        id: ConnectionId,
        h: Handshaked,
        pieces: usize,
        torrent_tx: mpsc::Sender<TorrentMsg>,
        params: &IoParams,
        config: &Config,
    ) -> Self {
        let Handshaked { stream, read_buf, addr, peer_id, direction, encrypted } = h;
        let (tx, reader) = spawn_io(id, stream, read_buf, torrent_tx, params);
        Self {
            addr,
            peer_id,
            direction,
            encrypted,
            state: ConnectionState::default(),
            have: Bitfield::new(pieces),
            downloader: Downloader::new(config.max_rate_period),
            uploader: Uploader::new(config.max_rate_period, config.max_slice_length),
            tx,
            reader,
        }
    }

    /// Queue a message for the writer. A closed writer means the
    /// connection is going away, its `Closed` message is on the way.
    pub fn send(&self, msg: Message) {
        let _ = self.tx.send(PeerMsg::Send(msg));
    }

    pub fn cancel_piece(&self, info: BlockInfo) {
        let _ = self.tx.send(PeerMsg::Cancel(info));
    }

    /// Flush what is queued and close.
    pub fn close(&self) {
        self.reader.abort();
        let _ = self.tx.send(PeerMsg::Close);
    }

    /// Whether the peer has every piece.
    pub fn is_seed(&self) -> bool {
        self.have.complete()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // the writer ends on its own once the sender is gone
        self.reader.abort();
    }
}

/// Dial `peer` and run the handshakes. The obfuscated handshake is tried
/// when the policy requires it or the tracker said the peer supports it;
/// when it fails and plaintext is still allowed, a fresh plaintext
/// connection is made.
#[tracing::instrument(skip_all, fields(addr = %peer.addr))]
pub async fn connect(
    peer: PeerAddr,
    info_hash: InfoHash,
    local_id: PeerId,
    policy: CryptoPolicy,
    timeout: Duration,
) -> Result<Handshaked, Error> {
    let attempt = async {
        if policy.allowed && (policy.only || peer.crypto) {
            let socket = TcpStream::connect(peer.addr).await?;
            match crypto::initiate(socket, &info_hash, policy).await {
                Ok((stream, _mode)) => {
                    return handshake_outbound(stream, peer, info_hash, local_id).await;
                }
                Err(e) if policy.only => return Err(e),
                Err(e) => debug!("{} encrypted handshake failed, retrying plain: {e}", peer.addr),
            }
        }
        let socket = TcpStream::connect(peer.addr).await?;
        handshake_outbound(CryptoStream::plain(socket), peer, info_hash, local_id).await
    };
    tokio::time::timeout(timeout, attempt).await.map_err(|_| Error::Timeout)?
}

async fn handshake_outbound(
    stream: CryptoStream<TcpStream>,
    peer: PeerAddr,
    info_hash: InfoHash,
    local_id: PeerId,
) -> Result<Handshaked, Error> {
    let remote = peer.addr;
    let mut socket = Framed::new(stream, HandshakeCodec);

    debug!("{remote} sending the first handshake");
    socket.send(Handshake::new(info_hash, local_id)).await?;

    let Some(Ok(theirs)) = socket.next().await else {
        debug!("{remote} did not send a handshake");
        return Err(Error::HandshakeInvalid);
    };
    if !theirs.validate(&info_hash) {
        return Err(Error::HandshakeInvalid);
    }
    if peer.peer_id.is_some_and(|id| id != theirs.peer_id) {
        debug!("{remote} peer id differs from the one the tracker gave");
        return Err(Error::HandshakeInvalid);
    }
    if theirs.peer_id == local_id {
        debug!("{remote} is ourselves");
        return Err(Error::HandshakeInvalid);
    }

    let parts = socket.into_parts();
    Ok(Handshaked {
        encrypted: parts.io.is_encrypted(),
        stream: parts.io,
        read_buf: parts.read_buf,
        addr: remote,
        peer_id: theirs.peer_id,
        direction: Direction::Outbound,
    })
}

/// Answer the handshake of an inbound connection. `hosted` tells whether
/// we serve an info hash; `expected` is set when the obfuscated handshake
/// already named the torrent.
pub async fn handshake_inbound(
    stream: CryptoStream<TcpStream>,
    addr: SocketAddr,
    expected: Option<InfoHash>,
    hosted: impl Fn(&InfoHash) -> bool,
    local_id: PeerId,
) -> Result<(InfoHash, Handshaked), Error> {
    let mut socket = Framed::new(stream, HandshakeCodec);

    let Some(Ok(theirs)) = socket.next().await else {
        debug!("{addr} did not send a handshake");
        return Err(Error::HandshakeInvalid);
    };
    if expected.is_some_and(|ih| ih != theirs.info_hash) || !hosted(&theirs.info_hash) {
        debug!("{addr} asked for {} which we do not serve", theirs.info_hash);
        return Err(Error::TorrentDoesNotExist);
    }
    if theirs.peer_id == local_id {
        return Err(Error::HandshakeInvalid);
    }

    debug!("{addr} sending the second handshake");
    socket.send(Handshake::new(theirs.info_hash, local_id)).await?;

    let parts = socket.into_parts();
    Ok((
        theirs.info_hash,
        Handshaked {
            encrypted: parts.io.is_encrypted(),
            stream: parts.io,
            read_buf: parts.read_buf,
            addr,
            peer_id: theirs.peer_id,
            direction: Direction::Inbound,
        },
    ))
}

/// Split a handshaked stream into its reader and writer tasks. Returns the
/// writer's command channel and the reader's handle.
pub fn spawn_io<S>(
    id: ConnectionId,
    stream: S,
    read_buf: BytesMut,
    torrent_tx: mpsc::Sender<TorrentMsg>,
    params: &IoParams,
) -> (mpsc::UnboundedSender<PeerMsg>, JoinHandle<()>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (r, w) = tokio::io::split(stream);

    let mut frames = FramedRead::new(r, MessageCodec { max_len: params.max_message_length });
    frames.read_buffer_mut().extend_from_slice(&read_buf);

    let (tx, rx) = mpsc::unbounded_channel();
    let reader = spawn(read_loop(id, frames, torrent_tx.clone(), params.clone()));
    spawn(write_loop(id, w, rx, torrent_tx, params.clone()));
    (tx, reader)
}

async fn read_loop<R>(
    id: ConnectionId,
    mut frames: FramedRead<R, MessageCodec>,
    tx: mpsc::Sender<TorrentMsg>,
    params: IoParams,
) where
    R: AsyncRead + Unpin,
{
    let fudge = params.tcp_ack_fudge;
    let err = loop {
        let msg = match tokio::time::timeout(params.timeout, frames.next()).await {
            Err(_) => break Error::Timeout,
            Ok(None) => break Error::PeerClosedSocket,
            Ok(Some(Err(e))) => break e,
            Ok(Some(Ok(msg))) => msg,
        };
        let n = msg.len();
        params.download.acquire(n).await;
        params.upload.charge(n as f64 * fudge);
        trace!("{id:?} read {n} bytes");
        if tx.send(TorrentMsg::Incoming(id, msg)).await.is_err() {
            return;
        }
    };
    let _ = tx.send(TorrentMsg::Closed(id, err)).await;
}

async fn write_loop<W>(
    id: ConnectionId,
    mut sink: W,
    mut rx: mpsc::UnboundedReceiver<PeerMsg>,
    tx: mpsc::Sender<TorrentMsg>,
    params: IoParams,
) where
    W: AsyncWrite + Unpin,
{
    let mut queue = OutQueue::new();
    let mut closing = false;
    let mut keep_alive =
        interval_at(Instant::now() + params.keepalive, params.keepalive);
    let mut piece_started: Option<Instant> = None;

    loop {
        if queue.is_empty() {
            if closing {
                break;
            }
            select! {
                msg = rx.recv() => match msg {
                    Some(msg) => closing |= handle(&mut queue, msg, id, &tx).await,
                    None => break,
                },
                _ = keep_alive.tick() => {
                    queue.push(Message::KeepAlive);
                }
            }
        }
        while let Ok(msg) = rx.try_recv() {
            closing |= handle(&mut queue, msg, id, &tx).await;
        }

        let Some(chunk) = queue.next_chunk() else { continue };
        if chunk.payload > 0 {
            piece_started.get_or_insert_with(Instant::now);
            params.upload.acquire(chunk.payload).await;
        }
        if let Err(e) = sink.write_all(&chunk.bytes).await {
            let _ = tx.send(TorrentMsg::Closed(id, e.into())).await;
            return;
        }
        keep_alive.reset();

        if let Some(info) = chunk.completed {
            if let Some(started) = piece_started.take() {
                params.upload.ping(started.elapsed());
            }
            let _ = tx.send(TorrentMsg::PieceSent(id, info)).await;
        }
    }

    let _ = sink.flush().await;
    let _ = sink.shutdown().await;
    debug!("{id:?} writer closed");
}

/// Returns true on [`PeerMsg::Close`].
async fn handle(
    queue: &mut OutQueue,
    msg: PeerMsg,
    id: ConnectionId,
    tx: &mpsc::Sender<TorrentMsg>,
) -> bool {
    match msg {
        PeerMsg::Send(msg) => {
            let dropped = queue.push(msg);
            if !dropped.is_empty() {
                let _ = tx.send(TorrentMsg::PiecesDropped(id, dropped)).await;
            }
        }
        PeerMsg::Cancel(info) => {
            if queue.cancel(&info) {
                let _ = tx.send(TorrentMsg::PiecesDropped(id, vec![info])).await;
            }
        }
        PeerMsg::Close => return true,
    }
    false
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use slotmap::SlotMap;
    use tokio::io::{duplex, AsyncReadExt};

    use super::*;
    use crate::tcp_wire::Block;

    fn params() -> IoParams {
        IoParams {
            upload: RateLimiter::unlimited(),
            download: RateLimiter::unlimited(),
            tcp_ack_fudge: 0.03,
            keepalive: Duration::from_secs(120),
            timeout: Duration::from_secs(300),
            max_message_length: 1 << 20,
        }
    }

    fn id() -> ConnectionId {
        SlotMap::<ConnectionId, ()>::with_key().insert(())
    }

    #[tokio::test]
    async fn leftover_handshake_bytes_are_decoded() {
        let (ours, mut theirs) = duplex(1 << 16);
        let (tx, mut rx) = mpsc::channel(16);
        let leftover = BytesMut::from(&Message::Have(3).to_bytes()[..]);
        let id = id();
        let (_peer_tx, _reader) = spawn_io(id, ours, leftover, tx, &params());

        theirs.write_all(&Message::Unchoke.to_bytes()).await.unwrap();

        match rx.recv().await.unwrap() {
            TorrentMsg::Incoming(got, Message::Have(3)) => assert_eq!(got, id),
            other => panic!("{other:?}"),
        }
        assert!(matches!(rx.recv().await.unwrap(), TorrentMsg::Incoming(_, Message::Unchoke)));

        drop(theirs);
        assert!(matches!(rx.recv().await.unwrap(), TorrentMsg::Closed(_, Error::PeerClosedSocket)));
    }

    #[tokio::test]
    async fn writer_reports_sent_and_dropped_pieces() {
        let (ours, mut theirs) = duplex(1 << 20);
        let (tx, mut rx) = mpsc::channel(16);
        let (peer_tx, _reader) = spawn_io(id(), ours, BytesMut::new(), tx, &params());

        let piece = |index| {
            Message::Piece(Block { index, begin: 0, block: Bytes::from(vec![1u8; 100]) })
        };
        peer_tx.send(PeerMsg::Send(piece(0))).unwrap();
        peer_tx.send(PeerMsg::Cancel(BlockInfo { index: 0, begin: 0, len: 100 })).unwrap();
        peer_tx.send(PeerMsg::Send(piece(1))).unwrap();
        peer_tx.send(PeerMsg::Close).unwrap();

        // the writer shuts its half down once the queue is flushed
        let mut wire = Vec::new();
        theirs.read_to_end(&mut wire).await.unwrap();
        assert_eq!(wire.len(), 113);
        assert_eq!(&wire[..9], &[0, 0, 0, 109, 7, 0, 0, 0, 1]);
        drop(theirs);

        let mut events = Vec::new();
        while let Some(msg) = rx.recv().await {
            match msg {
                TorrentMsg::Closed(..) => break,
                other => events.push(other),
            }
        }
        assert!(matches!(&events[0], TorrentMsg::PiecesDropped(_, d) if d[0].index == 0));
        assert!(matches!(&events[1], TorrentMsg::PieceSent(_, info) if info.index == 1));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_peer_times_out() {
        let (ours, _theirs) = duplex(1024);
        let (tx, mut rx) = mpsc::channel(16);
        let (_peer_tx, _reader) = spawn_io(id(), ours, BytesMut::new(), tx, &params());

        loop {
            match rx.recv().await.unwrap() {
                TorrentMsg::Closed(_, Error::Timeout) => break,
                TorrentMsg::Closed(_, e) => panic!("{e}"),
                _ => {}
            }
        }
    }
}
