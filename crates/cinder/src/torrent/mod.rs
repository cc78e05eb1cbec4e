//! A torrent, spawned by the daemon.
//!
//! The torrent is the single owner of the protocol state of one swarm:
//! storage, picker, choker, the dial queue and the arena of connections.
//! Connections report frames through [`TorrentMsg`] and receive commands
//! through their writer channel, so every state change happens inside
//! [`Torrent::run`]. Connections are addressed by [`ConnectionId`]; an id
//! whose connection already went away is simply not found.
//!
//! Lifecycle: files are allocated, data already on disk is checked one
//! piece per loop iteration, then the torrent downloads, seeds, and stops
//! on [`TorrentMsg::Quit`] or on a storage failure.
mod types;

// re-exports
pub use types::*;

use std::{collections::VecDeque, net::IpAddr, sync::Arc, time::Duration};

use hashbrown::HashSet;
use slotmap::SlotMap;
use tokio::{
    select,
    sync::{mpsc, oneshot, watch},
    time::{interval, interval_at, timeout, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    bitfield::Bitfield,
    choker::{Candidate, Choker, SuperSeeder},
    config::{AllocType, Config},
    counter::Counter,
    daemon::DaemonCtx,
    encoder::Encoder,
    error::{Error, ErrorKind},
    metainfo::MetaInfo,
    peer::{self, uploader::RequestVerdict, Connection, ConnectionId, Direction, Handshaked, IoParams, PeerAddr},
    picker::{Picker, Priority},
    sched::Scheduler,
    storage::{PieceOutcome, ResumeRecord, StorageWrapper},
    tcp_wire::{BlockInfo, Message},
    tracker::{reannounce::STOP_TIMEOUT, AnnounceRequest, Event, Reannouncer, TrackerMsg},
};

/// Background tasks of a torrent, by kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Task {
    Dial,
    Tracker,
}

/// How often background allocation gets a slice.
const ALLOC_TICK: Duration = Duration::from_millis(100);

/// Talks to a running [`Torrent`].
#[derive(Debug, Clone)]
pub struct TorrentHandle {
    pub info_hash: InfoHash,
    pub(crate) tx: mpsc::Sender<TorrentMsg>,
    state: watch::Receiver<TorrentState>,
}

impl TorrentHandle {
    /// The last published state.
    pub fn state(&self) -> TorrentState {
        self.state.borrow().clone()
    }

    /// Wait until the published state satisfies `f`. Fails once the
    /// torrent stopped without getting there.
    pub async fn wait_for(&mut self, f: impl FnMut(&TorrentState) -> bool) -> Result<TorrentState, Error> {
        let state = self.state.wait_for(f).await.map_err(|_| Error::SendError)?;
        Ok(state.clone())
    }

    /// Dial these peers, as if a tracker returned them.
    pub async fn add_peers(&self, peers: Vec<PeerAddr>) -> Result<(), Error> {
        self.tx.send(TorrentMsg::AddPeers(peers)).await?;
        Ok(())
    }

    pub async fn set_file_priority(&self, file: usize, priority: Priority) -> Result<(), Error> {
        self.tx.send(TorrentMsg::SetFilePriority(file, priority)).await?;
        Ok(())
    }

    /// Ask the torrent itself rather than reading the last published
    /// state.
    pub async fn fetch_state(&self) -> Result<TorrentState, Error> {
        let (otx, orx) = oneshot::channel();
        self.tx.send(TorrentMsg::GetState(otx)).await?;
        Ok(orx.await?)
    }

    pub async fn quit(&self) -> Result<(), Error> {
        self.tx.send(TorrentMsg::Quit).await?;
        Ok(())
    }
}

/// This is the main entity responsible for the high-level management of
/// a torrent download or upload.
pub struct Torrent {
    pub name: String,
    info_hash: InfoHash,
    meta: MetaInfo,
    ctx: Arc<DaemonCtx>,
    config: Arc<Config>,
    params: IoParams,
    status: TorrentStatus,
    seed_only: bool,

    storage: StorageWrapper,
    picker: Picker,
    choker: Choker,
    /// Set once super-seeding starts, never unset.
    super_seeder: Option<SuperSeeder>,
    file_priority: Vec<Priority>,
    conns: SlotMap<ConnectionId, Connection>,
    encoder: Encoder,
    banned: HashSet<IpAddr>,
    counter: Counter,

    /// Pieces still to hash before the torrent can start.
    to_check: VecDeque<usize>,
    check_total: usize,
    allocating: bool,

    stats: Stats,
    tracker_error: Option<String>,
    tracker_tx: Option<mpsc::Sender<TrackerMsg>>,
    data_tx: watch::Sender<AnnounceData>,
    state_tx: watch::Sender<TorrentState>,

    sched: Scheduler<Task>,
    tx: mpsc::Sender<TorrentMsg>,
    rx: mpsc::Receiver<TorrentMsg>,
}

impl Torrent {
    pub fn new(meta: MetaInfo, ctx: Arc<DaemonCtx>, seed_only: bool) -> Self {
        let config = ctx.config.clone();
        let pieces = meta.info.pieces();
        let storage = StorageWrapper::new(&meta.info, &config);
        let files = storage.files().files().len();
        let (tx, rx) = mpsc::channel(512);
        let initial = TorrentState {
            name: meta.info.name.clone(),
            info_hash: meta.info.info_hash,
            size: meta.info.get_torrent_size(),
            left: meta.info.get_torrent_size(),
            ..Default::default()
        };

        Self {
            name: meta.info.name.clone(),
            info_hash: meta.info.info_hash,
            params: IoParams::new(&config, ctx.upload.clone(), ctx.download.clone()),
            status: TorrentStatus::Checking,
            seed_only,
            storage,
            picker: Picker::new(pieces, config.rarest_first_cutoff),
            choker: Choker::new(config.max_uploads, config.optimistic_rounds as usize),
            super_seeder: None,
            file_priority: vec![Priority::Normal; files],
            conns: SlotMap::with_key(),
            encoder: Encoder::new(&config),
            banned: HashSet::new(),
            counter: Counter::new(),
            to_check: VecDeque::new(),
            check_total: 0,
            allocating: config.alloc_type == AllocType::Background,
            stats: Stats::default(),
            tracker_error: None,
            tracker_tx: None,
            data_tx: watch::Sender::new(AnnounceData::default()),
            state_tx: watch::Sender::new(initial),
            sched: Scheduler::new(),
            meta,
            ctx,
            config,
            tx,
            rx,
        }
    }

    pub fn handle(&self) -> TorrentHandle {
        TorrentHandle {
            info_hash: self.info_hash,
            tx: self.tx.clone(),
            state: self.state_tx.subscribe(),
        }
    }

    /// Run until quit. Errors are storage failures, or missing data when
    /// seeding only.
    #[tracing::instrument(name = "torrent", skip_all, fields(info_hash = %self.info_hash))]
    pub async fn run(mut self) -> Result<(), Error> {
        info!("starting {}", self.name);
        if let Err(e) = self.start() {
            return self.halt(e).await;
        }

        let mut tick = interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let round = self.config.choke_round();
        let mut choke = interval_at(Instant::now() + round, round);
        let mut alloc = interval(ALLOC_TICK);

        loop {
            let r = select! {
                Some(msg) = self.rx.recv() => {
                    if matches!(msg, TorrentMsg::Quit) {
                        break;
                    }
                    self.handle_msg(msg)
                }
                _ = tick.tick() => self.tick(),
                _ = choke.tick() => {
                    self.rechoke(true);
                    Ok(())
                }
                _ = std::future::ready(()), if !self.to_check.is_empty() => self.check_next(),
                _ = alloc.tick(), if self.allocating => self.allocate(),
                r = self.sched.join_next() => r,
            };
            if let Err(e) = r {
                return self.halt(e).await;
            }
        }

        self.shutdown().await;
        info!("stopped {}", self.name);
        Ok(())
    }

    fn start(&mut self) -> Result<(), Error> {
        self.status = TorrentStatus::Allocating;
        self.storage.start_allocation()?;

        let record = self.storage.resume_path().and_then(|p| ResumeRecord::read(p));
        let mut to_check = self.storage.unpickle(record);
        if !self.config.check_hashes {
            to_check.clear();
        }
        self.check_total = to_check.len();
        self.to_check = to_check.into();
        self.status = TorrentStatus::Checking;
        if self.to_check.is_empty() {
            self.finish_check()?;
        }
        Ok(())
    }

    fn check_next(&mut self) -> Result<(), Error> {
        if let Some(index) = self.to_check.pop_front() {
            self.storage.check_piece(index)?;
        }
        if self.to_check.is_empty() {
            self.finish_check()?;
        }
        Ok(())
    }

    fn finish_check(&mut self) -> Result<(), Error> {
        let have: Vec<usize> = self.storage.have().iter_ones().collect();
        for &i in &have {
            self.picker.complete(i);
        }
        self.apply_priorities();
        info!("{} of {} pieces on disk", have.len(), self.picker.len());

        if self.storage.is_complete() {
            self.status = TorrentStatus::Seeding;
            if self.config.super_seeder {
                info!("super-seeding");
                self.super_seeder = Some(SuperSeeder::new(self.picker.len(), self.config.max_uploads));
            }
        } else if self.seed_only {
            return Err(Error::IntegrityFailure(self.picker.len() - have.len()));
        } else {
            self.status = TorrentStatus::Downloading;
        }
        self.publish();
        self.start_tracker();
        Ok(())
    }

    fn allocate(&mut self) -> Result<(), Error> {
        let budget = self.config.alloc_rate * 1024.0 * 1024.0 * ALLOC_TICK.as_secs_f64();
        if self.storage.allocate(budget.max(1.0) as u64)? {
            debug!("background allocation done");
            self.allocating = false;
        }
        Ok(())
    }

    fn start_tracker(&mut self) {
        let tiers = self.meta.announce_tiers();
        if tiers.is_empty() {
            warn!("no trackers, waiting for peers to connect");
            return;
        }
        let base = AnnounceRequest {
            info_hash: self.info_hash,
            peer_id: self.ctx.local_peer_id,
            port: self.ctx.port,
            uploaded: 0,
            downloaded: 0,
            left: self.storage.left(),
            event: Event::Started,
            key: rand::random(),
            numwant: self.config.numwant as u32,
            crypto: self.config.crypto(),
        };
        let (tracker_tx, tracker_rx) = mpsc::channel(8);
        let reannouncer = Reannouncer::new(
            tiers,
            self.ctx.pool.clone(),
            base,
            self.data_tx.subscribe(),
            self.tx.clone(),
            tracker_rx,
        );
        self.sched.add_task(Duration::ZERO, Task::Tracker, async move {
            reannouncer.run().await;
            Ok(())
        });
        self.tracker_tx = Some(tracker_tx);
    }

    fn is_running(&self) -> bool {
        matches!(self.status, TorrentStatus::Downloading | TorrentStatus::Seeding)
    }

    fn handle_msg(&mut self, msg: TorrentMsg) -> Result<(), Error> {
        match msg {
            TorrentMsg::Connected(h) => self.connected(*h),
            TorrentMsg::DialFailed(addr) => {
                self.encoder.dial_done(&addr);
                self.dial();
            }
            TorrentMsg::Incoming(id, msg) => return self.incoming(id, msg),
            TorrentMsg::PieceSent(id, info) => {
                self.counter.record_upload(info.len as u64);
                if let Some(conn) = self.conns.get_mut(id) {
                    conn.uploader.sent(&info);
                }
                return self.flush_uploads(id);
            }
            TorrentMsg::PiecesDropped(id, dropped) => {
                if let Some(conn) = self.conns.get_mut(id) {
                    conn.uploader.dropped(dropped.len());
                }
                return self.flush_uploads(id);
            }
            TorrentMsg::Closed(id, e) => {
                if let Some(conn) = self.conns.get(id) {
                    debug!("{} closed: {e}", conn.addr);
                }
                self.remove_connection(id);
            }
            TorrentMsg::AddPeers(peers) => {
                let connected: HashSet<_> = self.conns.values().map(|c| c.addr).collect();
                let fresh = peers.into_iter().filter(|p| {
                    !connected.contains(&p.addr)
                        && !self.banned.contains(&p.addr.ip())
                        && p.peer_id != Some(self.ctx.local_peer_id)
                });
                self.encoder.start_connections(fresh);
                self.dial();
            }
            TorrentMsg::TrackerStats(stats) => {
                self.stats = stats;
                self.tracker_error = None;
            }
            TorrentMsg::TrackerError(e) => {
                warn!("announce failed: {e}");
                self.tracker_error = Some(e);
            }
            TorrentMsg::SetFilePriority(file, priority) => return self.set_file_priority(file, priority),
            TorrentMsg::GetState(tx) => {
                let _ = tx.send(self.state());
            }
            // handled by the loop
            TorrentMsg::Quit => {}
        }
        Ok(())
    }

    /// Take over a handshaked connection, or refuse it.
    fn connected(&mut self, h: Handshaked) {
        let addr = h.addr;
        if h.direction == Direction::Outbound {
            self.encoder.dial_done(&addr);
        }
        if !self.is_running() {
            debug!("{addr} refused, not running");
            return;
        }
        if self.banned.contains(&addr.ip()) {
            debug!("{addr} refused, banned");
            return;
        }
        if h.direction == Direction::Inbound && !self.encoder.can_accept(self.conns.len()) {
            debug!("{addr} refused, too many connections");
            return;
        }

        let dup = self.conns.iter().find(|(_, c)| c.peer_id == h.peer_id).map(|(id, c)| (id, c.addr));
        if let Some((old, old_addr)) = dup {
            if old_addr.ip() != addr.ip() {
                debug!("{addr} refused, {} already uses its peer id", old_addr);
                return;
            }
            debug!("{addr} replaces the older connection from {old_addr}");
            self.remove_connection(old);
        }

        let pieces = self.picker.len();
        let torrent_tx = self.tx.clone();
        let (params, config) = (&self.params, &self.config);
        let id = self
            .conns
            .insert_with_key(|id| Connection::new(id, h, pieces, torrent_tx, params, config));
        info!("{addr} connected, {} peers", self.conns.len());

        self.choker.connection_made(id);
        match &mut self.super_seeder {
            Some(ss) => {
                ss.connection_made(id);
                self.offer(id);
            }
            None => {
                let have = self.storage.have();
                if have.num_true() > 0 {
                    if let Some(conn) = self.conns.get(id) {
                        conn.send(Message::Bitfield(have.to_bytes().into()));
                    }
                }
            }
        }
    }

    /// Hand the next super-seed piece to `id`.
    fn offer(&mut self, id: ConnectionId) {
        let (Some(ss), Some(conn)) = (self.super_seeder.as_mut(), self.conns.get(id)) else {
            return;
        };
        if let Some(index) = ss.next_offer(id, &conn.have, &self.picker) {
            conn.send(Message::Have(index as u32));
        }
    }

    /// A frame from a connection. Faults of the peer close its connection,
    /// anything else escalates.
    fn incoming(&mut self, id: ConnectionId, msg: Message) -> Result<(), Error> {
        match self.on_message(id, msg) {
            Err(e) if e.kind() == ErrorKind::Malformed => {
                if let Some(conn) = self.conns.get(id) {
                    warn!("{} dropped: {e}", conn.addr);
                }
                self.remove_connection(id);
                Ok(())
            }
            r => r,
        }
    }

    fn on_message(&mut self, id: ConnectionId, msg: Message) -> Result<(), Error> {
        let pieces = self.picker.len();
        let Some(conn) = self.conns.get_mut(id) else { return Ok(()) };
        let first = !conn.state.got_anything;
        conn.state.got_anything = true;

        match msg {
            Message::KeepAlive | Message::Unknown(_) => {}
            Message::Choke => {
                conn.state.peer_choking = true;
                let lost = conn.downloader.take_requests();
                self.requests_lost(id, &lost);
                self.request_everywhere();
            }
            Message::Unchoke => {
                conn.state.peer_choking = false;
                self.fill(id);
            }
            Message::Interested => {
                conn.state.peer_interested = true;
                if conn.state.am_choking && self.choker.has_free_slot() {
                    self.rechoke(false);
                }
            }
            Message::NotInterested => {
                conn.state.peer_interested = false;
                if !conn.state.am_choking {
                    self.rechoke(false);
                }
            }
            Message::Have(index) => {
                let index = index as usize;
                if index >= pieces {
                    return Err(Error::ProtocolViolation("have index out of range"));
                }
                if conn.have.set(index, true) {
                    return Ok(());
                }
                self.picker.got_have(index);
                let offers = self.super_seeder.as_ref().map(|ss| ss.got_have(index)).unwrap_or_default();
                for peer in offers {
                    self.offer(peer);
                }
                self.peer_has_more(id);
            }
            Message::Bitfield(bytes) => {
                if !first {
                    return Err(Error::ProtocolViolation("bitfield after other messages"));
                }
                let have = Bitfield::from_bytes(&bytes, pieces)?;
                self.picker.got_bitfield(&have);
                conn.have = have;
                self.peer_has_more(id);
            }
            Message::Request(info) => {
                if info.index as usize >= pieces {
                    return Err(Error::ProtocolViolation("request index out of range"));
                }
                if !self.storage.is_have(info.index as usize) {
                    return Ok(());
                }
                if self.super_seeder.as_ref().is_some_and(|ss| !ss.may_serve(id, info.index as usize)) {
                    return Ok(());
                }
                match conn.uploader.got_request(info, conn.state.am_choking, conn.state.peer_interested) {
                    RequestVerdict::TooLong => {
                        return Err(Error::ProtocolViolation("request longer than max slice length"))
                    }
                    RequestVerdict::Ignored => {}
                    RequestVerdict::Queued => return self.flush_uploads(id),
                }
            }
            Message::Cancel(info) => {
                if !conn.uploader.got_cancel(&info) {
                    conn.cancel_piece(info);
                }
            }
            Message::Piece(block) => {
                let info = block.info();
                if !conn.downloader.got_piece(&info) {
                    debug!("{} sent an unrequested block {info:?}", conn.addr);
                    return Ok(());
                }
                self.counter.record_download(info.len as u64);
                self.cancel_duplicates(id, &info);

                match self.storage.piece_came_in(id, block)? {
                    PieceOutcome::Partial | PieceOutcome::Duplicate => {}
                    PieceOutcome::Verified => self.piece_verified(info.index as usize),
                    PieceOutcome::Failed { flunked } => self.piece_failed(info.index as usize, flunked),
                }
                self.fill(id);
            }
        }
        Ok(())
    }

    /// The peer advertised new pieces: update interest, and close the
    /// connection when both sides are seeds.
    fn peer_has_more(&mut self, id: ConnectionId) {
        let Some(conn) = self.conns.get(id) else { return };
        if conn.is_seed() && self.storage.is_complete() {
            debug!("{} closing, both seeds", conn.addr);
            self.remove_connection(id);
            return;
        }
        self.update_interest(id);
        self.fill(id);
    }

    fn update_interest(&mut self, id: ConnectionId) {
        let Some(conn) = self.conns.get_mut(id) else { return };
        let wanted = self.picker.is_interesting(&conn.have);
        if wanted != conn.state.am_interested {
            conn.state.am_interested = wanted;
            conn.send(if wanted { Message::Interested } else { Message::NotInterested });
        }
    }

    /// Top up the request pipeline of one connection.
    fn fill(&mut self, id: ConnectionId) {
        let Some(conn) = self.conns.get_mut(id) else { return };
        if conn.state.peer_choking || !conn.state.am_interested {
            return;
        }
        for req in conn.downloader.fill(&conn.have, &mut self.storage, &mut self.picker, &self.config) {
            conn.send(Message::Request(req));
        }
    }

    fn request_everywhere(&mut self) {
        let ids: Vec<ConnectionId> = self.conns.keys().collect();
        for id in ids {
            self.fill(id);
        }
    }

    /// Give requests back to storage, unless another connection still
    /// waits on the same block in endgame.
    fn requests_lost(&mut self, from: ConnectionId, lost: &[BlockInfo]) {
        for block in lost {
            let elsewhere = self
                .conns
                .iter()
                .any(|(id, c)| id != from && c.downloader.has_requested(block));
            if !elsewhere {
                self.storage.request_lost(block);
            }
        }
    }

    /// Cancel a block that arrived on `from` everywhere else it was asked.
    fn cancel_duplicates(&mut self, from: ConnectionId, info: &BlockInfo) {
        for (id, conn) in self.conns.iter_mut() {
            if id != from && conn.downloader.cancel(info) {
                conn.send(Message::Cancel(*info));
            }
        }
    }

    fn piece_verified(&mut self, index: usize) {
        self.picker.complete(index);
        for conn in self.conns.values() {
            conn.send(Message::Have(index as u32));
        }
        let ids: Vec<ConnectionId> = self.conns.keys().collect();
        for id in ids {
            self.update_interest(id);
        }
        if self.storage.is_complete() {
            self.completed();
        }
    }

    fn piece_failed(&mut self, index: usize, flunked: Vec<(ConnectionId, u64)>) {
        self.picker.bump(index);
        for (id, bytes) in flunked {
            let Some(conn) = self.conns.get_mut(id) else { continue };
            if !conn.downloader.flunk(bytes, self.config.kick_threshold) || !self.config.auto_kick {
                continue;
            }
            let ip = conn.addr.ip();
            warn!("{} kicked and banned after {} bytes of bad data", conn.addr, conn.downloader.flunked);
            self.banned.insert(ip);
            self.encoder.ban(ip);
            self.remove_connection(id);
        }
    }

    fn completed(&mut self) {
        info!("download of {} complete, seeding", self.name);
        self.status = TorrentStatus::Seeding;
        if let Some(tx) = &self.tracker_tx {
            let _ = tx.try_send(TrackerMsg::Completed);
        }
        let seeds: Vec<ConnectionId> =
            self.conns.iter().filter(|(_, c)| c.is_seed()).map(|(id, _)| id).collect();
        for id in seeds {
            self.remove_connection(id);
        }
        if let Err(e) = self.storage.flush() {
            warn!("flush after completion failed: {e}");
        }
        self.publish();
    }

    /// Read the next PIECEs of a connection's upload queue.
    fn flush_uploads(&mut self, id: ConnectionId) -> Result<(), Error> {
        let Some(conn) = self.conns.get_mut(id) else { return Ok(()) };
        match conn.uploader.flush(&mut self.storage) {
            Ok(blocks) => {
                for block in blocks {
                    conn.send(Message::Piece(block));
                }
                Ok(())
            }
            Err(e) => {
                // a request we cannot serve costs the requester its
                // connection, not the torrent
                warn!("{} dropped, could not serve its request: {e}", conn.addr);
                self.remove_connection(id);
                Ok(())
            }
        }
    }

    fn remove_connection(&mut self, id: ConnectionId) {
        let Some(mut conn) = self.conns.remove(id) else { return };
        conn.close();
        self.picker.lost_bitfield(&conn.have);
        let lost = conn.downloader.take_requests();
        self.requests_lost(id, &lost);
        if let Some(ss) = &mut self.super_seeder {
            ss.connection_lost(id);
        }
        if self.choker.connection_lost(id) {
            self.rechoke(false);
        }
        debug!("{} removed, {} peers", conn.addr, self.conns.len());
        self.request_everywhere();
        self.dial();
    }

    /// Run a choke round. `advance` is false for rounds run between
    /// periods.
    fn rechoke(&mut self, advance: bool) {
        let seeding = self.storage.is_complete();
        let candidates: Vec<Candidate> = self
            .conns
            .iter_mut()
            .map(|(id, c)| Candidate {
                id,
                interested: c.state.peer_interested,
                snubbed: c.downloader.snubbed,
                rate: if seeding { c.uploader.rate() } else { c.downloader.rate() },
            })
            .collect();

        let unchoked = match &mut self.super_seeder {
            Some(ss) => ss.rechoke(&candidates),
            None => self.choker.rechoke(&candidates, seeding, advance).clone(),
        };

        for (id, conn) in self.conns.iter_mut() {
            let unchoke = unchoked.contains(id);
            if unchoke && conn.state.am_choking {
                conn.state.am_choking = false;
                conn.send(Message::Unchoke);
            } else if !unchoke && !conn.state.am_choking {
                conn.state.am_choking = true;
                conn.uploader.choked();
                conn.send(Message::Choke);
            }
        }
    }

    /// Start queued dials the limits allow.
    fn dial(&mut self) {
        if !self.is_running() {
            return;
        }
        let has_inbound = self.conns.values().any(|c| c.direction == Direction::Inbound);
        let connected: HashSet<_> = self.conns.values().map(|c| c.addr).collect();
        let banned = &self.banned;
        let dials = self.encoder.next_dials(self.conns.len(), has_inbound, |p| {
            connected.contains(&p.addr) || banned.contains(&p.addr.ip())
        });

        let limit = Duration::from_secs(self.config.handshake_timeout);
        let policy = self.config.crypto();
        for peer in dials {
            let tx = self.tx.clone();
            let ctx = self.ctx.clone();
            let info_hash = self.info_hash;
            self.sched.add_task(Duration::ZERO, Task::Dial, async move {
                let Ok(_permit) = ctx.half_open.clone().acquire_owned().await else {
                    return Ok(());
                };
                match peer::connect(peer, info_hash, ctx.local_peer_id, policy, limit).await {
                    Ok(h) => tx.send(TorrentMsg::Connected(Box::new(h))).await?,
                    Err(e) => {
                        debug!("{} dial failed: {e}", peer.addr);
                        tx.send(TorrentMsg::DialFailed(peer.addr)).await?;
                    }
                }
                Ok(())
            });
        }
    }

    fn tick(&mut self) -> Result<(), Error> {
        self.counter.update_rates();

        let snub = self.config.snub();
        let mut snubbed = Vec::new();
        for (id, c) in self.conns.iter_mut() {
            if c.downloader.check_snub(c.state.peer_choking, snub) {
                debug!("{} snubbed us", c.addr);
                snubbed.push((id, c.downloader.take_requests()));
            }
        }
        for (id, lost) in snubbed {
            self.requests_lost(id, &lost);
        }

        self.request_everywhere();
        self.dial();
        self.publish();
        Ok(())
    }

    fn set_file_priority(&mut self, file: usize, priority: Priority) -> Result<(), Error> {
        let Some(p) = self.file_priority.get_mut(file) else {
            warn!("no file {file}");
            return Ok(());
        };
        *p = priority;
        self.storage.set_file_disabled(file, priority == Priority::Disabled)?;
        self.apply_priorities();
        let ids: Vec<ConnectionId> = self.conns.keys().collect();
        for id in ids {
            self.update_interest(id);
        }
        Ok(())
    }

    /// A piece takes the highest priority of the files it overlaps, so
    /// it is disabled only when all of them are.
    fn apply_priorities(&mut self) {
        for index in 0..self.picker.len() {
            let priority = self
                .storage
                .files_of_piece(index)
                .iter()
                .filter_map(|f| self.file_priority.get(*f))
                .max()
                .copied()
                .unwrap_or(Priority::Normal);
            self.picker.set_priority(index, priority);
        }
    }

    fn state(&self) -> TorrentState {
        let check_progress = if self.check_total == 0 {
            1.0
        } else {
            1.0 - self.to_check.len() as f64 / self.check_total as f64
        };
        TorrentState {
            name: self.name.clone(),
            info_hash: self.info_hash,
            status: self.status.clone(),
            stats: self.stats,
            size: self.meta.info.get_torrent_size(),
            downloaded: self.counter.total_downloaded,
            uploaded: self.counter.total_uploaded,
            left: self.storage.left(),
            download_rate: self.counter.download_rate(),
            upload_rate: self.counter.upload_rate(),
            peers: self.conns.len(),
            seeds: self.conns.values().filter(|c| c.is_seed()).count(),
            distributed_copies: self.picker.distributed_copies(),
            alloc_progress: self.storage.alloc_progress(),
            check_progress,
            tracker_error: self.tracker_error.clone(),
        }
    }

    fn announce_data(&self) -> AnnounceData {
        AnnounceData {
            uploaded: self.counter.total_uploaded,
            downloaded: self.counter.total_downloaded,
            left: self.storage.left(),
        }
    }

    /// Push the numbers to the reannouncer and the state to the owner.
    fn publish(&self) {
        self.data_tx.send_replace(self.announce_data());
        self.state_tx.send_replace(self.state());
    }

    /// Choke and close every connection, announce `stopped` and flush
    /// storage.
    async fn shutdown(&mut self) {
        self.sched.kill_tasks(&Task::Dial);
        for (_, conn) in self.conns.drain() {
            if !conn.state.am_choking {
                conn.send(Message::Choke);
            }
            conn.close();
        }

        if let Some(tracker_tx) = self.tracker_tx.take() {
            let (ack, done) = oneshot::channel();
            let stop = async {
                if tracker_tx.send(TrackerMsg::Stop { data: self.announce_data(), ack }).await.is_ok() {
                    let _ = done.await;
                }
            };
            if timeout(STOP_TIMEOUT + Duration::from_secs(1), stop).await.is_err() {
                debug!("stopped announce did not finish in time");
            }
        }
        self.sched.kill_tasks(&Task::Tracker);

        if let Err(e) = self.storage.close() {
            error!("could not close storage: {e}");
        }
        if !matches!(self.status, TorrentStatus::Error(_)) {
            self.status = TorrentStatus::Stopped;
        }
        self.publish();
    }

    /// Stop transferring after an error that is not a single peer's fault.
    async fn halt(&mut self, e: Error) -> Result<(), Error> {
        error!("{} halted: {e}", self.name);
        self.status = TorrentStatus::Error(e.to_string());
        self.shutdown().await;
        match e {
            Error::IntegrityFailure(_) | Error::TooManyTaskErrors(_) => Err(e),
            e => Err(Error::StorageHalted(e.to_string())),
        }
    }
}
