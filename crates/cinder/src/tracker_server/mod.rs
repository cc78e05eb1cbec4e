//! The tracker: an HTTP service that keeps the members of many swarms and
//! introduces them to each other.
//!
//! Connections are served by hyper on their own tasks
//! ([`http::serve_connection`]), which pass requests to the
//! [`TrackerServer`] actor. The actor is the only owner of the swarm
//! state. It also runs the periodic work: saving the state file, expiring
//! silent peers and reloading the access lists. NAT checks run on its
//! [`Scheduler`] and report back through the same mailbox.
pub mod allowed;
pub mod becache;
pub mod dfile;
pub mod http;
pub mod natcheck;
pub mod query;
pub mod state;

use std::{
    net::{IpAddr, SocketAddr},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tokio::{
    net::TcpListener,
    select, spawn,
    sync::{mpsc, oneshot},
    time::{interval_at, Instant},
};
use tracing::{debug, error, info, warn};

use self::{
    allowed::AccessLists,
    http::{serve_connection, Request, Response},
    query::{scrape_hashes, AnnounceParams, Query},
    state::{Followup, SwarmState},
};
use crate::{
    addr,
    bencode::{self, Value},
    config::{ScrapeMode, TrackerConfig},
    error::Error,
    peer::PeerId,
    sched::Scheduler,
    torrent::InfoHash,
};

/// Idle time after which a kept-alive connection is closed.
const KEEP_ALIVE: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub enum ServerMsg {
    Request { req: Request, remote: SocketAddr, reply: oneshot::Sender<Response> },
    NatChecked { info_hash: InfoHash, peer_id: PeerId, reachable: bool },
    Quit,
}

/// Talks to a running [`TrackerServer`].
#[derive(Debug, Clone)]
pub struct TrackerHandle {
    tx: mpsc::Sender<ServerMsg>,
}

impl TrackerHandle {
    /// Save the state file and stop.
    pub async fn quit(&self) -> Result<(), Error> {
        self.tx.send(ServerMsg::Quit).await?;
        Ok(())
    }
}

pub struct TrackerServer {
    config: TrackerConfig,
    state: SwarmState,
    access: AccessLists,
    sched: Scheduler<InfoHash>,
    tx: mpsc::Sender<ServerMsg>,
    rx: mpsc::Receiver<ServerMsg>,
    /// Unix seconds of the last expiry sweep.
    prev_sweep: u64,
}

fn now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs())
}

fn failure(reason: &str) -> Response {
    let mut d = Value::dict();
    d.insert(b"failure reason", reason);
    Response::bencoded(bencode::encode(&d))
}

impl TrackerServer {
    /// Load the state file and the access lists. A broken access list is
    /// a configuration error.
    pub async fn new(config: TrackerConfig) -> Result<Self, Error> {
        config.validate()?;
        let access = AccessLists::new(&config)?;
        let state = match &config.dfile {
            Some(path) => dfile::load(path, config.nat_check).await?,
            None => SwarmState::new(config.nat_check),
        };
        let (tx, rx) = mpsc::channel(1024);
        Ok(Self { config, state, access, sched: Scheduler::new(), tx, rx, prev_sweep: now() })
    }

    pub fn handle(&self) -> TrackerHandle {
        TrackerHandle { tx: self.tx.clone() }
    }

    pub fn state(&self) -> &SwarmState {
        &self.state
    }

    /// Serve `listener` until [`TrackerHandle::quit`].
    #[tracing::instrument(name = "tracker", skip_all, fields(addr = ?listener.local_addr().ok()))]
    pub async fn run(mut self, listener: TcpListener) -> Result<(), Error> {
        info!("tracker listening");
        let tx = self.tx.clone();
        let accept = spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, remote)) => {
                        spawn(serve_connection(socket, remote, tx.clone(), KEEP_ALIVE));
                    }
                    Err(e) => warn!("accept failed: {e}"),
                }
            }
        });

        let secs = Duration::from_secs;
        let start = Instant::now();
        let save_every = secs(self.config.save_dfile_interval.max(1));
        let expire_every = secs(self.config.timeout_downloaders_interval.max(1));
        let reload_every = secs(self.config.parse_dir_interval.max(1));
        let mut save = interval_at(start + save_every, save_every);
        let mut expire = interval_at(start + expire_every, expire_every);
        let mut reload = interval_at(start + reload_every, reload_every);

        loop {
            select! {
                Some(msg) = self.rx.recv() => match msg {
                    ServerMsg::Request { req, remote, reply } => {
                        let res = self.handle_request(&req, remote);
                        let _ = reply.send(res);
                    }
                    ServerMsg::NatChecked { info_hash, peer_id, reachable } => {
                        self.state.nat_checked(&info_hash, &peer_id, reachable);
                    }
                    ServerMsg::Quit => break,
                },
                _ = save.tick() => self.save().await,
                _ = expire.tick() => {
                    let now = now();
                    let gone = self.state.expire(self.prev_sweep);
                    if gone > 0 {
                        info!("expired {gone} silent peers");
                    }
                    self.prev_sweep = now;
                    self.forget_empty_swarms();
                }
                _ = reload.tick() => {
                    if let Err(e) = self.access.reload() {
                        error!("keeping the old access lists: {e}");
                    }
                }
                r = self.sched.join_next() => r?,
            }
        }

        accept.abort();
        self.sched.shutdown();
        self.save().await;
        info!("tracker stopped");
        Ok(())
    }

    /// NAT checks of swarms the sweep removed have nobody to report to.
    fn forget_empty_swarms(&mut self) {
        let empty: Vec<InfoHash> =
            self.sched.tags().filter(|h| !self.state.downloads.contains_key(*h)).copied().collect();
        for info_hash in empty {
            self.sched.kill_tasks(&info_hash);
        }
    }

    async fn save(&self) {
        let Some(path) = &self.config.dfile else { return };
        if let Err(e) = dfile::save(path, &self.state).await {
            error!("could not save the state file: {e}");
        }
    }

    pub fn handle_request(&mut self, req: &Request, remote: SocketAddr) -> Response {
        if req.method != "GET" {
            return Response::bad_request("only GET is supported");
        }
        match req.path() {
            "/announce" => self.announce(req, remote),
            "/scrape" => self.scrape(req),
            _ => Response::not_found(),
        }
    }

    /// The address a peer is reachable at: the socket address, the first
    /// public hop of `X-Forwarded-For` when the socket address is local,
    /// or the `ip` parameter when overriding is allowed.
    fn effective_ip(&self, req: &Request, remote: IpAddr, claimed: Option<IpAddr>) -> IpAddr {
        let mut ip = addr::normalize(remote);
        if addr::is_local(ip) {
            let forwarded = req
                .header("x-forwarded-for")
                .into_iter()
                .flat_map(|h| h.split(','))
                .filter_map(|s| s.trim().parse::<IpAddr>().ok())
                .map(addr::normalize)
                .find(|ip| !addr::is_local(*ip));
            if let Some(f) = forwarded {
                ip = f;
            }
        }
        if let Some(claimed) = claimed {
            if !self.config.only_local_override_ip || addr::is_local(ip) {
                ip = addr::normalize(claimed);
            }
        }
        ip
    }

    fn announce(&mut self, req: &Request, remote: SocketAddr) -> Response {
        let q = Query::parse(req.query());
        let p = match AnnounceParams::from_query(&q) {
            Ok(p) => p,
            Err(e) => return failure(&e),
        };
        if !self.access.is_allowed(&p.info_hash) {
            return failure("Requested download is not authorized for use with this tracker.");
        }
        let ip = self.effective_ip(req, remote.ip(), p.ip);
        if let Err(reason) = self.access.check_ip(ip) {
            return failure(reason);
        }
        if self.config.compact_reqd && !p.compact {
            return failure("your client is outdated, please upgrade");
        }

        match self.state.announce(&p, ip, now()) {
            Err(reason) => return failure(&reason),
            Ok(Followup::Nothing) => {}
            Ok(Followup::NatCheck(addr, crypto)) => {
                let (info_hash, peer_id) = (p.info_hash, p.peer_id);
                let timeout = Duration::from_secs(self.config.nat_check_timeout);
                let tx = self.tx.clone();
                self.sched.add_task(Duration::ZERO, info_hash, async move {
                    let reachable = natcheck::natcheck(addr, info_hash, peer_id, crypto, timeout).await;
                    tx.send(ServerMsg::NatChecked { info_hash, peer_id, reachable }).await?;
                    Ok(())
                });
            }
        }

        let (complete, incomplete) = self.state.counts(&p.info_hash);
        let mut d = Value::dict();
        d.insert(b"interval", self.config.reannounce_interval);
        if let Some(min) = self.config.min_interval {
            d.insert(b"min interval", min);
        }
        d.insert(b"complete", complete);
        d.insert(b"incomplete", incomplete);

        let n = p
            .numwant
            .unwrap_or(self.config.response_size)
            .min(self.config.response_size)
            .min(self.config.max_give);
        for (k, v) in self.state.peer_list(&p, n) {
            d.insert(k, v);
        }
        debug!("{} announced {:?} from {ip}", p.peer_id, p.event);
        Response::bencoded(bencode::encode(&d))
    }

    fn scrape(&self, req: &Request) -> Response {
        let hashes = match scrape_hashes(&Query::parse(req.query())) {
            Ok(h) => h,
            Err(e) => return failure(&e),
        };
        match self.config.scrape_allowed {
            ScrapeMode::None => return failure("scraping not allowed"),
            ScrapeMode::Specific if hashes.is_empty() => {
                return failure("specific scrape function is not available with this tracker.")
            }
            _ => {}
        }

        let hashes: Vec<InfoHash> = if hashes.is_empty() {
            match &self.access.torrents {
                Some(t) => t.keys().copied().collect(),
                None => self.state.downloads.keys().copied().collect(),
            }
        } else {
            hashes.into_iter().filter(|h| self.access.is_allowed(h)).collect()
        };

        let mut files = Value::dict();
        for h in hashes {
            let (complete, incomplete) = self.state.counts(&h);
            let mut f = Value::dict();
            f.insert(b"complete", complete);
            f.insert(b"incomplete", incomplete);
            f.insert(b"downloaded", self.state.completed.get(&h).copied().unwrap_or(0));
            if let Some(name) = self
                .access
                .torrents
                .as_ref()
                .and_then(|t| t.get(&h))
                .filter(|t| !t.name.is_empty())
                .map(|t| t.name.as_str())
            {
                f.insert(b"name", name);
            }
            files.insert(&h.0, f);
        }
        let mut d = Value::dict();
        d.insert(b"files", files);
        Response::bencoded(bencode::encode(&d))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crypto::CryptoPolicy,
        tracker::{http::HttpAnnouncer, AnnounceRequest, Event, TrackerFailure},
    };

    async fn start(config: TrackerConfig) -> (String, TrackerHandle) {
        let server = TrackerServer::new(config).await.unwrap();
        let handle = server.handle();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        spawn(server.run(listener));
        (format!("http://{addr}"), handle)
    }

    fn request(peer: u8, port: u16, left: u64) -> AnnounceRequest {
        AnnounceRequest {
            info_hash: InfoHash([9; 20]),
            peer_id: PeerId([peer; 20]),
            port,
            uploaded: 0,
            downloaded: 0,
            left,
            event: Event::Started,
            key: peer as u32,
            numwant: 50,
            crypto: CryptoPolicy { allowed: false, only: false, stealth: false },
        }
    }

    #[tokio::test]
    async fn peers_meet_through_the_tracker() {
        let (base, handle) = start(TrackerConfig::default()).await;
        let url = format!("{base}/announce");
        let t = Duration::from_secs(5);

        let mut seed = HttpAnnouncer::new(&url, t).unwrap();
        let res = seed.announce(&request(1, 7001, 0)).await.unwrap();
        assert!(res.peers.is_empty());
        assert_eq!(res.complete, 1);

        let mut leech = HttpAnnouncer::new(&url, t).unwrap();
        let res = leech.announce(&request(2, 7002, 100)).await.unwrap();
        assert_eq!(res.peers.len(), 1);
        assert_eq!(res.peers[0].addr, "127.0.0.1:7001".parse::<SocketAddr>().unwrap());
        assert_eq!((res.complete, res.incomplete), (1, 1));

        // the seed only gets the leecher back
        let res = seed.announce(&request(1, 7001, 0)).await.unwrap();
        assert_eq!(res.peers.len(), 1);
        assert_eq!(res.peers[0].addr.port(), 7002);

        let mut stop = request(2, 7002, 100);
        stop.event = Event::Stopped;
        leech.announce(&stop).await.unwrap();
        let res = seed.announce(&request(1, 7001, 0)).await.unwrap();
        assert!(res.peers.is_empty());
        assert_eq!(res.incomplete, 0);

        handle.quit().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_paths_are_404() {
        let (base, handle) = start(TrackerConfig::default()).await;
        let res = reqwest::get(format!("{base}/")).await.unwrap();
        assert_eq!(res.status().as_u16(), 404);
        handle.quit().await.unwrap();
    }

    #[tokio::test]
    async fn request_bodies_do_not_leak_into_the_next_request() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (base, handle) = start(TrackerConfig::default()).await;
        let addr = base.trim_start_matches("http://");
        let mut socket = tokio::net::TcpStream::connect(addr).await.unwrap();
        socket
            .write_all(
                b"GET /scrape HTTP/1.1\r\nHost: t\r\nContent-Length: 5\r\n\r\nhello\
                  GET /nothing HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n",
            )
            .await
            .unwrap();

        let mut wire = Vec::new();
        socket.read_to_end(&mut wire).await.unwrap();
        let wire = String::from_utf8_lossy(&wire);
        // bodies are not newline terminated, look for status lines anywhere
        let statuses: Vec<&str> = wire.match_indices("HTTP/1.1 ").map(|(i, _)| &wire[i..i + 12]).collect();
        assert_eq!(statuses, ["HTTP/1.1 200", "HTTP/1.1 404"]);
        handle.quit().await.unwrap();
    }

    #[tokio::test]
    async fn allow_list_rejects_other_torrents() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("allowed");
        std::fs::write(&list, format!("{}\n", "01".repeat(20))).unwrap();
        let config = TrackerConfig { allowed_list: Some(list), ..Default::default() };
        let (base, handle) = start(config).await;

        let mut a = HttpAnnouncer::new(&format!("{base}/announce"), Duration::from_secs(5)).unwrap();
        let err = a.announce(&request(1, 7001, 0)).await.unwrap_err();
        assert!(matches!(err, TrackerFailure::Rejected(_)));
        handle.quit().await.unwrap();
    }

    #[tokio::test]
    async fn scrape_modes() {
        let mut server = TrackerServer::new(TrackerConfig::default()).await.unwrap();
        let remote: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let get = |target: &str| Request::new("GET", target);

        let announce = format!(
            "/announce?info_hash={}&peer_id={}&port=1&left=0&event=completed",
            "%09".repeat(20),
            "a".repeat(20)
        );
        server.handle_request(&get(&announce), remote);

        let res = server.handle_request(&get("/scrape"), remote);
        let v = bencode::decode(&res.body).unwrap();
        let stats = v.get(b"files").unwrap().get(&[9; 20]).unwrap();
        assert_eq!(stats.get(b"complete").unwrap().as_integer(), Some(1));

        server.config.scrape_allowed = ScrapeMode::Specific;
        let res = server.handle_request(&get("/scrape"), remote);
        assert!(bencode::decode(&res.body).unwrap().get(b"failure reason").is_some());

        server.config.scrape_allowed = ScrapeMode::None;
        let res = server.handle_request(&get(&format!("/scrape?info_hash={}", "%09".repeat(20))), remote);
        assert!(bencode::decode(&res.body).unwrap().get(b"failure reason").is_some());
    }

    #[tokio::test]
    async fn sweep_kills_nat_checks_of_vanished_swarms() {
        let mut server = TrackerServer::new(TrackerConfig::default()).await.unwrap();
        server.sched.add_task(Duration::ZERO, InfoHash([5; 20]), std::future::pending::<Result<(), Error>>());
        server.forget_empty_swarms();
        assert_eq!(server.sched.tags().count(), 0);
    }

    #[tokio::test]
    async fn forwarded_and_overridden_addresses() {
        let server = TrackerServer::new(TrackerConfig::default()).await.unwrap();
        let req = Request {
            method: "GET".into(),
            target: "/announce".into(),
            headers: vec![("x-forwarded-for".into(), "192.168.1.1, 8.8.4.4".into())],
        };
        let local = "127.0.0.1".parse().unwrap();
        let public: IpAddr = "1.1.1.1".parse().unwrap();
        assert_eq!(server.effective_ip(&req, local, None), "8.8.4.4".parse::<IpAddr>().unwrap());
        // a public client cannot claim another address
        let claimed = Some("9.9.9.9".parse().unwrap());
        assert_eq!(server.effective_ip(&req, public, claimed), public);
    }
}
