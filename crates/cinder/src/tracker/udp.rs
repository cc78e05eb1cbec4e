//! UDP announces, BEP 15.
//!
//! A connect exchange hands out a connection id that stays valid for a
//! minute, then announces reuse it. Lost datagrams are retransmitted after
//! `15 * 2^n` seconds, but never past the announce timeout. The path and
//! query of the URL ride along as BEP 41 URLData options.
use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use reqwest::Url;
use tokio::{
    net::{lookup_host, UdpSocket},
    time::timeout,
};
use tracing::{debug, trace};

use super::{
    action::Action,
    announce::{self, error_message},
    connect, AnnounceRequest, AnnounceResponse, TrackerFailure,
};
use crate::{addr, error::Error, peer::PeerAddr};

const ANNOUNCE_RES_BUF_LEN: usize = 8192;

/// How long a connection id may be reused.
const CONNECTION_ID_TTL: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct UdpAnnouncer {
    url: Url,
    host: String,
    port: u16,
    socket: Option<UdpSocket>,
    connection: Option<(u64, Instant)>,
    timeout: Duration,
    /// First retransmit delay, doubled on every loss.
    retransmit: Duration,
}

impl UdpAnnouncer {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, Error> {
        let invalid = || Error::TrackerUrlInvalid(url.to_string());
        let parsed = Url::parse(url).map_err(|_| invalid())?;
        let host = parsed.host_str().ok_or_else(invalid)?.to_string();
        let port = parsed.port().ok_or_else(invalid)?;
        Ok(Self {
            url: parsed,
            host,
            port,
            socket: None,
            connection: None,
            timeout,
            retransmit: Duration::from_secs(15),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Path and query as URLData options.
    fn url_data(&self) -> Vec<u8> {
        let mut pq = self.url.path().to_string();
        if let Some(q) = self.url.query() {
            pq.push('?');
            pq.push_str(q);
        }
        if pq.is_empty() || pq == "/" {
            return Vec::new();
        }
        announce::url_data(&pq)
    }

    async fn socket(&mut self) -> Result<&UdpSocket, TrackerFailure> {
        if self.socket.is_none() {
            let trouble = |e: std::io::Error| TrackerFailure::Trouble(e.to_string());
            let remote: SocketAddr = lookup_host((self.host.as_str(), self.port))
                .await
                .map_err(trouble)?
                .next()
                .ok_or_else(|| TrackerFailure::Trouble(format!("{} did not resolve", self.host)))?;
            let local = if remote.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
            let socket = UdpSocket::bind(local).await.map_err(trouble)?;
            socket.connect(remote).await.map_err(trouble)?;
            debug!("udp tracker socket to {remote}");
            self.socket = Some(socket);
        }
        self.socket.as_ref().ok_or_else(|| TrackerFailure::Trouble("no socket".into()))
    }

    /// Send `payload` and wait for a datagram echoing `transaction_id`,
    /// retransmitting on loss. Returns the datagram length.
    async fn exchange(
        &mut self,
        payload: &[u8],
        transaction_id: u32,
        buf: &mut [u8],
    ) -> Result<usize, TrackerFailure> {
        let deadline = Instant::now() + self.timeout;
        let mut wait = self.retransmit;
        let trouble = |e: std::io::Error| TrackerFailure::Trouble(e.to_string());
        let socket = self.socket().await?;

        socket.send(payload).await.map_err(trouble)?;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(TrackerFailure::Trouble("timed out".into()));
            }
            match timeout(wait.min(left), socket.recv(buf)).await {
                Ok(Ok(len)) => {
                    if len >= 8 && buf[4..8] == transaction_id.to_be_bytes() {
                        return Ok(len);
                    }
                    trace!("ignoring stray datagram of {len} bytes");
                }
                Ok(Err(e)) => return Err(trouble(e)),
                Err(_) => {
                    wait *= 2;
                    debug!("udp tracker request was lost, trying again");
                    socket.send(payload).await.map_err(trouble)?;
                }
            }
        }
    }

    async fn connect(&mut self) -> Result<u64, TrackerFailure> {
        if let Some((id, at)) = self.connection {
            if at.elapsed() < CONNECTION_ID_TTL {
                return Ok(id);
            }
        }
        let req = connect::Request::new();
        let payload = req.serialize().map_err(|e| TrackerFailure::BadData(e.to_string()))?;
        let mut buf = [0u8; 64];
        let len = self.exchange(&payload, req.transaction_id, &mut buf).await?;

        if let Some(msg) = error_message(&buf[..len]) {
            return Err(TrackerFailure::Rejected(msg));
        }
        let res = connect::Response::deserialize(&buf[..len])
            .map_err(|e| TrackerFailure::BadData(e.to_string()))?;
        if res.action != Action::Connect as u32 {
            return Err(TrackerFailure::BadData(format!("unexpected action {}", res.action)));
        }
        self.connection = Some((res.connection_id, Instant::now()));
        Ok(res.connection_id)
    }

    #[tracing::instrument(skip_all, fields(url = %self.url, event = ?req.event))]
    pub async fn announce(&mut self, req: &AnnounceRequest) -> Result<AnnounceResponse, TrackerFailure> {
        let connection_id = self.connect().await?;

        let announce = announce::Request {
            connection_id,
            action: Action::Announce as u32,
            transaction_id: rand::random(),
            info_hash: req.info_hash.0,
            peer_id: req.peer_id.0,
            downloaded: req.downloaded,
            left: req.left,
            uploaded: req.uploaded,
            event: req.event as u32,
            ip_address: 0,
            key: req.key,
            num_want: i32::try_from(req.numwant).unwrap_or(-1),
            port: req.port,
        };
        let mut payload =
            announce.serialize().map_err(|e| TrackerFailure::BadData(e.to_string()))?;
        payload.extend_from_slice(&self.url_data());

        let mut buf = vec![0u8; ANNOUNCE_RES_BUF_LEN];
        let len = match self.exchange(&payload, announce.transaction_id, &mut buf).await {
            Ok(len) => len,
            Err(e) => {
                // the id may have expired on the tracker side
                self.connection = None;
                return Err(e);
            }
        };
        let buf = &buf[..len];

        if let Some(msg) = error_message(buf) {
            self.connection = None;
            return Err(TrackerFailure::Rejected(msg));
        }
        let (res, peers) = announce::Response::deserialize(buf)
            .map_err(|e| TrackerFailure::BadData(e.to_string()))?;
        if res.action != Action::Announce as u32 {
            return Err(TrackerFailure::BadData(format!("unexpected action {}", res.action)));
        }

        let ipv6 = self
            .socket
            .as_ref()
            .and_then(|s| s.peer_addr().ok())
            .is_some_and(|a| a.is_ipv6());
        let peers = if ipv6 { addr::parse_compact_v6(peers) } else { addr::parse_compact_v4(peers) }
            .map_err(|e| TrackerFailure::BadData(e.to_string()))?;

        debug!("announce got {} peers, interval {}", peers.len(), res.interval);

        Ok(AnnounceResponse {
            interval: res.interval,
            min_interval: None,
            complete: res.seeders,
            incomplete: res.leechers,
            peers: peers.into_iter().map(PeerAddr::from).collect(),
            warning: None,
        })
    }
}
