//! HTTP(S) announces.
//!
//! Redirects are followed up to 10 hops; the URL they end at replaces the
//! configured one, so the next announce goes there directly. Responses may
//! be gzip encoded. Peers come either as a list of dictionaries or in the
//! compact form, IPv6 peers in `peers6`, and `crypto_flags` marks the
//! compact peers that speak the obfuscated handshake.
use std::{net::SocketAddr, time::Duration};

use hashbrown::HashMap;
use reqwest::{redirect::Policy, Client, Url};
use tracing::{debug, info, warn};

use super::{AnnounceRequest, AnnounceResponse, TrackerFailure};
use crate::{
    addr,
    bencode::{self, Value},
    error::Error,
    peer::{PeerAddr, PeerId},
    torrent::InfoHash,
};

/// Interval used when the tracker does not send one.
const DEFAULT_INTERVAL: u32 = 30 * 60;

/// Query keys we add, stripped from a redirect target before caching it.
const OUR_KEYS: [&str; 15] = [
    "info_hash",
    "peer_id",
    "port",
    "uploaded",
    "downloaded",
    "left",
    "event",
    "key",
    "numwant",
    "compact",
    "no_peer_id",
    "supportcrypto",
    "requirecrypto",
    "cryptoport",
    "trackerid",
];

#[derive(Debug)]
pub struct HttpAnnouncer {
    url: Url,
    client: Client,
    /// `tracker id` handed out by the tracker, echoed back per swarm.
    tracker_ids: HashMap<InfoHash, String>,
}

impl HttpAnnouncer {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, Error> {
        let url = Url::parse(url).map_err(|_| Error::TrackerUrlInvalid(url.to_string()))?;
        let client = Client::builder()
            .redirect(Policy::limited(10))
            .timeout(timeout)
            .gzip(true)
            .build()?;
        Ok(Self { url, client, tracker_ids: HashMap::new() })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn announce_url(&self, req: &AnnounceRequest) -> String {
        let mut q = format!(
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&key={:08x}\
             &numwant={}&compact=1&no_peer_id=1",
            urlencoding::encode_binary(&req.info_hash.0),
            urlencoding::encode_binary(&req.peer_id.0),
            // stealth only tells peers that read cryptoport where we are
            if req.crypto.stealth { 0 } else { req.port },
            req.uploaded,
            req.downloaded,
            req.left,
            req.key,
            req.numwant,
        );
        if let Some(event) = req.event.as_query() {
            q.push_str("&event=");
            q.push_str(event);
        }
        if req.crypto.allowed {
            q.push_str("&supportcrypto=1");
        }
        if req.crypto.only {
            q.push_str(&format!("&requirecrypto=1&cryptoport={}", req.port));
        }
        if let Some(id) = self.tracker_ids.get(&req.info_hash) {
            q.push_str("&trackerid=");
            q.push_str(&urlencoding::encode(id));
        }

        let sep = if self.url.query().is_some() { '&' } else { '?' };
        format!("{}{sep}{q}", self.url)
    }

    #[tracing::instrument(skip_all, fields(url = %self.url, event = ?req.event))]
    pub async fn announce(&mut self, req: &AnnounceRequest) -> Result<AnnounceResponse, TrackerFailure> {
        let url = self.announce_url(req);
        let res = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| TrackerFailure::Trouble(e.to_string()))?;

        self.remember_redirect(res.url());

        if !res.status().is_success() {
            return Err(TrackerFailure::Trouble(format!("HTTP status {}", res.status())));
        }
        let body = res.bytes().await.map_err(|e| TrackerFailure::Trouble(e.to_string()))?;
        let (response, tracker_id) = parse_response(&body)?;

        if let Some(id) = tracker_id {
            self.tracker_ids.insert(req.info_hash, id);
        }
        if let Some(w) = &response.warning {
            warn!("tracker warning: {w}");
        }
        debug!("announce got {} peers, interval {}", response.peers.len(), response.interval);
        Ok(response)
    }

    fn remember_redirect(&mut self, landed: &Url) {
        let mut base = landed.clone();
        let kept: Vec<(String, String)> = landed
            .query_pairs()
            .filter(|(k, _)| !OUR_KEYS.contains(&k.as_ref()))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if kept.is_empty() {
            base.set_query(None);
        } else {
            base.query_pairs_mut().clear().extend_pairs(kept);
        }
        if base != self.url {
            info!("tracker moved from {} to {base}", self.url);
            self.url = base;
        }
    }
}

/// Decode an announce response body. Also returns the `tracker id`, if
/// any.
pub fn parse_response(body: &[u8]) -> Result<(AnnounceResponse, Option<String>), TrackerFailure> {
    let value = bencode::decode_sloppy(body).map_err(|e| TrackerFailure::BadData(e.to_string()))?;
    if value.as_dict().is_none() {
        return Err(TrackerFailure::BadData("response is not a dictionary".into()));
    }
    if let Some(reason) = value.get(b"failure reason") {
        let reason = reason.as_bytes().map(|b| String::from_utf8_lossy(b).into_owned());
        return Err(TrackerFailure::Rejected(reason.unwrap_or_default()));
    }

    let int = |key: &[u8]| value.get(key).and_then(Value::as_integer).map(|i| i.max(0) as u32);
    let text = |key: &[u8]| {
        value.get(key).and_then(Value::as_bytes).map(|b| String::from_utf8_lossy(b).into_owned())
    };

    let mut peers = match value.get(b"peers") {
        None => Vec::new(),
        Some(Value::Bytes(b)) => {
            let addrs = addr::parse_compact_v4(b)
                .map_err(|_| TrackerFailure::BadData("compact peers not a multiple of 6".into()))?;
            let flags = value.get(b"crypto_flags").and_then(Value::as_bytes);
            addrs
                .into_iter()
                .enumerate()
                .map(|(i, addr)| PeerAddr {
                    addr,
                    peer_id: None,
                    crypto: flags.and_then(|f| f.get(i)).is_some_and(|f| *f == 1),
                })
                .collect()
        }
        Some(Value::List(list)) => list.iter().filter_map(dict_peer).collect(),
        Some(_) => return Err(TrackerFailure::BadData("peers has the wrong type".into())),
    };

    if let Some(b) = value.get(b"peers6").and_then(Value::as_bytes) {
        let v6 = addr::parse_compact_v6(b)
            .map_err(|_| TrackerFailure::BadData("compact peers6 not a multiple of 18".into()))?;
        peers.extend(v6.into_iter().map(PeerAddr::from));
    }

    let response = AnnounceResponse {
        interval: int(b"interval").unwrap_or(DEFAULT_INTERVAL),
        min_interval: int(b"min interval"),
        complete: int(b"complete").unwrap_or(0),
        incomplete: int(b"incomplete").unwrap_or(0),
        peers,
        warning: text(b"warning message"),
    };
    Ok((response, text(b"tracker id")))
}

/// `{ip, port, peer id}`, entries we cannot read are skipped.
fn dict_peer(v: &Value) -> Option<PeerAddr> {
    let ip = v.get(b"ip")?.as_str()?.parse().ok()?;
    let port = u16::try_from(v.get(b"port")?.as_integer()?).ok()?;
    let peer_id = v.get(b"peer id").and_then(Value::as_bytes).and_then(|b| PeerId::try_from(&b[..]).ok());
    Some(PeerAddr { addr: SocketAddr::new(ip, port), peer_id, crypto: false })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CryptoPolicy;

    fn request() -> AnnounceRequest {
        AnnounceRequest {
            info_hash: InfoHash([0xab; 20]),
            peer_id: PeerId([b'x'; 20]),
            port: 6881,
            uploaded: 1,
            downloaded: 2,
            left: 3,
            event: super::super::Event::Started,
            key: 0xbeef,
            numwant: 50,
            crypto: CryptoPolicy { allowed: true, only: true, stealth: false },
        }
    }

    #[test]
    fn query_string() {
        let a = HttpAnnouncer::new("http://t/announce?passkey=abc", Duration::from_secs(1)).unwrap();
        let url = a.announce_url(&request());
        assert!(url.starts_with("http://t/announce?passkey=abc&info_hash=%AB%AB"));
        assert!(url.contains("&key=0000beef"));
        assert!(url.contains("&event=started"));
        assert!(url.contains("&supportcrypto=1&requirecrypto=1&cryptoport=6881"));
        assert!(!url.contains("trackerid"));
        assert!(url.contains("&port=6881&"));
    }

    #[test]
    fn stealth_hides_the_plain_port() {
        let a = HttpAnnouncer::new("http://t/announce", Duration::from_secs(1)).unwrap();
        let mut req = request();
        req.crypto.stealth = true;
        let url = a.announce_url(&req);
        assert!(url.contains("&port=0&"));
        assert!(url.contains("&cryptoport=6881"));
    }

    #[test]
    fn compact_response_with_flags() {
        let body = b"d8:completei3e12:crypto_flags2:\x01\x0010:incompletei1e8:intervali900e12:min intervali60e5:peers12:\x0a\x00\x00\x01\x1a\xe1\x0a\x00\x00\x02\x1a\xe210:tracker id3:xyze";
        let (res, id) = parse_response(body).unwrap();
        assert_eq!(res.interval, 900);
        assert_eq!(res.min_interval, Some(60));
        assert_eq!(res.stats().seeders, 3);
        assert_eq!(res.peers.len(), 2);
        assert_eq!(res.peers[0].addr, "10.0.0.1:6881".parse().unwrap());
        assert!(res.peers[0].crypto);
        assert!(!res.peers[1].crypto);
        assert_eq!(id.as_deref(), Some("xyz"));
    }

    #[test]
    fn dict_peers() {
        let body = b"d8:intervali60e5:peersld2:ip8:10.0.0.97:peer id20:aaaaaaaaaaaaaaaaaaaa4:porti80eed2:ip3:bad4:porti1eeee";
        let (res, _) = parse_response(body).unwrap();
        assert_eq!(res.peers.len(), 1);
        assert_eq!(res.peers[0].peer_id, Some(PeerId([b'a'; 20])));
    }

    #[test]
    fn untidy_tracker_output_is_accepted() {
        let body = b"d8:intervali60e8:completei2e5:peers6:\x0a\x00\x00\x01\x1a\xe1e\r\n";
        let (res, _) = parse_response(body).unwrap();
        assert_eq!(res.complete, 2);
        assert_eq!(res.peers.len(), 1);
    }

    #[test]
    fn failure_reason() {
        let body = b"d14:failure reason9:not founde";
        assert_eq!(parse_response(body).unwrap_err(), TrackerFailure::Rejected("not found".into()));
        assert!(matches!(parse_response(b"garbage"), Err(TrackerFailure::BadData(_))));
    }

    #[test]
    fn redirect_target_is_cached_without_our_keys() {
        let mut a = HttpAnnouncer::new("http://t1/announce", Duration::from_secs(1)).unwrap();
        let landed = Url::parse("https://t2/announce?info_hash=%AB&passkey=z&port=1").unwrap();
        a.remember_redirect(&landed);
        assert_eq!(a.url().as_str(), "https://t2/announce?passkey=z");
    }
}
