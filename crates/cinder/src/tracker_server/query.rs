//! Announce and scrape parameters, decoded from the request query.
use std::net::IpAddr;

use hashbrown::HashMap;

use crate::{
    peer::PeerId,
    torrent::InfoHash,
};

/// Percent-decoded query pairs. Values are bytes, `info_hash` and
/// `peer_id` are binary.
#[derive(Debug, Default)]
pub struct Query(HashMap<String, Vec<Vec<u8>>>);

impl Query {
    pub fn parse(query: &str) -> Self {
        let mut map: HashMap<String, Vec<Vec<u8>>> = HashMap::new();
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            let k = urlencoding::decode(k).map(|k| k.into_owned()).unwrap_or_else(|_| k.to_string());
            let v = urlencoding::decode_binary(v.replace('+', " ").as_bytes()).into_owned();
            map.entry(k).or_default().push(v);
        }
        Self(map)
    }

    /// First value of `key`.
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.0.get(key).and_then(|v| v.first()).map(Vec::as_slice)
    }

    pub fn get_all(&self, key: &str) -> &[Vec<u8>] {
        self.0.get(key).map_or(&[], Vec::as_slice)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| std::str::from_utf8(v).ok())
    }

    fn get_num<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>, String> {
        match self.get_str(key) {
            None | Some("") => Ok(None),
            Some(s) => s.parse().map(Some).map_err(|_| format!("invalid {key}")),
        }
    }

    fn flag(&self, key: &str) -> bool {
        self.get_str(key).is_some_and(|v| v == "1")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnnounceEvent {
    #[default]
    Update,
    Started,
    Completed,
    Stopped,
    /// Look at the swarm without joining it.
    Snooped,
}

/// What a client can do with obfuscation, as claimed in its announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum CryptoSupport {
    #[default]
    Plain,
    Supported,
    Required,
}

impl CryptoSupport {
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(i: u64) -> Self {
        match i {
            1 => Self::Supported,
            2 => Self::Required,
            _ => Self::Plain,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnnounceParams {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: AnnounceEvent,
    pub numwant: Option<usize>,
    /// Address the client claims, honored only from local clients
    /// unless configured otherwise.
    pub ip: Option<IpAddr>,
    pub key: Option<String>,
    pub compact: bool,
    pub no_peer_id: bool,
    pub crypto: CryptoSupport,
    /// Port for obfuscated connections, replaces `port` when set.
    pub cryptoport: Option<u16>,
}

impl AnnounceParams {
    /// Errors are sent back as the `failure reason`.
    pub fn from_query(q: &Query) -> Result<Self, String> {
        let info_hash = q
            .get("info_hash")
            .and_then(|v| InfoHash::try_from(v).ok())
            .ok_or("invalid info_hash")?;
        let peer_id = q
            .get("peer_id")
            .and_then(|v| PeerId::try_from(v).ok())
            .ok_or("invalid peer_id")?;
        let port = q.get_num::<u16>("port")?.ok_or("missing port")?;

        let event = match q.get_str("event") {
            None | Some("") | Some("empty") => AnnounceEvent::Update,
            Some("started") => AnnounceEvent::Started,
            Some("completed") => AnnounceEvent::Completed,
            Some("stopped") => AnnounceEvent::Stopped,
            Some("snooped") => AnnounceEvent::Snooped,
            Some(_) => return Err("invalid event".into()),
        };

        let crypto = if q.flag("requirecrypto") {
            CryptoSupport::Required
        } else if q.flag("supportcrypto") {
            CryptoSupport::Supported
        } else {
            CryptoSupport::Plain
        };

        let ip = match q.get_str("ip") {
            None | Some("") => None,
            Some(s) => Some(s.parse().map_err(|_| "invalid ip".to_string())?),
        };

        Ok(Self {
            info_hash,
            peer_id,
            port,
            uploaded: q.get_num("uploaded")?.unwrap_or(0),
            downloaded: q.get_num("downloaded")?.unwrap_or(0),
            left: q.get_num("left")?.ok_or("missing left")?,
            event,
            numwant: q.get_num("numwant")?,
            ip,
            key: q.get_str("key").filter(|k| !k.is_empty()).map(str::to_string),
            compact: q.flag("compact"),
            no_peer_id: q.flag("no_peer_id"),
            crypto,
            cryptoport: q.get_num("cryptoport")?.filter(|p| *p != 0),
        })
    }

    pub fn is_seed(&self) -> bool {
        self.left == 0
    }
}

/// Info-hashes named in a scrape; empty for "everything".
pub fn scrape_hashes(q: &Query) -> Result<Vec<InfoHash>, String> {
    q.get_all("info_hash")
        .iter()
        .map(|v| InfoHash::try_from(v.as_slice()).map_err(|_| "invalid info_hash".to_string()))
        .collect()
}
