//! The tracker's state file: swarm members and completion counts,
//! bencoded.
//!
//! ```text
//! d
//!   9:completed d <info hash> i<count>e ... e
//!   5:peers d <info hash> d <peer id> d
//!       2:ip <str>  4:port i  4:left i  6:crypto i  3:key <str>?
//!       3:nat i<1 when reachable>e  9:last_seen i
//!   e ... e ... e
//! e
//! ```
use std::path::Path;

use bytes::Bytes;
use tracing::{debug, info};

use super::{
    query::CryptoSupport,
    state::{NatStatus, SwarmPeer, SwarmState},
};
use crate::{
    bencode::{self, Value},
    error::Error,
    peer::PeerId,
    torrent::InfoHash,
};

pub fn encode_state(state: &SwarmState) -> Vec<u8> {
    let mut completed = Value::dict();
    for (h, n) in &state.completed {
        completed.insert(&h.0, *n);
    }

    let mut swarms = Value::dict();
    for (h, swarm) in &state.downloads {
        let mut peers = Value::dict();
        for (id, p) in swarm {
            let mut d = Value::dict();
            d.insert(b"ip", p.ip.to_string());
            d.insert(b"port", p.port);
            d.insert(b"left", p.left);
            d.insert(b"crypto", p.crypto.index() as u64);
            if let Some(k) = &p.key {
                d.insert(b"key", k.as_str());
            }
            d.insert(b"nat", u64::from(p.nat == NatStatus::Reachable));
            d.insert(b"last_seen", p.last_seen);
            peers.insert(&id.0, d);
        }
        swarms.insert(&h.0, peers);
    }

    let mut root = Value::dict();
    root.insert(b"completed", completed);
    root.insert(b"peers", swarms);
    bencode::encode(&root)
}

pub fn decode_state(buf: &[u8], nat_check: u32) -> Result<SwarmState, Error> {
    let root = bencode::decode(buf)?;
    let mut state = SwarmState::new(nat_check);

    if let Some(completed) = root.get(b"completed").and_then(Value::as_dict) {
        for (h, n) in completed {
            let (Ok(h), Some(n)) = (InfoHash::try_from(&h[..]), n.as_integer()) else {
                continue;
            };
            state.completed.insert(h, n.max(0) as u64);
        }
    }

    let Some(swarms) = root.get(b"peers").and_then(Value::as_dict) else {
        return Ok(state);
    };
    for (h, peers) in swarms {
        let Ok(h) = InfoHash::try_from(&h[..]) else { continue };
        let Some(peers) = peers.as_dict() else { continue };
        for (id, p) in peers {
            let Ok(id) = PeerId::try_from(&id[..]) else { continue };
            match decode_peer(p) {
                Some(peer) => state.restore(h, id, peer),
                None => debug!("skipping malformed peer {id} of {h}"),
            }
        }
    }
    Ok(state)
}

fn decode_peer(p: &Value) -> Option<SwarmPeer> {
    let int = |k: &[u8]| p.get(k).and_then(Value::as_integer);
    Some(SwarmPeer {
        ip: p.get(b"ip")?.as_str()?.parse().ok()?,
        port: u16::try_from(int(b"port")?).ok()?,
        left: u64::try_from(int(b"left")?).ok()?,
        crypto: CryptoSupport::from_index(int(b"crypto").unwrap_or(0).max(0) as u64),
        key: p.get(b"key").and_then(Value::as_str).map(str::to_string),
        nat: if int(b"nat") == Some(1) { NatStatus::Reachable } else { NatStatus::Failed(0) },
        last_seen: u64::try_from(int(b"last_seen")?).ok()?,
    })
}

/// Write through a temporary file, so a crash leaves the old state.
pub async fn save(path: &Path, state: &SwarmState) -> Result<(), Error> {
    let buf = encode_state(state);
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, &buf).await?;
    tokio::fs::rename(&tmp, path).await?;
    debug!("saved {} swarms to {path:?}", state.num_swarms());
    Ok(())
}

/// A missing file is an empty state.
pub async fn load(path: &Path, nat_check: u32) -> Result<SwarmState, Error> {
    let buf = match tokio::fs::read(path).await {
        Ok(buf) => Bytes::from(buf),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(SwarmState::new(nat_check)),
        Err(e) => return Err(e.into()),
    };
    let state = decode_state(&buf, nat_check)?;
    info!("loaded {} swarms from {path:?}", state.num_swarms());
    Ok(state)
}
