//! Dial-back checks of announced ports.
use std::{net::SocketAddr, time::Duration};

use tracing::debug;

use super::query::CryptoSupport;
use crate::{
    crypto::CryptoPolicy,
    peer::{self, PeerAddr, PeerId},
    torrent::InfoHash,
};

/// Connect to `addr`, exchange handshakes for `info_hash` and check the
/// remote claims `peer_id`. The connection is dropped right after.
pub async fn natcheck(
    addr: SocketAddr,
    info_hash: InfoHash,
    peer_id: PeerId,
    crypto: CryptoSupport,
    timeout: Duration,
) -> bool {
    let policy = CryptoPolicy {
        allowed: crypto != CryptoSupport::Plain,
        only: crypto == CryptoSupport::Required,
        stealth: false,
    };
    let target = PeerAddr { addr, peer_id: Some(peer_id), crypto: crypto != CryptoSupport::Plain };
    // any id but the peer's own
    let local_id = PeerId::generate();

    match peer::connect(target, info_hash, local_id, policy, timeout).await {
        Ok(_) => true,
        Err(e) => {
            debug!("natcheck of {addr} failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_util::codec::Framed;

    use super::*;
    use crate::tcp_wire::{Handshake, HandshakeCodec};

    async fn peer_answering_as(id: PeerId) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (s, _) = listener.accept().await.unwrap();
            let mut s = Framed::new(s, HandshakeCodec);
            let theirs = s.next().await.unwrap().unwrap();
            s.send(Handshake::new(theirs.info_hash, id)).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn reachable_peer_with_the_right_id() {
        let id = PeerId([5; 20]);
        let addr = peer_answering_as(id).await;
        let t = Duration::from_secs(5);
        assert!(natcheck(addr, InfoHash([1; 20]), id, CryptoSupport::Plain, t).await);
    }

    #[tokio::test]
    async fn wrong_id_counts_as_natted() {
        let addr = peer_answering_as(PeerId([6; 20])).await;
        let t = Duration::from_secs(5);
        assert!(!natcheck(addr, InfoHash([1; 20]), PeerId([5; 20]), CryptoSupport::Plain, t).await);
    }

    #[tokio::test]
    async fn closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let t = Duration::from_secs(5);
        assert!(!natcheck(addr, InfoHash([1; 20]), PeerId([5; 20]), CryptoSupport::Plain, t).await);
    }
}
