use tokio::time::Instant;

/// Contains the state of both sides of the connection.
#[derive(Clone, Copy, Debug)]
pub struct ConnectionState {
    /// If we're choking, we don't send PIECEs to the peer.
    pub am_choking: bool,

    /// If we're interested, the peer has pieces that we want.
    pub am_interested: bool,

    /// If the peer is choking us, it won't answer our requests.
    pub peer_choking: bool,

    /// If the peer is interested, it wants pieces that we have.
    pub peer_interested: bool,

    /// Set by the first message after the handshake. A BITFIELD is only
    /// valid before this.
    pub got_anything: bool,

    /// When the handshake completed.
    pub connected_at: Instant,
}

impl Default for ConnectionState {
    /// Both sides of the connection start off as choked and not interested
    /// in the other.
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            got_anything: false,
            connected_at: Instant::now(),
        }
    }
}
