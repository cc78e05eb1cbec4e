//! The obfuscation handshake.
//!
//! ```text
//! A -> B  Ya, PadA
//! B -> A  Yb, PadB
//! A -> B  HASH('req1', S), HASH('req2', SKEY) xor HASH('req3', S),
//!         ENCRYPT(VC, crypto_provide, len(PadC), PadC, len(IA)), ENCRYPT(IA)
//! B -> A  ENCRYPT(VC, crypto_select, len(PadD), PadD), ENCRYPT2(payload)
//! A -> B  ENCRYPT2(payload)
//! ```
//!
//! `S` is the Diffie-Hellman secret and `SKEY` the info-hash. A encrypts
//! with `SHA1('keyA', S, SKEY)` and B with `SHA1('keyB', S, SKEY)`, both
//! keystreams with their first 1024 bytes discarded. `VC` is eight zero
//! bytes; A finds where B's padding ends by searching for the encrypted VC.
use bytes::{Buf, BytesMut};
use rand::Rng;
use sha1_smol::Sha1;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::{
    arc4::Arc4,
    dh::{KeyPair, KEY_LEN},
    stream::CryptoStream,
};
use crate::{error::Error, tcp_wire::PSTR, torrent::InfoHash};

const VC: [u8; 8] = [0; 8];
const CRYPTO_PLAINTEXT: u32 = 0x01;
const CRYPTO_RC4: u32 = 0x02;

/// Longest padding we accept from a remote.
const MAX_PAD: usize = 512;
/// Longest padding we send.
const SEND_PAD: usize = 200;

/// What the negotiation settled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoMode {
    /// Only the negotiation was encrypted; the stream continues in the clear.
    HeaderOnly,
    /// The whole stream is ARC4 encrypted.
    FullStream,
}

/// Local encryption preferences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CryptoPolicy {
    /// Take part in obfuscated handshakes at all.
    pub allowed: bool,
    /// Refuse plaintext handshakes and header-only encryption. A plaintext
    /// peer still gets our handshake before we hang up.
    pub only: bool,
    /// Like `only`, but plaintext peers get no bytes at all and trackers
    /// over HTTP learn our port only as `cryptoport`.
    pub stealth: bool,
}

impl Default for CryptoPolicy {
    fn default() -> Self {
        Self { allowed: true, only: false, stealth: false }
    }
}

impl CryptoPolicy {
    fn provide(&self) -> u32 {
        if self.only {
            CRYPTO_RC4
        } else {
            CRYPTO_RC4 | CRYPTO_PLAINTEXT
        }
    }

    fn select(&self, provide: u32) -> Option<u32> {
        if provide & CRYPTO_RC4 != 0 {
            Some(CRYPTO_RC4)
        } else if provide & CRYPTO_PLAINTEXT != 0 && !self.only {
            Some(CRYPTO_PLAINTEXT)
        } else {
            None
        }
    }
}

/// Whether the first bytes of an inbound connection are a plaintext
/// BitTorrent handshake. Needs at least 20 bytes to answer `true`.
pub fn is_plaintext_handshake(prefix: &[u8]) -> bool {
    prefix.len() >= 20 && prefix[0] == PSTR.len() as u8 && prefix[1..20] == PSTR
}

fn hash(label: &[u8], data: &[u8]) -> [u8; 20] {
    let mut h = Sha1::new();
    h.update(label);
    h.update(data);
    h.digest().bytes()
}

fn keystream(label: &[u8], secret: &[u8], skey: &[u8]) -> Arc4 {
    let mut h = Sha1::new();
    h.update(label);
    h.update(secret);
    h.update(skey);
    let mut c = Arc4::new(&h.digest().bytes());
    c.discard(1024);
    c
}

fn padding() -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let len = rng.gen_range(0..=SEND_PAD);
    (0..len).map(|_| rng.gen()).collect()
}

/// Buffered reads over the raw socket while the handshake is in progress.
struct Wire<S> {
    io: S,
    buf: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Wire<S> {
    async fn fill(&mut self, n: usize) -> Result<(), Error> {
        while self.buf.len() < n {
            if self.io.read_buf(&mut self.buf).await? == 0 {
                return Err(Error::PeerClosedSocket);
            }
        }
        Ok(())
    }

    async fn take(&mut self, n: usize) -> Result<BytesMut, Error> {
        self.fill(n).await?;
        Ok(self.buf.split_to(n))
    }

    /// Consume bytes up to and including `pattern`, which must start
    /// within `window` bytes.
    async fn sync(&mut self, pattern: &[u8], window: usize) -> Result<(), Error> {
        loop {
            if let Some(at) = self.buf.windows(pattern.len()).position(|w| w == pattern) {
                self.buf.advance(at + pattern.len());
                return Ok(());
            }
            if self.buf.len() >= window + pattern.len() {
                return Err(Error::CryptoHandshake("sync pattern not found"));
            }
            if self.io.read_buf(&mut self.buf).await? == 0 {
                return Err(Error::PeerClosedSocket);
            }
        }
    }
}

/// Run the initiator side over a fresh connection to a peer of `info_hash`.
pub async fn initiate<S>(
    io: S,
    info_hash: &InfoHash,
    policy: CryptoPolicy,
) -> Result<(CryptoStream<S>, CryptoMode), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut wire = Wire { io, buf: BytesMut::new() };
    let keys = KeyPair::generate();

    let mut hello = keys.public().to_vec();
    hello.extend(padding());
    wire.io.write_all(&hello).await?;

    let yb = wire.take(KEY_LEN).await?;
    let secret = keys.shared_secret(&yb)?;
    let skey = &info_hash.0;

    let mut enc = keystream(b"keyA", &secret, skey);
    let mut dec = keystream(b"keyB", &secret, skey);

    let req2 = hash(b"req2", skey);
    let req3 = hash(b"req3", &secret);
    let mut out = hash(b"req1", &secret).to_vec();
    out.extend(req2.iter().zip(req3.iter()).map(|(a, b)| a ^ b));

    let pad_c = padding();
    let mut crypted = VC.to_vec();
    crypted.extend_from_slice(&policy.provide().to_be_bytes());
    crypted.extend_from_slice(&(pad_c.len() as u16).to_be_bytes());
    crypted.extend_from_slice(&pad_c);
    // no initial payload, the peer handshake follows the negotiation
    crypted.extend_from_slice(&0u16.to_be_bytes());
    enc.apply(&mut crypted);
    out.extend(crypted);
    wire.io.write_all(&out).await?;

    // B's padding ends where its encrypted VC starts
    let mut vc = VC;
    dec.apply(&mut vc);
    wire.sync(&vc, MAX_PAD).await?;

    let mut head = wire.take(6).await?;
    dec.apply(&mut head);
    let select = u32::from_be_bytes([head[0], head[1], head[2], head[3]]);
    let pad_d = u16::from_be_bytes([head[4], head[5]]) as usize;
    if pad_d > MAX_PAD {
        return Err(Error::CryptoHandshake("padding too long"));
    }
    let mut pad = wire.take(pad_d).await?;
    dec.apply(&mut pad);

    let mode = match select {
        CRYPTO_RC4 if policy.provide() & CRYPTO_RC4 != 0 => CryptoMode::FullStream,
        CRYPTO_PLAINTEXT if policy.provide() & CRYPTO_PLAINTEXT != 0 => CryptoMode::HeaderOnly,
        _ => return Err(Error::CryptoHandshake("peer selected an unoffered method")),
    };
    debug!("encrypted handshake done as initiator, {mode:?}");

    let Wire { io, buf } = wire;
    let stream = match mode {
        CryptoMode::FullStream => {
            CryptoStream::encrypted(io, Some(enc), Some(dec), BytesMut::new(), buf)
        }
        CryptoMode::HeaderOnly => CryptoStream::with_prefix(io, buf),
    };
    Ok((stream, mode))
}

/// A completed responder handshake.
#[derive(Debug)]
pub struct Accepted<S> {
    pub stream: CryptoStream<S>,
    pub info_hash: InfoHash,
    pub mode: CryptoMode,
}

/// Run the responder side of an inbound connection. `prefix` holds the
/// bytes already read while telling it apart from a plaintext handshake.
/// The torrent is identified by probing `hosted`.
pub async fn respond<S>(
    io: S,
    prefix: BytesMut,
    hosted: &[InfoHash],
    policy: CryptoPolicy,
) -> Result<Accepted<S>, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if !policy.allowed {
        return Err(Error::CryptoHandshake("encryption disabled"));
    }

    let mut wire = Wire { io, buf: prefix };
    let ya = wire.take(KEY_LEN).await?;

    let keys = KeyPair::generate();
    let mut hello = keys.public().to_vec();
    hello.extend(padding());
    wire.io.write_all(&hello).await?;

    let secret = keys.shared_secret(&ya)?;
    wire.sync(&hash(b"req1", &secret), MAX_PAD).await?;

    let obfuscated = wire.take(20).await?;
    let req3 = hash(b"req3", &secret);
    let req2: Vec<u8> = obfuscated.iter().zip(req3.iter()).map(|(a, b)| a ^ b).collect();

    let info_hash = hosted
        .iter()
        .find(|ih| hash(b"req2", &ih.0)[..] == req2[..])
        .copied()
        .ok_or(Error::CryptoHandshake("unknown info hash"))?;

    let skey = &info_hash.0;
    let mut dec = keystream(b"keyA", &secret, skey);
    let mut enc = keystream(b"keyB", &secret, skey);

    let mut head = wire.take(14).await?;
    dec.apply(&mut head);
    if head[..8] != VC {
        return Err(Error::CryptoHandshake("bad verification constant"));
    }
    let provide = u32::from_be_bytes([head[8], head[9], head[10], head[11]]);
    let pad_c = u16::from_be_bytes([head[12], head[13]]) as usize;
    if pad_c > MAX_PAD {
        return Err(Error::CryptoHandshake("padding too long"));
    }
    let mut pad = wire.take(pad_c).await?;
    dec.apply(&mut pad);

    let mut ia_len = wire.take(2).await?;
    dec.apply(&mut ia_len);
    let ia_len = u16::from_be_bytes([ia_len[0], ia_len[1]]) as usize;
    let mut initial_payload = wire.take(ia_len).await?;
    dec.apply(&mut initial_payload);

    let select = policy
        .select(provide)
        .ok_or(Error::CryptoHandshake("no common encryption method"))?;

    let pad_d = padding();
    let mut reply = VC.to_vec();
    reply.extend_from_slice(&select.to_be_bytes());
    reply.extend_from_slice(&(pad_d.len() as u16).to_be_bytes());
    reply.extend_from_slice(&pad_d);
    enc.apply(&mut reply);
    wire.io.write_all(&reply).await?;

    let Wire { io, buf } = wire;
    let (stream, mode) = if select == CRYPTO_RC4 {
        let s = CryptoStream::encrypted(io, Some(enc), Some(dec), initial_payload, buf);
        (s, CryptoMode::FullStream)
    } else {
        initial_payload.extend_from_slice(&buf);
        (CryptoStream::with_prefix(io, initial_payload), CryptoMode::HeaderOnly)
    };
    debug!("encrypted handshake done as responder for {info_hash}, {mode:?}");

    Ok(Accepted { stream, info_hash, mode })
}
