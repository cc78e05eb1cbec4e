use std::{
    io,
    pin::Pin,
    task::{ready, Context, Poll},
};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::arc4::Arc4;

/// A transport that may or may not be encrypted.
///
/// Plaintext and encrypted connections share this type, so nothing above
/// the handshake can tell them apart. Bytes read ahead during a handshake
/// are replayed before touching the socket: `plain` holds bytes that are
/// already decrypted, `raw` holds bytes that still go through the cipher.
#[derive(Debug)]
pub struct CryptoStream<S> {
    inner: S,
    enc: Option<Arc4>,
    dec: Option<Arc4>,
    plain: BytesMut,
    raw: BytesMut,
    /// Encrypted bytes accepted by `poll_write` but not yet on the socket.
    pending: BytesMut,
}

impl<S> CryptoStream<S> {
    /// An unencrypted stream.
    pub fn plain(inner: S) -> Self {
        Self::with_prefix(inner, BytesMut::new())
    }

    /// An unencrypted stream that first replays `prefix`.
    pub fn with_prefix(inner: S, prefix: BytesMut) -> Self {
        Self {
            inner,
            enc: None,
            dec: None,
            plain: prefix,
            raw: BytesMut::new(),
            pending: BytesMut::new(),
        }
    }

    pub(crate) fn encrypted(
        inner: S,
        enc: Option<Arc4>,
        dec: Option<Arc4>,
        plain: BytesMut,
        raw: BytesMut,
    ) -> Self {
        Self { inner, enc, dec, plain, raw, pending: BytesMut::new() }
    }

    pub fn is_encrypted(&self) -> bool {
        self.enc.is_some()
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncWrite + Unpin> CryptoStream<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.pending.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CryptoStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.plain.is_empty() {
            let n = buf.remaining().min(this.plain.len());
            buf.put_slice(&this.plain.split_to(n));
            return Poll::Ready(Ok(()));
        }

        if !this.raw.is_empty() {
            let n = buf.remaining().min(this.raw.len());
            let mut chunk = this.raw.split_to(n);
            if let Some(dec) = this.dec.as_mut() {
                dec.apply(&mut chunk);
            }
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }

        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        if let Some(dec) = this.dec.as_mut() {
            dec.apply(&mut buf.filled_mut()[before..]);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CryptoStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;

        let Some(enc) = this.enc.as_mut() else {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        };

        // the keystream has advanced, so these bytes are ours from now on
        let start = this.pending.len();
        this.pending.extend_from_slice(buf);
        enc.apply(&mut this.pending[start..]);

        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
