//! A replay wrapper for sniffed bytes.
//!
//! The `CONNECT` handler reads ahead on the client stream to decide between
//! TLS termination and plaintext passthrough, and the request loop may hold
//! bytes that belong to the next message. [`PeekStream`] puts such bytes
//! back in front of the stream so downstream parsers see them again.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Buf, Bytes};
use tokio::io::{self, AsyncRead, AsyncWrite, ReadBuf};

/// A stream whose reads first drain an injected prefix, then fall through
/// to the inner stream. Writes pass through untouched.
pub(crate) struct PeekStream<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> PeekStream<S> {
    pub(crate) fn new(inner: S, prefix: Bytes) -> Self {
        Self { prefix, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.prefix.is_empty() {
            return Pin::new(&mut self.inner).poll_read(cx, out);
        }
        let n = self.prefix.len().min(out.remaining());
        if n > 0 {
            out.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn prefix_is_read_before_inner() {
        let mut s = PeekStream::new(Cursor::new(b" world".to_vec()), Bytes::from_static(b"hello"));
        let mut out = String::new();
        s.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn partial_reads_drain_prefix_first() {
        let mut s = PeekStream::new(Cursor::new(b"cd".to_vec()), Bytes::from_static(b"ab"));
        let mut buf = [0u8; 1];
        s.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"a");
        let mut rest = Vec::new();
        s.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"bcd");
    }

    #[tokio::test]
    async fn empty_prefix_falls_through() {
        let mut s = PeekStream::new(Cursor::new(b"xyz".to_vec()), Bytes::new());
        let mut out = Vec::new();
        s.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"xyz");
    }

    #[tokio::test]
    async fn writes_pass_through() {
        use tokio::io::AsyncWriteExt;
        let mut s = PeekStream::new(Cursor::new(Vec::new()), Bytes::from_static(b"unread"));
        s.write_all(b"written").await.unwrap();
        assert_eq!(s.inner.get_ref(), b"written");
    }
}
