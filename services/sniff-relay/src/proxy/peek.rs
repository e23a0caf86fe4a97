//! Non-destructive inspection of a byte stream.
//!
//! [`PeekStream`] records every byte it reads. [`PeekStream::into_replay`]
//! turns it into a [`Replay`] that yields the recorded prefix first and then
//! continues with the live stream, so the next consumer sees the stream as if
//! nothing had been read.
//!
//! Wrappers compose: a `PeekStream<Replay<S>>` reads through the inner
//! prefix, so the outer prefix covers it and nothing is replayed twice.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Default upper bound on bytes buffered while inspecting a stream.
///
/// Large enough for post-quantum ClientHellos spanning several records.
pub const DEFAULT_MAX_PEEK_BYTES: usize = 64 * 1024;

/// Stream wrapper that keeps a copy of everything read through it.
#[derive(Debug)]
pub struct PeekStream<S> {
    inner: S,
    peeked: BytesMut,
}

impl<S> PeekStream<S> {
    /// Wrap a stream.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            peeked: BytesMut::new(),
        }
    }

    /// Bytes read so far.
    pub fn peeked(&self) -> &[u8] {
        &self.peeked
    }

    /// Finish inspection and hand back a stream that starts at the first
    /// peeked byte.
    pub fn into_replay(self) -> Replay<S> {
        Replay::new(self.peeked.freeze(), self.inner)
    }
}

impl<S: AsyncRead + Unpin> PeekStream<S> {
    /// Read up to `buf.len()` bytes, recording them for replay.
    ///
    /// Returns `Ok(0)` at end of stream. Cancelling the future before it
    /// completes loses no data.
    pub async fn peek_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf).await?;
        self.peeked.extend_from_slice(&buf[..n]);
        Ok(n)
    }
}

/// A stream whose reads start with a fixed prefix.
///
/// Writes, flushes and shutdowns go straight to the inner stream.
#[derive(Debug)]
pub struct Replay<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> Replay<S> {
    /// Serve `prefix` before reading from `inner`.
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }

    /// Prefix bytes not yet read.
    pub fn pending(&self) -> &[u8] {
        &self.prefix
    }

    /// The wrapped stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Split into the unread prefix and the wrapped stream.
    pub fn into_parts(self) -> (Bytes, S) {
        (self.prefix, self.inner)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Replay<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            let chunk = self.prefix.split_to(n);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Replay<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
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
    use super::*;
    use proptest::prelude::*;
    use tokio::io::AsyncWriteExt;

    async fn drain<R: AsyncRead + Unpin>(mut reader: R) -> Vec<u8> {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_replay_after_single_peek() {
        let data: &[u8] = b"hello world";
        let mut peek = PeekStream::new(data);

        let mut buf = [0u8; 5];
        let n = peek.peek_read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(peek.peeked(), b"hello");

        assert_eq!(drain(peek.into_replay()).await, b"hello world");
    }

    #[tokio::test]
    async fn test_peek_at_eof_records_nothing() {
        let data: &[u8] = b"";
        let mut peek = PeekStream::new(data);

        let mut buf = [0u8; 1];
        assert_eq!(peek.peek_read(&mut buf).await.unwrap(), 0);
        assert!(peek.peeked().is_empty());
        assert!(drain(peek.into_replay()).await.is_empty());
    }

    #[tokio::test]
    async fn test_nested_peek_replays_both_prefixes_once() {
        let data: &[u8] = b"\x16\x03\x01rest-of-the-stream";
        let mut first = PeekStream::new(data);
        let mut one = [0u8; 1];
        first.peek_read(&mut one).await.unwrap();

        let mut second = PeekStream::new(first.into_replay());
        let mut buf = [0u8; 4];
        let n = second.peek_read(&mut buf).await.unwrap();
        // The inner replay hands out its one-byte prefix on its own.
        assert_eq!(&buf[..n], b"\x16");
        second.peek_read(&mut buf).await.unwrap();
        assert_eq!(second.peeked(), b"\x16\x03\x01re");

        assert_eq!(drain(second.into_replay()).await, data);
    }

    #[tokio::test]
    async fn test_small_reads_split_prefix() {
        let mut replay = Replay::new(Bytes::from_static(b"abcdef"), &b"gh"[..]);
        let mut buf = [0u8; 4];
        let n = replay.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abcd");
        assert_eq!(replay.pending(), b"ef");
        assert_eq!(drain(replay).await, b"efgh");
    }

    #[tokio::test]
    async fn test_writes_pass_through() {
        let (near, mut far) = tokio::io::duplex(64);
        let mut replay = PeekStream::new(near).into_replay();

        replay.write_all(b"pong").await.unwrap();
        replay.shutdown().await.unwrap();

        let mut got = Vec::new();
        far.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"pong");
    }

    proptest! {
        #[test]
        fn prop_peek_then_replay_is_identity(
            data in proptest::collection::vec(any::<u8>(), 0..2048),
            chunks in proptest::collection::vec(1usize..64, 0..16),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap();
            let out = rt.block_on(async {
                let mut peek = PeekStream::new(&data[..]);
                for size in &chunks {
                    let mut buf = vec![0u8; *size];
                    if peek.peek_read(&mut buf).await.unwrap() == 0 {
                        break;
                    }
                }
                drain(peek.into_replay()).await
            });
            prop_assert_eq!(out, data);
        }
    }
}
