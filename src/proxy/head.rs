//! First request head on a client connection
//!
//! The head is read here with a size bound and a deadline before hyper sees the
//! connection, so both violations get a plain `400 Bad Request` and a close.
//! The bytes read are replayed to hyper through [`PrefixedStream`].

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

/// Read size while looking for the end of the head
pub(crate) const HEAD_CHUNK: usize = 4096;

/// How long a rejected client may keep sending before the socket is dropped
const REJECT_LINGER: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub(crate) enum HeadError {
    #[error("request head exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("request head not received within {0:?}")]
    TimedOut(Duration),

    #[error("client closed before sending a request head")]
    Closed,

    #[error("read failed: {0}")]
    Io(#[from] io::Error),
}

impl HeadError {
    /// Whether the client is owed a 400
    pub(crate) fn needs_response(&self) -> bool {
        matches!(self, HeadError::TooLarge { .. } | HeadError::TimedOut(_))
    }
}

/// Read until the blank line ending the head; the result may hold body bytes too
pub(crate) async fn read_request_head<S>(
    stream: &mut S,
    limit: usize,
    deadline: Duration,
) -> Result<Vec<u8>, HeadError>
where
    S: AsyncRead + Unpin,
{
    tokio::time::timeout(deadline, read_until_blank_line(stream, limit))
        .await
        .map_err(|_| HeadError::TimedOut(deadline))?
}

async fn read_until_blank_line<S>(stream: &mut S, limit: usize) -> Result<Vec<u8>, HeadError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(HEAD_CHUNK);
    let mut chunk = [0u8; HEAD_CHUNK];

    loop {
        match head_end(&buf) {
            Some(end) if end > limit => return Err(HeadError::TooLarge { limit }),
            Some(_) => return Ok(buf),
            None if buf.len() >= limit => return Err(HeadError::TooLarge { limit }),
            None => {}
        }

        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(HeadError::Closed);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Offset just past the blank line, accepting bare LF line endings
fn head_end(buf: &[u8]) -> Option<usize> {
    (0..buf.len()).find_map(|i| match &buf[i..] {
        [b'\n', b'\n', ..] => Some(i + 2),
        [b'\n', b'\r', b'\n', ..] => Some(i + 3),
        _ => None,
    })
}

/// Answer `400 Bad Request`, close our side, then drain briefly so the close
/// does not turn into a reset that eats the response
pub(crate) async fn reject_head<S>(stream: &mut S, reason: &str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 400 Bad Request\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        reason.len(),
        reason
    );
    if stream.write_all(response.as_bytes()).await.is_err() {
        return;
    }
    let _ = stream.shutdown().await;

    let _ = tokio::time::timeout(REJECT_LINGER, async {
        let mut sink = [0u8; HEAD_CHUNK];
        while let Ok(n) = stream.read(&mut sink).await {
            if n == 0 {
                break;
            }
        }
    })
    .await;
}

/// A stream that yields `prefix` before reading from `inner`
pub(crate) struct PrefixedStream<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub(crate) fn new(prefix: impl Into<Bytes>, inner: S) -> Self {
        Self {
            prefix: prefix.into(),
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
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

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
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
