//! Fixed I/O deadlines for dialed destinations
//!
//! A deadline is armed once when the wrapper is created and never renewed:
//! every read (or write) attempted after it has passed fails with
//! `TimedOut`, however much data has flowed before.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep, Sleep};

use undertow_common::{RelaySink, RelaySource};

/// I/O endpoint that fails once its deadline has passed
pub struct Deadline<T> {
    inner: T,
    deadline: Option<Pin<Box<Sleep>>>,
}

impl<T> Deadline<T> {
    /// Arm a deadline `timeout` from now; `None` never expires
    pub fn new(inner: T, timeout: Option<Duration>) -> Self {
        Self {
            inner,
            deadline: timeout.map(|timeout| Box::pin(sleep(timeout))),
        }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    fn poll_expired(&mut self, cx: &mut Context<'_>) -> Poll<io::Error> {
        if let Some(deadline) = self.deadline.as_mut() {
            if deadline.as_mut().poll(cx).is_ready() {
                return Poll::Ready(io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded"));
            }
        }
        Poll::Pending
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Deadline<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Poll::Ready(e) = self.poll_expired(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Deadline<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if let Poll::Ready(e) = self.poll_expired(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Poll::Ready(e) = self.poll_expired(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[async_trait]
impl<T: RelaySink> RelaySink for Deadline<T> {
    async fn close_write(&mut self) -> Option<io::Result<()>> {
        self.inner.close_write().await
    }
}

#[async_trait]
impl<T: RelaySource> RelaySource for Deadline<T> {
    async fn close_read(&mut self) -> Option<io::Result<()>> {
        self.inner.close_read().await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_read_fails_after_deadline() {
        let (near, mut far) = tokio::io::duplex(64);
        let mut reader = Deadline::new(near, Some(Duration::from_millis(50)));

        far.write_all(b"early").await.unwrap();
        let mut buf = [0u8; 5];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"early");

        // Blocked read is woken by the deadline
        let err = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_deadline_is_not_renewed_by_traffic() {
        let (near, mut far) = tokio::io::duplex(64);
        let mut reader = Deadline::new(near, Some(Duration::from_millis(50)));

        tokio::time::sleep(Duration::from_millis(80)).await;
        far.write_all(b"late").await.unwrap();

        let mut buf = [0u8; 4];
        let err = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_write_deadline() {
        let (near, _far) = tokio::io::duplex(64);
        let mut writer = Deadline::new(near, Some(Duration::from_millis(20)));

        writer.write_all(b"ok").await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        let err = writer.write_all(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_no_deadline_passes_through() {
        let (near, mut far) = tokio::io::duplex(64);
        let mut reader = Deadline::new(near, None);

        far.write_all(b"x").await.unwrap();
        drop(far);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"x");
    }
}
