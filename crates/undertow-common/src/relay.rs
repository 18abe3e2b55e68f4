//! Half-close aware byte relay
//!
//! [`relay`] copies one direction and then propagates end of stream: the
//! destination is half-closed for writing so the opposite direction can keep
//! delivering bytes, and the source is half-closed for reading when it can
//! be, or released otherwise. [`relay_bidirectional`] runs both directions
//! concurrently and returns once both are done.

use std::io;
use std::net::Shutdown;

use async_trait::async_trait;
use socket2::SockRef;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::pipe::{BodyReader, PipeWriter};

/// Tracing target for byte accounting
pub const TRANSFER_TARGET: &str = "transfer";

const BUFFER_SIZE: usize = 32 * 1024;

/// Destination side of a relay
///
/// Flushing uses `AsyncWrite::poll_flush`, which is a no-op for unbuffered
/// endpoints.
#[async_trait]
pub trait RelaySink: AsyncWrite + Unpin + Send {
    /// Half-close for writing, `None` if the endpoint cannot half-close
    async fn close_write(&mut self) -> Option<io::Result<()>> {
        Some(self.shutdown().await)
    }
}

/// Source side of a relay
#[async_trait]
pub trait RelaySource: AsyncRead + Unpin + Send {
    /// Half-close for reading, `None` if the endpoint cannot half-close
    async fn close_read(&mut self) -> Option<io::Result<()>> {
        None
    }

    /// Release the endpoint when it cannot be half-closed
    async fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl RelaySink for OwnedWriteHalf {}

#[async_trait]
impl RelaySource for OwnedReadHalf {
    async fn close_read(&mut self) -> Option<io::Result<()>> {
        let stream: &tokio::net::TcpStream = self.as_ref();
        Some(SockRef::from(stream).shutdown(Shutdown::Read))
    }
}

#[async_trait]
impl<T: AsyncRead + AsyncWrite + Send> RelaySink for WriteHalf<T> {}

#[async_trait]
impl<T: AsyncRead + AsyncWrite + Send> RelaySource for ReadHalf<T> {}

#[async_trait]
impl RelaySink for PipeWriter {}

#[async_trait]
impl<B> RelaySource for BodyReader<B>
where
    B: hyper::body::Body<Data = bytes::Bytes> + Unpin + Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    async fn close(&mut self) -> io::Result<()> {
        BodyReader::close(self);
        Ok(())
    }
}

/// Byte counts of a finished bidirectional relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transfer {
    /// Bytes copied from the first endpoint to the second
    pub sent: u64,
    /// Bytes copied from the second endpoint to the first
    pub received: u64,
}

/// Copy `src` into `dst` until end of stream or error, then close both ends
///
/// Copy errors are logged and end the copy; they are never returned. The
/// return value is the number of bytes delivered to `dst`.
pub async fn relay<D, S>(side: &str, dst: &mut D, src: &mut S) -> u64
where
    D: RelaySink + ?Sized,
    S: RelaySource + ?Sized,
{
    let (bytes, result) = copy(dst, src).await;
    if let Err(e) = result {
        tracing::error!(target: TRANSFER_TARGET, side, error = %e, "copy error");
    }

    if let Some(Err(e)) = dst.close_write().await {
        tracing::debug!(target: TRANSFER_TARGET, side, error = %e, "close write failed");
    }

    let closed = match src.close_read().await {
        Some(result) => result,
        None => src.close().await,
    };
    if let Err(e) = closed {
        tracing::debug!(target: TRANSFER_TARGET, side, error = %e, "close read failed");
    }

    tracing::debug!(target: TRANSFER_TARGET, side, bytes, "copied");
    bytes
}

/// Relay `a` to `b` and `b` to `a` concurrently, returning when both finish
pub async fn relay_bidirectional<AR, AW, BR, BW>(
    a: (&mut AR, &mut AW),
    b: (&mut BR, &mut BW),
    a_name: &str,
    b_name: &str,
) -> Transfer
where
    AR: RelaySource + ?Sized,
    AW: RelaySink + ?Sized,
    BR: RelaySource + ?Sized,
    BW: RelaySink + ?Sized,
{
    let (a_read, a_write) = a;
    let (b_read, b_write) = b;
    let forward = format!("{} to {}", a_name, b_name);
    let backward = format!("{} to {}", b_name, a_name);

    let (sent, received) = tokio::join!(
        relay(&forward, b_write, a_read),
        relay(&backward, a_write, b_read),
    );

    Transfer { sent, received }
}

async fn copy<D, S>(dst: &mut D, src: &mut S) -> (u64, io::Result<()>)
where
    D: AsyncWrite + Unpin + ?Sized,
    S: AsyncRead + Unpin + ?Sized,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = match src.read(&mut buf).await {
            Ok(0) => return (total, Ok(())),
            Ok(n) => n,
            Err(e) => return (total, Err(e)),
        };

        if let Err(e) = dst.write_all(&buf[..n]).await {
            return (total, Err(e));
        }
        total += n as u64;

        if let Err(e) = dst.flush().await {
            return (total, Err(e));
        }
    }
}
