//! In-memory adapters between byte streams and HTTP/2 stream bodies
//!
//! A logical tunnel stream is an HTTP/2 request whose body carries bytes one
//! way and whose response body carries bytes the other way. These adapters
//! let the relay treat both bodies as ordinary `AsyncRead` / `AsyncWrite`
//! endpoints without materializing them in memory:
//!
//! - [`pipe`] returns a bounded channel whose writable end is an `AsyncWrite`
//!   and whose readable end is an outgoing body.
//! - [`BodyReader`] turns an incoming body into an `AsyncRead`.
//! - [`TunnelIo`] joins one of each into a duplex endpoint that HTTP/1.1
//!   connections can be driven over.

use std::error::Error as StdError;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf, Bytes};
use hyper::body::{Body, Frame, Incoming};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

/// Number of chunks a pipe buffers before writers are suspended
pub const PIPE_CAPACITY: usize = 16;

/// Create a bounded byte pipe
///
/// Writes are suspended once `capacity` chunks are queued and not yet polled
/// by the body, which is how backpressure from the peer reaches the writer.
pub fn pipe(capacity: usize) -> (PipeWriter, PipeBody) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        PipeWriter {
            tx: PollSender::new(tx),
        },
        PipeBody { rx },
    )
}

/// Writable end of a [`pipe`]
pub struct PipeWriter {
    tx: PollSender<Bytes>,
}

impl AsyncWrite for PipeWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        ready!(self.tx.poll_reserve(cx)).map_err(|_| broken_pipe())?;
        self.tx
            .send_item(Bytes::copy_from_slice(buf))
            .map_err(|_| broken_pipe())?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.tx.close();
        Poll::Ready(Ok(()))
    }
}

/// Readable end of a [`pipe`], usable as a request or response body
///
/// The body ends once the writer is shut down or dropped.
pub struct PipeBody {
    rx: mpsc::Receiver<Bytes>,
}

impl Body for PipeBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match ready!(self.rx.poll_recv(cx)) {
            Some(chunk) => Poll::Ready(Some(Ok(Frame::data(chunk)))),
            None => Poll::Ready(None),
        }
    }
}

/// `AsyncRead` over the data frames of an HTTP body
///
/// Trailers are skipped. Closing the reader drops the body, which resets the
/// underlying stream if the peer is still sending.
pub struct BodyReader<B = Incoming> {
    body: Option<B>,
    chunk: Bytes,
}

impl<B> BodyReader<B> {
    pub fn new(body: B) -> Self {
        Self {
            body: Some(body),
            chunk: Bytes::new(),
        }
    }

    /// Drop the body; further reads report end of stream
    pub fn close(&mut self) {
        self.body = None;
        self.chunk.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.body.is_none()
    }
}

impl<B> AsyncRead for BodyReader<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            if !this.chunk.is_empty() {
                let n = this.chunk.len().min(buf.remaining());
                buf.put_slice(&this.chunk[..n]);
                this.chunk.advance(n);
                return Poll::Ready(Ok(()));
            }

            let Some(body) = this.body.as_mut() else {
                return Poll::Ready(Ok(()));
            };

            match ready!(Pin::new(body).poll_frame(cx)) {
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        this.chunk = data;
                    }
                }
                Some(Err(e)) => return Poll::Ready(Err(io::Error::other(e))),
                None => {
                    this.body = None;
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

/// Duplex endpoint made of an independent reader and writer
pub struct TunnelIo<R, W> {
    reader: R,
    writer: W,
}

impl<R, W> TunnelIo<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }

    pub fn into_parts(self) -> (R, W) {
        (self.reader, self.writer)
    }
}

impl<R: AsyncRead + Unpin, W: Unpin> AsyncRead for TunnelIo<R, W> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl<R: Unpin, W: AsyncWrite + Unpin> AsyncWrite for TunnelIo<R, W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader dropped")
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use http_body_util::{BodyExt, Full, StreamBody};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_pipe_delivers_bytes_then_ends() {
        let (mut writer, body) = pipe(4);

        let write = tokio::spawn(async move {
            writer.write_all(b"hello ").await.unwrap();
            writer.write_all(b"world").await.unwrap();
            writer.shutdown().await.unwrap();
        });

        let collected = body.collect().await.unwrap().to_bytes();
        write.await.unwrap();
        assert_eq!(&collected[..], b"hello world");
    }

    #[tokio::test]
    async fn test_pipe_applies_backpressure() {
        let (mut writer, mut body) = pipe(1);

        writer.write_all(b"first").await.unwrap();
        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            writer.write_all(b"second"),
        )
        .await;
        assert!(blocked.is_err(), "second write should wait for the reader");

        let frame = body.frame().await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap(), Bytes::from_static(b"first"));
    }

    #[tokio::test]
    async fn test_pipe_write_fails_when_body_dropped() {
        let (mut writer, body) = pipe(1);
        drop(body);

        let err = writer.write_all(b"data").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_body_reader_spans_frames() {
        let frames = stream::iter(vec![
            Ok::<_, io::Error>(Frame::data(Bytes::from_static(b"abc"))),
            Ok(Frame::data(Bytes::from_static(b""))),
            Ok(Frame::data(Bytes::from_static(b"defgh"))),
        ]);
        let mut reader = BodyReader::new(StreamBody::new(frames));

        let mut small = [0u8; 2];
        reader.read_exact(&mut small).await.unwrap();
        assert_eq!(&small, b"ab");

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"cdefgh");
        assert!(reader.is_closed());
    }

    #[tokio::test]
    async fn test_body_reader_close_is_idempotent() {
        let mut reader = BodyReader::new(Full::new(Bytes::from_static(b"ignored")));
        reader.close();
        reader.close();

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_tunnel_io_joins_halves() {
        let (writer, body) = pipe(4);
        let mut io = TunnelIo::new(BodyReader::new(Full::new(Bytes::from_static(b"in"))), writer);

        let mut incoming = Vec::new();
        io.read_to_end(&mut incoming).await.unwrap();
        io.write_all(b"out").await.unwrap();
        io.shutdown().await.unwrap();

        assert_eq!(incoming, b"in");
        assert_eq!(&body.collect().await.unwrap().to_bytes()[..], b"out");
    }
}
