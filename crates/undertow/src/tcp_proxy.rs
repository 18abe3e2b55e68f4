use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::net::TcpStream;

use undertow_common::{relay_bidirectional, RelaySink, RelaySource, Transfer};
use undertow_protocol::{ControlMessage, Protocol};

use crate::backends::Backends;
use crate::error::ProxyError;

/// Connect to `addr`, giving up after `timeout`
pub(crate) async fn dial(addr: &str, timeout: Duration) -> Result<TcpStream, ProxyError> {
    bounded_connect(addr, timeout, TcpStream::connect(addr)).await
}

async fn bounded_connect<F>(
    addr: &str,
    timeout: Duration,
    connect: F,
) -> Result<TcpStream, ProxyError>
where
    F: Future<Output = io::Result<TcpStream>>,
{
    match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(ProxyError::Dial {
            addr: addr.to_string(),
            source,
        }),
        Err(_) => Err(ProxyError::DialTimeout(addr.to_string())),
    }
}

/// Relays raw TCP streams to a local backend
pub struct TcpProxy {
    backends: Backends,
    dial_timeout: Duration,
}

impl TcpProxy {
    pub fn new(backends: Backends, dial_timeout: Duration) -> Self {
        Self {
            backends,
            dial_timeout,
        }
    }

    /// Serve one routed stream; errors are logged and end the stream
    pub async fn handle<W, R>(&self, mut sink: W, mut source: R, message: &ControlMessage)
    where
        W: RelaySink,
        R: RelaySource,
    {
        match self.proxy(&mut sink, &mut source, message).await {
            Ok(transfer) => tracing::debug!(
                peer = %message.forwarded_for,
                host = %message.forwarded_host,
                sent = transfer.sent,
                received = transfer.received,
                "TCP stream done"
            ),
            Err(e) => tracing::warn!(
                peer = %message.forwarded_for,
                host = %message.forwarded_host,
                error = %e,
                "TCP stream failed"
            ),
        }
    }

    async fn proxy<W, R>(
        &self,
        sink: &mut W,
        source: &mut R,
        message: &ControlMessage,
    ) -> Result<Transfer, ProxyError>
    where
        W: RelaySink,
        R: RelaySource,
    {
        if message.protocol != Protocol::Tcp {
            return Err(ProxyError::InvalidRequest(format!(
                "unsupported protocol {}",
                message.protocol
            )));
        }

        let addr = self
            .backends
            .select(&message.forwarded_host)
            .ok_or_else(|| ProxyError::NoBackend(message.forwarded_host.clone()))?;
        let stream = dial(addr, self.dial_timeout).await?;
        tracing::debug!(backend = addr, peer = %message.forwarded_for, "Dialed backend");

        let (mut local_reader, mut local_writer) = stream.into_split();
        Ok(relay_bidirectional(
            (source, sink),
            (&mut local_reader, &mut local_writer),
            "remote",
            "local",
        )
        .await)
    }
}
