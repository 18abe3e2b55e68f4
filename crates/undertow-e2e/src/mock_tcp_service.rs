//! Mock TCP backend for E2E tests
//!
//! Echoes everything it reads and counts the connections it accepted, so
//! tests can assert that a destination was (or was not) dialed.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[derive(Default)]
struct State {
    accepted: AtomicUsize,
    /// Bytes received per finished connection
    received: RwLock<Vec<Vec<u8>>>,
}

pub struct MockTcpService {
    addr: SocketAddr,
    state: Arc<State>,
}

impl MockTcpService {
    /// Start an echo service on an ephemeral port
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock TCP service");
        let addr = listener.local_addr().expect("bound address");

        let state = Arc::new(State::default());
        let shared = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                shared.accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(echo(stream, shared.clone()));
            }
        });

        Self { addr, state }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn connection_count(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    /// Bytes received on each connection that has ended
    pub fn received(&self) -> Vec<Vec<u8>> {
        self.state.received.read().clone()
    }
}

async fn echo(mut stream: TcpStream, state: Arc<State>) {
    let mut received = Vec::new();
    let mut buf = [0u8; 4096];

    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                received.extend_from_slice(&buf[..n]);
                if let Err(e) = stream.write_all(&buf[..n]).await {
                    tracing::debug!(error = %e, "Echo write failed");
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "Echo read failed");
                break;
            }
        }
    }

    state.received.write().push(received);
}
