//! Mock HTTP backend for E2E tests
//!
//! Records every request it receives and answers with a configurable body.
//! It stands in for the local service a tunnel client forwards to.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use tokio::net::TcpListener;

/// A request as the backend saw it
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: String,
    /// Request target, origin-form when it came through the reverse proxy
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    /// First value of header `name`
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Default)]
struct State {
    requests: RwLock<Vec<RecordedRequest>>,
    response_body: RwLock<Vec<u8>>,
}

pub struct MockHttpService {
    addr: SocketAddr,
    state: Arc<State>,
}

impl MockHttpService {
    /// Start on an ephemeral port, answering `200 OK` with body "OK"
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock service");
        let addr = listener.local_addr().expect("bound address");

        let state = Arc::new(State::default());
        *state.response_body.write() = b"OK".to_vec();

        let shared = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = shared.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let state = state.clone();
                        async move { Ok::<_, Infallible>(record(&state, req).await) }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self { addr, state }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.read().clone()
    }

    pub fn set_response_body(&self, body: impl Into<Vec<u8>>) {
        *self.state.response_body.write() = body.into();
    }
}

async fn record(state: &State, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let method = req.method().to_string();
    let uri = req.uri().to_string();
    let headers = req
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
        .collect();
    let body = req
        .into_body()
        .collect()
        .await
        .map(|b| b.to_bytes().to_vec())
        .unwrap_or_default();

    state.requests.write().push(RecordedRequest {
        method,
        uri,
        headers,
        body,
    });

    let body = state.response_body.read().clone();
    Response::builder()
        .header("x-mock", "1")
        .body(Full::new(Bytes::from(body)))
        .expect("valid response")
}
