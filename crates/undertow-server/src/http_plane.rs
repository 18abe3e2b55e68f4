use std::convert::Infallible;
use std::error::Error as StdError;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::uri::Authority;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::client::conn::http1 as client_http1;
use hyper::header::{HeaderValue, HOST};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use undertow_common::{pipe, remove_hop_by_hop_headers, BodyReader, TunnelIo, PIPE_CAPACITY};
use undertow_protocol::{Action, ControlMessage, Protocol};

use crate::error::RelayError;
use crate::registry::Registry;
use crate::tcp_plane::accept;

/// Body of responses produced by the HTTP entry point
pub type ResponseBody = BoxBody<Bytes, hyper::Error>;

/// HTTP entry point routing each request to the client registered for its host
pub struct HttpPlane {
    registry: Arc<Registry>,
}

impl HttpPlane {
    pub fn new(registry: Arc<Registry>) -> Arc<Self> {
        Arc::new(Self { registry })
    }

    /// Serve HTTP/1.1 on `listener` until `shutdown` is cancelled
    pub async fn run(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, "HTTP entry point listening");
        }

        while let Some((stream, peer_addr)) = accept(&listener, &shutdown).await {
            tracing::debug!(peer = %peer_addr, "HTTP connection");
            let this = self.clone();
            let shutdown = shutdown.clone();

            tokio::spawn(async move {
                tokio::select! {
                    _ = this.serve_connection(stream, peer_addr) => {}
                    _ = shutdown.cancelled() => {}
                }
            });
        }
        tracing::debug!("HTTP entry point stopped");
    }

    /// Serve one HTTP/1.1 connection on any byte stream
    pub async fn serve_connection<S>(self: Arc<Self>, stream: S, remote_addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let service = service_fn(move |req| {
            let this = self.clone();
            async move { Ok::<_, Infallible>(this.handle(req, remote_addr).await) }
        });

        if let Err(e) = http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .await
        {
            tracing::debug!(peer = %remote_addr, error = %e, "HTTP connection error");
        }
    }

    /// Route one request through its host's client
    ///
    /// Never fails: any relay error is answered with a 502.
    pub async fn handle<B>(
        &self,
        req: Request<B>,
        remote_addr: SocketAddr,
    ) -> Response<ResponseBody>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let method = req.method().clone();
        let uri = req.uri().clone();

        match self.forward(req, remote_addr).await {
            Ok(response) => {
                tracing::debug!(
                    peer = %remote_addr,
                    %method,
                    %uri,
                    status = response.status().as_u16(),
                    "Forwarded"
                );
                response
            }
            Err(e) => {
                tracing::warn!(
                    peer = %remote_addr,
                    %method,
                    %uri,
                    kind = ?e.kind(),
                    error = %e,
                    "Request failed"
                );
                bad_gateway(&e)
            }
        }
    }

    async fn forward<B>(
        &self,
        mut req: Request<B>,
        remote_addr: SocketAddr,
    ) -> Result<Response<ResponseBody>, RelayError>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let (host, authority) = request_host(&req).ok_or(RelayError::MissingHost)?;
        let transport = self
            .registry
            .resolve(&host)
            .ok_or_else(|| RelayError::NoRoute(host.clone()))?;

        let message = ControlMessage {
            action: Action::RequestClientSession,
            protocol: Protocol::Http,
            forwarded_host: authority.clone(),
            forwarded_for: remote_addr.to_string(),
            forwarded_by: authority.clone(),
            url_path: req.uri().path().to_string(),
            remote_addr: remote_addr.ip().to_string(),
        };

        let (writer, body) = pipe(PIPE_CAPACITY);
        let stream = match transport.open_stream(&host, &message, body).await {
            Ok(response) => response,
            Err(e) => {
                self.registry.report_failure(&host, &transport, &e);
                return Err(e.into());
            }
        };

        let io = TunnelIo::new(BodyReader::new(stream.into_body()), writer);
        let (mut sender, connection) = client_http1::handshake(TokioIo::new(io))
            .await
            .map_err(RelayError::Upstream)?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!(error = %e, "Tunnelled HTTP connection error");
            }
        });

        let origin_form = req
            .uri()
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/")
            .parse::<Uri>()
            .unwrap_or_else(|_| Uri::from_static("/"));
        *req.uri_mut() = origin_form;
        if !req.headers().contains_key(HOST) {
            if let Ok(value) = HeaderValue::from_str(&authority) {
                req.headers_mut().insert(HOST, value);
            }
        }

        let response = sender
            .send_request(req)
            .await
            .map_err(RelayError::Upstream)?;
        let (mut parts, body) = response.into_parts();
        remove_hop_by_hop_headers(&mut parts.headers);
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// Routing host (lowercase, no port) and the authority as sent
fn request_host<B>(req: &Request<B>) -> Option<(String, String)> {
    let authority = req
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))?;

    let host = authority
        .parse::<Authority>()
        .ok()?
        .host()
        .to_ascii_lowercase();
    if host.is_empty() {
        return None;
    }
    Some((host, authority))
}

fn bad_gateway(err: &RelayError) -> Response<ResponseBody> {
    let mut response = Response::new(
        Full::new(Bytes::from(err.to_string()))
            .map_err(|never| match never {})
            .boxed(),
    );
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    use http_body_util::Empty;
    use hyper::body::Incoming;
    use hyper::server::conn::http2 as server_http2;
    use hyper_util::rt::TokioExecutor;

    use crate::transport::tests::idle_transport;
    use crate::transport::Transport;

    /// Client that answers tunnelled HTTP requests with a description of
    /// what it received
    async fn describing_client() -> Transport {
        let (near, far) = tokio::io::duplex(64 * 1024);

        tokio::spawn(async move {
            let service = service_fn(|req: Request<Incoming>| async move {
                let message = ControlMessage::read_from(req.headers()).unwrap();
                let (writer, body) = pipe(PIPE_CAPACITY);
                let io = TunnelIo::new(BodyReader::new(req.into_body()), writer);

                tokio::spawn(async move {
                    let backend = service_fn(move |inner: Request<Incoming>| {
                        let message = message.clone();
                        async move {
                            let text = format!(
                                "{} {} host={} for={} by={} path={}",
                                inner.method(),
                                inner.uri(),
                                inner.headers()[HOST].to_str().unwrap(),
                                message.forwarded_for,
                                message.forwarded_by,
                                message.url_path,
                            );
                            Ok::<_, Infallible>(
                                Response::builder()
                                    .header("connection", "keep-alive")
                                    .header("x-backend", "yes")
                                    .body(Full::new(Bytes::from(text)))
                                    .unwrap(),
                            )
                        }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(io), backend)
                        .await;
                });

                Ok::<_, Infallible>(Response::new(body))
            });

            let _ = server_http2::Builder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(far), service)
                .await;
        });

        Transport::handshake(near, "127.0.0.1:9".parse().unwrap())
            .await
            .unwrap()
    }

    fn get(uri: &str, host: Option<&str>) -> Request<Empty<Bytes>> {
        let mut builder = Request::builder().uri(uri);
        if let Some(host) = host {
            builder = builder.header(HOST, host);
        }
        builder.body(Empty::new()).unwrap()
    }

    fn remote() -> SocketAddr {
        "10.0.0.1:5555".parse().unwrap()
    }

    #[tokio::test]
    async fn test_registered_host_is_forwarded() {
        let registry = Registry::new();
        registry.add("a.example", describing_client().await).unwrap();
        let plane = HttpPlane::new(registry);

        let response = plane
            .handle(get("/hello?x=1", Some("A.example:8080")), remote())
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-backend"], "yes");
        assert!(response.headers().get("connection").is_none());
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(
            &body[..],
            b"GET /hello?x=1 host=A.example:8080 for=10.0.0.1:5555 by=A.example:8080 path=/hello"
        );
    }

    #[tokio::test]
    async fn test_absolute_uri_without_host_header() {
        let registry = Registry::new();
        registry.add("a.example", describing_client().await).unwrap();
        let plane = HttpPlane::new(registry);

        let response = plane
            .handle(get("http://a.example/p", None), remote())
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(body.starts_with(b"GET /p host=a.example "));
    }

    #[tokio::test]
    async fn test_unregistered_host_is_bad_gateway() {
        let plane = HttpPlane::new(Registry::new());

        let response = plane.handle(get("/", Some("b.example")), remote()).await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"No client connected for b.example");
    }

    #[tokio::test]
    async fn test_missing_host_is_bad_gateway() {
        let plane = HttpPlane::new(Registry::new());
        let response = plane.handle(get("/", None), remote()).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_closed_connection_is_bad_gateway_and_unregistered() {
        let registry = Registry::new();
        let (transport, _far) = idle_transport().await;
        registry.add("a.example", transport.clone()).unwrap();
        transport.close();
        let plane = HttpPlane::new(registry.clone());

        let response = plane.handle(get("/", Some("a.example")), remote()).await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(registry.is_empty());
    }
}
