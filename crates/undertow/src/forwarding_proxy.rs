//! Client-side termination of HTTP and CONNECT streams
//!
//! Each routed stream carries one HTTP/1.1 connection. Absolute `http://`
//! requests, and origin-form ones on HTTP streams, are reverse-proxied to a
//! local backend; `CONNECT` requests dial their target and relay raw bytes.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderValue, PROXY_AUTHENTICATE, USER_AGENT};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};

use undertow_common::{
    relay_bidirectional, remove_hop_by_hop_headers, RelaySink, RelaySource, TunnelIo,
};
use undertow_protocol::{ControlMessage, Protocol};

use crate::auth::Credentials;
use crate::backends::Backends;
use crate::deadline::Deadline;
use crate::error::ProxyError;
use crate::tcp_proxy::dial;

/// Body of responses written back through the tunnel
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const PROXY_REALM: &str = "Basic realm=\"undertow\"";

/// Dial and deadline settings of the forwarding proxy
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// Required when set from CONNECT streams and absolute-form requests
    pub credentials: Option<Credentials>,
    pub dial_timeout: Duration,
    /// Read deadline on dialed destinations, armed once after the dial
    pub read_timeout: Option<Duration>,
    /// Write deadline on dialed destinations, armed once after the dial
    pub write_timeout: Option<Duration>,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            credentials: None,
            dial_timeout: Duration::from_secs(10),
            read_timeout: None,
            write_timeout: None,
        }
    }
}

/// Reverse proxy and CONNECT proxy for routed HTTP streams
pub struct ForwardingProxy {
    backends: Backends,
    options: ProxyOptions,
    client: Client<HttpConnector, Incoming>,
}

impl ForwardingProxy {
    pub fn new(backends: Backends, options: ProxyOptions) -> Arc<Self> {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(options.dial_timeout));
        let client = Client::builder(TokioExecutor::new()).build(connector);

        Arc::new(Self {
            backends,
            options,
            client,
        })
    }

    /// Serve one routed stream: `source` carries the caller's bytes and
    /// `sink` takes the bytes sent back
    pub async fn handle<W, R>(self: Arc<Self>, sink: W, source: R, message: ControlMessage)
    where
        W: RelaySink + 'static,
        R: RelaySource + 'static,
    {
        match message.protocol {
            Protocol::Http | Protocol::HttpConnect => {}
            other => {
                tracing::warn!(protocol = %other, %message, "Unsupported protocol, dropping stream");
                return;
            }
        }

        let message = Arc::new(message);
        let io = TunnelIo::new(source, sink);
        let peer = message.forwarded_for.clone();

        let service = service_fn(move |req| {
            let this = self.clone();
            let message = message.clone();
            async move { Ok::<_, Infallible>(this.serve(req, &message).await) }
        });

        if let Err(e) = http1::Builder::new()
            .serve_connection(TokioIo::new(io), service)
            .with_upgrades()
            .await
        {
            tracing::debug!(%peer, error = %e, "Routed HTTP connection error");
        }
    }

    /// Answer one request read from a routed stream
    pub async fn serve(
        &self,
        req: Request<Incoming>,
        message: &ControlMessage,
    ) -> Response<ProxyBody> {
        let method = req.method().clone();
        let uri = req.uri().clone();

        match self.route(req, message).await {
            Ok(response) => {
                tracing::debug!(
                    peer = %message.forwarded_for,
                    %method,
                    %uri,
                    status = response.status().as_u16(),
                    "Proxied"
                );
                response
            }
            Err(e) => {
                tracing::warn!(
                    peer = %message.forwarded_for,
                    %method,
                    %uri,
                    error = %e,
                    "Proxy request failed"
                );
                error_response(&e)
            }
        }
    }

    async fn route(
        &self,
        mut req: Request<Incoming>,
        message: &ControlMessage,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let is_connect = req.method() == Method::CONNECT;
        let connect_stream = message.protocol == Protocol::HttpConnect;

        // A CONNECT listener is a proxy: every request on it must authenticate
        if connect_stream || is_connect || req.uri().scheme().is_some() {
            if let Some(credentials) = &self.options.credentials {
                if !credentials.authorize(req.headers()) {
                    return Err(ProxyError::Auth);
                }
            }
        }
        set_x_forwarded_for(req.headers_mut(), &message.remote_addr);

        if is_connect {
            return self.connect(req).await;
        }
        match req.uri().scheme_str() {
            Some("http") => self.reverse_proxy(req, message).await,
            None if !connect_stream => self.reverse_proxy(req, message).await,
            _ => Err(ProxyError::MethodNotAllowed(req.method().clone())),
        }
    }

    async fn reverse_proxy(
        &self,
        mut req: Request<Incoming>,
        message: &ControlMessage,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let selector = if message.forwarded_host.is_empty() {
            req.uri()
                .authority()
                .map(|a| a.to_string())
                .unwrap_or_default()
        } else {
            message.forwarded_host.clone()
        };
        let backend = self
            .backends
            .select(&selector)
            .ok_or_else(|| ProxyError::NoBackend(selector.clone()))?;

        let path = req
            .uri()
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/");
        let target: Uri = format!("http://{}{}", backend, path)
            .parse()
            .map_err(|e| ProxyError::InvalidRequest(format!("backend {}: {}", backend, e)))?;
        *req.uri_mut() = target;

        remove_hop_by_hop_headers(req.headers_mut());
        if !req.headers().contains_key(USER_AGENT) {
            req.headers_mut()
                .insert(USER_AGENT, HeaderValue::from_static(""));
        }

        let response = self
            .client
            .request(req)
            .await
            .map_err(ProxyError::Upstream)?;
        let (mut parts, body) = response.into_parts();
        remove_hop_by_hop_headers(&mut parts.headers);
        Ok(Response::from_parts(parts, body.boxed()))
    }

    async fn connect(&self, req: Request<Incoming>) -> Result<Response<ProxyBody>, ProxyError> {
        let target = req
            .uri()
            .authority()
            .map(|a| a.to_string())
            .ok_or_else(|| ProxyError::InvalidRequest("CONNECT without authority".to_string()))?;

        let stream = dial(&target, self.options.dial_timeout).await?;
        let (reader, writer) = stream.into_split();
        let mut dst_reader = Deadline::new(reader, self.options.read_timeout);
        let mut dst_writer = Deadline::new(writer, self.options.write_timeout);
        tracing::debug!(%target, "Connected");

        tokio::spawn(async move {
            let upgraded = match hyper::upgrade::on(req).await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    tracing::warn!(%target, error = %e, "CONNECT upgrade failed");
                    return;
                }
            };

            let (mut src_reader, mut src_writer) = tokio::io::split(TokioIo::new(upgraded));
            let transfer = relay_bidirectional(
                (&mut src_reader, &mut src_writer),
                (&mut dst_reader, &mut dst_writer),
                "source",
                &target,
            )
            .await;
            tracing::debug!(
                %target,
                sent = transfer.sent,
                received = transfer.received,
                "CONNECT done"
            );
        });

        Ok(Response::new(empty()))
    }
}

/// Append the caller's address to `X-Forwarded-For`
fn set_x_forwarded_for(headers: &mut HeaderMap, remote_addr: &str) {
    if remote_addr.is_empty() {
        return;
    }

    let value = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) if !prior.is_empty() => format!("{}, {}", prior, remote_addr),
        _ => remote_addr.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

fn error_response(err: &ProxyError) -> Response<ProxyBody> {
    let status = match err {
        ProxyError::Auth => StatusCode::PROXY_AUTHENTICATION_REQUIRED,
        ProxyError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
        ProxyError::Dial { .. } | ProxyError::DialTimeout(_) => StatusCode::SERVICE_UNAVAILABLE,
        ProxyError::InvalidRequest(_) | ProxyError::Protocol(_) => StatusCode::BAD_REQUEST,
        ProxyError::NoBackend(_) | ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
    };

    let text = match err {
        ProxyError::Auth | ProxyError::MethodNotAllowed(_) => {
            status.canonical_reason().unwrap_or_default().to_string()
        }
        other => other.to_string(),
    };

    let mut response = Response::new(
        Full::new(Bytes::from(text))
            .map_err(|never| match never {})
            .boxed(),
    );
    *response.status_mut() = status;
    if status == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
        response
            .headers_mut()
            .insert(PROXY_AUTHENTICATE, HeaderValue::from_static(PROXY_REALM));
    }
    response
}
