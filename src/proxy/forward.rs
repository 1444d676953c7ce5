//! Forward engine: replays an exchange against its origin server and streams
//! the answer back through the [`ResponseWriter`].

use std::io;

use bytes::Bytes;
use http::header::HOST as HOST_HEADER;
use http::{HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Empty, StreamBody};
use http_body::Body;
use hyper::body::{Frame, Incoming};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::config::ExchangePolicy;
use crate::error::{BoxError, ErrorEvent, ErrorSink};
use crate::headers::{CONTENT_LENGTH, HeaderSet, condition};
use crate::proxy::exchange::{BodyFrame, HandlerFuture, ProxyRequest, ResponseWriter};
use crate::proxy::casing::{CaseTap, HeaderCasing, RawHeaders};
use crate::proxy::tls::build_connector;
use crate::proxy::OutboundBody;
use crate::proxy_log;

pub(crate) const UPSTREAM_FAILURE_ORIGIN: &str = "proxy-proxyrequest";
pub(crate) const RESPONSE_ORIGIN: &str = "proxy";
pub(crate) const REQUEST_BODY_ORIGIN: &str = "proxy-request";

/// Hands exchanges that no filter handled to the origin server.
pub trait Forward: Send + Sync + 'static {
    fn forward(&self, req: ProxyRequest, res: ResponseWriter) -> HandlerFuture;
}

/// Upstream connector plus the error sink failures are reported to.
///
/// Every exchange gets its own origin connection; plain or TLS transport is
/// picked from the URL scheme.
#[derive(Clone)]
pub struct ForwardProxy {
    connector: TlsConnector,
    errors: ErrorSink,
    policy: ExchangePolicy,
}

impl ForwardProxy {
    pub fn new(accept_invalid_certs: bool, policy: ExchangePolicy, errors: ErrorSink) -> Self {
        Self {
            connector: build_connector(accept_invalid_certs),
            errors,
            policy,
        }
    }

    pub async fn forward(&self, mut req: ProxyRequest, mut res: ResponseWriter) {
        condition(&mut req.headers);
        let target = req.url.to_string();
        let host = req.host().unwrap_or_default().to_string();
        let body = self.outbound_body(&mut req);

        let mut out = Request::new(body);
        *out.method_mut() = req.method.clone();
        *out.uri_mut() = req.url.clone();
        *out.headers_mut() = req.headers.to_http();
        let casing = HeaderCasing::of(&req.headers);
        proxy_log!("[forward] {} {} id={}", req.method, target, req.id());

        let pending = send_upstream(&self.connector, out, casing);
        let result: Result<Response<Incoming>, BoxError> = match self.policy.upstream_timeout {
            Some(limit) => match tokio::time::timeout(limit, pending).await {
                Ok(r) => r,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no upstream response within {limit:?}"),
                )
                .into()),
            },
            None => pending.await,
        };

        match result {
            Ok(resp) => {
                proxy_log!("[forward] {} <- {}", target, resp.status());
                relay_response(resp, &mut res, &self.errors).await;
            }
            Err(e) => {
                self.errors
                    .emit_event(ErrorEvent::new(e, UPSTREAM_FAILURE_ORIGIN).with_host(host));
                respond_unreachable(&mut res, &target);
            }
        }
    }

    /// Only POST and PUT carry a body upstream; everything else goes out
    /// with an empty one.
    fn outbound_body(&self, req: &mut ProxyRequest) -> OutboundBody {
        let inbound = match req.method {
            Method::POST | Method::PUT => req.take_body(),
            _ => None,
        };
        let Some(inbound) = inbound else {
            return Empty::new().boxed();
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let copier = BodyCopier::new(ChannelSink(Some(tx)), req.headers.content_length());
        tokio::spawn(copy_body(inbound, copier, self.errors.clone()));
        StreamBody::new(UnboundedReceiverStream::new(rx)).boxed()
    }
}

/// Opens a connection to the origin named by the request URL and runs one
/// HTTP/1.1 exchange over it. Header names go out with `casing`.
async fn send_upstream(
    connector: &TlsConnector,
    mut req: Request<OutboundBody>,
    casing: HeaderCasing,
) -> Result<Response<Incoming>, BoxError> {
    let url = req.uri().clone();
    let host = url
        .host()
        .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "request url has no host"))?;
    let https = url.scheme_str() == Some("https");
    let port = url.port_u16().unwrap_or(if https { 443 } else { 80 });

    if !req.headers().contains_key(HOST_HEADER) {
        if let Some(authority) = url.authority() {
            if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
                req.headers_mut().insert(HOST_HEADER, value);
            }
        }
    }
    let path = url.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    *req.uri_mut() = path.parse()?;

    let tcp = TcpStream::connect((host.as_str(), port)).await?;
    let _ = tcp.set_nodelay(true);
    if https {
        let name = ServerName::try_from(host)?;
        let tls = connector.connect(name, tcp).await?;
        exchange_over(tls, req, casing).await
    } else {
        exchange_over(tcp, req, casing).await
    }
}

async fn exchange_over<S>(
    io: S,
    req: Request<OutboundBody>,
    casing: HeaderCasing,
) -> Result<Response<Incoming>, BoxError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (io, tap) = CaseTap::new(io, true);
    tap.set_casing(casing);
    let (mut sender, conn) = http1::Builder::new()
        .title_case_headers(true)
        .handshake(TokioIo::new(io))
        .await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            proxy_log!("[forward] upstream connection ended: {}", e);
        }
    });
    let mut resp = sender.send_request(req).await?;
    if let Some(raw) = tap.response_headers() {
        resp.extensions_mut().insert(RawHeaders(raw));
    }
    Ok(resp)
}

impl Forward for ForwardProxy {
    fn forward(&self, req: ProxyRequest, res: ResponseWriter) -> HandlerFuture {
        let this = self.clone();
        Box::pin(async move { ForwardProxy::forward(&this, req, res).await })
    }
}

/// Content-Length of exactly `0`, or a status that never carries a body.
pub(crate) fn has_no_body(status: StatusCode, headers: &HeaderSet) -> bool {
    headers.get(CONTENT_LENGTH).map(str::trim) == Some("0")
        || matches!(
            status,
            StatusCode::NO_CONTENT | StatusCode::RESET_CONTENT | StatusCode::NOT_MODIFIED
        )
}

pub(crate) async fn relay_response<B>(resp: Response<B>, res: &mut ResponseWriter, errors: &ErrorSink)
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    let (parts, mut body) = resp.into_parts();
    let mut headers = match parts.extensions.get::<RawHeaders>() {
        Some(RawHeaders(raw)) => raw.clone(),
        None => HeaderSet::from_http(&parts.headers),
    };
    condition(&mut headers);
    let bodyless = has_no_body(parts.status, &headers);
    res.write_head(parts.status, headers);
    if bodyless {
        res.end();
        return;
    }
    while let Some(frame) = body.frame().await {
        match frame {
            Ok(frame) => {
                if let Ok(data) = frame.into_data() {
                    if !res.write(data) {
                        break;
                    }
                }
            }
            Err(e) => {
                errors.emit(e, RESPONSE_ORIGIN);
                break;
            }
        }
    }
    res.end();
}

fn respond_unreachable(res: &mut ResponseWriter, target: &str) {
    let mut headers = HeaderSet::default();
    headers.set("Content-Type", "text/plain");
    res.respond(
        StatusCode::IM_A_TEAPOT,
        headers,
        format!("error: probably, proxy could not resolve host {target}\n"),
    );
}

pub(crate) trait BodySink {
    fn write(&mut self, chunk: Bytes);
    fn end(&mut self);
}

struct ChannelSink(Option<mpsc::UnboundedSender<BodyFrame>>);

impl BodySink for ChannelSink {
    fn write(&mut self, chunk: Bytes) {
        if let Some(tx) = &self.0 {
            let _ = tx.send(Ok(Frame::data(chunk)));
        }
    }

    fn end(&mut self) {
        self.0 = None;
    }
}

/// Copies an inbound body into the outbound request. The outbound side is
/// ended exactly once: when the declared length is reached or when the
/// inbound body ends, whichever comes first.
pub(crate) struct BodyCopier<S> {
    sink: S,
    expected: Option<u64>,
    received: u64,
    ended: bool,
}

impl<S: BodySink> BodyCopier<S> {
    pub(crate) fn new(sink: S, expected: Option<u64>) -> Self {
        Self {
            sink,
            expected,
            received: 0,
            ended: false,
        }
    }

    pub(crate) fn is_ended(&self) -> bool {
        self.ended
    }

    pub(crate) fn on_data(&mut self, mut chunk: Bytes) {
        if self.ended {
            return;
        }
        if let Some(limit) = self.expected {
            let remaining = limit.saturating_sub(self.received);
            if (chunk.len() as u64) > remaining {
                chunk.truncate(remaining as usize);
            }
        }
        self.received += chunk.len() as u64;
        if !chunk.is_empty() {
            self.sink.write(chunk);
        }
        if self.expected.is_some_and(|limit| self.received >= limit) {
            self.on_end();
        }
    }

    pub(crate) fn on_end(&mut self) {
        if !self.ended {
            self.ended = true;
            self.sink.end();
        }
    }
}

async fn copy_body<B, S>(mut inbound: B, mut copier: BodyCopier<S>, errors: ErrorSink)
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
    S: BodySink,
{
    while !copier.is_ended() {
        match inbound.frame().await {
            Some(Ok(frame)) => {
                if let Ok(data) = frame.into_data() {
                    copier.on_data(data);
                }
            }
            Some(Err(e)) => {
                errors.emit(e, REQUEST_BODY_ORIGIN);
                break;
            }
            None => break,
        }
    }
    copier.on_end();
}
