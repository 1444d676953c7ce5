//! Normalizing HTTP servers behind the local relay sockets.
//!
//! Each server turns a client request into a [`ProxyRequest`]: headers are
//! conditioned, the URL is made absolute from the server's scheme and the
//! `Host` header, and the exchange is handed to the [`RequestHandler`] on
//! its own task. The client response is whatever the handler writes.
//! Header names keep the casing they arrived with, apart from
//! canonicalization.

use std::convert::Infallible;
use std::sync::Arc;

use http::{Method, Request, Response, StatusCode, Uri};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use crate::error::ErrorSink;
use crate::headers::{HOST, HeaderSet, condition};
use crate::proxy::casing::{CaseTap, HeaderCasing, RawHeaders};
use crate::proxy::exchange::{ClientBody, ProxyRequest, RequestHandler, ResponseWriter};
use crate::proxy::server::{Accepted, ServerSocket, accept_loop};
use crate::proxy_log;

pub(crate) const HTTP_SERVER: &str = "internal-http";
pub(crate) const HTTPS_SERVER: &str = "internal-https";
pub(crate) const FALLBACK_SERVER: &str = "fallback-http";

pub(crate) struct InternalServer {
    name: &'static str,
    scheme: &'static str,
    tls: Option<TlsAcceptor>,
    handler: Arc<dyn RequestHandler>,
    errors: ErrorSink,
}

impl InternalServer {
    pub(crate) fn plain(
        name: &'static str,
        handler: Arc<dyn RequestHandler>,
        errors: ErrorSink,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            scheme: "http",
            tls: None,
            handler,
            errors,
        })
    }

    pub(crate) fn tls(
        name: &'static str,
        acceptor: TlsAcceptor,
        handler: Arc<dyn RequestHandler>,
        errors: ErrorSink,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            scheme: "https",
            tls: Some(acceptor),
            handler,
            errors,
        })
    }

    pub(crate) async fn serve(self: Arc<Self>, socket: ServerSocket, shutdown: watch::Receiver<bool>) {
        let origin = format!("{}-socket", self.name);
        let errors = self.errors.clone();
        accept_loop(socket, shutdown, errors, origin, move |conn| {
            let this = self.clone();
            async move {
                match conn {
                    Accepted::Tcp(s) => this.serve_stream(s).await,
                    Accepted::Unix(s) => this.serve_stream(s).await,
                }
            }
        })
        .await;
    }

    async fn serve_stream<S>(self: Arc<Self>, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        match self.tls.clone() {
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(tls) => self.serve_http(tls).await,
                Err(e) => self.errors.emit(e, &format!("{}-socket", self.name)),
            },
            None => self.serve_http(stream).await,
        }
    }

    async fn serve_http<S>(self: Arc<Self>, io: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (io, tap) = CaseTap::new(io, false);
        let this = self.clone();
        let service = service_fn(move |mut req: Request<Incoming>| {
            let this = this.clone();
            let tap = tap.clone();
            async move {
                if let Some(raw) = tap.request_headers() {
                    req.extensions_mut().insert(RawHeaders(raw));
                }
                let resp = this.handle(req).await;
                if let Some(casing) = resp.extensions().get::<HeaderCasing>() {
                    tap.set_casing(casing.clone());
                }
                Ok::<_, Infallible>(resp)
            }
        });
        let mut builder = http1::Builder::new();
        builder.keep_alive(false).title_case_headers(true);
        if let Err(e) = builder.serve_connection(TokioIo::new(io), service).await {
            let side = if e.is_parse() || e.is_incomplete_message() {
                "request"
            } else {
                "response"
            };
            self.errors.emit(e, &format!("{}-{}", self.name, side));
        }
    }

    async fn handle(&self, req: Request<Incoming>) -> Response<ClientBody> {
        let (parts, body) = req.into_parts();
        if parts.method == Method::CONNECT {
            return short_response(StatusCode::METHOD_NOT_ALLOWED).await;
        }
        let mut headers = match parts.extensions.get::<RawHeaders>() {
            Some(RawHeaders(raw)) => raw.clone(),
            None => HeaderSet::from_http(&parts.headers),
        };
        condition(&mut headers);
        let Some(url) = absolute_url(self.scheme, &parts.uri, headers.get(HOST)) else {
            return short_response(StatusCode::BAD_REQUEST).await;
        };
        proxy_log!("[{}] {} {}", self.name, parts.method, url);

        let mut exchange = ProxyRequest::new(parts.method, url, headers)
            .with_body(body.boxed_unsync())
            .with_server(self.name);
        exchange.version = parts.version;
        let (res, receiver) = ResponseWriter::channel();
        let handler = self.handler.clone();
        tokio::spawn(async move { handler.handle(exchange, res).await });
        receiver.into_response().await
    }
}

async fn short_response(status: StatusCode) -> Response<ClientBody> {
    let (mut w, r) = ResponseWriter::channel();
    w.respond(status, HeaderSet::default(), "");
    r.into_response().await
}

/// `scheme://host/path?query`, host from the `Host` header, falling back to
/// the authority of an absolute-form request target.
pub(crate) fn absolute_url(scheme: &str, uri: &Uri, host: Option<&str>) -> Option<Uri> {
    let authority = host
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .or_else(|| uri.authority().map(|a| a.to_string()))?;
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    format!("{scheme}://{authority}{path}").parse().ok()
}
