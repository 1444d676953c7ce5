//! Default consumer of [`ErrorEvent`]s: decides what reaches the operator.

use std::fmt::Write as _;
use std::io;
use std::sync::Arc;

use crate::error::{ErrorEvent, ErrorSink};

pub const FAKE_CERTIFICATE_NOTICE: &str = "No TLS certificate provided, using fake certificate.";
pub const HTTP_FALLBACK_NOTICE: &str = "Failed to initialize https tunnling, using http fallback.";

type Output = Arc<dyn Fn(&str) + Send + Sync>;

enum Notice {
    /// Routine noise: clients hanging up, browsers probing bare names.
    Benign,
    Fixed(&'static str),
    Unexpected,
}

fn classify(event: &ErrorEvent) -> Notice {
    match event.origin() {
        "listener:external-server-socket"
            if event.io_kind() == Some(io::ErrorKind::ConnectionReset) =>
        {
            Notice::Benign
        }
        "proxy:proxy-proxyrequest" if event.is_dns_failure() && is_bare_hostname(event.host()) => {
            Notice::Benign
        }
        "proxy:proxy-proxyrequest"
            if event.io_kind() == Some(io::ErrorKind::ConnectionRefused) =>
        {
            Notice::Benign
        }
        "listener:fakecertificate" => Notice::Fixed(FAKE_CERTIFICATE_NOTICE),
        "listener:http-fallback" => Notice::Fixed(HTTP_FALLBACK_NOTICE),
        _ => Notice::Unexpected,
    }
}

fn is_bare_hostname(host: Option<&str>) -> bool {
    match host {
        Some(h) => !h.is_empty() && !h.contains('.') && h != "localhost",
        None => false,
    }
}

fn detailed(event: &ErrorEvent) -> String {
    let mut out = event.to_string();
    if let Some(host) = event.host() {
        let _ = write!(out, " (host {host})");
    }
    let mut source = event.error().source();
    while let Some(cause) = source {
        let _ = write!(out, "\n  caused by: {cause}");
        source = cause.source();
    }
    out
}

#[derive(Clone)]
pub struct NotificationHandler {
    verbose: bool,
    out: Output,
}

impl NotificationHandler {
    pub fn new(verbose: bool) -> Self {
        Self::with_output(verbose, |msg| tracing::warn!("{msg}"))
    }

    pub fn with_output(verbose: bool, out: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self {
            verbose,
            out: Arc::new(out),
        }
    }

    pub fn notify(&self, event: &ErrorEvent) {
        match classify(event) {
            Notice::Benign if !self.verbose => {}
            Notice::Fixed(msg) => (self.out)(msg),
            _ if self.verbose => (self.out)(&detailed(event)),
            _ => (self.out)(&event.to_string()),
        }
    }

    pub fn into_sink(self) -> ErrorSink {
        ErrorSink::new(move |event| self.notify(&event))
    }
}

impl std::fmt::Debug for NotificationHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationHandler")
            .field("verbose", &self.verbose)
            .finish()
    }
}
