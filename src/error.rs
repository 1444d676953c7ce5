//! Error types and the origin-tagged error fabric.
//!
//! Startup and configuration failures are returned as [`ProxyError`].
//! Traffic failures (resets, refused connections, broken streams) are never
//! returned to a caller; they are published as [`ErrorEvent`]s through an
//! [`ErrorSink`]. Each layer an event passes through prefixes its own tag,
//! so an event raised on the external client socket of a listener ends up
//! with the origin `listener:external-server-socket`.

use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Errors raised while configuring or starting the proxy.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("failed to read tls {kind} file {path}: {source}")]
    TlsFile {
        kind: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("tls configuration error: {0}")]
    Tls(String),

    #[error("socket directory {path} unusable: {source}")]
    SocketDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("bind failed on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ProxyError>;

/// A traffic failure together with the path of components it bubbled through.
#[derive(Clone)]
pub struct ErrorEvent {
    origin: String,
    host: Option<String>,
    error: Arc<dyn StdError + Send + Sync + 'static>,
}

impl ErrorEvent {
    pub fn new(error: impl Into<BoxError>, origin: &str) -> Self {
        let boxed: BoxError = error.into();
        let mut event = Self {
            origin: String::new(),
            host: None,
            error: Arc::from(boxed),
        };
        event.apply_origin(origin);
        event
    }

    /// Attach the destination host name the failing operation was aimed at.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    fn apply_origin(&mut self, tag: &str) {
        if tag.is_empty() {
            return;
        }
        self.origin = if self.origin.is_empty() {
            tag.to_string()
        } else {
            format!("{}:{}", tag, self.origin)
        };
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn error(&self) -> &(dyn StdError + Send + Sync + 'static) {
        &*self.error
    }

    pub fn message(&self) -> String {
        self.error.to_string()
    }

    fn chain(&self) -> impl Iterator<Item = &(dyn StdError + 'static)> {
        let first: &(dyn StdError + 'static) = &*self.error;
        std::iter::successors(Some(first), |e: &&(dyn StdError + 'static)| (*e).source())
    }

    /// Kind of the first `std::io::Error` found in the source chain.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        self.chain()
            .find_map(|e| e.downcast_ref::<io::Error>())
            .map(|e| e.kind())
    }

    /// Whether name resolution failed somewhere in the source chain.
    pub fn is_dns_failure(&self) -> bool {
        self.chain().any(|e| {
            let msg = e.to_string();
            msg.contains("dns error") || msg.contains("failed to lookup address")
        })
    }
}

impl fmt::Debug for ErrorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorEvent")
            .field("origin", &self.origin)
            .field("host", &self.host)
            .field("error", &self.error)
            .finish()
    }
}

impl fmt::Display for ErrorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.origin, self.error)
    }
}

type Deliver = dyn Fn(ErrorEvent) + Send + Sync;

/// Destination for [`ErrorEvent`]s.
///
/// Cloning is cheap. [`ErrorSink::scoped`] derives a sink that prefixes a tag
/// before handing events to its parent.
#[derive(Clone)]
pub struct ErrorSink {
    deliver: Arc<Deliver>,
}

impl ErrorSink {
    pub fn new(handler: impl Fn(ErrorEvent) + Send + Sync + 'static) -> Self {
        Self {
            deliver: Arc::new(handler),
        }
    }

    /// A sink that drops everything.
    pub fn discard() -> Self {
        Self::new(|_| {})
    }

    pub fn scoped(&self, tag: &str) -> ErrorSink {
        let parent = self.clone();
        let tag = tag.to_string();
        Self::new(move |mut event: ErrorEvent| {
            event.apply_origin(&tag);
            parent.emit_event(event);
        })
    }

    pub fn emit(&self, error: impl Into<BoxError>, origin: &str) {
        self.emit_event(ErrorEvent::new(error, origin));
    }

    pub fn emit_event(&self, event: ErrorEvent) {
        (self.deliver)(event);
    }
}

impl fmt::Debug for ErrorSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ErrorSink")
    }
}
