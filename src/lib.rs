//! reworse: a local intercepting HTTP/HTTPS forward proxy.
//!
//! Clients point at a single TCP port. Plain HTTP, TLS and `CONNECT`
//! traffic on that port is told apart by its first byte and normalized into
//! [`ProxyRequest`] exchanges, which pass through a chain of [`Filter`]s and
//! are then replayed against the origin server.

mod ca;
pub mod config;
pub mod error;
pub mod filters;
pub mod fs_env;
pub mod headers;
pub mod listener;
pub mod notification;
pub mod proxy;
pub mod wait;

use std::net::SocketAddr;
use std::sync::Arc;

pub use config::{ExchangePolicy, ListenerConfig, ProxyOptions, TlsCert};
pub use error::{ErrorEvent, ErrorSink, ProxyError, Result};
pub use filters::{Filter, FilterChain, RequestLog, Router};
pub use listener::{Listener, ListenerHandle, ListenerMode};
pub use notification::NotificationHandler;
pub use proxy::{ForwardProxy, ProxyRequest, ResponseHead, ResponseWriter};

/// A started proxy.
#[derive(Debug)]
pub struct Running {
    listener: ListenerHandle,
}

impl Running {
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn mode(&self) -> ListenerMode {
        self.listener.mode()
    }

    pub async fn close(self) {
        self.listener.close().await;
    }
}

/// Starts the listener, router and forward engine.
///
/// Listener events are tagged `listener`, forward engine events `proxy`.
/// Without an explicit `errors` sink a [`NotificationHandler`] is used.
pub async fn run(
    options: ProxyOptions,
    filters: Vec<Arc<dyn Filter>>,
    errors: Option<ErrorSink>,
) -> Result<Running> {
    let root = errors.unwrap_or_else(|| NotificationHandler::new(options.verbose).into_sink());
    let forward = ForwardProxy::new(
        options.accept_invalid_upstream_certs,
        options.exchange_policy.clone(),
        root.scoped("proxy"),
    );
    let router = Router::new(FilterChain::new(filters), Arc::new(forward));
    let listener = Listener::new(options.listener.clone(), Arc::new(router), root.scoped("listener"));
    let handle = listener.listen(options.port).await?;
    tracing::info!(
        addr = %handle.local_addr(),
        mode = ?handle.mode(),
        "reworse listening"
    );
    Ok(Running { listener: handle })
}
