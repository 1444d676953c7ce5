use std::convert::Infallible;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;

pub(crate) mod casing;
pub(crate) mod exchange;
pub(crate) mod external;
pub(crate) mod forward;
pub(crate) mod internal;
pub(crate) mod parse;
pub(crate) mod relay;
pub(crate) mod server;
pub(crate) mod tls;
pub(crate) mod tunnel;


/// Debug-level trace for the proxy pipeline, filtered under the
/// `reworse::proxy` target.
#[macro_export]
macro_rules! proxy_log {
    ($($arg:tt)*) => {{
        ::tracing::debug!(target: "reworse::proxy", $($arg)*);
    }};
}

/// Body of requests sent upstream.
pub type OutboundBody = BoxBody<Bytes, Infallible>;

pub use exchange::{
    ClientBody, HandlerFuture, ProxyRequest, RequestBody, RequestHandler, ResponseHead,
    ResponseReceiver, ResponseWriter,
};
pub use forward::{Forward, ForwardProxy};
