//! Request filters and the router that runs them.

use std::sync::Arc;

use crate::proxy::{Forward, HandlerFuture, ProxyRequest, RequestHandler, ResponseWriter};

/// Inspects, rewrites or answers an exchange.
///
/// `handled` tells whether an earlier filter already answered. Return true
/// if this filter answered; the flag stays set for the rest of the chain.
/// Filters run synchronously, in registration order, before anything is
/// sent upstream. Head rewrites that need the upstream answer go through
/// [`ResponseWriter::on_head`].
pub trait Filter: Send + Sync {
    fn filter(&self, req: &mut ProxyRequest, res: &mut ResponseWriter, handled: bool) -> bool;
}

impl<F> Filter for F
where
    F: Fn(&mut ProxyRequest, &mut ResponseWriter, bool) -> bool + Send + Sync,
{
    fn filter(&self, req: &mut ProxyRequest, res: &mut ResponseWriter, handled: bool) -> bool {
        self(req, res, handled)
    }
}

#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn Filter>>,
}

impl FilterChain {
    pub fn new(filters: Vec<Arc<dyn Filter>>) -> Self {
        Self { filters }
    }

    pub fn push(&mut self, filter: Arc<dyn Filter>) {
        self.filters.push(filter);
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Every filter runs, even after one has handled the exchange.
    pub fn apply(&self, req: &mut ProxyRequest, res: &mut ResponseWriter) -> bool {
        self.filters
            .iter()
            .fold(false, |handled, f| f.filter(req, res, handled) || handled)
    }
}

/// Passive filter logging each exchange at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct RequestLog;

impl Filter for RequestLog {
    fn filter(&self, req: &mut ProxyRequest, _res: &mut ResponseWriter, handled: bool) -> bool {
        tracing::info!(
            id = req.id(),
            server = req.server(),
            handled,
            "{} {}",
            req.method,
            req.url
        );
        false
    }
}

/// Runs the filter chain and forwards whatever it left unhandled.
pub struct Router {
    filters: FilterChain,
    forward: Arc<dyn Forward>,
}

impl Router {
    pub fn new(filters: FilterChain, forward: Arc<dyn Forward>) -> Self {
        Self { filters, forward }
    }
}

impl RequestHandler for Router {
    fn handle(&self, mut req: ProxyRequest, mut res: ResponseWriter) -> HandlerFuture {
        if self.filters.apply(&mut req, &mut res) {
            return Box::pin(async move { drop(res) });
        }
        self.forward.forward(req, res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::HeaderSet;
    use http::{Method, StatusCode, Uri};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingForward(AtomicUsize);

    impl Forward for CountingForward {
        fn forward(&self, _req: ProxyRequest, mut res: ResponseWriter) -> HandlerFuture {
            self.0.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { res.respond(StatusCode::OK, HeaderSet::default(), "upstream") })
        }
    }

    fn request() -> ProxyRequest {
        ProxyRequest::new(
            Method::GET,
            Uri::from_static("http://example.test/"),
            HeaderSet::default(),
        )
    }

    #[test]
    fn every_filter_sees_sticky_flag() {
        let flags = Arc::new(Mutex::new(Vec::new()));
        let f = |answer: bool| -> Arc<dyn Filter> {
            let flags = flags.clone();
            Arc::new(move |_: &mut ProxyRequest, _: &mut ResponseWriter, handled: bool| {
                flags.lock().unwrap().push(handled);
                answer
            })
        };
        let chain = FilterChain::new(vec![f(false), f(true), f(false), f(false)]);
        let (mut w, _r) = ResponseWriter::channel();
        assert!(chain.apply(&mut request(), &mut w));
        assert_eq!(*flags.lock().unwrap(), vec![false, false, true, true]);
    }

    #[test]
    fn empty_chain_is_unhandled() {
        let (mut w, _r) = ResponseWriter::channel();
        assert!(!FilterChain::default().apply(&mut request(), &mut w));
        assert!(!RequestLog.filter(&mut request(), &mut w, false));
    }

    #[tokio::test]
    async fn handled_exchange_is_not_forwarded() {
        let forward = Arc::new(CountingForward::default());
        let answer: Arc<dyn Filter> = Arc::new(
            |_: &mut ProxyRequest, res: &mut ResponseWriter, _handled: bool| {
                res.respond(StatusCode::FORBIDDEN, HeaderSet::default(), "blocked");
                true
            },
        );
        let passive: Arc<dyn Filter> = Arc::new(RequestLog);
        let router = Router::new(
            FilterChain::new(vec![passive.clone(), answer, passive]),
            forward.clone(),
        );
        let (w, mut r) = ResponseWriter::channel();
        router.handle(request(), w).await;
        assert_eq!(r.head().await.unwrap().status, StatusCode::FORBIDDEN);
        assert_eq!(r.next_chunk().await.unwrap(), "blocked");
        assert_eq!(forward.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unhandled_exchange_is_forwarded_with_rewrites() {
        let forward = Arc::new(CountingForward::default());
        let rewrite: Arc<dyn Filter> = Arc::new(
            |req: &mut ProxyRequest, res: &mut ResponseWriter, _handled: bool| {
                req.headers.set("X-Filtered", "1");
                res.on_head(|head| head.headers.set("X-Seen", "1"));
                false
            },
        );
        let router = Router::new(FilterChain::new(vec![rewrite]), forward.clone());
        let (w, mut r) = ResponseWriter::channel();
        router.handle(request(), w).await;
        let head = r.head().await.unwrap();
        assert_eq!(head.headers.get("x-seen"), Some("1"));
        assert_eq!(forward.0.load(Ordering::SeqCst), 1);
    }
}
