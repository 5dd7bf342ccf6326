use std::sync::mpsc;
use std::sync::{Arc, PoisonError, RwLock};
use std::thread;

use tracing::debug;

use crate::error::{Result, SessionError};
use crate::stream::Stream;

/// Something that accepts streams.
pub trait StreamSender: Send + Sync {
    fn send(&self, stream: Stream) -> Result<()>;
}

/// Something that produces streams until it is closed.
pub trait StreamReceiver {
    /// Next stream. `SessionError::Closed` marks an orderly end.
    fn receive(&self) -> Result<Stream>;
}

impl StreamSender for mpsc::Sender<Stream> {
    fn send(&self, stream: Stream) -> Result<()> {
        mpsc::Sender::send(self, stream).map_err(|_| SessionError::Closed)
    }
}

impl StreamSender for mpsc::SyncSender<Stream> {
    fn send(&self, stream: Stream) -> Result<()> {
        mpsc::SyncSender::send(self, stream).map_err(|_| SessionError::Closed)
    }
}

impl StreamReceiver for mpsc::Receiver<Stream> {
    fn receive(&self) -> Result<Stream> {
        self.recv().map_err(|_| SessionError::Closed)
    }
}

/// Handler that runs a function on a new thread for every stream.
pub struct HandleFunc {
    f: Arc<dyn Fn(Stream) + Send + Sync>,
}

impl HandleFunc {
    pub fn new(f: impl Fn(Stream) + Send + Sync + 'static) -> Self {
        Self { f: Arc::new(f) }
    }
}

impl StreamSender for HandleFunc {
    fn send(&self, stream: Stream) -> Result<()> {
        let f = Arc::clone(&self.f);
        thread::Builder::new()
            .name(format!("beam-handler-{}", stream.id()))
            .spawn(move || f(stream))
            .map_err(SessionError::Spawn)?;
        Ok(())
    }
}

enum Predicate {
    Parent(Vec<u32>),
    Headers(Vec<(String, String)>),
    Func(Box<dyn Fn(&Stream) -> bool + Send + Sync>),
}

impl Predicate {
    fn matches(&self, stream: &Stream) -> bool {
        match self {
            Predicate::Parent(ids) if ids.is_empty() => stream.parent_id().is_none(),
            Predicate::Parent(ids) => stream.parent_id().is_some_and(|id| ids.contains(&id)),
            Predicate::Headers(pairs) => stream.with_header(|header| {
                pairs.iter().all(|(key, value)| {
                    if !header.exists(key) {
                        return false;
                    }
                    value.is_empty()
                        || header
                            .get_all(key)
                            .iter()
                            .any(|v| v.as_ref() == value.as_bytes())
                })
            }),
            Predicate::Func(f) => f(stream),
        }
    }
}

struct Route {
    predicates: Vec<Predicate>,
    handler: Box<dyn StreamSender>,
}

impl Route {
    fn matches(&self, stream: &Stream) -> bool {
        self.predicates.iter().all(|p| p.matches(stream))
    }
}

/// Dispatches streams to handlers by predicate.
///
/// Routes are tried newest first: when several match, the one registered
/// last handles the stream. Streams no route matches are dropped.
#[derive(Default)]
pub struct Router {
    routes: RwLock<Vec<Arc<Route>>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a route. It is registered once a handler is attached.
    pub fn new_route(&self) -> RouteBuilder<'_> {
        RouteBuilder {
            router: self,
            predicates: Vec::new(),
        }
    }

    /// Number of registered routes.
    pub fn len(&self) -> usize {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dispatch every stream from `source` until it closes.
    pub fn receive_from(&self, source: &impl StreamReceiver) -> Result<()> {
        loop {
            match source.receive() {
                Ok(stream) => StreamSender::send(self, stream)?,
                Err(SessionError::Closed) => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }

    fn add(&self, route: Route) {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(route));
    }

    fn find(&self, stream: &Stream) -> Option<Arc<Route>> {
        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
        routes.iter().rev().find(|r| r.matches(stream)).cloned()
    }
}

impl StreamSender for Router {
    fn send(&self, stream: Stream) -> Result<()> {
        match self.find(&stream) {
            Some(route) => route.handler.send(stream),
            None => {
                debug!(%stream, "no route matched, dropping stream");
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router").field("routes", &self.len()).finish()
    }
}

/// Builder for one route. Every predicate must match.
#[must_use = "a route is registered only when a handler is attached"]
pub struct RouteBuilder<'r> {
    router: &'r Router,
    predicates: Vec<Predicate>,
}

impl RouteBuilder<'_> {
    /// Match streams whose parent is one of `ids`, or with no ids, streams
    /// without a parent.
    pub fn parent(mut self, ids: &[u32]) -> Self {
        self.predicates.push(Predicate::Parent(ids.to_vec()));
        self
    }

    /// Match streams carrying every `(key, value)` header. An empty value
    /// only requires the key to exist.
    pub fn headers(mut self, pairs: &[(&str, &str)]) -> Self {
        let pairs = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.predicates.push(Predicate::Headers(pairs));
        self
    }

    /// Match streams whose `name` header is `name`.
    pub fn name(self, name: &str) -> Self {
        self.headers(&[("name", name)])
    }

    pub fn matcher_func(mut self, f: impl Fn(&Stream) -> bool + Send + Sync + 'static) -> Self {
        self.predicates.push(Predicate::Func(Box::new(f)));
        self
    }

    /// Register the route, running `f` on its own thread per stream.
    pub fn handle_func(self, f: impl Fn(Stream) + Send + Sync + 'static) {
        self.handler(HandleFunc::new(f));
    }

    /// Register the route with an arbitrary handler.
    pub fn handler(self, handler: impl StreamSender + 'static) {
        self.router.add(Route {
            predicates: self.predicates,
            handler: Box::new(handler),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use std::time::Duration;

    fn announce(session: &Session, build: impl FnOnce(&Stream)) -> Stream {
        let stream = session.new_stream(None);
        build(&stream);
        stream.send().expect("send should succeed");
        stream
    }

    #[test]
    fn last_registered_route_wins() {
        let router = Router::new();
        let (first_tx, first_rx) = mpsc::channel::<Stream>();
        let (second_tx, second_rx) = mpsc::channel::<Stream>();
        router.new_route().name("greet").handler(first_tx);
        router.new_route().name("greet").handler(second_tx);

        let (a, b) = Session::pair().unwrap();
        announce(&a, |s| s.set_name("greet").unwrap());
        let stream = b.receive().unwrap();
        router.send(stream).unwrap();

        assert!(second_rx.try_recv().is_ok());
        assert!(first_rx.try_recv().is_err());
    }

    #[test]
    fn unmatched_stream_is_dropped() {
        let router = Router::new();
        let (tx, rx) = mpsc::channel::<Stream>();
        router.new_route().name("stdout").handler(tx);

        let (a, b) = Session::pair().unwrap();
        announce(&a, |s| s.set_name("stderr").unwrap());
        router.send(b.receive().unwrap()).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn header_predicates() {
        let (a, b) = Session::pair().unwrap();
        announce(&a, |s| {
            s.add_header("content-type", "beam-job").unwrap();
            s.add_header("tag", "x").unwrap();
            s.add_header("tag", "y").unwrap();
        });
        let stream = b.receive().unwrap();

        let check = |pairs: &[(&str, &str)]| {
            let router = Router::new();
            let (tx, rx) = mpsc::channel::<Stream>();
            router.new_route().headers(pairs).handler(tx);
            router.send(stream.clone()).unwrap();
            rx.try_recv().is_ok()
        };

        assert!(check(&[("Content-Type", "beam-job")]));
        assert!(check(&[("tag", "y"), ("content-type", "")]));
        assert!(!check(&[("tag", "z")]));
        assert!(!check(&[("missing", "")]));
        assert!(!check(&[("content-type", "BEAM-JOB")]));
    }

    #[test]
    fn parent_predicates() {
        let (a, b) = Session::pair().unwrap();
        let root = a.new_stream(None);
        root.send().unwrap();
        let child = root.new_child().unwrap();
        child.send().unwrap();

        let remote_root = b.receive().unwrap();
        let remote_child = b.receive().unwrap();

        let matches = |ids: &[u32], stream: &Stream| {
            let router = Router::new();
            let (tx, rx) = mpsc::channel::<Stream>();
            router.new_route().parent(ids).handler(tx);
            router.send(stream.clone()).unwrap();
            rx.try_recv().is_ok()
        };

        assert!(matches(&[], &remote_root));
        assert!(!matches(&[], &remote_child));
        assert!(matches(&[7, 1], &remote_child));
        assert!(!matches(&[3], &remote_child));
    }

    #[test]
    fn installed_router_runs_handlers_per_stream() {
        let (a, b) = Session::pair().unwrap();
        let router = Arc::new(Router::new());
        let (tx, rx) = mpsc::channel();
        router
            .new_route()
            .matcher_func(|s| s.id() % 2 == 1)
            .handle_func(move |stream| {
                let name = stream.header().get_str("name").map(str::to_string);
                tx.send(name).unwrap();
            });
        b.install_router(Arc::clone(&router));

        announce(&a, |s| s.set_name("one").unwrap());
        announce(&a, |s| s.set_name("two").unwrap());

        let mut names: Vec<Option<String>> = (0..2)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        names.sort();
        assert_eq!(names, [Some("one".to_string()), Some("two".to_string())]);
    }

    #[test]
    fn receive_from_pumps_until_closed() {
        let (a, b) = Session::pair().unwrap();
        let router = Router::new();
        let (tx, rx) = mpsc::channel::<Stream>();
        router.new_route().handler(tx);

        announce(&a, |_| {});
        announce(&a, |_| {});
        a.close().unwrap();

        router.receive_from(&b).unwrap();
        assert_eq!(rx.try_iter().count(), 2);
    }
}
