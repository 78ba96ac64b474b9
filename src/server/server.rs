//! The server: listener setup, virtual-host routing tables, the handler
//! contract, and the worker pool connections are dispatched onto.

use crate::http::request::Request;
use crate::http::response::Response;
use crate::http::types::parent_path;
use crate::limits::Limits;
use crate::server::connection::serve_connection;
use crossbeam::channel;
use log::{debug, error};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;

/// A context handler serves the content of resources within a context.
///
/// The return value is an HTTP status code: `0` means the response has
/// already been written; any other value makes the dispatcher send a
/// default response for that status. I/O errors become a `500` if the
/// response headers have not been sent yet.
pub trait Handler: Send + Sync {
    fn serve(&self, req: &mut Request<'_>, resp: &mut Response<'_>) -> io::Result<u16>;

    /// Invoked once by [`Server::stop`] so handlers holding resources
    /// (mounted archives, caches) can release them.
    fn on_close(&self) {}
}

impl<F> Handler for F
where
    F: Fn(&mut Request<'_>, &mut Response<'_>) -> io::Result<u16> + Send + Sync,
{
    fn serve(&self, req: &mut Request<'_>, resp: &mut Response<'_>) -> io::Result<u16> {
        self(req, resp)
    }
}

/// Runs connection tasks. The default executor is a grow-on-demand cached
/// thread pool; embedders can inject their own and are then responsible
/// for shutting it down.
pub trait Executor: Send + Sync {
    fn execute(&self, task: Box<dyn FnOnce() + Send>);
}

type Job = Box<dyn FnOnce() + Send>;

/// The default executor: workers block on a shared channel, a new worker
/// is spawned whenever a task arrives and none is idle, and workers exit
/// after a minute without work. Consumes no threads when idle long enough.
pub(crate) struct CachedPool {
    tx: channel::Sender<Job>,
    rx: channel::Receiver<Job>,
    idle: Arc<AtomicUsize>,
    keep_alive: Duration,
}

impl CachedPool {
    pub(crate) fn new(keep_alive: Duration) -> Self {
        let (tx, rx) = channel::unbounded();
        Self {
            tx,
            rx,
            idle: Arc::new(AtomicUsize::new(0)),
            keep_alive,
        }
    }

    fn spawn_worker(&self) {
        let rx = self.rx.clone();
        let idle = Arc::clone(&self.idle);
        let keep_alive = self.keep_alive;

        let spawned = thread::Builder::new()
            .name("ember-worker".to_string())
            .spawn(move || loop {
                idle.fetch_add(1, Ordering::SeqCst);
                let job = rx.recv_timeout(keep_alive);
                idle.fetch_sub(1, Ordering::SeqCst);

                match job {
                    Ok(job) => job(),
                    Err(_) => break,
                }
            });

        if let Err(e) = spawned {
            error!("failed to spawn worker thread: {}", e);
        }
    }
}

impl Executor for CachedPool {
    fn execute(&self, task: Job) {
        if self.idle.load(Ordering::SeqCst) == 0 {
            self.spawn_worker();
        }
        let _ = self.tx.send(task);
    }
}

/// Produces the read/write halves of accepted connections.
///
/// The server applies the socket options (read timeout, `TCP_NODELAY`)
/// before handing the stream over, so a TLS factory only performs its
/// handshake and splits the stream. Certificate handling stays with the
/// embedder.
pub trait StreamFactory: Send + Sync {
    /// Whether streams from this factory are transport-secured; reflected
    /// as `https` in request base URLs.
    fn secure(&self) -> bool {
        false
    }

    fn open(
        &self,
        stream: TcpStream,
    ) -> io::Result<(Box<dyn Read + Send>, Box<dyn Write + Send>)>;
}

/// Plain TCP: the halves are clones of the same socket.
struct PlainFactory;

impl StreamFactory for PlainFactory {
    fn open(
        &self,
        stream: TcpStream,
    ) -> io::Result<(Box<dyn Read + Send>, Box<dyn Write + Send>)> {
        let writer = stream.try_clone()?;
        Ok((Box::new(stream), Box::new(writer)))
    }
}

/// A virtual host: a named (or default) routing namespace holding the
/// contexts registered under it.
///
/// Configuration methods must not be called once the server has started.
pub struct VirtualHost {
    name: Option<String>,
    aliases: RwLock<Vec<String>>,
    contexts: RwLock<HashMap<String, Arc<ContextInfo>>>,
    directory_index: RwLock<Option<String>>,
    allow_generated_index: AtomicBool,
    methods: RwLock<Vec<String>>,
    empty_context: Arc<ContextInfo>,
}

impl VirtualHost {
    /// Constructs a virtual host; `None` names the default host.
    pub fn new(name: Option<&str>) -> Self {
        let mut contexts = HashMap::new();
        // the pseudo-context backing server-wide "OPTIONS *" requests
        contexts.insert("*".to_string(), Arc::new(ContextInfo::new(None)));

        Self {
            name: name.map(str::to_string),
            aliases: RwLock::new(Vec::new()),
            contexts: RwLock::new(contexts),
            directory_index: RwLock::new(Some("index.html".to_string())),
            allow_generated_index: AtomicBool::new(false),
            methods: RwLock::new(Vec::new()),
            empty_context: Arc::new(ContextInfo::new(None)),
        }
    }

    /// This host's name, or `None` for the default host.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn add_alias(&self, alias: &str) {
        let mut aliases = lock_write(&self.aliases);
        if !aliases.iter().any(|a| a == alias) {
            aliases.push(alias.to_string());
        }
    }

    pub fn aliases(&self) -> Vec<String> {
        lock_read(&self.aliases).clone()
    }

    /// The filename appended to directory requests (default `index.html`),
    /// or `None` to disable the rewrite.
    pub fn directory_index(&self) -> Option<String> {
        lock_read(&self.directory_index).clone()
    }

    pub fn set_directory_index(&self, index: Option<&str>) {
        *lock_write(&self.directory_index) = index.map(str::to_string);
    }

    pub fn allow_generated_index(&self) -> bool {
        self.allow_generated_index.load(Ordering::Relaxed)
    }

    pub fn set_allow_generated_index(&self, allowed: bool) {
        self.allow_generated_index.store(allowed, Ordering::Relaxed);
    }

    /// All HTTP methods explicitly supported by at least one context, in
    /// registration order.
    pub fn methods(&self) -> Vec<String> {
        lock_read(&self.methods).clone()
    }

    /// Adds a context and its handler for the given HTTP methods (`GET`
    /// when empty). Paths are normalized by removing trailing slashes.
    ///
    /// # Panics
    ///
    /// Panics if the path neither starts with `/` nor equals `*`.
    #[track_caller]
    pub fn add_context<H: Handler + 'static>(&self, path: &str, methods: &[&str], handler: H) {
        assert!(
            path.starts_with('/') || path == "*",
            "invalid path: {}",
            path
        );

        let path = if path == "*" {
            path.to_string()
        } else {
            path.trim_end_matches('/').to_string()
        };

        let info = {
            let mut contexts = lock_write(&self.contexts);
            contexts
                .entry(path.clone())
                .or_insert_with(|| Arc::new(ContextInfo::new(Some(&path))))
                .clone()
        };

        let handler: Arc<dyn Handler> = Arc::new(handler);
        let methods = if methods.is_empty() { &["GET"] } else { methods };
        for method in methods {
            info.put_handler(method, Arc::clone(&handler));

            let mut known = lock_write(&self.methods);
            if !known.iter().any(|m| m == method) {
                known.push(method.to_string());
            }
        }
    }

    /// Returns the context matching the given path: the entry registered
    /// for the path itself or for its nearest ancestor, or the host's
    /// empty context when neither exists.
    pub fn get_context(&self, path: &str) -> Arc<ContextInfo> {
        let contexts = lock_read(&self.contexts);

        // context paths are stored without trailing slashes
        let mut current = path.trim_end_matches('/');
        loop {
            if let Some(info) = contexts.get(current) {
                return Arc::clone(info);
            }
            match parent_path(current) {
                Some(parent) => current = parent,
                None => return Arc::clone(&self.empty_context),
            }
        }
    }

    pub(crate) fn contexts_snapshot(&self) -> Vec<Arc<ContextInfo>> {
        lock_read(&self.contexts).values().cloned().collect()
    }
}

/// A single context: a path prefix and its per-method handler table.
pub struct ContextInfo {
    path: Option<String>,
    handlers: RwLock<Vec<(String, Arc<dyn Handler>)>>,
}

impl ContextInfo {
    pub(crate) fn new(path: Option<&str>) -> Self {
        Self {
            path: path.map(str::to_string),
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// The context path (without trailing slash), or `None` for the
    /// catch-all empty context.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// The handler registered for the given method.
    pub fn handler(&self, method: &str) -> Option<Arc<dyn Handler>> {
        lock_read(&self.handlers)
            .iter()
            .find(|(m, _)| m == method)
            .map(|(_, h)| Arc::clone(h))
    }

    /// The methods this context handles, in registration order.
    pub fn methods(&self) -> Vec<String> {
        lock_read(&self.handlers)
            .iter()
            .map(|(m, _)| m.clone())
            .collect()
    }

    fn put_handler(&self, method: &str, handler: Arc<dyn Handler>) {
        let mut handlers = lock_write(&self.handlers);
        match handlers.iter_mut().find(|(m, _)| m == method) {
            Some(entry) => entry.1 = handler,
            None => handlers.push((method.to_string(), handler)),
        }
    }

    pub(crate) fn handlers_snapshot(&self) -> Vec<Arc<dyn Handler>> {
        lock_read(&self.handlers)
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect()
    }
}

/// Shared server tables read by every connection worker.
pub(crate) struct ServerState {
    pub(crate) limits: Limits,
    pub(crate) secure: bool,
    port: AtomicU16,
    hosts: RwLock<HashMap<String, Arc<VirtualHost>>>,
}

impl ServerState {
    fn new(limits: Limits, secure: bool, port: u16) -> Self {
        let mut hosts = HashMap::new();
        hosts.insert(String::new(), Arc::new(VirtualHost::new(None)));

        Self {
            limits,
            secure,
            port: AtomicU16::new(port),
            hosts: RwLock::new(hosts),
        }
    }

    pub(crate) fn port(&self) -> u16 {
        self.port.load(Ordering::Relaxed)
    }

    fn set_port(&self, port: u16) {
        self.port.store(port, Ordering::Relaxed);
    }

    /// The host registered under the given name (or alias), with `None`
    /// naming the default host.
    pub(crate) fn virtual_host(&self, name: Option<&str>) -> Option<Arc<VirtualHost>> {
        lock_read(&self.hosts).get(name.unwrap_or("")).cloned()
    }

    pub(crate) fn add_virtual_host(&self, host: Arc<VirtualHost>) {
        let name = host.name().unwrap_or("").to_string();
        lock_write(&self.hosts).insert(name, host);
    }

    fn register_alias(&self, alias: &str, host: Arc<VirtualHost>) {
        lock_write(&self.hosts).insert(alias.to_string(), host);
    }

    fn hosts_snapshot(&self) -> Vec<Arc<VirtualHost>> {
        let mut seen: Vec<Arc<VirtualHost>> = Vec::new();
        for host in lock_read(&self.hosts).values() {
            if !seen.iter().any(|h| Arc::ptr_eq(h, host)) {
                seen.push(Arc::clone(host));
            }
        }
        seen
    }
}

/// An embeddable HTTP/1.1 server.
///
/// ```no_run
/// use ember_web::{Request, Response, Server};
/// use std::io;
///
/// fn hello(_req: &mut Request<'_>, resp: &mut Response<'_>) -> io::Result<u16> {
///     resp.send(200, "hello")?;
///     Ok(0)
/// }
///
/// let server = Server::builder()
///     .port(8080)
///     .context("/hello", &["GET"], hello)
///     .build();
/// server.start().unwrap();
/// ```
pub struct Server {
    state: Arc<ServerState>,
    executor: Arc<dyn Executor>,
    factory: Arc<dyn StreamFactory>,
    bind_fallback: Option<(u16, u16)>,
    closing: Arc<AtomicBool>,
    started: AtomicBool,
}

impl Server {
    /// Creates a builder for configuring a server instance.
    pub fn builder() -> ServerBuilder {
        ServerBuilder {
            port: 80,
            limits: Limits::default(),
            executor: None,
            factory: None,
            bind_fallback: None,
            contexts: Vec::new(),
        }
    }

    /// The configured port, or the actually bound port once started.
    pub fn port(&self) -> u16 {
        self.state.port()
    }

    /// Returns the virtual host with the given name (`None` for the
    /// default host), if it exists.
    pub fn virtual_host(&self, name: Option<&str>) -> Option<Arc<VirtualHost>> {
        self.state.virtual_host(name)
    }

    /// Adds a virtual host, replacing any host with the same name.
    pub fn add_virtual_host(&self, host: VirtualHost) -> Arc<VirtualHost> {
        let host = Arc::new(host);
        self.state.add_virtual_host(Arc::clone(&host));
        host
    }

    /// Binds the listener and starts the acceptor thread. Does nothing if
    /// the server is already running.
    ///
    /// Configuration methods of the server and its hosts must not be used
    /// once it has started.
    pub fn start(&self) -> io::Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let listener = match self.bind() {
            Ok(l) => l,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        self.state.set_port(listener.local_addr()?.port());

        // host aliases may have been added since construction
        for host in self.state.hosts_snapshot() {
            for alias in host.aliases() {
                self.state.register_alias(&alias, Arc::clone(&host));
            }
        }

        self.closing.store(false, Ordering::SeqCst);
        let state = Arc::clone(&self.state);
        let executor = Arc::clone(&self.executor);
        let factory = Arc::clone(&self.factory);
        let closing = Arc::clone(&self.closing);

        thread::Builder::new()
            .name(format!("ember-acceptor-{}", self.state.port()))
            .spawn(move || accept_loop(state, executor, factory, listener, closing))?;

        Ok(())
    }

    fn bind(&self) -> io::Result<TcpListener> {
        let port = self.state.port();
        let err = match TcpListener::bind(("0.0.0.0", port)) {
            Ok(listener) => return Ok(listener),
            Err(e) => e,
        };

        if let Some((lo, hi)) = self.bind_fallback {
            for fallback in lo..=hi {
                if fallback == port {
                    continue;
                }
                if let Ok(listener) = TcpListener::bind(("0.0.0.0", fallback)) {
                    return Ok(listener);
                }
            }
        }

        Err(err)
    }

    /// Stops accepting connections and invokes every handler's close
    /// hook. In-flight transactions run to completion; an injected
    /// executor must be shut down by its owner.
    pub fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        self.closing.store(true, Ordering::SeqCst);

        // unblock the acceptor's pending accept()
        let _ = TcpStream::connect(("127.0.0.1", self.state.port()));

        for host in self.state.hosts_snapshot() {
            for context in host.contexts_snapshot() {
                for handler in context.handlers_snapshot() {
                    handler.on_close();
                }
            }
        }
    }

}

fn accept_loop(
    state: Arc<ServerState>,
    executor: Arc<dyn Executor>,
    factory: Arc<dyn StreamFactory>,
    listener: TcpListener,
    closing: Arc<AtomicBool>,
) {
    debug!("accepting connections on port {}", state.port());

    while !closing.load(Ordering::SeqCst) {
        let (sock, addr) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("accept failed: {}", e);
                break;
            }
        };
        if closing.load(Ordering::SeqCst) {
            break;
        }

        debug!("connection from {}", addr);
        let configured = sock
            .set_read_timeout(Some(state.limits.read_timeout))
            .and_then(|_| sock.set_nodelay(true));
        if let Err(e) = configured {
            debug!("failed to configure socket: {}", e);
            continue;
        }

        match factory.open(sock) {
            Ok((reader, writer)) => {
                let state = Arc::clone(&state);
                executor.execute(Box::new(move || serve_connection(&state, reader, writer)));
            }
            Err(e) => debug!("stream setup failed: {}", e),
        }
    }

    debug!("terminating accept thread");
}

/// Builder for configuring and creating [`Server`] instances.
pub struct ServerBuilder {
    port: u16,
    limits: Limits,
    executor: Option<Arc<dyn Executor>>,
    factory: Option<Arc<dyn StreamFactory>>,
    bind_fallback: Option<(u16, u16)>,
    contexts: Vec<(String, Vec<String>, Arc<dyn Handler>)>,
}

impl ServerBuilder {
    /// The port to accept connections on. Port `0` binds an ephemeral
    /// port, readable through [`Server::port`] after `start`.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// The executor servicing connections. The caller is responsible for
    /// shutting an injected executor down.
    pub fn executor<E: Executor + 'static>(mut self, executor: E) -> Self {
        self.executor = Some(Arc::new(executor));
        self
    }

    /// The factory producing connection streams; inject a TLS factory to
    /// serve HTTPS.
    pub fn stream_factory<F: StreamFactory + 'static>(mut self, factory: F) -> Self {
        self.factory = Some(Arc::new(factory));
        self
    }

    /// A range of ports to try in order when the configured port cannot
    /// be bound.
    pub fn bind_fallback(mut self, lo: u16, hi: u16) -> Self {
        self.bind_fallback = Some((lo, hi));
        self
    }

    /// Registers a context on the default virtual host.
    pub fn context<H: Handler + 'static>(
        mut self,
        path: &str,
        methods: &[&str],
        handler: H,
    ) -> Self {
        self.contexts.push((
            path.to_string(),
            methods.iter().map(|m| m.to_string()).collect(),
            Arc::new(handler),
        ));
        self
    }

    pub fn build(self) -> Server {
        let factory = self
            .factory
            .unwrap_or_else(|| Arc::new(PlainFactory) as Arc<dyn StreamFactory>);
        let executor = self
            .executor
            .unwrap_or_else(|| Arc::new(CachedPool::new(Duration::from_secs(60))));

        let state = Arc::new(ServerState::new(self.limits, factory.secure(), self.port));

        if let Some(host) = state.virtual_host(None) {
            for (path, methods, handler) in self.contexts {
                let methods: Vec<&str> = methods.iter().map(String::as_str).collect();
                host.add_context(&path, &methods, ArcHandler(handler));
            }
        }

        Server {
            state,
            executor,
            factory,
            bind_fallback: self.bind_fallback,
            closing: Arc::new(AtomicBool::new(false)),
            started: AtomicBool::new(false),
        }
    }
}

/// Adapter so a pre-boxed handler can be registered through the
/// `impl Handler` surface.
struct ArcHandler(Arc<dyn Handler>);

impl Handler for ArcHandler {
    fn serve(&self, req: &mut Request<'_>, resp: &mut Response<'_>) -> io::Result<u16> {
        self.0.serve(req, resp)
    }

    fn on_close(&self) {
        self.0.on_close();
    }
}

fn lock_read<'a, T>(lock: &'a RwLock<T>) -> std::sync::RwLockReadGuard<'a, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn lock_write<'a, T>(lock: &'a RwLock<T>) -> std::sync::RwLockWriteGuard<'a, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
pub(crate) fn test_state() -> Arc<ServerState> {
    Arc::new(ServerState::new(Limits::default(), false, 80))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_handler(_req: &mut Request<'_>, resp: &mut Response<'_>) -> io::Result<u16> {
        resp.send(200, "ok")?;
        Ok(0)
    }

    #[test]
    fn context_lookup_walks_ancestors() {
        let host = VirtualHost::new(None);
        host.add_context("/", &["GET"], ok_handler);
        host.add_context("/api", &["GET"], ok_handler);
        host.add_context("/api/users/", &["GET"], ok_handler);

        #[rustfmt::skip]
        let cases = [
            ("/api/users",          Some("/api/users")),
            ("/api/users/",         Some("/api/users")),
            ("/api/users/42",       Some("/api/users")),
            ("/api",                Some("/api")),
            ("/api/other",          Some("/api")),
            ("/apiX",               Some("")),       // not a path-segment prefix
            ("/",                   Some("")),
            ("/elsewhere/deep",     Some("")),
        ];

        for (path, expected) in cases {
            let ctx = host.get_context(path);
            assert_eq!(ctx.path(), expected, "lookup of {}", path);
        }
    }

    #[test]
    fn unmatched_path_yields_empty_context() {
        let host = VirtualHost::new(None);
        host.add_context("/known", &["GET"], ok_handler);

        let ctx = host.get_context("/unknown");
        assert_eq!(ctx.path(), None);
        assert!(ctx.methods().is_empty());
    }

    #[test]
    fn method_registration() {
        let host = VirtualHost::new(None);
        host.add_context("/a", &["GET", "PUT"], ok_handler);
        host.add_context("/b", &["PUT", "PATCH"], ok_handler);
        host.add_context("/c", &[], ok_handler); // defaults to GET

        assert_eq!(host.methods(), ["GET", "PUT", "PATCH"]);
        assert_eq!(host.get_context("/a").methods(), ["GET", "PUT"]);
        assert_eq!(host.get_context("/c").methods(), ["GET"]);
    }

    #[test]
    #[should_panic(expected = "invalid path")]
    fn rejects_relative_context_path() {
        VirtualHost::new(None).add_context("relative", &["GET"], ok_handler);
    }

    #[test]
    fn options_star_context_exists() {
        let host = VirtualHost::new(None);
        let ctx = host.get_context("*");
        assert_eq!(ctx.path(), None);
    }

    #[test]
    fn state_host_resolution_with_aliases() {
        let state = test_state();

        let named = Arc::new(VirtualHost::new(Some("example.com")));
        named.add_alias("www.example.com");
        state.add_virtual_host(Arc::clone(&named));
        state.register_alias("www.example.com", Arc::clone(&named));

        assert!(state.virtual_host(None).is_some());
        let by_name = state.virtual_host(Some("example.com")).unwrap();
        let by_alias = state.virtual_host(Some("www.example.com")).unwrap();
        assert!(Arc::ptr_eq(&by_name, &by_alias));
        assert!(state.virtual_host(Some("unknown.example")).is_none());
    }

    #[test]
    fn cached_pool_runs_tasks() {
        let pool = CachedPool::new(Duration::from_millis(100));
        let (tx, rx) = channel::unbounded();

        for i in 0..8 {
            let tx = tx.clone();
            pool.execute(Box::new(move || {
                let _ = tx.send(i);
            }));
        }

        let mut seen: Vec<i32> = (0..8)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn close_hooks_run_on_stop() {
        use std::sync::atomic::AtomicUsize;

        struct Closing(Arc<AtomicUsize>);
        impl Handler for Closing {
            fn serve(&self, _: &mut Request<'_>, _: &mut Response<'_>) -> io::Result<u16> {
                Ok(0)
            }
            fn on_close(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let closed = Arc::new(AtomicUsize::new(0));
        let server = Server::builder()
            .port(0)
            .context("/x", &["GET"], Closing(Arc::clone(&closed)))
            .build();

        server.start().unwrap();
        server.stop();
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }
}
