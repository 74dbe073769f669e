// src/server.rs
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::conn::{Connection, Inbound, ReadOutcome};
use crate::error::{ServerError, ServerResult};
use crate::http::Response;
use crate::metrics::Metrics;
use crate::parser::{self, ParseError};
use crate::pool::ConnectionPool;
use crate::processor::RequestProcessor;
use crate::router::Router;
use crate::syscalls::{self, Epoll, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP};
use crate::worker::WorkerPool;

const LISTENER_TOKEN: u64 = u64::MAX;
const EPOLL_WAIT_MS: i32 = 1000;
const START_TIMEOUT: Duration = Duration::from_secs(2);

/// Uniform control surface over the server variants.
pub trait Server {
    /// Spawn the serving thread and wait until it is accepting (or failed).
    fn start(&self) -> ServerResult<()>;
    /// Request shutdown and join the serving thread. Idempotent.
    fn stop(&self);
    /// Start, block until shutdown is requested, then stop.
    fn run(&self) -> ServerResult<()>;
    /// The bound address; the configured one until the listener is up.
    fn address(&self) -> String;
    fn is_running(&self) -> bool;
}

// ---- Multiplexing server ----

struct Inner {
    config: Config,
    metrics: Arc<Metrics>,
    processor: Arc<RequestProcessor>,
    router: Arc<Router>,
    shutdown: AtomicBool,
    running: AtomicBool,
    failed: AtomicBool,
    bound: Mutex<Option<SocketAddr>>,
    conns: Mutex<HashMap<i32, Arc<Connection>>>,
    pool: ConnectionPool,
}

/// Readiness-driven server: one event-loop thread multiplexing every
/// connection over epoll, handler work running on a fixed worker pool.
pub struct MultiplexServer {
    inner: Arc<Inner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl MultiplexServer {
    pub fn new(
        config: Config,
        metrics: Arc<Metrics>,
        processor: Arc<RequestProcessor>,
        router: Arc<Router>,
    ) -> Self {
        let pool = ConnectionPool::new(config.pool_capacity);
        Self {
            inner: Arc::new(Inner {
                config,
                metrics,
                processor,
                router,
                shutdown: AtomicBool::new(false),
                running: AtomicBool::new(false),
                failed: AtomicBool::new(false),
                bound: Mutex::new(None),
                conns: Mutex::new(HashMap::new()),
                pool,
            }),
            handle: Mutex::new(None),
        }
    }

    /// Flip the shutdown flag; the event loop notices within one wait tick.
    /// Safe to call from a signal-handler thread.
    pub fn request_shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
    }
}

impl Server for MultiplexServer {
    fn start(&self) -> ServerResult<()> {
        let mut handle = self.handle.lock().unwrap();
        if handle.is_some() {
            warn!("server already running on {}", self.address());
            return Ok(());
        }

        let inner = Arc::clone(&self.inner);
        let thread = thread::Builder::new()
            .name("tallyd-epoll".to_string())
            .spawn(move || event_loop(inner))
            .map_err(|e| ServerError::Other(format!("failed to spawn event loop: {}", e)))?;
        *handle = Some(thread);
        drop(handle);

        let started = Instant::now();
        while started.elapsed() < START_TIMEOUT {
            if self.inner.running.load(Ordering::Acquire) {
                info!("server started on {}", self.address());
                return Ok(());
            }
            if self.inner.failed.load(Ordering::Acquire) {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        self.stop();
        Err(ServerError::Other(format!(
            "server failed to start on {}",
            self.inner.config.address()
        )))
    }

    fn stop(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn run(&self) -> ServerResult<()> {
        self.start()?;
        info!("multiplexing server running; send SIGINT or SIGTERM to stop");
        while !self.inner.shutdown.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(200));
        }
        self.stop();
        Ok(())
    }

    fn address(&self) -> String {
        match *self.inner.bound.lock().unwrap() {
            Some(addr) => addr.to_string(),
            None => self.inner.config.address(),
        }
    }

    fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }
}

impl Drop for MultiplexServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn event_loop(inner: Arc<Inner>) {
    let cfg = inner.config.clone();

    let listen_fd = match syscalls::create_listen_socket(&cfg.host, cfg.port, cfg.accept_backlog) {
        Ok(fd) => fd,
        Err(e) => {
            error!("failed to bind {}: {}", cfg.address(), e);
            inner.failed.store(true, Ordering::Release);
            return;
        }
    };
    let bound_str = match syscalls::local_addr(listen_fd) {
        Ok(addr) => {
            *inner.bound.lock().unwrap() = Some(addr);
            addr.to_string()
        }
        Err(_) => cfg.address(),
    };

    let epoll = match Epoll::new() {
        Ok(ep) => Arc::new(ep),
        Err(e) => {
            error!("failed to create epoll instance: {}", e);
            syscalls::close_fd(listen_fd);
            inner.failed.store(true, Ordering::Release);
            return;
        }
    };
    if let Err(e) = epoll.add(listen_fd, LISTENER_TOKEN, EPOLLIN) {
        error!("failed to register listener: {}", e);
        syscalls::close_fd(listen_fd);
        inner.failed.store(true, Ordering::Release);
        return;
    }

    let workers = WorkerPool::new(cfg.resolved_workers());
    let mut events = vec![syscalls::epoll_event { events: 0, u64: 0 }; cfg.epoll_max_events];
    let mut scratch = vec![0u8; 16 * 1024];
    let mut last_reap = Instant::now();
    let reap_interval = Duration::from_secs(cfg.reap_interval_secs);
    let idle_timeout = Duration::from_secs(cfg.idle_timeout_secs);

    inner.running.store(true, Ordering::Release);
    info!(
        "event loop up on {} ({} workers, {} max connections)",
        bound_str,
        cfg.resolved_workers(),
        cfg.max_connections
    );

    while !inner.shutdown.load(Ordering::Acquire) {
        let n = match epoll.wait(&mut events, EPOLL_WAIT_MS) {
            Ok(n) => n,
            Err(e) => {
                error!("epoll wait failed: {}", e);
                break;
            }
        };

        for i in 0..n {
            let token = events[i].u64;
            let evmask = events[i].events;

            if token == LISTENER_TOKEN {
                accept_pending(&inner, listen_fd, &epoll);
                continue;
            }

            let fd = token as i32;
            let conn = inner.conns.lock().unwrap().get(&fd).cloned();
            let Some(conn) = conn else {
                // Stale event for an fd we already dropped
                let _ = epoll.delete(fd);
                continue;
            };

            if !conn.is_active() {
                close_connection(&inner, &epoll, fd);
                continue;
            }
            if evmask & (EPOLLHUP | EPOLLERR) != 0 {
                debug!("hangup/error event for {}", conn.peer_addr());
                close_connection(&inner, &epoll, fd);
                continue;
            }

            let mut close_now = false;

            // EPOLLRDHUP still goes through the read path: pipelined bytes
            // ahead of the FIN are drained and EOF then closes it.
            if evmask & (EPOLLIN | EPOLLRDHUP) != 0 {
                match conn.on_readable(&mut scratch, &inner.metrics, cfg.max_read_buffer_bytes) {
                    ReadOutcome::Progress => {
                        if conn.extract_requests() && conn.claim_dispatch() {
                            let inner = Arc::clone(&inner);
                            let conn = Arc::clone(&conn);
                            let epoll = Arc::clone(&epoll);
                            workers.execute(move || drain_connection(&inner, &conn, &epoll));
                        }
                    }
                    ReadOutcome::Closed => close_now = true,
                    ReadOutcome::WouldBlock => {}
                }
            }

            if !close_now && evmask & EPOLLOUT != 0 {
                if !conn.on_writable(&epoll, &inner.metrics, cfg.toggle_write_interest) {
                    close_now = true;
                }
            }

            if close_now || !conn.is_active() {
                close_connection(&inner, &epoll, fd);
            }
        }

        if last_reap.elapsed() >= reap_interval {
            reap_connections(&inner, &epoll, idle_timeout);
            last_reap = Instant::now();
        }
    }

    // Cleanup: connections first, then listener, then the worker pool.
    // Responses produced by workers after this point are discarded by the
    // inactive-connection no-op.
    let fds: Vec<i32> = inner.conns.lock().unwrap().keys().copied().collect();
    for fd in fds {
        close_connection(&inner, &epoll, fd);
    }
    let _ = epoll.delete(listen_fd);
    syscalls::close_fd(listen_fd);
    drop(workers);

    inner.running.store(false, Ordering::Release);
    let stats = inner.processor.stats();
    info!(
        "server stopped ({} processed, {} successful, {} failed)",
        stats.processed, stats.successful, stats.failed
    );
}

fn accept_pending(inner: &Arc<Inner>, listen_fd: i32, epoll: &Arc<Epoll>) {
    loop {
        match syscalls::accept_connection(listen_fd) {
            Ok(Some((fd, peer))) => {
                let at_capacity = inner.conns.lock().unwrap().len() >= inner.config.max_connections;
                if at_capacity {
                    warn!("connection limit reached, refusing {}", peer);
                    syscalls::close_fd(fd);
                    continue;
                }

                let conn = inner.pool.acquire(fd, peer);
                let mut interests = EPOLLIN | EPOLLRDHUP;
                if !inner.config.toggle_write_interest {
                    interests |= EPOLLOUT;
                    conn.set_want_write(true);
                }
                if let Err(e) = epoll.add(fd, fd as u64, interests) {
                    warn!("failed to register fd {}: {}", fd, e);
                    syscalls::close_fd(fd);
                    continue;
                }

                debug!("accepted connection from {}", conn.peer_addr());
                inner.conns.lock().unwrap().insert(fd, conn);
                inner.metrics.inc_connections();
            }
            Ok(None) => break,
            Err(e) => {
                warn!("accept failed: {}", e);
                break;
            }
        }
    }
}

fn close_connection(inner: &Arc<Inner>, epoll: &Epoll, fd: i32) {
    let conn = inner.conns.lock().unwrap().remove(&fd);
    if let Some(conn) = conn {
        let _ = epoll.delete(fd);
        conn.close(&inner.metrics);
        inner.pool.release(conn);
    }
}

/// Periodic sweep: reap idle peers and probe for half-closed sockets so
/// CLOSE_WAIT connections cannot accumulate.
fn reap_connections(inner: &Arc<Inner>, epoll: &Epoll, idle_timeout: Duration) {
    let snapshot: Vec<(i32, Arc<Connection>)> = inner
        .conns
        .lock()
        .unwrap()
        .iter()
        .map(|(fd, conn)| (*fd, Arc::clone(conn)))
        .collect();

    for (fd, conn) in snapshot {
        let mut dead = !conn.is_active();
        if !dead && conn.idle_for() > idle_timeout {
            debug!("reaping idle connection from {}", conn.peer_addr());
            dead = true;
        }
        if !dead {
            match syscalls::peek_liveness(fd) {
                Ok(Some(0)) => {
                    debug!("peer {} is half-closed (CLOSE_WAIT)", conn.peer_addr());
                    dead = true;
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe
                    ) =>
                {
                    dead = true;
                }
                _ => {}
            }
        }
        if dead {
            close_connection(inner, epoll, fd);
        }
    }
}

/// Worker-side drain: process this connection's queued requests in arrival
/// order. At most one drain runs per connection at a time, so pipelined
/// responses are appended in request order.
fn drain_connection(inner: &Inner, conn: &Arc<Connection>, epoll: &Epoll) {
    loop {
        match conn.next_inbound() {
            Some(Inbound::Request(req)) => {
                let response = inner.router.dispatch(&req);
                conn.enqueue_response(
                    &response.to_bytes(),
                    epoll,
                    &inner.metrics,
                    inner.config.max_write_buffer_bytes,
                    inner.config.toggle_write_interest,
                );
            }
            Some(Inbound::Malformed) => {
                inner.metrics.inc_requests();
                inner.metrics.inc_fail();
                let response =
                    Response::bad_request(RequestProcessor::error_body("Invalid HTTP request"));
                conn.enqueue_response(
                    &response.to_bytes(),
                    epoll,
                    &inner.metrics,
                    inner.config.max_write_buffer_bytes,
                    inner.config.toggle_write_interest,
                );
            }
            None => {
                conn.release_dispatch();
                // A read event may have queued work between the final pop and
                // the release; reclaim and keep draining if so.
                if conn.has_pending() && conn.claim_dispatch() {
                    continue;
                }
                break;
            }
        }
    }
}

// ---- Blocking server ----

struct BlockingInner {
    config: Config,
    metrics: Arc<Metrics>,
    router: Arc<Router>,
    shutdown: AtomicBool,
    running: AtomicBool,
    failed: AtomicBool,
    bound: Mutex<Option<SocketAddr>>,
}

/// Thread-per-connection variant with the same wire contract. Requests on a
/// connection are handled serially, so ordering is trivial; throughput is
/// bounded by thread count. Kept for small deployments and comparison runs.
pub struct BlockingServer {
    inner: Arc<BlockingInner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BlockingServer {
    pub fn new(config: Config, metrics: Arc<Metrics>, router: Arc<Router>) -> Self {
        Self {
            inner: Arc::new(BlockingInner {
                config,
                metrics,
                router,
                shutdown: AtomicBool::new(false),
                running: AtomicBool::new(false),
                failed: AtomicBool::new(false),
                bound: Mutex::new(None),
            }),
            handle: Mutex::new(None),
        }
    }

    pub fn request_shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
    }
}

impl Server for BlockingServer {
    fn start(&self) -> ServerResult<()> {
        let mut handle = self.handle.lock().unwrap();
        if handle.is_some() {
            return Ok(());
        }

        let inner = Arc::clone(&self.inner);
        let thread = thread::Builder::new()
            .name("tallyd-accept".to_string())
            .spawn(move || blocking_accept_loop(inner))
            .map_err(|e| ServerError::Other(format!("failed to spawn accept loop: {}", e)))?;
        *handle = Some(thread);
        drop(handle);

        let started = Instant::now();
        while started.elapsed() < START_TIMEOUT {
            if self.inner.running.load(Ordering::Acquire) {
                info!("blocking server started on {}", self.address());
                return Ok(());
            }
            if self.inner.failed.load(Ordering::Acquire) {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        self.stop();
        Err(ServerError::Other(format!(
            "server failed to start on {}",
            self.inner.config.address()
        )))
    }

    fn stop(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn run(&self) -> ServerResult<()> {
        self.start()?;
        info!("blocking server running; send SIGINT or SIGTERM to stop");
        while !self.inner.shutdown.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(200));
        }
        self.stop();
        Ok(())
    }

    fn address(&self) -> String {
        match *self.inner.bound.lock().unwrap() {
            Some(addr) => addr.to_string(),
            None => self.inner.config.address(),
        }
    }

    fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }
}

impl Drop for BlockingServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn blocking_accept_loop(inner: Arc<BlockingInner>) {
    let listener = match std::net::TcpListener::bind(inner.config.address()) {
        Ok(l) => l,
        Err(e) => {
            error!("failed to bind {}: {}", inner.config.address(), e);
            inner.failed.store(true, Ordering::Release);
            return;
        }
    };
    if listener.set_nonblocking(true).is_err() {
        inner.failed.store(true, Ordering::Release);
        return;
    }
    if let Ok(addr) = listener.local_addr() {
        *inner.bound.lock().unwrap() = Some(addr);
    }

    inner.running.store(true, Ordering::Release);
    info!("blocking accept loop up on one thread per connection");

    while !inner.shutdown.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                inner.metrics.inc_connections();
                let inner = Arc::clone(&inner);
                let _ = thread::Builder::new()
                    .name("tallyd-conn".to_string())
                    .spawn(move || blocking_handle_client(inner, stream, peer.to_string()));
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                warn!("accept failed: {}", e);
                thread::sleep(Duration::from_millis(50));
            }
        }
    }

    inner.running.store(false, Ordering::Release);
    info!("blocking server stopped");
}

fn blocking_handle_client(
    inner: Arc<BlockingInner>,
    mut stream: std::net::TcpStream,
    peer: String,
) {
    let started = Instant::now();
    let _ = stream.set_read_timeout(Some(Duration::from_millis(250)));
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut last_activity = Instant::now();
    let idle_timeout = Duration::from_secs(inner.config.idle_timeout_secs);

    'conn: while !inner.shutdown.load(Ordering::Acquire) {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                if buf.len() + n > inner.config.max_read_buffer_bytes {
                    warn!("read buffer cap exceeded, closing {}", peer);
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                last_activity = Instant::now();

                let mut consumed = 0;
                loop {
                    match parser::parse_request(&buf[consumed..]) {
                        Ok((req, used)) => {
                            consumed += used;
                            let response = inner.router.dispatch(&req);
                            if stream.write_all(&response.to_bytes()).is_err() {
                                break 'conn;
                            }
                        }
                        Err(ParseError::Incomplete) => break,
                        Err(e) => {
                            debug!("parse error from {}: {}", peer, e);
                            inner.metrics.inc_requests();
                            inner.metrics.inc_fail();
                            let response = Response::bad_request(RequestProcessor::error_body(
                                "Invalid HTTP request",
                            ));
                            if stream.write_all(&response.to_bytes()).is_err() {
                                break 'conn;
                            }
                            buf.clear();
                            consumed = 0;
                            break;
                        }
                    }
                }
                if consumed > 0 {
                    buf.drain(..consumed);
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                if last_activity.elapsed() > idle_timeout {
                    debug!("reaping idle blocking connection from {}", peer);
                    break;
                }
            }
            Err(e) => {
                debug!("read error from {}: {}", peer, e);
                break;
            }
        }
    }

    let _ = stream.shutdown(std::net::Shutdown::Both);
    inner.metrics.dec_connections();
    inner.metrics.observe_connection_duration(started.elapsed());
}
