// src/conn.rs
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::http::Request;
use crate::metrics::Metrics;
use crate::parser::{self, ParseError};
use crate::syscalls::{self, Epoll, EPOLLIN, EPOLLOUT, EPOLLRDHUP};

/// One unit of work framed off a connection, queued for the worker pool.
pub enum Inbound {
    Request(Request),
    /// The framer hit unparseable bytes; the drained buffer was discarded
    /// and the peer gets a 400.
    Malformed,
}

/// What a read-readiness event produced.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes were appended to the read buffer.
    Progress,
    /// Peer EOF, fatal I/O error, or buffer cap breach.
    Closed,
    /// Spurious wakeup; nothing to do.
    WouldBlock,
}

/// Per-connection state.
///
/// Owned by the event loop through the fd map; workers hold extra `Arc`
/// references only long enough to append responses. The write buffer lock
/// also guards the fd close, so a worker's append-and-send can never race
/// the event loop tearing the socket down.
pub struct Connection {
    fd: i32,
    peer_addr: String,
    started_at: Instant,
    read_buf: Mutex<Vec<u8>>,
    write_buf: Mutex<Vec<u8>>,
    active: AtomicBool,
    closed: AtomicBool,
    want_write: AtomicBool,
    last_activity: Mutex<Instant>,
    pending: Mutex<VecDeque<Inbound>>,
    dispatching: AtomicBool,
}

impl Connection {
    pub fn new(fd: i32, peer_addr: String) -> Self {
        let now = Instant::now();
        Self {
            fd,
            peer_addr,
            started_at: now,
            read_buf: Mutex::new(Vec::new()),
            write_buf: Mutex::new(Vec::new()),
            active: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            want_write: AtomicBool::new(false),
            last_activity: Mutex::new(now),
            pending: Mutex::new(VecDeque::new()),
            dispatching: AtomicBool::new(false),
        }
    }

    /// Re-arm a pooled connection for a new socket. Buffers are cleared but
    /// keep their capacity.
    pub fn reset(&mut self, fd: i32, peer_addr: String) {
        let now = Instant::now();
        self.fd = fd;
        self.peer_addr = peer_addr;
        self.started_at = now;
        self.read_buf.get_mut().unwrap().clear();
        self.write_buf.get_mut().unwrap().clear();
        *self.active.get_mut() = true;
        *self.closed.get_mut() = false;
        *self.want_write.get_mut() = false;
        *self.last_activity.get_mut().unwrap() = now;
        self.pending.get_mut().unwrap().clear();
        *self.dispatching.get_mut() = false;
    }

    pub fn fd(&self) -> i32 {
        self.fd
    }

    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn set_want_write(&self, v: bool) {
        self.want_write.store(v, Ordering::Release);
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    fn interests(&self, writable: bool) -> u32 {
        if writable {
            EPOLLIN | EPOLLOUT | EPOLLRDHUP
        } else {
            EPOLLIN | EPOLLRDHUP
        }
    }

    // ---- Read path (event loop only) ----

    /// Handle one read-readiness event: a single non-blocking recv into the
    /// caller's scratch buffer, appended under the read-buffer cap.
    pub fn on_readable(
        &self,
        scratch: &mut [u8],
        metrics: &Metrics,
        max_read_bytes: usize,
    ) -> ReadOutcome {
        match syscalls::recv_nonblocking(self.fd, scratch) {
            Ok(Some(0)) => {
                debug!("peer closed: {}", self.peer_addr);
                ReadOutcome::Closed
            }
            Ok(Some(n)) => {
                let mut buf = self.read_buf.lock().unwrap();
                if buf.len() + n > max_read_bytes {
                    warn!(
                        "read buffer cap exceeded ({} + {} > {}), closing {}",
                        buf.len(),
                        n,
                        max_read_bytes,
                        self.peer_addr
                    );
                    return ReadOutcome::Closed;
                }
                buf.extend_from_slice(&scratch[..n]);
                metrics.observe_read_buf(buf.len());
                drop(buf);
                self.touch();
                ReadOutcome::Progress
            }
            Ok(None) => ReadOutcome::WouldBlock,
            Err(e) => {
                match e.kind() {
                    std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe => {
                        debug!("recv reset from {}: {}", self.peer_addr, e);
                    }
                    _ => warn!("recv error from {}: {}", self.peer_addr, e),
                }
                ReadOutcome::Closed
            }
        }
    }

    /// Run the framing loop over the read buffer: every complete request is
    /// moved onto the pending queue in arrival order; the consumed prefix is
    /// erased. On a parse error a `Malformed` marker is queued and the
    /// remaining (unframeable) bytes are discarded so the connection can
    /// resynchronize on the next request.
    ///
    /// Returns true when new work was queued and a drain should be scheduled.
    pub fn extract_requests(&self) -> bool {
        let mut buf = self.read_buf.lock().unwrap();
        let mut pending = self.pending.lock().unwrap();
        let mut consumed = 0;
        let mut queued = false;

        loop {
            match parser::parse_request(&buf[consumed..]) {
                Ok((req, n)) => {
                    consumed += n;
                    pending.push_back(Inbound::Request(req));
                    queued = true;
                }
                Err(ParseError::Incomplete) => break,
                Err(e) => {
                    debug!("parse error from {}: {}", self.peer_addr, e);
                    pending.push_back(Inbound::Malformed);
                    queued = true;
                    buf.clear();
                    consumed = 0;
                    break;
                }
            }
        }

        if consumed > 0 {
            buf.drain(..consumed);
        }
        queued
    }

    /// Pop the next queued inbound item for the drain task.
    pub fn next_inbound(&self) -> Option<Inbound> {
        self.pending.lock().unwrap().pop_front()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.lock().unwrap().is_empty()
    }

    /// Claim the dispatch slot. Only the claimant may run a drain task;
    /// at most one is in flight per connection so pipelined responses keep
    /// request order.
    pub fn claim_dispatch(&self) -> bool {
        !self.dispatching.swap(true, Ordering::AcqRel)
    }

    pub fn release_dispatch(&self) {
        self.dispatching.store(false, Ordering::Release);
    }

    // ---- Write path ----

    /// Append a response and try to push it out inline. Called from worker
    /// threads; a no-op once the connection is inactive. A cap breach marks
    /// the connection inactive and nudges the event loop to reap it.
    pub fn enqueue_response(
        &self,
        bytes: &[u8],
        epoll: &Epoll,
        metrics: &Metrics,
        max_write_bytes: usize,
        toggle_write_interest: bool,
    ) {
        let mut buf = self.write_buf.lock().unwrap();
        if !self.active.load(Ordering::Acquire) {
            return;
        }

        if buf.len() + bytes.len() > max_write_bytes {
            warn!(
                "write buffer cap exceeded ({} + {} > {}), closing {}",
                buf.len(),
                bytes.len(),
                max_write_bytes,
                self.peer_addr
            );
            self.active.store(false, Ordering::Release);
            // Wake the event loop so the fd is reaped promptly.
            let _ = epoll.modify(self.fd, self.fd as u64, self.interests(true));
            return;
        }

        buf.extend_from_slice(bytes);
        metrics.observe_write_buf(buf.len());

        // Opportunistic inline send: usually drains the whole response and
        // saves an event-loop round-trip.
        match syscalls::send_nonblocking(self.fd, &buf) {
            Ok(Some(n)) if n > 0 => {
                buf.drain(..n);
                self.touch();
            }
            Ok(_) => {}
            Err(e) => {
                debug!("inline send failed for {}: {}", self.peer_addr, e);
                self.active.store(false, Ordering::Release);
                let _ = epoll.modify(self.fd, self.fd as u64, self.interests(true));
                return;
            }
        }

        if !buf.is_empty() && !self.want_write.swap(true, Ordering::AcqRel) {
            let _ = epoll.modify(self.fd, self.fd as u64, self.interests(true));
        } else if buf.is_empty()
            && toggle_write_interest
            && self.want_write.swap(false, Ordering::AcqRel)
        {
            let _ = epoll.modify(self.fd, self.fd as u64, self.interests(false));
        }
    }

    /// Handle one write-readiness event: send what the kernel accepts and
    /// drop write interest once the buffer drains. Returns false when the
    /// connection must be closed.
    pub fn on_writable(
        &self,
        epoll: &Epoll,
        metrics: &Metrics,
        toggle_write_interest: bool,
    ) -> bool {
        let mut buf = self.write_buf.lock().unwrap();
        if !self.active.load(Ordering::Acquire) {
            return false;
        }
        if buf.is_empty() {
            if toggle_write_interest && self.want_write.swap(false, Ordering::AcqRel) {
                let _ = epoll.modify(self.fd, self.fd as u64, self.interests(false));
            }
            return true;
        }

        match syscalls::send_nonblocking(self.fd, &buf) {
            Ok(Some(n)) => {
                buf.drain(..n);
                metrics.observe_write_buf(buf.len());
                self.touch();
                if buf.is_empty()
                    && toggle_write_interest
                    && self.want_write.swap(false, Ordering::AcqRel)
                {
                    let _ = epoll.modify(self.fd, self.fd as u64, self.interests(false));
                }
                true
            }
            Ok(None) => true,
            Err(e) => {
                match e.kind() {
                    std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe => {
                        debug!("send reset for {}: {}", self.peer_addr, e);
                    }
                    _ => warn!("send error for {}: {}", self.peer_addr, e),
                }
                false
            }
        }
    }

    /// Tear the socket down: both directions shut, fd closed, duration and
    /// connection gauges updated. Idempotent; serialized against worker
    /// appends by the write-buffer lock.
    pub fn close(&self, metrics: &Metrics) {
        let _guard = self.write_buf.lock().unwrap();
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.active.store(false, Ordering::Release);
        syscalls::shutdown_socket(self.fd);
        syscalls::close_fd(self.fd);
        metrics.dec_connections();
        metrics.observe_connection_duration(self.started_at.elapsed());
        debug!("closed connection from {}", self.peer_addr);
    }
}
