// src/pool.rs
use std::sync::{Arc, Mutex};

use crate::conn::Connection;

/// Bounded LIFO free-list of connection objects.
///
/// High-churn workloads create and destroy connection wrappers constantly;
/// reusing them keeps the allocator out of the accept path. Buffers are
/// cleared on reset but keep their capacity.
pub struct ConnectionPool {
    free: Mutex<Vec<Connection>>,
    capacity: usize,
}

impl ConnectionPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    /// Take a pooled object re-armed for `fd`, or allocate a fresh one.
    pub fn acquire(&self, fd: i32, peer_addr: String) -> Arc<Connection> {
        let pooled = self.free.lock().unwrap().pop();
        match pooled {
            Some(mut conn) => {
                conn.reset(fd, peer_addr);
                Arc::new(conn)
            }
            None => Arc::new(Connection::new(fd, peer_addr)),
        }
    }

    /// Return a closed connection. Objects still referenced by an in-flight
    /// worker are dropped instead of pooled, so a reset can never race a
    /// stale writer. Beyond capacity the object is dropped.
    pub fn release(&self, conn: Arc<Connection>) {
        if let Ok(conn) = Arc::try_unwrap(conn) {
            let mut free = self.free.lock().unwrap();
            if free.len() < self.capacity {
                free.push(conn);
            }
        }
    }

    pub fn idle_count(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}
