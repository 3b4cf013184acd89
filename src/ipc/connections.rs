//! Connection limiting for the IPC server.
//!
//! Each accepted connection holds an owned slot for as long as its task runs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Configuration for the connection pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub max_connections: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_connections: 256,
        }
    }
}

/// Counts live IPC connections against a fixed cap.
#[derive(Debug)]
pub struct ConnectionPool {
    active: Arc<AtomicUsize>,
    config: ConnectionConfig,
}

impl ConnectionPool {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            active: Arc::new(AtomicUsize::new(0)),
            config,
        }
    }

    /// Take a slot that can move into a connection task.
    pub fn try_acquire_owned(&self) -> Option<ConnectionSlot> {
        let mut current = self.active.load(Ordering::Relaxed);
        loop {
            if current >= self.config.max_connections {
                return None;
            }
            match self.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return Some(ConnectionSlot {
                        active: self.active.clone(),
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn max_connections(&self) -> usize {
        self.config.max_connections
    }
}

/// Releases its connection slot on drop.
#[derive(Debug)]
pub struct ConnectionSlot {
    active: Arc<AtomicUsize>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}
