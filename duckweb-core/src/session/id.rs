//! Connection identifiers.
//!
//! Hosts hold a `ConnectionId` as an opaque integer handle; it maps back to a
//! registered [`Connection`](super::Connection) until the connection is removed.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque identifier for a registered connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Create an ID from a raw value handed back by a host
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the underlying u64 ID
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ConnectionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Connection ID generator; IDs are never reused within a process.
#[derive(Debug)]
pub struct ConnectionIdGenerator {
    next_id: AtomicU64,
}

impl ConnectionIdGenerator {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        ConnectionId::new(id)
    }
}

impl Default for ConnectionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
