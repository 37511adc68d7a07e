//! Per-connection serialization
//!
//! Requests and closes for the same connection id run one at a time on a
//! service. Different ids never wait on each other.
//!
//! The lock table only holds ids that currently have a caller inside the
//! service. The guard removes the entry on drop once nobody else holds or
//! waits for it, so a cancelled caller does not leave an entry behind.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Lock table keyed by connection id
#[derive(Debug, Default)]
pub(crate) struct ConnectionLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ConnectionLocks {
    /// Wait for exclusive access to `id`
    pub(crate) async fn lock(&self, id: &str) -> ConnectionGuard<'_> {
        let lock = self.locks.entry(id.to_owned()).or_default().clone();
        let guard = lock.lock_owned().await;
        ConnectionGuard {
            locks: &self.locks,
            id: id.to_owned(),
            guard: Some(guard),
        }
    }

    /// Number of ids with a caller inside
    pub(crate) fn len(&self) -> usize {
        self.locks.len()
    }
}

/// Exclusive access to one connection id
pub(crate) struct ConnectionGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Holders and waiters each keep a clone; one reference is the table's
        self.locks
            .remove_if(&self.id, |_, lock| Arc::strong_count(lock) == 1);
    }
}
