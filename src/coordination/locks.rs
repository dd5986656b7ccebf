//! Per-repository mutation locks with single-flight coalescing.
//!
//! Every [`RepositoryIdentity`] gets one [`LockEntry`] the first time it is
//! seen.  A mutation (clone or fetch) runs as its own Tokio task while holding
//! the entry's mutex; callers that arrive while it is in flight join it and
//! receive a clone of the same outcome instead of starting another one.
//!
//! Running the mutation in a task detaches it from whichever request happened
//! to start it: if that client disconnects, the clients coalesced onto the
//! same flight still get their result.  Mutations are bounded by the sync
//! timeout, so a detached one cannot run forever.
//!
//! # Memory
//!
//! Entries are never removed.  The table grows with the number of distinct
//! repositories requested over the life of the process, each entry being a
//! mutex and an empty slot.  This is accepted; removing entries would require
//! coordinating with callers that hold an `Arc` to one.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt as _;
use prometheus_client::metrics::counter::Counter;
use thiserror::Error;
use tracing::debug;

use crate::identity::RepositoryIdentity;

type Flight<T> = Shared<BoxFuture<'static, Result<T, Aborted>>>;

/// The mutation task ended without producing a value (it panicked or the
/// runtime is shutting down).
#[derive(Debug, Clone, Error)]
#[error("mirror operation for {identity} was aborted: {reason}")]
pub struct Aborted {
    pub identity: String,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// LockEntry
// ---------------------------------------------------------------------------

/// Coordination state for one repository.
struct LockEntry<T> {
    /// Held for the whole duration of a mutation.
    mutation: tokio::sync::Mutex<()>,
    /// The mutation currently running, if any.
    in_flight: Mutex<Option<Flight<T>>>,
}

impl<T> Default for LockEntry<T> {
    fn default() -> Self {
        Self {
            mutation: tokio::sync::Mutex::new(()),
            in_flight: Mutex::new(None),
        }
    }
}

/// Clears the entry's in-flight slot when the mutation task finishes,
/// including by panic.
struct ClearOnDrop<T>(Arc<LockEntry<T>>);

impl<T> Drop for ClearOnDrop<T> {
    fn drop(&mut self) {
        self.0
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

// ---------------------------------------------------------------------------
// LockTable
// ---------------------------------------------------------------------------

/// Process-wide map from repository identity to its [`LockEntry`].
pub struct LockTable<T> {
    entries: Mutex<HashMap<RepositoryIdentity, Arc<LockEntry<T>>>>,
    coalesced: Counter,
}

impl<T> LockTable<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// `coalesced` is incremented each time a caller joins an in-flight
    /// mutation instead of starting one.
    pub fn new(coalesced: Counter) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            coalesced,
        }
    }

    /// Run `op` with exclusive mutation rights for `identity`.
    ///
    /// If a mutation for `identity` is already running, `op` is not called;
    /// the caller waits for the running one and gets its result.
    pub async fn with_lock<F, Fut>(&self, identity: &RepositoryIdentity, op: F) -> Result<T, Aborted>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let entry = self.entry(identity);

        let flight = {
            let mut slot = entry
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match slot.clone() {
                Some(flight) => {
                    self.coalesced.inc();
                    debug!(%identity, "joining in-flight mirror operation");
                    flight
                }
                None => {
                    let flight = launch(Arc::clone(&entry), identity.clone(), op());
                    *slot = Some(flight.clone());
                    flight
                }
            }
        };

        flight.await
    }

    /// Number of repositories that have a lock entry.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether a mutation for `identity` is currently running.
    #[cfg(test)]
    pub fn is_in_flight(&self, identity: &RepositoryIdentity) -> bool {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(identity).is_some_and(|entry| {
            entry
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_some()
        })
    }

    /// Fetch or lazily create the entry for `identity`.  Creation happens under
    /// the table mutex, so concurrent first requests share one entry.
    fn entry(&self, identity: &RepositoryIdentity) -> Arc<LockEntry<T>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(entries.entry(identity.clone()).or_default())
    }
}

/// Spawn the mutation and wrap its join handle so every waiter can share it.
fn launch<T, Fut>(entry: Arc<LockEntry<T>>, identity: RepositoryIdentity, op: Fut) -> Flight<T>
where
    T: Clone + Send + Sync + 'static,
    Fut: Future<Output = T> + Send + 'static,
{
    let handle = tokio::spawn(async move {
        let _clear = ClearOnDrop(Arc::clone(&entry));
        let _guard = entry.mutation.lock().await;
        op.await
    });

    async move {
        handle.await.map_err(|e| Aborted {
            identity: identity.to_string(),
            reason: e.to_string(),
        })
    }
    .boxed()
    .shared()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
