//! Traits the pool uses to manage sessions without knowing the wire protocol.
//!
//! - [`Connector`] opens new sessions.
//! - [`Poolable`] is the synchronous surface the pool needs from a session on release and prune.
//! - [`CloseHandle`] lets the pool force-close a session that is currently borrowed.
//!
//! All async operations integrate with asupersync's structured concurrency via `Cx`.

use crate::error::Error;
use asupersync::{Cx, Outcome};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::Waker;

/// Opens new sessions for a pool.
pub trait Connector: Send + Sync + 'static {
    /// The session type produced.
    type Conn: Poolable;

    /// Open and authenticate a new session.
    fn connect(&self, cx: &Cx) -> impl Future<Output = Outcome<Self::Conn, Error>> + Send;
}

/// A session that can live in a pool.
///
/// Every method is synchronous: the pool calls them under its lock and
/// from `Drop`, where no I/O may be awaited.
pub trait Poolable: Send + 'static {
    /// True once the session has closed or faulted.
    fn is_closed(&self) -> bool;

    /// Probe the transport without blocking. Returns false if the peer
    /// has gone away or unexpected bytes are pending.
    fn check_alive(&mut self) -> bool;

    /// True while the server reports an open transaction.
    fn in_transaction(&self) -> bool;

    /// A handle that aborts this session's pending and future I/O.
    fn close_handle(&self) -> CloseHandle;

    /// Drop the transport immediately without a goodbye message.
    fn close_now(&mut self);
}

#[derive(Debug, Default)]
struct CloseShared {
    aborted: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

/// Shared abort flag between a session and its pool.
///
/// Aborting wakes whatever I/O the session is parked on; the session then
/// observes [`CloseHandle::is_aborted`] and fails with a connection error.
#[derive(Debug, Clone, Default)]
pub struct CloseHandle {
    shared: Arc<CloseShared>,
}

impl CloseHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_aborted(&self) -> bool {
        self.shared.aborted.load(Ordering::Acquire)
    }

    /// Mark the session aborted and wake its pending I/O.
    pub fn abort(&self) {
        self.shared.aborted.store(true, Ordering::Release);
        let waker = self
            .shared
            .waker
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Remember the waker of the task currently polling the session's I/O.
    pub fn register(&self, waker: &Waker) {
        let mut slot = self
            .shared
            .waker
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match slot.as_ref() {
            Some(existing) if existing.will_wake(waker) => {}
            _ => *slot = Some(waker.clone()),
        }
    }

    /// Whether two handles refer to the same session.
    pub fn same_as(&self, other: &CloseHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}
