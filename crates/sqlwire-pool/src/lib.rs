//! Connection pooling for sqlwire using asupersync.
//!
//! A [`Pool`] owns sessions opened by a [`Connector`]. Every session is in
//! exactly one of three places: the free set, checked out to a caller, or
//! terminated (force-closed and owned by nobody). Sessions still being
//! opened count towards the size, so
//! `size = free + in_use + connecting` never exceeds `maxsize`.
//!
//! All pool state sits behind one mutex. Waiters queue in arrival order and
//! re-check the free set under that lock each time they are woken by a
//! release, a finished connect or a shutdown. A waiter that goes away after
//! being woken hands the wake-up to the next one in line.

use std::collections::VecDeque;
use std::future::poll_fn;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Poll, Waker};
use std::time::{Duration, Instant};

use asupersync::{Cx, Outcome};
use sqlwire_core::{CloseHandle, Connector, Error, PoolError, PoolErrorKind, Poolable};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Connection pool configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Sessions kept open even when idle
    pub minsize: usize,
    /// Upper bound on open sessions; `0` means unbounded
    pub maxsize: usize,
    /// Free sessions idle longer than this are closed instead of reused
    pub recycle: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            minsize: 1,
            maxsize: 10,
            recycle: None,
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with the given maximum size.
    pub fn new(maxsize: usize) -> Self {
        Self {
            maxsize,
            ..Default::default()
        }
    }

    pub fn minsize(mut self, n: usize) -> Self {
        self.minsize = n;
        self
    }

    pub fn maxsize(mut self, n: usize) -> Self {
        self.maxsize = n;
        self
    }

    /// Close free sessions idle for longer than `age`.
    pub fn recycle(mut self, age: Duration) -> Self {
        self.recycle = Some(age);
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.maxsize != 0 && self.maxsize < self.minsize {
            return Err(pool_error(
                PoolErrorKind::Config,
                format!(
                    "maxsize ({}) must be 0 or at least minsize ({})",
                    self.maxsize, self.minsize
                ),
            ));
        }
        Ok(())
    }

    fn has_room(&self, size: usize) -> bool {
        self.maxsize == 0 || size < self.maxsize
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// free + in use + connecting
    pub size: usize,
    pub freesize: usize,
    pub in_use: usize,
    pub connecting: usize,
    /// Tasks parked in `acquire`
    pub waiters: usize,
    /// Sessions opened over the pool's lifetime
    pub total_created: u64,
    /// Sessions closed by the pool (dead, recycled, in a transaction, terminated)
    pub total_closed: u64,
}

fn pool_error(kind: PoolErrorKind, message: impl Into<String>) -> Error {
    Error::Pool(PoolError {
        kind,
        message: message.into(),
        source: None,
    })
}

fn closed_error() -> Error {
    pool_error(PoolErrorKind::Closed, "Pool is closing")
}

struct Idle<C> {
    conn: C,
    since: Instant,
}

struct State<C> {
    free: VecDeque<Idle<C>>,
    /// Checked-out sessions by id, with the handle `terminate` aborts them by.
    in_use: Vec<(u64, CloseHandle)>,
    connecting: usize,
    closing: bool,
    /// Parked `acquire` calls, one slot per waiter id.
    waiters: VecDeque<(u64, Waker)>,
    next_waiter: u64,
    close_waiters: Vec<Waker>,
    next_id: u64,
    total_created: u64,
    total_closed: u64,
}

impl<C: Poolable> State<C> {
    fn size(&self) -> usize {
        self.free.len() + self.in_use.len() + self.connecting
    }

    /// Close free sessions that are dead or past the recycle age.
    fn prune(&mut self, recycle: Option<Duration>) {
        let now = Instant::now();
        let before = self.free.len();
        let mut kept = VecDeque::with_capacity(before);
        while let Some(mut idle) = self.free.pop_front() {
            let expired = recycle.is_some_and(|age| now.duration_since(idle.since) > age);
            if expired || !idle.conn.check_alive() {
                idle.conn.close_now();
                self.total_closed += 1;
            } else {
                kept.push_back(idle);
            }
        }
        self.free = kept;
        let pruned = before - self.free.len();
        if pruned > 0 {
            tracing::debug!(pruned, free = self.free.len(), "pruned free sessions");
        }
    }

    fn check_out(&mut self) -> Option<(u64, C)> {
        let idle = self.free.pop_front()?;
        let id = self.next_id;
        self.next_id += 1;
        self.in_use.push((id, idle.conn.close_handle()));
        Some((id, idle.conn))
    }

    fn wake_one(&mut self) {
        if let Some((_, waker)) = self.waiters.pop_front() {
            waker.wake();
        }
    }

    fn wake_all(&mut self) {
        for (_, waker) in self.waiters.drain(..) {
            waker.wake();
        }
    }

    /// Queue waiter `id`, or refresh its waker if it is already queued.
    fn park(&mut self, id: u64, waker: &Waker) {
        match self.waiters.iter_mut().find(|(i, _)| *i == id) {
            Some((_, parked)) => {
                if !parked.will_wake(waker) {
                    parked.clone_from(waker);
                }
            }
            None => self.waiters.push_back((id, waker.clone())),
        }
    }

    /// Dequeue waiter `id`. False if it was already woken.
    fn unpark(&mut self, id: u64) -> bool {
        match self.waiters.iter().position(|(i, _)| *i == id) {
            Some(pos) => {
                self.waiters.remove(pos);
                true
            }
            None => false,
        }
    }

    fn wake_if_empty(&mut self) {
        if self.closing && self.size() == 0 {
            for waker in self.close_waiters.drain(..) {
                waker.wake();
            }
        }
    }
}

struct Shared<K: Connector> {
    id: u64,
    connector: K,
    config: PoolConfig,
    state: Mutex<State<K::Conn>>,
}

impl<K: Connector> Shared<K> {
    fn lock(&self) -> MutexGuard<'_, State<K::Conn>> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn release(&self, id: u64, mut conn: K::Conn) {
        let mut state = self.lock();
        let Some(pos) = state.in_use.iter().position(|(i, _)| *i == id) else {
            // terminated while checked out; already counted out
            conn.close_now();
            return;
        };
        state.in_use.swap_remove(pos);

        let healthy = !conn.is_closed() && conn.check_alive();
        if state.closing || !healthy || conn.in_transaction() {
            tracing::debug!(
                closing = state.closing,
                healthy,
                in_transaction = conn.in_transaction(),
                "closing released session"
            );
            conn.close_now();
            state.total_closed += 1;
        } else {
            state.free.push_back(Idle {
                conn,
                since: Instant::now(),
            });
        }
        state.wake_one();
        state.wake_if_empty();
    }

    /// Open one session for a slot reserved in `connecting`.
    async fn open_one(&self, cx: &Cx) -> Outcome<(), Error> {
        let mut slot = ConnectingSlot {
            shared: self,
            armed: true,
        };
        let outcome = self.connector.connect(cx).await;
        slot.armed = false;
        let mut state = self.lock();
        state.connecting -= 1;
        let result = match outcome {
            Outcome::Ok(mut conn) => {
                state.total_created += 1;
                if state.closing {
                    conn.close_now();
                    state.total_closed += 1;
                } else {
                    state.free.push_back(Idle {
                        conn,
                        since: Instant::now(),
                    });
                }
                tracing::debug!(size = state.size(), free = state.free.len(), "pool grew");
                Outcome::Ok(())
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        };
        state.wake_one();
        state.wake_if_empty();
        result
    }
}

/// Gives a reserved `connecting` slot back if the connect future is dropped.
struct ConnectingSlot<'a, K: Connector> {
    shared: &'a Shared<K>,
    armed: bool,
}

impl<K: Connector> Drop for ConnectingSlot<'_, K> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.shared.lock();
            state.connecting -= 1;
            state.wake_one();
            state.wake_if_empty();
        }
    }
}

/// A parked `acquire`. Dropped before it resumes, it leaves the queue and
/// passes on any wake-up it was already given.
struct Waiter<'a, K: Connector> {
    shared: &'a Shared<K>,
    id: Option<u64>,
}

impl<K: Connector> Drop for Waiter<'_, K> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            let mut state = self.shared.lock();
            if !state.unpark(id) {
                state.wake_one();
            }
        }
    }
}

/// Connection pool over any [`Connector`].
///
/// Cheap to clone; clones share the same sessions.
pub struct Pool<K: Connector> {
    shared: Arc<Shared<K>>,
}

impl<K: Connector> Clone for Pool<K> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K: Connector> std::fmt::Debug for Pool<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.shared.id)
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<K: Connector> Pool<K> {
    /// Create a pool. No session is opened until the first `acquire`.
    pub fn new(connector: K, config: PoolConfig) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
                connector,
                config,
                state: Mutex::new(State {
                    free: VecDeque::new(),
                    in_use: Vec::new(),
                    connecting: 0,
                    closing: false,
                    waiters: VecDeque::new(),
                    next_waiter: 1,
                    close_waiters: Vec::new(),
                    next_id: 1,
                    total_created: 0,
                    total_closed: 0,
                }),
            }),
        })
    }

    /// Create a pool and open `minsize` sessions up front.
    pub async fn connect(cx: &Cx, connector: K, config: PoolConfig) -> Outcome<Self, Error> {
        let pool = match Self::new(connector, config) {
            Ok(pool) => pool,
            Err(e) => return Outcome::Err(e),
        };
        match pool.fill(cx).await {
            Outcome::Ok(()) => Outcome::Ok(pool),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn connector(&self) -> &K {
        &self.shared.connector
    }

    /// Open sessions until `minsize` is reached, then one more if nothing
    /// is free and there is room.
    async fn fill(&self, cx: &Cx) -> Outcome<(), Error> {
        let config = &self.shared.config;
        loop {
            {
                let mut state = self.shared.lock();
                if state.closing {
                    return Outcome::Err(closed_error());
                }
                let size = state.size();
                if size >= config.minsize {
                    break;
                }
                state.connecting += 1;
            }
            match self.shared.open_one(cx).await {
                Outcome::Ok(()) => {}
                other => return other,
            }
        }

        let grow = {
            let mut state = self.shared.lock();
            let grow = state.free.is_empty() && config.has_room(state.size());
            if grow {
                state.connecting += 1;
            }
            grow
        };
        if grow {
            return self.shared.open_one(cx).await;
        }
        Outcome::Ok(())
    }

    /// Borrow a session, waiting until one is free or the pool can grow.
    #[tracing::instrument(level = "trace", skip(self, cx), fields(pool = self.shared.id))]
    pub async fn acquire(&self, cx: &Cx) -> Outcome<PooledConnection<K>, Error> {
        loop {
            if cx.is_cancel_requested() {
                return cancelled(cx);
            }
            {
                let mut state = self.shared.lock();
                if state.closing {
                    return Outcome::Err(closed_error());
                }
                state.prune(self.shared.config.recycle);
            }
            match self.fill(cx).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
            if let Some((id, conn)) = self.shared.lock().check_out() {
                return Outcome::Ok(PooledConnection {
                    conn: Some(conn),
                    pool: self.clone(),
                    id,
                });
            }
            self.wait_for_change(cx).await;
        }
    }

    /// Park until a session is freed, room opens up or the pool closes.
    async fn wait_for_change(&self, cx: &Cx) {
        let config = &self.shared.config;
        let mut waiter = Waiter {
            shared: &self.shared,
            id: None,
        };
        poll_fn(|task| {
            if cx.is_cancel_requested() {
                return Poll::Ready(());
            }
            let mut state = self.shared.lock();
            if state.closing || !state.free.is_empty() || config.has_room(state.size()) {
                if let Some(id) = waiter.id.take() {
                    state.unpark(id);
                }
                return Poll::Ready(());
            }
            let id = *waiter.id.get_or_insert_with(|| {
                let id = state.next_waiter;
                state.next_waiter += 1;
                id
            });
            state.park(id, task.waker());
            Poll::Pending
        })
        .await;
    }

    /// Return a session. Same as dropping it, but reports a session that
    /// belongs to another pool.
    pub fn release(&self, mut conn: PooledConnection<K>) -> Result<(), Error> {
        if !Arc::ptr_eq(&self.shared, &conn.pool.shared) {
            return Err(pool_error(
                PoolErrorKind::Misuse,
                format!(
                    "Session belongs to pool {}, not pool {}",
                    conn.pool.shared.id, self.shared.id
                ),
            ));
        }
        if let Some(inner) = conn.conn.take() {
            self.shared.release(conn.id, inner);
        }
        Ok(())
    }

    /// free + in use + connecting
    pub fn size(&self) -> usize {
        self.shared.lock().size()
    }

    pub fn freesize(&self) -> usize {
        self.shared.lock().free.len()
    }

    pub fn minsize(&self) -> usize {
        self.shared.config.minsize
    }

    pub fn maxsize(&self) -> usize {
        self.shared.config.maxsize
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        PoolStats {
            size: state.size(),
            freesize: state.free.len(),
            in_use: state.in_use.len(),
            connecting: state.connecting,
            waiters: state.waiters.len(),
            total_created: state.total_created,
            total_closed: state.total_closed,
        }
    }

    /// Close every free session. Checked-out sessions are untouched.
    pub fn clear(&self) {
        let mut state = self.shared.lock();
        let cleared = state.free.len();
        while let Some(mut idle) = state.free.pop_front() {
            idle.conn.close_now();
            state.total_closed += 1;
        }
        tracing::debug!(cleared, "cleared free sessions");
        state.wake_one();
        state.wake_if_empty();
    }

    /// Stop handing out sessions. Free sessions are closed now; borrowed
    /// ones are closed as they come back.
    pub fn close(&self) {
        let mut state = self.shared.lock();
        if !state.closing {
            tracing::info!(
                pool = self.shared.id,
                in_use = state.in_use.len(),
                "closing pool"
            );
        }
        state.closing = true;
        while let Some(mut idle) = state.free.pop_front() {
            idle.conn.close_now();
            state.total_closed += 1;
        }
        state.wake_all();
        state.wake_if_empty();
    }

    /// Close the pool and force-close every borrowed session.
    pub fn terminate(&self) {
        self.close();
        let mut state = self.shared.lock();
        let terminated = state.in_use.len();
        for (_, handle) in state.in_use.drain(..) {
            handle.abort();
        }
        state.total_closed += terminated as u64;
        tracing::info!(pool = self.shared.id, terminated, "terminated pool");
        state.wake_if_empty();
    }

    /// Wait until every session has been released or terminated. The pool
    /// must be closing.
    pub async fn wait_closed(&self, cx: &Cx) -> Outcome<(), Error> {
        if !self.is_closing() {
            return Outcome::Err(pool_error(
                PoolErrorKind::Misuse,
                "wait_closed() called before close()",
            ));
        }
        poll_fn(|task| {
            if cx.is_cancel_requested() {
                return Poll::Ready(());
            }
            let mut state = self.shared.lock();
            if state.size() == 0 {
                return Poll::Ready(());
            }
            if !state.close_waiters.iter().any(|w| w.will_wake(task.waker())) {
                state.close_waiters.push(task.waker().clone());
            }
            Poll::Pending
        })
        .await;
        if cx.is_cancel_requested() {
            return cancelled(cx);
        }
        Outcome::Ok(())
    }

    pub fn is_closing(&self) -> bool {
        self.shared.lock().closing
    }

    /// Closing and every session gone.
    pub fn is_closed(&self) -> bool {
        let state = self.shared.lock();
        state.closing && state.size() == 0
    }
}

fn cancelled<T>(cx: &Cx) -> Outcome<T, Error> {
    match cx.cancel_reason() {
        Some(reason) => Outcome::Cancelled(reason),
        None => Outcome::Err(Error::Cancelled),
    }
}

/// A session borrowed from a [`Pool`]. Returned to the pool on drop.
pub struct PooledConnection<K: Connector> {
    conn: Option<K::Conn>,
    pool: Pool<K>,
    id: u64,
}

impl<K: Connector> PooledConnection<K> {
    pub fn pool(&self) -> &Pool<K> {
        &self.pool
    }

    /// Take the session out of the pool for good. It no longer counts
    /// towards the pool's size.
    pub fn into_inner(mut self) -> K::Conn {
        let mut state = self.pool.shared.lock();
        if let Some(pos) = state.in_use.iter().position(|(i, _)| *i == self.id) {
            state.in_use.swap_remove(pos);
        }
        state.wake_one();
        state.wake_if_empty();
        drop(state);
        // `conn` is only `None` after release or drop
        self.conn.take().unwrap_or_else(|| unreachable!())
    }
}

impl<K: Connector> std::fmt::Debug for PooledConnection<K>
where
    K::Conn: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("conn", &self.conn)
            .finish()
    }
}

impl<K: Connector> std::ops::Deref for PooledConnection<K> {
    type Target = K::Conn;

    fn deref(&self) -> &Self::Target {
        // `conn` is only `None` after release or drop
        self.conn.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<K: Connector> std::ops::DerefMut for PooledConnection<K> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<K: Connector> Drop for PooledConnection<K> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.shared.release(self.id, conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_and_validation() {
        let config = PoolConfig::default();
        assert_eq!(config.minsize, 1);
        assert_eq!(config.maxsize, 10);
        assert!(config.recycle.is_none());
        assert!(config.validate().is_ok());

        assert!(PoolConfig::new(0).minsize(50).validate().is_ok());
        let err = PoolConfig::new(2).minsize(3).validate().unwrap_err();
        assert!(matches!(
            err,
            Error::Pool(PoolError {
                kind: PoolErrorKind::Config,
                ..
            })
        ));
    }

    #[test]
    fn has_room_treats_zero_as_unbounded() {
        assert!(PoolConfig::new(0).has_room(10_000));
        assert!(PoolConfig::new(2).has_room(1));
        assert!(!PoolConfig::new(2).has_room(2));
    }
}
