//! Pool behavior against an in-memory connector.

use std::future::poll_fn;
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::{Context, Poll, Wake, Waker};
use std::time::Duration;

use asupersync::runtime::RuntimeBuilder;
use asupersync::{Cx, Outcome};
use sqlwire_core::{CloseHandle, Connector, Error, PoolError, PoolErrorKind, Poolable};
use sqlwire_pool::{Pool, PoolConfig};

#[derive(Debug)]
struct FakeConn {
    serial: usize,
    closed: bool,
    in_tx: bool,
    /// A command was cut off mid-flight.
    interrupted: bool,
    alive: Arc<AtomicBool>,
    close: CloseHandle,
}

impl Poolable for FakeConn {
    fn is_closed(&self) -> bool {
        self.closed || self.close.is_aborted()
    }

    fn check_alive(&mut self) -> bool {
        !self.is_closed() && !self.interrupted && self.alive.load(Ordering::SeqCst)
    }

    fn in_transaction(&self) -> bool {
        self.in_tx
    }

    fn close_handle(&self) -> CloseHandle {
        self.close.clone()
    }

    fn close_now(&mut self) {
        self.closed = true;
    }
}

#[derive(Default)]
struct FakeConnector {
    opened: Arc<AtomicUsize>,
    fail: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
}

impl FakeConnector {
    fn new() -> Self {
        let connector = Self::default();
        connector.alive.store(true, Ordering::SeqCst);
        connector
    }
}

/// Suspend once so concurrent acquires interleave inside `connect`.
async fn yield_now() {
    let mut yielded = false;
    poll_fn(|task| {
        if yielded {
            Poll::Ready(())
        } else {
            yielded = true;
            task.waker().wake_by_ref();
            Poll::Pending
        }
    })
    .await;
}

impl Connector for FakeConnector {
    type Conn = FakeConn;

    fn connect(&self, _cx: &Cx) -> impl Future<Output = Outcome<FakeConn, Error>> + Send {
        let serial = self.opened.fetch_add(1, Ordering::SeqCst);
        let fail = self.fail.load(Ordering::SeqCst);
        let alive = Arc::clone(&self.alive);
        async move {
            yield_now().await;
            if fail {
                return Outcome::Err(Error::Custom("connect refused".into()));
            }
            Outcome::Ok(FakeConn {
                serial,
                closed: false,
                in_tx: false,
                interrupted: false,
                alive,
                close: CloseHandle::new(),
            })
        }
    }
}

fn run<F: Future>(f: F) -> F::Output {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    rt.block_on(f)
}

fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

fn pool_kind<T>(outcome: Outcome<T, Error>) -> Option<PoolErrorKind> {
    match outcome {
        Outcome::Err(Error::Pool(PoolError { kind, .. })) => Some(kind),
        _ => None,
    }
}

/// Poll two futures to completion on the current task.
async fn join2<A: Future, B: Future>(a: A, b: B) -> (A::Output, B::Output) {
    let mut a = pin!(a);
    let mut b = pin!(b);
    let mut out_a = None;
    let mut out_b = None;
    poll_fn(|task| {
        if out_a.is_none() {
            if let Poll::Ready(v) = a.as_mut().poll(task) {
                out_a = Some(v);
            }
        }
        if out_b.is_none() {
            if let Poll::Ready(v) = b.as_mut().poll(task) {
                out_b = Some(v);
            }
        }
        if out_a.is_some() && out_b.is_some() {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    })
    .await;
    (out_a.unwrap(), out_b.unwrap())
}

/// Poll a future once; true if it is still pending.
async fn stays_pending<F: Future>(f: F) -> bool {
    let mut f = pin!(f);
    poll_fn(|task| Poll::Ready(f.as_mut().poll(task).is_pending())).await
}

/// Counts how often the task it stands for was woken.
#[derive(Default)]
struct WakeCount(AtomicUsize);

impl WakeCount {
    fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

impl Wake for WakeCount {
    fn wake(self: Arc<Self>) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Poll `f` once on behalf of the task `wakes` stands for.
fn poll_as<F: Future>(wakes: &Arc<WakeCount>, f: std::pin::Pin<&mut F>) -> Poll<F::Output> {
    let waker = Waker::from(Arc::clone(wakes));
    f.poll(&mut Context::from_waker(&waker))
}

fn assert_accounting(pool: &Pool<FakeConnector>) {
    let stats = pool.stats();
    assert_eq!(stats.size, stats.freesize + stats.in_use + stats.connecting);
    if pool.maxsize() != 0 {
        assert!(stats.size <= pool.maxsize());
    }
}

#[test]
fn acquire_opens_minsize_and_reuses() {
    let cx = Cx::for_testing();
    let pool = Pool::new(FakeConnector::new(), PoolConfig::new(4).minsize(2)).unwrap();
    run(async {
        let conn = unwrap_outcome(pool.acquire(&cx).await);
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.freesize(), 1);
        assert_accounting(&pool);
        assert_eq!(conn.serial, 0);
        drop(conn);
        assert_eq!(pool.freesize(), 2);

        // oldest free session first
        let again = unwrap_outcome(pool.acquire(&cx).await);
        assert_eq!(again.serial, 1);
        assert_eq!(pool.connector().opened.load(Ordering::SeqCst), 2);
    });
}

#[test]
fn contention_grows_to_maxsize_then_waits() {
    let cx = Cx::for_testing();
    let pool = Pool::new(FakeConnector::new(), PoolConfig::new(2).minsize(0)).unwrap();
    run(async {
        let (a, b) = join2(pool.acquire(&cx), pool.acquire(&cx)).await;
        let a = unwrap_outcome(a);
        let b = unwrap_outcome(b);
        assert_ne!(a.serial, b.serial);
        assert_eq!(pool.size(), 2);
        assert_accounting(&pool);

        assert!(stays_pending(pool.acquire(&cx)).await);
        assert_eq!(pool.size(), 2);

        let released = a.serial;
        drop(a);
        let c = unwrap_outcome(pool.acquire(&cx).await);
        assert_eq!(c.serial, released);
        drop(b);
        drop(c);
        assert_eq!(pool.freesize(), 2);
    });
}

#[test]
fn sessions_in_transaction_or_faulted_are_closed_on_release() {
    let cx = Cx::for_testing();
    let pool = Pool::new(FakeConnector::new(), PoolConfig::new(3).minsize(0)).unwrap();
    run(async {
        let mut tx = unwrap_outcome(pool.acquire(&cx).await);
        tx.in_tx = true;
        drop(tx);
        assert_eq!(pool.size(), 0);

        let mut faulted = unwrap_outcome(pool.acquire(&cx).await);
        faulted.closed = true;
        pool.release(faulted).unwrap();
        assert_eq!(pool.size(), 0);
        assert_eq!(pool.stats().total_closed, 2);
    });
}

#[test]
fn dead_and_recycled_sessions_are_pruned() {
    let cx = Cx::for_testing();
    let connector = FakeConnector::new();
    let alive = Arc::clone(&connector.alive);
    let pool = Pool::new(connector, PoolConfig::new(2).minsize(1)).unwrap();
    run(async {
        drop(unwrap_outcome(pool.acquire(&cx).await));
        assert_eq!(pool.freesize(), 1);

        alive.store(false, Ordering::SeqCst);
        let conn = unwrap_outcome(pool.acquire(&cx).await);
        assert_eq!(conn.serial, 1);
        drop(conn);
        alive.store(true, Ordering::SeqCst);
    });

    let recycled = Pool::new(
        FakeConnector::new(),
        PoolConfig::new(2).minsize(1).recycle(Duration::ZERO),
    )
    .unwrap();
    run(async {
        drop(unwrap_outcome(recycled.acquire(&cx).await));
        std::thread::sleep(Duration::from_millis(2));
        let conn = unwrap_outcome(recycled.acquire(&cx).await);
        assert_eq!(conn.serial, 1);
    });
}

#[test]
fn release_to_foreign_pool_is_misuse() {
    let cx = Cx::for_testing();
    let one = Pool::new(FakeConnector::new(), PoolConfig::new(1).minsize(0)).unwrap();
    let two = Pool::new(FakeConnector::new(), PoolConfig::new(1).minsize(0)).unwrap();
    run(async {
        let conn = unwrap_outcome(one.acquire(&cx).await);
        match two.release(conn) {
            Err(Error::Pool(e)) => assert_eq!(e.kind, PoolErrorKind::Misuse),
            other => panic!("expected misuse, got {other:?}"),
        }
        // dropped by the failed release, so it went home to `one`
        assert_eq!(one.freesize(), 1);
    });
}

#[test]
fn close_rejects_acquire_and_closes_returns() {
    let cx = Cx::for_testing();
    let pool = Pool::new(FakeConnector::new(), PoolConfig::new(2).minsize(1)).unwrap();
    run(async {
        let conn = unwrap_outcome(pool.acquire(&cx).await);
        pool.close();
        assert!(pool.is_closing());
        assert!(!pool.is_closed());
        assert_eq!(pool_kind(pool.acquire(&cx).await), Some(PoolErrorKind::Closed));

        drop(conn);
        assert_eq!(pool.size(), 0);
        assert!(pool.is_closed());
        unwrap_outcome(pool.wait_closed(&cx).await);
    });
}

#[test]
fn terminate_aborts_borrowed_sessions() {
    let cx = Cx::for_testing();
    let pool = Pool::new(FakeConnector::new(), PoolConfig::new(2).minsize(0)).unwrap();
    run(async {
        let conn = unwrap_outcome(pool.acquire(&cx).await);
        pool.terminate();
        assert!(conn.is_closed());
        assert_eq!(pool.size(), 0);
        unwrap_outcome(pool.wait_closed(&cx).await);
        drop(conn);
        assert_eq!(pool.size(), 0);
    });
}

#[test]
fn wait_closed_before_close_is_misuse() {
    let cx = Cx::for_testing();
    let pool = Pool::new(FakeConnector::new(), PoolConfig::default()).unwrap();
    assert_eq!(pool_kind(run(pool.wait_closed(&cx))), Some(PoolErrorKind::Misuse));
}

#[test]
fn connect_failure_frees_the_slot() {
    let cx = Cx::for_testing();
    let connector = FakeConnector::new();
    let fail = Arc::clone(&connector.fail);
    let pool = Pool::new(connector, PoolConfig::new(1).minsize(0)).unwrap();
    run(async {
        fail.store(true, Ordering::SeqCst);
        assert!(matches!(pool.acquire(&cx).await, Outcome::Err(Error::Custom(_))));
        assert_eq!(pool.size(), 0);

        fail.store(false, Ordering::SeqCst);
        let conn = unwrap_outcome(pool.acquire(&cx).await);
        assert_eq!(pool.size(), 1);
        let detached = conn.into_inner();
        assert!(!detached.is_closed());
        assert_eq!(pool.size(), 0);
    });
}

#[test]
fn clear_closes_only_free_sessions() {
    let cx = Cx::for_testing();
    let pool = Pool::new(FakeConnector::new(), PoolConfig::new(3).minsize(2)).unwrap();
    run(async {
        let held = unwrap_outcome(pool.acquire(&cx).await);
        assert_eq!(pool.freesize(), 1);
        pool.clear();
        assert_eq!(pool.freesize(), 0);
        assert_eq!(pool.size(), 1);
        assert!(!held.is_closed());
    });
}

#[test]
fn invalid_config_is_rejected() {
    let err = Pool::new(FakeConnector::new(), PoolConfig::new(1).minsize(2)).unwrap_err();
    assert!(matches!(
        err,
        Error::Pool(PoolError {
            kind: PoolErrorKind::Config,
            ..
        })
    ));
}

#[test]
fn dropped_acquire_gives_back_its_connecting_slot() {
    let cx = Cx::for_testing();
    let pool = Pool::new(FakeConnector::new(), PoolConfig::new(1).minsize(0)).unwrap();
    run(async {
        // parked inside connect, then dropped
        assert!(stays_pending(pool.acquire(&cx)).await);
        assert_eq!(pool.stats().connecting, 0);
        assert_eq!(pool.size(), 0);

        let conn = unwrap_outcome(pool.acquire(&cx).await);
        assert_eq!(conn.serial, 1);
        assert_accounting(&pool);
    });
}

#[test]
fn interrupted_session_is_closed_on_release() {
    let cx = Cx::for_testing();
    let pool = Pool::new(FakeConnector::new(), PoolConfig::new(2).minsize(0)).unwrap();
    run(async {
        let mut conn = unwrap_outcome(pool.acquire(&cx).await);
        conn.interrupted = true;
        drop(conn);
        assert_eq!(pool.freesize(), 0);
        assert_eq!(pool.size(), 0);
        assert_eq!(pool.stats().total_closed, 1);
    });
}

#[test]
fn abandoned_waiter_does_not_swallow_a_release() {
    let cx = Cx::for_testing();
    let pool = Pool::new(FakeConnector::new(), PoolConfig::new(1).minsize(0)).unwrap();
    let held = unwrap_outcome(run(pool.acquire(&cx)));
    let first = Arc::new(WakeCount::default());
    let second = Arc::new(WakeCount::default());

    {
        // gives up before anything is released, like an acquire timeout
        let mut gave_up = pin!(pool.acquire(&cx));
        assert!(poll_as(&first, gave_up.as_mut()).is_pending());
    }
    assert_eq!(pool.stats().waiters, 0);

    let mut waiting = pin!(pool.acquire(&cx));
    assert!(poll_as(&second, waiting.as_mut()).is_pending());
    // polling again refreshes the slot instead of adding one
    assert!(poll_as(&second, waiting.as_mut()).is_pending());
    assert_eq!(pool.stats().waiters, 1);

    drop(held);
    assert_eq!(first.count(), 0);
    assert_eq!(second.count(), 1);
    match poll_as(&second, waiting.as_mut()) {
        Poll::Ready(outcome) => assert_eq!(unwrap_outcome(outcome).serial, 0),
        Poll::Pending => panic!("waiter still parked with a free session"),
    }
}

#[test]
fn woken_waiter_that_leaves_passes_the_wakeup_on() {
    let cx = Cx::for_testing();
    let pool = Pool::new(FakeConnector::new(), PoolConfig::new(1).minsize(0)).unwrap();
    let held = unwrap_outcome(run(pool.acquire(&cx)));
    let first = Arc::new(WakeCount::default());
    let second = Arc::new(WakeCount::default());

    let mut waiting = pin!(pool.acquire(&cx));
    {
        let mut leaves = pin!(pool.acquire(&cx));
        assert!(poll_as(&first, leaves.as_mut()).is_pending());
        assert!(poll_as(&second, waiting.as_mut()).is_pending());
        assert_eq!(pool.stats().waiters, 2);

        drop(held);
        assert_eq!(first.count(), 1);
        assert_eq!(second.count(), 0);
    }
    assert_eq!(second.count(), 1);
    match poll_as(&second, waiting.as_mut()) {
        Poll::Ready(outcome) => assert_eq!(unwrap_outcome(outcome).serial, 0),
        Poll::Pending => panic!("waiter still parked with a free session"),
    }
    assert_eq!(pool.stats().waiters, 0);
}
