//! Slot pool: a bounded in-flight counter with deadline-bounded waiting.
//!
//! `in_use` is the only mutable state. It is updated with compare-and-swap so
//! it can never exceed `capacity` or drop below zero, and every successful
//! release wakes all current waiters through a [`Notify`]. Waiters re-probe
//! after waking; there is no FIFO hand-off.

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Which of a limiter's two pools a slot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    /// Exclusive minimum for the owning class. Never lent.
    Guaranteed,
    /// Capacity above the minimum. Usable by the owner and lendable to siblings.
    Surplus,
}

impl PoolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Guaranteed => "guaranteed",
            Self::Surplus => "surplus",
        }
    }
}

impl std::fmt::Display for PoolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an admission attempt produced no slot.
///
/// Overload is an expected outcome, not a failure of the gate, so this is
/// returned as a value for the caller to map onto its protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Rejected {
    #[error("no slot became available within {waited:?}")]
    TimedOut { waited: Duration },
    #[error("admission wait was cancelled")]
    Cancelled,
}

impl Rejected {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Rejected::TimedOut { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Rejected::Cancelled)
    }
}

/// Point-in-time view of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    pub capacity: usize,
    pub in_use: usize,
}

/// Bounded counting resource.
#[derive(Debug)]
pub struct SlotPool {
    kind: PoolKind,
    capacity: usize,
    in_use: AtomicUsize,
    released: Notify,
}

impl SlotPool {
    pub fn new(kind: PoolKind, capacity: usize) -> Self {
        Self {
            kind,
            capacity,
            in_use: AtomicUsize::new(0),
            released: Notify::new(),
        }
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.in_use())
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            capacity: self.capacity,
            in_use: self.in_use(),
        }
    }

    /// Take a slot if one is free. Never waits.
    pub fn try_acquire(&self) -> bool {
        self.in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .is_ok()
    }

    /// Wait until a slot is taken or `deadline` passes.
    ///
    /// Returns `false` on timeout. Dropping the future abandons the wait
    /// without holding anything.
    pub async fn acquire(&self, deadline: Instant) -> bool {
        self.acquire_inner(deadline, None).await.is_ok()
    }

    /// Like [`acquire`](Self::acquire), but interruptible through `cancel`.
    pub async fn acquire_cancellable(
        &self,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<(), Rejected> {
        self.acquire_inner(deadline, Some(cancel)).await
    }

    async fn acquire_inner(
        &self,
        deadline: Instant,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), Rejected> {
        wait_for_slot(&[self], deadline, cancel, || self.try_acquire().then_some(())).await
    }

    /// Return a slot.
    ///
    /// Safe from any thread. Returns `false` without touching the counter when
    /// nothing is held, so a bookkeeping error can never underflow the pool.
    pub fn release(&self) -> bool {
        match self
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(_) => {
                self.released.notify_waiters();
                true
            }
            Err(_) => {
                tracing::warn!(
                    pool = %self.kind,
                    "Release on a pool with no slots in use, ignoring"
                );
                false
            }
        }
    }

    pub(crate) fn released(&self) -> Notified<'_> {
        self.released.notified()
    }
}

/// Repeatedly run `probe` until it yields, the deadline passes, or `cancel` fires.
///
/// Waiters register on every pool in `pools` *before* probing, so a release
/// that lands between a failed probe and the wait is never missed. The
/// registrations are dropped on every exit path.
pub(crate) async fn wait_for_slot<T>(
    pools: &[&SlotPool],
    deadline: Instant,
    cancel: Option<&CancellationToken>,
    mut probe: impl FnMut() -> Option<T>,
) -> Result<T, Rejected> {
    let started = Instant::now();

    loop {
        if cancel.is_some_and(|c| c.is_cancelled()) {
            return Err(Rejected::Cancelled);
        }

        let mut wakeups: Vec<Pin<Box<Notified<'_>>>> =
            pools.iter().map(|p| Box::pin(p.released())).collect();
        for wakeup in wakeups.iter_mut() {
            wakeup.as_mut().enable();
        }

        if let Some(slot) = probe() {
            return Ok(slot);
        }

        if Instant::now() >= deadline {
            return Err(Rejected::TimedOut {
                waited: started.elapsed(),
            });
        }

        let any_release = async move {
            if wakeups.is_empty() {
                future::pending::<()>().await;
            } else {
                future::select_all(wakeups).await;
            }
        };

        tokio::select! {
            _ = any_release => {}
            _ = tokio::time::sleep_until(deadline) => {
                // One last look: a release may have raced the timer.
                return probe().ok_or(Rejected::TimedOut {
                    waited: started.elapsed(),
                });
            }
            _ = cancelled(cancel) => return Err(Rejected::Cancelled),
        }
    }
}

async fn cancelled(cancel: Option<&CancellationToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn soon(ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    #[test]
    fn try_acquire_up_to_capacity() {
        let pool = SlotPool::new(PoolKind::Guaranteed, 2);

        assert!(pool.try_acquire());
        assert!(pool.try_acquire());
        assert!(!pool.try_acquire());
        assert_eq!(pool.in_use(), 2);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn zero_capacity_never_admits() {
        let pool = SlotPool::new(PoolKind::Surplus, 0);
        assert!(!pool.try_acquire());
        assert_eq!(pool.snapshot(), PoolSnapshot { capacity: 0, in_use: 0 });
    }

    #[test]
    fn extra_release_is_ignored() {
        let pool = SlotPool::new(PoolKind::Surplus, 3);

        assert!(pool.try_acquire());
        assert!(pool.try_acquire());
        assert!(pool.release());
        assert!(pool.release());
        assert!(!pool.release());
        assert_eq!(pool.in_use(), 0);

        // Still bounded by capacity after the bogus release.
        for _ in 0..3 {
            assert!(pool.try_acquire());
        }
        assert!(!pool.try_acquire());
    }

    #[tokio::test]
    async fn acquire_times_out_when_full() {
        let pool = SlotPool::new(PoolKind::Guaranteed, 1);
        assert!(pool.try_acquire());

        let start = std::time::Instant::now();
        assert!(!pool.acquire(soon(100)).await);
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(pool.in_use(), 1);
    }

    #[tokio::test]
    async fn acquire_wakes_on_release_from_another_task() {
        let pool = Arc::new(SlotPool::new(PoolKind::Guaranteed, 1));
        assert!(pool.try_acquire());

        let releaser = Arc::clone(&pool);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            releaser.release();
        });

        let start = std::time::Instant::now();
        assert!(pool.acquire(soon(5_000)).await);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(pool.in_use(), 1);
    }

    #[tokio::test]
    async fn cancellation_is_distinct_from_timeout() {
        let pool = Arc::new(SlotPool::new(PoolKind::Surplus, 1));
        assert!(pool.try_acquire());

        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let outcome = pool.acquire_cancellable(soon(5_000), &token).await;
        assert_eq!(outcome, Err(Rejected::Cancelled));
        assert_eq!(pool.in_use(), 1);

        let outcome = pool
            .acquire_cancellable(soon(10), &CancellationToken::new())
            .await;
        assert!(outcome.unwrap_err().is_timeout());
    }

    #[tokio::test]
    async fn dropped_waiter_leaves_counter_untouched() {
        let pool = Arc::new(SlotPool::new(PoolKind::Guaranteed, 1));
        assert!(pool.try_acquire());

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(soon(5_000)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());

        assert!(pool.release());
        assert_eq!(pool.in_use(), 0);
        assert!(pool.try_acquire());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_round_trip_restores_count() {
        let pool = Arc::new(SlotPool::new(PoolKind::Surplus, 4));
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let pool = Arc::clone(&pool);
            tasks.push(tokio::spawn(async move {
                for _ in 0..50 {
                    if pool.acquire(soon(1_000)).await {
                        assert!(pool.in_use() <= pool.capacity());
                        tokio::task::yield_now().await;
                        assert!(pool.release());
                    }
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(pool.in_use(), 0);
    }
}
