//! Per-class limiter: a guaranteed pool, a surplus pool, and the borrowing protocol.
//!
//! Admission order for a request of this class:
//! 1. own guaranteed pool
//! 2. own surplus pool
//! 3. siblings' surplus pools (only with `borrowing_enabled`)
//!
//! If none has a free slot, the limiter waits for any of those pools to
//! release and probes again, until `acquisition_timeout` has elapsed.
//! Borrowers only ever touch a lender's surplus pool, so a class can always
//! reach its guaranteed slots.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::class::RequestClass;
use crate::config::{ConfigError, LimiterConfig};
use crate::permit::{PoolKind, PoolSnapshot, Rejected, Reservation, SlotPool, wait_for_slot};

/// Stand-in deadline offset for unrepresentable timeouts.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Serializable view of a limiter for status endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimiterSnapshot {
    pub class: RequestClass,
    pub enabled: bool,
    pub borrowing_enabled: bool,
    pub guaranteed: PoolSnapshot,
    pub surplus: PoolSnapshot,
}

impl LimiterSnapshot {
    pub fn in_use(&self) -> usize {
        self.guaranteed.in_use + self.surplus.in_use
    }

    pub fn is_saturated(&self) -> bool {
        self.enabled
            && self.guaranteed.in_use >= self.guaranteed.capacity
            && self.surplus.in_use >= self.surplus.capacity
    }
}

pub struct ClassLimiter {
    config: LimiterConfig,
    guaranteed: Arc<SlotPool>,
    surplus: Arc<SlotPool>,
}

impl ClassLimiter {
    /// Build a limiter, failing fast on an invalid configuration.
    pub fn new(config: LimiterConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let guaranteed = Arc::new(SlotPool::new(
            PoolKind::Guaranteed,
            config.guaranteed_slots(),
        ));
        let surplus = Arc::new(SlotPool::new(PoolKind::Surplus, config.surplus_slots()));
        Ok(Self {
            config,
            guaranteed,
            surplus,
        })
    }

    pub fn class(&self) -> &RequestClass {
        &self.config.class
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// True iff no reservation, own or lent, is held against this limiter.
    pub fn is_empty(&self) -> bool {
        self.guaranteed.in_use() == 0 && self.surplus.in_use() == 0
    }

    pub fn snapshot(&self) -> LimiterSnapshot {
        LimiterSnapshot {
            class: self.config.class.clone(),
            enabled: self.config.enabled,
            borrowing_enabled: self.config.borrowing_enabled,
            guaranteed: self.guaranteed.snapshot(),
            surplus: self.surplus.snapshot(),
        }
    }

    /// Admit a request of this class.
    ///
    /// `siblings` are the limiters this one may borrow from. Entries for this
    /// limiter's own class are skipped.
    pub async fn handle_request(
        &self,
        siblings: &[Arc<ClassLimiter>],
    ) -> Result<Reservation, Rejected> {
        self.admit(siblings, None).await
    }

    /// Like [`handle_request`](Self::handle_request), but the wait ends with
    /// [`Rejected::Cancelled`] as soon as `cancel` fires.
    pub async fn handle_request_cancellable(
        &self,
        siblings: &[Arc<ClassLimiter>],
        cancel: &CancellationToken,
    ) -> Result<Reservation, Rejected> {
        self.admit(siblings, Some(cancel)).await
    }

    /// Take a slot from this limiter's surplus pool only.
    ///
    /// This is what a sibling borrows through, and also an admission path for
    /// callers that must never consume guaranteed capacity. Waits up to this
    /// limiter's `acquisition_timeout` and never consults other limiters.
    pub async fn allow_slot_borrowing(&self) -> Result<Reservation, Rejected> {
        self.lend(self.class(), None).await
    }

    pub async fn allow_slot_borrowing_cancellable(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Reservation, Rejected> {
        self.lend(self.class(), Some(cancel)).await
    }

    /// Wait until every reservation held against this limiter is released.
    ///
    /// Used to retire a limiter after it was replaced in the registry.
    pub async fn drained(&self) {
        loop {
            let guaranteed = self.guaranteed.released();
            let surplus = self.surplus.released();
            tokio::pin!(guaranteed, surplus);
            guaranteed.as_mut().enable();
            surplus.as_mut().enable();

            if self.is_empty() {
                return;
            }

            tokio::select! {
                _ = guaranteed => {}
                _ = surplus => {}
            }
        }
    }

    async fn admit(
        &self,
        siblings: &[Arc<ClassLimiter>],
        cancel: Option<&CancellationToken>,
    ) -> Result<Reservation, Rejected> {
        if !self.config.enabled {
            return Ok(Reservation::unlimited());
        }

        let lenders: Vec<&ClassLimiter> = if self.config.borrowing_enabled {
            siblings
                .iter()
                .map(Arc::as_ref)
                .filter(|s| s.class() != self.class() && s.lends())
                .collect()
        } else {
            Vec::new()
        };

        let mut pools: Vec<&SlotPool> = vec![self.guaranteed.as_ref(), self.surplus.as_ref()];
        pools.extend(lenders.iter().map(|l| l.surplus.as_ref()));

        let deadline = self.deadline();
        let outcome = wait_for_slot(&pools, deadline, cancel, || {
            self.try_own().or_else(|| {
                lenders
                    .iter()
                    .find_map(|lender| lender.try_lend(self.class()))
            })
        })
        .await;

        match &outcome {
            Ok(reservation) => {
                tracing::debug!(
                    class = %self.class(),
                    kind = ?reservation.kind(),
                    "Request admitted"
                );
            }
            Err(rejected) => {
                tracing::debug!(class = %self.class(), %rejected, "Request rejected");
            }
        }
        outcome
    }

    /// End of the acquisition wait. Timeouts too large to represent wait
    /// for roughly thirty years instead.
    fn deadline(&self) -> Instant {
        let now = Instant::now();
        now.checked_add(self.config.acquisition_timeout)
            .unwrap_or_else(|| now + FAR_FUTURE)
    }

    fn try_own(&self) -> Option<Reservation> {
        let class = self.class();
        [&self.guaranteed, &self.surplus]
            .into_iter()
            .find(|pool| pool.try_acquire())
            .map(|pool| Reservation::held(Arc::clone(pool), class.clone(), class.clone()))
    }

    /// Whether siblings may draw from this limiter at all.
    fn lends(&self) -> bool {
        self.config.enabled && self.surplus.capacity() > 0
    }

    /// Non-blocking probe of the surplus pool on behalf of `borrower`.
    fn try_lend(&self, borrower: &RequestClass) -> Option<Reservation> {
        self.surplus.try_acquire().then(|| {
            Reservation::held(
                Arc::clone(&self.surplus),
                borrower.clone(),
                self.class().clone(),
            )
        })
    }

    async fn lend(
        &self,
        borrower: &RequestClass,
        cancel: Option<&CancellationToken>,
    ) -> Result<Reservation, Rejected> {
        if !self.lends() {
            return Err(Rejected::TimedOut {
                waited: Duration::ZERO,
            });
        }
        let deadline = self.deadline();
        wait_for_slot(&[self.surplus.as_ref()], deadline, cancel, || {
            self.try_lend(borrower)
        })
        .await
    }
}

impl std::fmt::Debug for ClassLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassLimiter")
            .field("config", &self.config)
            .field("guaranteed", &self.guaranteed.snapshot())
            .field("surplus", &self.surplus.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permit::ReservationKind;

    const WAIT: Duration = Duration::from_millis(200);

    fn limiter(class: &str, guaranteed: usize, total: usize, borrowing: bool) -> Arc<ClassLimiter> {
        Arc::new(
            ClassLimiter::new(
                LimiterConfig::new(class, guaranteed, total)
                    .with_acquisition_timeout(WAIT)
                    .with_borrowing(borrowing),
            )
            .unwrap(),
        )
    }

    async fn admit_now(limiter: &ClassLimiter, siblings: &[Arc<ClassLimiter>]) -> Reservation {
        let start = std::time::Instant::now();
        let reservation = limiter.handle_request(siblings).await.unwrap();
        assert!(start.elapsed() < WAIT, "admission should not wait");
        reservation
    }

    #[test]
    fn invalid_config_is_fatal() {
        let err = ClassLimiter::new(LimiterConfig::new("QUERY", 3, 2)).unwrap_err();
        assert!(matches!(err, ConfigError::GuaranteedExceedsTotal { .. }));
    }

    #[tokio::test]
    async fn disabled_limiter_admits_everything() {
        let limiter = ClassLimiter::new(LimiterConfig::new("QUERY", 0, 0).with_enabled(false))
            .unwrap();
        let mut held = Vec::new();
        for _ in 0..10 {
            held.push(limiter.handle_request(&[]).await.unwrap());
        }
        assert!(held.iter().all(Reservation::is_unlimited));
        assert!(limiter.is_empty());
    }

    #[tokio::test]
    async fn guaranteed_then_surplus_then_wait() {
        let q = limiter("QUERY", 2, 5, false);

        let mut held = Vec::new();
        for _ in 0..2 {
            let r = admit_now(&q, &[]).await;
            assert_eq!(r.kind(), ReservationKind::Guaranteed);
            held.push(r);
        }
        for _ in 0..3 {
            let r = admit_now(&q, &[]).await;
            assert_eq!(r.kind(), ReservationKind::OwnSurplus);
            held.push(r);
        }

        let snapshot = q.snapshot();
        assert_eq!(snapshot.guaranteed, PoolSnapshot { capacity: 2, in_use: 2 });
        assert_eq!(snapshot.surplus, PoolSnapshot { capacity: 3, in_use: 3 });
        assert!(snapshot.is_saturated());

        let start = std::time::Instant::now();
        let rejected = q.handle_request(&[]).await.unwrap_err();
        assert!(rejected.is_timeout());
        assert!(start.elapsed() >= WAIT);

        drop(held);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn waiting_request_admitted_on_release() {
        let q = limiter("QUERY", 1, 1, false);
        let first = admit_now(&q, &[]).await;

        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.handle_request(&[]).await.map(|r| r.kind()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        first.release();

        assert_eq!(waiter.await.unwrap(), Ok(ReservationKind::Guaranteed));
    }

    #[tokio::test]
    async fn unbounded_timeout_waits_instead_of_overflowing() {
        let q = Arc::new(
            ClassLimiter::new(
                LimiterConfig::new("QUERY", 1, 2).with_acquisition_timeout(Duration::MAX),
            )
            .unwrap(),
        );
        let first = q.handle_request(&[]).await.unwrap();
        let second = q.handle_request(&[]).await.unwrap();

        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.handle_request(&[]).await.map(|r| r.kind()) })
        };
        let lender = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.allow_slot_borrowing().await.map(|r| r.kind()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert!(!lender.is_finished());

        drop(first);
        assert_eq!(waiter.await.unwrap(), Ok(ReservationKind::Guaranteed));
        drop(second);
        assert_eq!(lender.await.unwrap(), Ok(ReservationKind::OwnSurplus));
    }

    #[tokio::test]
    async fn borrows_from_sibling_surplus() {
        let u = limiter("UPDATE", 1, 1, true);
        let q = limiter("QUERY", 1, 3, true);
        let siblings = [Arc::clone(&q)];

        let own = admit_now(&u, &siblings).await;
        assert_eq!(own.kind(), ReservationKind::Guaranteed);

        let mut borrowed = Vec::new();
        for _ in 0..2 {
            let r = admit_now(&u, &siblings).await;
            assert_eq!(
                r.kind(),
                ReservationKind::Borrowed {
                    lender: RequestClass::new("QUERY")
                }
            );
            borrowed.push(r);
        }
        assert_eq!(q.snapshot().surplus.in_use, 2);
        assert_eq!(q.snapshot().guaranteed.in_use, 0);

        // Lender's surplus exhausted: the borrower waits out its timeout.
        assert!(u.handle_request(&siblings).await.unwrap_err().is_timeout());

        // The lender's guaranteed slot is still there for its own traffic.
        let q_own = admit_now(&q, &[Arc::clone(&u)]).await;
        assert_eq!(q_own.kind(), ReservationKind::Guaranteed);

        drop(borrowed);
        assert_eq!(q.snapshot().surplus.in_use, 0);
        assert!(!q.is_empty());
        drop(q_own);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn borrowing_disabled_never_touches_siblings() {
        let u = limiter("UPDATE", 1, 1, false);
        let q = limiter("QUERY", 0, 4, true);
        let siblings = [Arc::clone(&q)];

        let _own = admit_now(&u, &siblings).await;
        assert!(u.handle_request(&siblings).await.unwrap_err().is_timeout());
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn disabled_sibling_lends_nothing() {
        let u = limiter("UPDATE", 1, 1, true);
        let q = Arc::new(
            ClassLimiter::new(LimiterConfig::new("QUERY", 0, 4).with_enabled(false)).unwrap(),
        );

        let _own = admit_now(&u, &[Arc::clone(&q)]).await;
        assert!(
            u.handle_request(&[Arc::clone(&q)])
                .await
                .unwrap_err()
                .is_timeout()
        );
        assert!(q.allow_slot_borrowing().await.is_err());
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn allow_slot_borrowing_uses_surplus_only() {
        let q = limiter("QUERY", 2, 3, false);

        let surplus = q.allow_slot_borrowing().await.unwrap();
        assert_eq!(surplus.origin(), Some(PoolKind::Surplus));
        assert_eq!(surplus.kind(), ReservationKind::OwnSurplus);

        // Surplus exhausted; guaranteed slots are free but out of reach.
        assert!(q.allow_slot_borrowing().await.unwrap_err().is_timeout());
        assert_eq!(q.snapshot().guaranteed.in_use, 0);
    }

    #[tokio::test]
    async fn cancellation_is_reported_distinctly() {
        let q = Arc::new(
            ClassLimiter::new(
                LimiterConfig::new("QUERY", 1, 1).with_acquisition_timeout(Duration::from_secs(30)),
            )
            .unwrap(),
        );
        let _held = q.handle_request(&[]).await.unwrap();

        let token = CancellationToken::new();
        let waiter = {
            let q = Arc::clone(&q);
            let token = token.clone();
            tokio::spawn(async move { q.handle_request_cancellable(&[], &token).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        assert_eq!(waiter.await.unwrap(), Err(Rejected::Cancelled));
        assert_eq!(q.snapshot().guaranteed.in_use, 1);
    }

    #[tokio::test]
    async fn sibling_release_wakes_borrower() {
        let u = limiter("UPDATE", 0, 0, true);
        let q = limiter("QUERY", 0, 1, true);
        let siblings = vec![Arc::clone(&q)];

        let q_held = admit_now(&q, &[]).await;
        let waiter = {
            let u = Arc::clone(&u);
            tokio::spawn(async move { u.handle_request(&siblings).await.map(|r| r.is_borrowed()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(q_held);

        assert_eq!(waiter.await.unwrap(), Ok(true));
    }

    #[tokio::test]
    async fn drained_waits_for_last_release() {
        let q = limiter("QUERY", 1, 2, false);
        let a = admit_now(&q, &[]).await;
        let b = admit_now(&q, &[]).await;

        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(a);
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(b);
        });

        tokio::time::timeout(Duration::from_secs(5), q.drained())
            .await
            .unwrap();
        assert!(q.is_empty());
        releaser.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn pools_stay_within_bounds_under_load() {
        let g = 2;
        let total = 6;
        let q = Arc::new(
            ClassLimiter::new(
                LimiterConfig::new("QUERY", g, total)
                    .with_acquisition_timeout(Duration::from_millis(20)),
            )
            .unwrap(),
        );
        let outstanding = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let borrowed = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for i in 0..24 {
            let q = Arc::clone(&q);
            let outstanding = Arc::clone(&outstanding);
            let borrowed = Arc::clone(&borrowed);
            tasks.push(tokio::spawn(async move {
                use std::sync::atomic::Ordering::SeqCst;
                for _ in 0..20 {
                    let borrower = i % 2 == 0;
                    let admitted = if borrower {
                        q.allow_slot_borrowing().await
                    } else {
                        q.handle_request(&[]).await
                    };
                    let Ok(reservation) = admitted else { continue };

                    assert!(outstanding.fetch_add(1, SeqCst) < total);
                    if borrower {
                        assert!(borrowed.fetch_add(1, SeqCst) < total - g);
                    }
                    let snapshot = q.snapshot();
                    assert!(snapshot.guaranteed.in_use <= g);
                    assert!(snapshot.surplus.in_use <= total - g);

                    tokio::time::sleep(Duration::from_millis(1)).await;
                    if borrower {
                        borrowed.fetch_sub(1, SeqCst);
                    }
                    outstanding.fetch_sub(1, SeqCst);
                    drop(reservation);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(q.is_empty());
    }
}
