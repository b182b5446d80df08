//! Reservation: one held slot, returned on release or drop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;

use super::pool::{PoolKind, SlotPool};
use crate::class::RequestClass;

/// How an admitted request got its slot.
///
/// Enough granularity for an external collaborator to derive accepted and
/// borrowed counters without the gate keeping them itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReservationKind {
    /// No limiter applied (unmanaged class or disabled limiter).
    Unlimited,
    /// Drawn from the class's own guaranteed pool.
    Guaranteed,
    /// Drawn from the class's own surplus pool.
    OwnSurplus,
    /// Drawn from a sibling's surplus pool.
    Borrowed { lender: RequestClass },
}

struct HeldSlot {
    pool: Arc<SlotPool>,
    class: RequestClass,
    lender: RequestClass,
    released: AtomicBool,
}

/// Scoped handle for an admitted request.
///
/// Transitions `Held → Released` exactly once: the first call to
/// [`release`](Self::release) (or the drop) returns the slot, every later call
/// is a no-op. The handle carries its pool explicitly, so it may be released
/// from any thread or task, including after its limiter has been replaced in
/// the registry.
#[must_use = "dropping a Reservation releases its slot immediately"]
pub struct Reservation {
    held: Option<HeldSlot>,
}

impl Reservation {
    /// A reservation that holds nothing. Release is always a no-op.
    pub fn unlimited() -> Self {
        Self { held: None }
    }

    /// Wrap a slot already taken from `pool` on behalf of `class`.
    pub(crate) fn held(pool: Arc<SlotPool>, class: RequestClass, lender: RequestClass) -> Self {
        Self {
            held: Some(HeldSlot {
                pool,
                class,
                lender,
                released: AtomicBool::new(false),
            }),
        }
    }

    pub fn kind(&self) -> ReservationKind {
        match &self.held {
            None => ReservationKind::Unlimited,
            Some(h) if h.lender != h.class => ReservationKind::Borrowed {
                lender: h.lender.clone(),
            },
            Some(h) => match h.pool.kind() {
                PoolKind::Guaranteed => ReservationKind::Guaranteed,
                PoolKind::Surplus => ReservationKind::OwnSurplus,
            },
        }
    }

    /// Pool the slot came from, `None` for an unlimited reservation.
    pub fn origin(&self) -> Option<PoolKind> {
        self.held.as_ref().map(|h| h.pool.kind())
    }

    /// Class whose pool lent the slot.
    pub fn lender(&self) -> Option<&RequestClass> {
        self.held.as_ref().map(|h| &h.lender)
    }

    /// Class the slot was admitted for.
    pub fn class(&self) -> Option<&RequestClass> {
        self.held.as_ref().map(|h| &h.class)
    }

    pub fn is_unlimited(&self) -> bool {
        self.held.is_none()
    }

    pub fn is_borrowed(&self) -> bool {
        matches!(self.kind(), ReservationKind::Borrowed { .. })
    }

    pub fn is_released(&self) -> bool {
        self.held
            .as_ref()
            .is_none_or(|h| h.released.load(Ordering::Acquire))
    }

    /// Return the slot to its pool.
    ///
    /// Returns `true` only for the call that actually released it.
    pub fn release(&self) -> bool {
        let Some(held) = &self.held else {
            return false;
        };
        if held.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        tracing::trace!(
            class = %held.class,
            lender = %held.lender,
            pool = %held.pool.kind(),
            "Slot released"
        );
        held.pool.release()
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("kind", &self.kind())
            .field("released", &self.is_released())
            .finish()
    }
}
