//! Admission outcome counters.
//!
//! The gate itself keeps no statistics. These counters are derived purely from
//! the values admission returns, the way an external metrics pipeline would.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;

use crate::class::RequestClass;
use crate::permit::{Rejected, Reservation};

#[derive(Debug, Default)]
struct ClassCounters {
    incoming: AtomicU64,
    accepted: AtomicU64,
    borrowed: AtomicU64,
    rejected: AtomicU64,
    cancelled: AtomicU64,
}

/// Counter values for one class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub incoming: u64,
    pub accepted: u64,
    /// Accepted requests whose slot came from a sibling.
    pub borrowed: u64,
    /// Timed out waiting for a slot.
    pub rejected: u64,
    pub cancelled: u64,
}

#[derive(Debug, Default)]
pub struct AdmissionCounters {
    classes: DashMap<RequestClass, ClassCounters>,
}

impl AdmissionCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one admission outcome. Unclassified requests are not counted.
    pub fn record(&self, class: Option<&RequestClass>, outcome: &Result<Reservation, Rejected>) {
        let Some(class) = class else {
            return;
        };
        let counters = self.classes.entry(class.clone()).or_default();
        counters.incoming.fetch_add(1, Ordering::Relaxed);
        match outcome {
            Ok(reservation) => {
                counters.accepted.fetch_add(1, Ordering::Relaxed);
                if reservation.is_borrowed() {
                    counters.borrowed.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(Rejected::TimedOut { .. }) => {
                counters.rejected.fetch_add(1, Ordering::Relaxed);
            }
            Err(Rejected::Cancelled) => {
                counters.cancelled.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Forget every class not in `classes`.
    pub fn retain(&self, classes: &[RequestClass]) {
        self.classes.retain(|class, _| classes.contains(class));
    }

    /// Number of classes with counters.
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn get(&self, class: &RequestClass) -> CounterSnapshot {
        self.classes
            .get(class)
            .map(|c| CounterSnapshot {
                incoming: c.incoming.load(Ordering::Relaxed),
                accepted: c.accepted.load(Ordering::Relaxed),
                borrowed: c.borrowed.load(Ordering::Relaxed),
                rejected: c.rejected.load(Ordering::Relaxed),
                cancelled: c.cancelled.load(Ordering::Relaxed),
            })
            .unwrap_or_default()
    }
}
