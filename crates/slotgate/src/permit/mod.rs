//! Slot pools and the reservations drawn from them.
//!
//! - `SlotPool`: bounded in-flight counter, the only mutable shared state
//! - `Reservation`: `Held` → `Released`, exactly once; releases on drop

mod pool;
mod reservation;

pub(crate) use pool::wait_for_slot;
pub use pool::{PoolKind, PoolSnapshot, Rejected, SlotPool};
pub use reservation::{Reservation, ReservationKind};
