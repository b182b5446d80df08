//! slotgate: per-class admission control with slot borrowing.

mod class;
mod version;

pub mod classify;
pub mod config;
pub mod limiter;
pub mod observer;
pub mod permit;
pub mod registry;
pub mod service;
pub mod transport;

pub use class::RequestClass;
pub use classify::{HeaderClassifier, RequestClassifier};
pub use config::{AdmissionConfig, ConfigError, LimiterConfig};
pub use limiter::{ClassLimiter, LimiterSnapshot};
pub use observer::{AdmissionCounters, CounterSnapshot};
pub use permit::{PoolKind, PoolSnapshot, Rejected, Reservation, ReservationKind, SlotPool};
pub use registry::LimiterRegistry;
pub use service::{AdmissionService, HealthSnapshot, LimiterStatus};
pub use version::{SLOTGATE_VERSION, VersionInfo};
