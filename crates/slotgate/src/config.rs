//! Limiter configuration.
//!
//! One [`LimiterConfig`] per request class, grouped into an
//! [`AdmissionConfig`] that is usually loaded from a JSON file:
//!
//! ```json
//! {
//!   "limiters": [
//!     {
//!       "class": "QUERY",
//!       "guaranteed_slots": 4,
//!       "total_slots": 12,
//!       "acquisition_timeout": "250ms",
//!       "borrowing_enabled": true
//!     }
//!   ]
//! }
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::class::RequestClass;

/// Default acquisition wait: probe once, never wait.
const DEFAULT_ACQUISITION_TIMEOUT: Duration = Duration::ZERO;

/// Default in-flight ceiling per available CPU.
const DEFAULT_SLOTS_PER_CPU: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(
        "limiter {class}: guaranteed_slots ({guaranteed}) must not exceed total_slots ({total})"
    )]
    GuaranteedExceedsTotal {
        class: RequestClass,
        guaranteed: usize,
        total: usize,
    },
    #[error("limiter {0} is configured more than once")]
    DuplicateClass(RequestClass),
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid admission config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Configuration of one class limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimiterConfig {
    pub class: RequestClass,

    /// When false, every request of this class is admitted without a slot.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Slots reserved exclusively for this class. Defaults to half of `total_slots`.
    #[serde(default)]
    pub guaranteed_slots: Option<usize>,

    /// Maximum in-flight requests attributable to this class's pools.
    #[serde(default = "default_total_slots")]
    pub total_slots: usize,

    #[serde(default = "default_acquisition_timeout", with = "humantime_serde")]
    pub acquisition_timeout: Duration,

    /// Allow this class to borrow surplus slots from its siblings.
    #[serde(default)]
    pub borrowing_enabled: bool,
}

const fn default_enabled() -> bool {
    true
}

fn default_total_slots() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cpus * DEFAULT_SLOTS_PER_CPU
}

const fn default_acquisition_timeout() -> Duration {
    DEFAULT_ACQUISITION_TIMEOUT
}

impl LimiterConfig {
    /// Enabled limiter with explicit slot counts and no borrowing.
    pub fn new(
        class: impl Into<RequestClass>,
        guaranteed_slots: usize,
        total_slots: usize,
    ) -> Self {
        Self {
            class: class.into(),
            enabled: true,
            guaranteed_slots: Some(guaranteed_slots),
            total_slots,
            acquisition_timeout: DEFAULT_ACQUISITION_TIMEOUT,
            borrowing_enabled: false,
        }
    }

    pub fn with_acquisition_timeout(mut self, timeout: Duration) -> Self {
        self.acquisition_timeout = timeout;
        self
    }

    pub fn with_borrowing(mut self, enabled: bool) -> Self {
        self.borrowing_enabled = enabled;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn guaranteed_slots(&self) -> usize {
        self.guaranteed_slots.unwrap_or(self.total_slots / 2)
    }

    pub fn surplus_slots(&self) -> usize {
        self.total_slots.saturating_sub(self.guaranteed_slots())
    }

    /// Reject configurations that would need silent clamping.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let guaranteed = self.guaranteed_slots();
        if guaranteed > self.total_slots {
            return Err(ConfigError::GuaranteedExceedsTotal {
                class: self.class.clone(),
                guaranteed,
                total: self.total_slots,
            });
        }
        Ok(())
    }
}

/// All limiters for one node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdmissionConfig {
    #[serde(default)]
    pub limiters: Vec<LimiterConfig>,
}

impl AdmissionConfig {
    pub fn new(limiters: Vec<LimiterConfig>) -> Self {
        Self { limiters }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&json)
    }

    /// Validate every limiter and reject duplicate classes.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for limiter in &self.limiters {
            limiter.validate()?;
            if !seen.insert(&limiter.class) {
                return Err(ConfigError::DuplicateClass(limiter.class.clone()));
            }
        }
        Ok(())
    }
}
