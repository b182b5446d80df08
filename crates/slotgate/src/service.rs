//! AdmissionService: transport-agnostic gate state shared by the HTTP layer.
//!
//! This service owns:
//! - The limiter registry (swappable at runtime via `reconfigure`)
//! - The request classifier
//! - Outcome counters
//! - Shutdown coordination (cancels waiting admissions)
//!
//! Transports classify nothing themselves; they hand request headers to
//! `admit` and map the outcome onto their protocol.

use std::sync::Arc;

use axum::http::HeaderMap;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::class::RequestClass;
use crate::classify::{HeaderClassifier, RequestClassifier};
use crate::config::{AdmissionConfig, ConfigError};
use crate::limiter::{ClassLimiter, LimiterSnapshot};
use crate::observer::{AdmissionCounters, CounterSnapshot};
use crate::permit::{Rejected, Reservation};
use crate::registry::LimiterRegistry;
use crate::version::VersionInfo;

/// Limiter state plus the counters derived for it.
#[derive(Debug, Clone, Serialize)]
pub struct LimiterStatus {
    #[serde(flatten)]
    pub limiter: LimiterSnapshot,
    pub counters: CounterSnapshot,
}

/// Snapshot of gate health for transports to query.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub shutting_down: bool,
    pub limiters: Vec<LimiterSnapshot>,
    pub version: VersionInfo,
}

impl HealthSnapshot {
    /// BUSY: every enabled limiter is saturated.
    pub fn is_busy(&self) -> bool {
        let mut enabled = self.limiters.iter().filter(|l| l.enabled).peekable();
        enabled.peek().is_some() && enabled.all(LimiterSnapshot::is_saturated)
    }
}

pub struct AdmissionService {
    registry: Arc<LimiterRegistry>,
    classifier: Box<dyn RequestClassifier<HeaderMap>>,
    counters: AdmissionCounters,
    cancel: CancellationToken,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    version: VersionInfo,
}

impl AdmissionService {
    pub fn new(registry: Arc<LimiterRegistry>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            registry,
            classifier: Box::new(HeaderClassifier::default()),
            counters: AdmissionCounters::new(),
            cancel: CancellationToken::new(),
            shutdown_tx,
            shutdown_rx,
            version: VersionInfo::new(),
        }
    }

    pub fn from_config(config: &AdmissionConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(Arc::new(LimiterRegistry::from_config(config)?)))
    }

    pub fn with_classifier(
        mut self,
        classifier: impl RequestClassifier<HeaderMap> + 'static,
    ) -> Self {
        self.classifier = Box::new(classifier);
        self
    }

    pub fn with_version(mut self, version: VersionInfo) -> Self {
        self.version = version;
        self
    }

    pub fn registry(&self) -> &Arc<LimiterRegistry> {
        &self.registry
    }

    pub fn classify(&self, headers: &HeaderMap) -> Option<RequestClass> {
        self.classifier.classify(headers)
    }

    /// Classify and admit a request.
    ///
    /// Waits are cancelled when the service shuts down. Returns the class
    /// alongside the outcome so callers can report it.
    pub async fn admit(
        &self,
        headers: &HeaderMap,
    ) -> (Option<RequestClass>, Result<Reservation, Rejected>) {
        self.admit_class(self.classify(headers)).await
    }

    /// Admit a request that was already classified.
    pub async fn admit_class(
        &self,
        class: Option<RequestClass>,
    ) -> (Option<RequestClass>, Result<Reservation, Rejected>) {
        let outcome = self
            .registry
            .handle_class_cancellable(class.as_ref(), &self.cancel)
            .await;
        // Only classes with a limiter are counted; the class tag is client input.
        let managed = class
            .as_ref()
            .filter(|class| self.registry.get_limiter(class).is_some());
        self.counters.record(managed, &outcome);
        if let (Some(class), Err(rejected)) = (&class, &outcome) {
            tracing::warn!(%class, %rejected, "Request not admitted");
        }
        (class, outcome)
    }

    pub fn status(&self) -> Vec<LimiterStatus> {
        self.registry
            .snapshot()
            .into_iter()
            .map(|limiter| LimiterStatus {
                counters: self.counters.get(&limiter.class),
                limiter,
            })
            .collect()
    }

    pub fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            shutting_down: self.cancel.is_cancelled(),
            limiters: self.registry.snapshot(),
            version: self.version.clone(),
        }
    }

    /// Swap in a new configuration and retire the old limiters in the background.
    pub fn reconfigure(&self, config: &AdmissionConfig) -> Result<usize, ConfigError> {
        let retired = self.registry.reconfigure(config)?;
        self.counters.retain(&self.registry.classes());
        let count = retired.len();
        for limiter in retired {
            tokio::spawn(retire(limiter));
        }
        Ok(count)
    }

    pub fn trigger_shutdown(&self) {
        self.cancel.cancel();
        let _ = self.shutdown_tx.send(true);
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }
}

async fn retire(limiter: Arc<ClassLimiter>) {
    if !limiter.is_empty() {
        tracing::info!(class = %limiter.class(), "Waiting for retired limiter to drain");
        limiter.drained().await;
    }
    tracing::info!(class = %limiter.class(), "Retired limiter drained");
}
