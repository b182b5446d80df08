//! Limiter registry: class → limiter map, dispatch, and reconfiguration.
//!
//! The registry is explicit state created at server start and shared by
//! `Arc`. Entries can be replaced at any time. A replaced limiter is simply
//! unmapped: reservations already drawn from it keep their pool and release
//! into it, and [`ClassLimiter::drained`] tells reconfiguration tooling when
//! it can be discarded.

use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::class::RequestClass;
use crate::classify::RequestClassifier;
use crate::config::{AdmissionConfig, ConfigError, LimiterConfig};
use crate::limiter::{ClassLimiter, LimiterSnapshot};
use crate::permit::{Rejected, Reservation};

#[derive(Debug, Default)]
pub struct LimiterRegistry {
    limiters: DashMap<RequestClass, Arc<ClassLimiter>>,
}

impl LimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry with one limiter per configured class.
    pub fn from_config(config: &AdmissionConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let registry = Self::new();
        for limiter in &config.limiters {
            registry.register_limiter(limiter.clone())?;
        }
        Ok(registry)
    }

    /// Build and install a limiter for `config.class`.
    ///
    /// Returns the limiter it replaced, if any. The old instance is not
    /// drained or cancelled.
    pub fn register_limiter(
        &self,
        config: LimiterConfig,
    ) -> Result<Option<Arc<ClassLimiter>>, ConfigError> {
        let limiter = ClassLimiter::new(config)?;
        Ok(self.register(Arc::new(limiter)))
    }

    /// Install a pre-built limiter under its own class.
    pub fn register(&self, limiter: Arc<ClassLimiter>) -> Option<Arc<ClassLimiter>> {
        let class = limiter.class().clone();
        tracing::info!(
            %class,
            enabled = limiter.is_enabled(),
            guaranteed = limiter.config().guaranteed_slots(),
            total = limiter.config().total_slots,
            borrowing = limiter.config().borrowing_enabled,
            "Registered limiter"
        );
        self.limiters.insert(class, limiter)
    }

    pub fn get_limiter(&self, class: &RequestClass) -> Option<Arc<ClassLimiter>> {
        self.limiters.get(class).map(|entry| Arc::clone(entry.value()))
    }

    /// Unmap a class. Its traffic becomes unrestricted.
    pub fn remove_limiter(&self, class: &RequestClass) -> Option<Arc<ClassLimiter>> {
        self.limiters.remove(class).map(|(_, limiter)| limiter)
    }

    /// Whether nothing is held against the limiter for `class`.
    ///
    /// An unmanaged class holds nothing.
    pub fn is_empty(&self, class: &RequestClass) -> bool {
        self.get_limiter(class).is_none_or(|l| l.is_empty())
    }

    pub fn classes(&self) -> Vec<RequestClass> {
        let mut classes: Vec<_> = self.limiters.iter().map(|e| e.key().clone()).collect();
        classes.sort();
        classes
    }

    /// Every registered limiter except the one for `class`.
    pub fn siblings_of(&self, class: &RequestClass) -> Vec<Arc<ClassLimiter>> {
        self.limiters
            .iter()
            .filter(|entry| entry.key() != class)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn snapshot(&self) -> Vec<LimiterSnapshot> {
        let mut snapshots: Vec<_> = self.limiters.iter().map(|e| e.value().snapshot()).collect();
        snapshots.sort_by(|a, b| a.class.cmp(&b.class));
        snapshots
    }

    /// Classify `request` and admit it.
    ///
    /// Unclassified traffic and classes without a limiter are admitted with an
    /// unlimited reservation.
    pub async fn handle_request<R: ?Sized>(
        &self,
        classifier: &dyn RequestClassifier<R>,
        request: &R,
    ) -> Result<Reservation, Rejected> {
        let class = classifier.classify(request);
        self.dispatch(class.as_ref(), None).await
    }

    pub async fn handle_request_cancellable<R: ?Sized>(
        &self,
        classifier: &dyn RequestClassifier<R>,
        request: &R,
        cancel: &CancellationToken,
    ) -> Result<Reservation, Rejected> {
        let class = classifier.classify(request);
        self.dispatch(class.as_ref(), Some(cancel)).await
    }

    /// Admit a request whose class is already known.
    pub async fn handle_class(
        &self,
        class: Option<&RequestClass>,
    ) -> Result<Reservation, Rejected> {
        self.dispatch(class, None).await
    }

    pub async fn handle_class_cancellable(
        &self,
        class: Option<&RequestClass>,
        cancel: &CancellationToken,
    ) -> Result<Reservation, Rejected> {
        self.dispatch(class, Some(cancel)).await
    }

    async fn dispatch(
        &self,
        class: Option<&RequestClass>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Reservation, Rejected> {
        let Some(class) = class else {
            return Ok(Reservation::unlimited());
        };
        let Some(limiter) = self.get_limiter(class) else {
            tracing::trace!(%class, "No limiter registered, passing through");
            return Ok(Reservation::unlimited());
        };

        // Snapshot siblings up front; no map guard may be held across the wait.
        let siblings = if limiter.config().borrowing_enabled {
            self.siblings_of(class)
        } else {
            Vec::new()
        };

        match cancel {
            Some(token) => limiter.handle_request_cancellable(&siblings, token).await,
            None => limiter.handle_request(&siblings).await,
        }
    }

    /// Apply a new configuration to every class at once.
    ///
    /// The whole configuration is validated before anything changes. Every
    /// configured class gets a fresh limiter and classes no longer configured
    /// are removed. Returns the retired limiters so the caller can wait for
    /// them to drain.
    pub fn reconfigure(
        &self,
        config: &AdmissionConfig,
    ) -> Result<Vec<Arc<ClassLimiter>>, ConfigError> {
        config.validate()?;
        let fresh = config
            .limiters
            .iter()
            .cloned()
            .map(ClassLimiter::new)
            .collect::<Result<Vec<_>, _>>()?;

        let mut retired: Vec<Arc<ClassLimiter>> = Vec::new();
        let keep: Vec<RequestClass> = fresh.iter().map(|l| l.class().clone()).collect();

        for limiter in fresh {
            retired.extend(self.register(Arc::new(limiter)));
        }

        let stale: Vec<RequestClass> = self
            .limiters
            .iter()
            .map(|e| e.key().clone())
            .filter(|class| !keep.contains(class))
            .collect();
        for class in stale {
            if let Some(limiter) = self.remove_limiter(&class) {
                tracing::info!(%class, "Removed limiter");
                retired.push(limiter);
            }
        }

        tracing::info!(
            classes = keep.len(),
            retired = retired.len(),
            "Applied admission config"
        );
        Ok(retired)
    }
}
