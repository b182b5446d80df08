//! Version information for slotgate.

/// Slotgate version from Cargo.toml
pub const SLOTGATE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version information reported by the health check.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    /// Slotgate library version.
    pub slotgate: &'static str,
    /// Version of the service embedding the gate (if set).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            slotgate: SLOTGATE_VERSION,
            service: None,
        }
    }
}

impl VersionInfo {
    /// Create version info with the slotgate version only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the embedding service's version.
    pub fn with_service(mut self, version: impl Into<String>) -> Self {
        self.service = Some(version.into());
        self
    }
}
