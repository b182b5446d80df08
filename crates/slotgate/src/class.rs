//! Request class tags.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Identifies a traffic category such as `QUERY` or `UPDATE`.
///
/// The set of classes is defined by the deployment. Tags are compared
/// case-insensitively: they are normalised to ASCII upper case on creation.
/// Cloning is cheap (shared string).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct RequestClass(Arc<str>);

impl RequestClass {
    pub fn new(tag: impl AsRef<str>) -> Self {
        Self(Arc::from(tag.as_ref().trim().to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RequestClass {
    fn from(tag: String) -> Self {
        Self::new(tag)
    }
}

impl From<&str> for RequestClass {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

impl From<RequestClass> for String {
    fn from(class: RequestClass) -> Self {
        class.0.to_string()
    }
}

impl std::fmt::Display for RequestClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
