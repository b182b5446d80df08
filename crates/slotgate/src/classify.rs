//! Request classification.
//!
//! The gate never inspects protocol details itself. A [`RequestClassifier`]
//! maps an inbound request to a [`RequestClass`], or to `None` for traffic
//! that should not be limited at all.

use axum::http::HeaderMap;

use crate::class::RequestClass;

/// Header naming the request class, e.g. `X-Request-Type: QUERY`.
pub const REQUEST_TYPE_HEADER: &str = "x-request-type";

/// Header naming where the request came from. Node-internal traffic
/// (`SERVER`) is never limited, so fan-out between nodes cannot deadlock on
/// the gate.
pub const REQUEST_CONTEXT_HEADER: &str = "x-request-context";

pub const SERVER_CONTEXT: &str = "SERVER";

pub trait RequestClassifier<R: ?Sized>: Send + Sync {
    fn classify(&self, request: &R) -> Option<RequestClass>;
}

impl<R, F> RequestClassifier<R> for F
where
    R: ?Sized,
    F: Fn(&R) -> Option<RequestClass> + Send + Sync,
{
    fn classify(&self, request: &R) -> Option<RequestClass> {
        self(request)
    }
}

/// Classifies HTTP requests by their type and context headers.
#[derive(Debug, Clone)]
pub struct HeaderClassifier {
    type_header: String,
    context_header: String,
}

impl Default for HeaderClassifier {
    fn default() -> Self {
        Self {
            type_header: REQUEST_TYPE_HEADER.to_string(),
            context_header: REQUEST_CONTEXT_HEADER.to_string(),
        }
    }
}

impl HeaderClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type_header(mut self, name: impl Into<String>) -> Self {
        self.type_header = name.into();
        self
    }

    pub fn with_context_header(mut self, name: impl Into<String>) -> Self {
        self.context_header = name.into();
        self
    }

    fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }
}

impl RequestClassifier<HeaderMap> for HeaderClassifier {
    fn classify(&self, headers: &HeaderMap) -> Option<RequestClass> {
        if Self::header(headers, &self.context_header)
            .is_some_and(|ctx| ctx.eq_ignore_ascii_case(SERVER_CONTEXT))
        {
            return None;
        }
        Self::header(headers, &self.type_header).map(RequestClass::new)
    }
}
