//! Transport layer for slotgate.
//!
//! Currently provides HTTP transport via axum: an admission middleware,
//! control routes and a server loop.

pub mod http;

pub use http::{ServerConfig, admission, router, routes, serve};
