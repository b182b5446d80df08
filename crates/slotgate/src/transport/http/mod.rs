//! HTTP transport.

mod middleware;
mod routes;
mod server;

pub use middleware::admission;
pub use routes::{HealthCheckResponse, HealthStatus, gate, router, routes};
pub use server::{ServerConfig, serve};
