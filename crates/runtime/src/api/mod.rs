//! HTTP surface: axum router, middleware, SSE streaming, OpenAPI docs.

pub mod middleware;
pub mod routes;
pub mod server;
pub mod sse;
pub mod types;

pub use server::{HttpApiConfig, HttpApiServer};
pub use types::AppState;
