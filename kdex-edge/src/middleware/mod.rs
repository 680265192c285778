//! The per-host middleware chain
//!
//! Outer to inner: error interceptor → auth → design sniffer → route-table
//! dispatch. Each layer is an `axum::middleware::from_fn_with_state`
//! function over the owning engine.

mod auth;
mod interceptor;
mod sniffer;

pub use auth::auth_middleware;
pub use interceptor::error_interceptor;
pub use sniffer::sniffer_middleware;
