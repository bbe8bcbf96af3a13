//! Context propagation across thread hops.
//!
//! This module provides:
//! - Scoped bindings restored on every exit path
//! - Mutable thread-scoped cells
//! - Capture/re-bind of all bindings when work moves to another thread

mod binding;
mod propagation;

pub use binding::{ContextCell, ContextKey};
pub use propagation::CapturedContext;

/// Route identifier bound while a stage runs.
pub static ROUTE_ID: ContextKey<String> = ContextKey::new("routeflow.route_id");

/// Correlation identifier bound while a unit of work is routed.
pub static CORRELATION_ID: ContextKey<String> = ContextKey::new("routeflow.correlation_id");
