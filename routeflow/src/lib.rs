//! # Routeflow
//!
//! The execution and failure-recovery core of a message-routing pipeline.
//!
//! Routeflow provides:
//!
//! - **Executors**: fixed and scheduled thread pools with pluggable rejection
//!   policies, plus a scheduler that refuses work beyond a queue cap
//! - **Context propagation**: thread-scoped bindings that follow work onto
//!   worker threads
//! - **Completion collectors**: batches of closures whose results come back
//!   in completion or submission order
//! - **Await manager**: lets a synchronous caller block on a stage that
//!   completes on another thread, with interruption and statistics
//! - **Redelivery**: a retry state machine with back-off, async delays and a
//!   terminal failure sink
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use routeflow::prelude::*;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), RouteflowError> {
//! let charge = ProcessorStage::from_fn("charge", |uow| {
//!     uow.set_header("charged", serde_json::json!(true));
//!     Ok(())
//! });
//!
//! let dlq = Arc::new(DeadLetterQueue::new("payments.dlq"));
//! let handler = RedeliveryErrorHandler::builder("payments", charge)
//!     .policy(RedeliveryPolicy::new(3))
//!     .failure_sink(dlq.clone())
//!     .build()?;
//!
//! let manager = AwaitManager::new();
//! let uow = manager.await_stage(&handler, UnitOfWork::new(serde_json::json!({"amount": 42})))?;
//! assert!(!uow.is_failed());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod bridge;
pub mod collector;
pub mod config;
pub mod context;
pub mod core;
pub mod errors;
pub mod executor;
pub mod observability;
pub mod pipeline;
pub mod redelivery;
pub mod stages;
pub mod testing;
pub mod utils;

pub use errors::{ErrorKind, Result, RouteflowError};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::bridge::{AwaitManager, AwaitStatistics};
    pub use crate::collector::{Completion, CompletionCollector, CompletionTicket, OrderedCollector, UnorderedCollector};
    pub use crate::config::{ErrorHandlerConfig, ThreadPoolProfile};
    pub use crate::context::{CapturedContext, ContextCell, ContextKey};
    pub use crate::core::{UnitOfWork, UnitOfWorkId};
    pub use crate::errors::{ErrorKind, RouteflowError};
    pub use crate::executor::{
        BoundedScheduler, Executor, ExecutorExt, RejectionPolicy, ScheduledThreadPool, ThreadPoolExecutor,
    };
    pub use crate::observability::{init_logging, LogFormat};
    pub use crate::pipeline::{AggregationStrategy, Multicast};
    pub use crate::redelivery::{
        DeadLetterQueue, FailureSink, LoggingFailureSink, RedeliveryErrorHandler, RedeliveryPolicy,
    };
    pub use crate::stages::{done_callback, DoneCallback, OffloadStage, ProcessorStage, Stage};
}
