//! Configuration structs for pools and error handlers.
//!
//! Every struct derives `serde` so an embedding application can load it
//! from whatever format it uses.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::errors::Result;
use crate::executor::{BoundedScheduler, RejectionPolicy, ScheduledThreadPool, ThreadPoolExecutor};
use crate::redelivery::RedeliveryPolicy;

/// Sizing and policy of an executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadPoolProfile {
    /// Pool name, also the default thread name prefix.
    pub name: String,
    /// Number of worker threads.
    pub pool_size: usize,
    /// Maximum queued tasks; 0 means unlimited.
    pub max_queue_size: usize,
    /// What happens to a task that does not fit.
    pub rejection_policy: RejectionPolicy,
    /// Re-bind the submitter's context on the worker.
    pub propagate_context: bool,
    /// Worker thread name prefix.
    pub thread_name_prefix: Option<String>,
}

impl Default for ThreadPoolProfile {
    fn default() -> Self {
        Self {
            name: "routeflow".to_string(),
            pool_size: 10,
            max_queue_size: 1000,
            rejection_policy: RejectionPolicy::CallerRuns,
            propagate_context: true,
            thread_name_prefix: None,
        }
    }
}

impl ThreadPoolProfile {
    /// Creates the default profile under `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets the pool size.
    #[must_use]
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Sets the queue cap.
    #[must_use]
    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    /// Sets the rejection policy.
    #[must_use]
    pub fn with_rejection_policy(mut self, policy: RejectionPolicy) -> Self {
        self.rejection_policy = policy;
        self
    }

    /// Sets context propagation.
    #[must_use]
    pub fn with_propagate_context(mut self, propagate: bool) -> Self {
        self.propagate_context = propagate;
        self
    }

    /// Builds a fixed thread pool.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the pool runtime cannot be started.
    pub fn build_thread_pool(&self) -> Result<ThreadPoolExecutor> {
        let mut builder = ThreadPoolExecutor::builder(&self.name)
            .pool_size(self.pool_size)
            .max_queue_size(self.max_queue_size)
            .rejection_policy(self.rejection_policy)
            .propagate_context(self.propagate_context);
        if let Some(prefix) = &self.thread_name_prefix {
            builder = builder.thread_name_prefix(prefix);
        }
        builder.build()
    }

    /// Builds a scheduled pool. The queue cap does not apply to it; the
    /// rejection policy handles submissions refused after shutdown.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the pool runtime cannot be started.
    pub fn build_scheduled_pool(&self) -> Result<ScheduledThreadPool> {
        let mut builder = ScheduledThreadPool::builder(&self.name)
            .pool_size(self.pool_size)
            .rejection_policy(self.rejection_policy)
            .propagate_context(self.propagate_context);
        if let Some(prefix) = &self.thread_name_prefix {
            builder = builder.thread_name_prefix(prefix);
        }
        builder.build()
    }

    /// Builds a scheduled pool gated by `max_queue_size`.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the pool runtime cannot be started.
    pub fn build_bounded_scheduler(&self) -> Result<BoundedScheduler> {
        let pool = self.build_scheduled_pool()?;
        Ok(BoundedScheduler::new(Arc::new(pool), self.max_queue_size))
    }
}

/// Non-closure settings of a redelivery error handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorHandlerConfig {
    /// The redelivery policy.
    pub redelivery: RedeliveryPolicy,
    /// Restore the original body and headers before terminal dispatch.
    pub use_original_message: bool,
    /// Swallow a failure raised by the terminal sink.
    pub handle_new_exception: bool,
}

impl Default for ErrorHandlerConfig {
    fn default() -> Self {
        Self {
            redelivery: RedeliveryPolicy::default(),
            use_original_message: false,
            handle_new_exception: true,
        }
    }
}

impl ErrorHandlerConfig {
    /// Creates a config around `redelivery`.
    #[must_use]
    pub fn new(redelivery: RedeliveryPolicy) -> Self {
        Self {
            redelivery,
            ..Self::default()
        }
    }
}
