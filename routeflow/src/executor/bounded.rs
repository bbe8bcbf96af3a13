//! Admission control in front of a scheduled pool.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::warn;

use super::{BoxTask, Executor, ExecutorExt, ScheduledHandle, ScheduledThreadPool, TaskHandle};
use crate::errors::{Result, RouteflowError};

/// A scheduler with an explicit maximum queue depth.
///
/// Every operation reads the live queue length of the wrapped pool first and
/// fails with `CapacityExceeded` when it is at or over the cap, instead of
/// accepting the work and rejecting it later.
///
/// ```rust,no_run
/// use routeflow::executor::{BoundedScheduler, ScheduledThreadPool};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let pool = Arc::new(ScheduledThreadPool::builder("redelivery").build()?);
/// let scheduler = BoundedScheduler::new(pool, 100);
/// scheduler.schedule_fn(|| println!("retry"), Duration::from_millis(250))?;
/// # Ok::<(), routeflow::RouteflowError>(())
/// ```
#[derive(Clone)]
pub struct BoundedScheduler {
    inner: Arc<ScheduledThreadPool>,
    max_queue_size: usize,
}

impl BoundedScheduler {
    /// Wraps a pool. A `max_queue_size` of 0 means unlimited.
    #[must_use]
    pub fn new(inner: Arc<ScheduledThreadPool>, max_queue_size: usize) -> Self {
        Self {
            inner,
            max_queue_size,
        }
    }

    /// Returns the configured maximum queue size (0 means unlimited).
    #[must_use]
    pub fn max_queue_size(&self) -> usize {
        self.max_queue_size
    }

    /// Returns how many more entries can be queued, or `None` when unlimited.
    #[must_use]
    pub fn remaining_capacity(&self) -> Option<usize> {
        (self.max_queue_size > 0).then(|| self.max_queue_size.saturating_sub(self.inner.queue_len()))
    }

    /// Returns the wrapped pool.
    #[must_use]
    pub fn inner(&self) -> &Arc<ScheduledThreadPool> {
        &self.inner
    }

    fn admit(&self) -> Result<()> {
        if self.max_queue_size == 0 {
            return Ok(());
        }
        let queue_size = self.inner.queue_len();
        if queue_size >= self.max_queue_size {
            warn!(
                executor = %self.inner.name(),
                queue_size,
                capacity = self.max_queue_size,
                "Task submission refused, queue at capacity"
            );
            return Err(RouteflowError::capacity_exceeded(
                self.inner.name(),
                queue_size,
                self.max_queue_size,
            ));
        }
        Ok(())
    }

    /// Runs `task` once after `delay`.
    ///
    /// # Errors
    ///
    /// `CapacityExceeded` when the queue is full, `Shutdown` once stopped.
    pub fn schedule(&self, task: BoxTask, delay: Duration) -> Result<ScheduledHandle> {
        self.admit()?;
        self.inner.schedule(task, delay)
    }

    /// Runs a closure once after `delay`.
    pub fn schedule_fn<F>(&self, f: F, delay: Duration) -> Result<ScheduledHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        self.admit()?;
        self.inner.schedule_fn(f, delay)
    }

    /// Runs `f` at a fixed rate.
    pub fn schedule_at_fixed_rate<F>(&self, f: F, initial_delay: Duration, period: Duration) -> Result<ScheduledHandle>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.admit()?;
        self.inner.schedule_at_fixed_rate(f, initial_delay, period)
    }

    /// Runs `f` with a fixed delay between runs.
    pub fn schedule_with_fixed_delay<F>(&self, f: F, initial_delay: Duration, delay: Duration) -> Result<ScheduledHandle>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.admit()?;
        self.inner.schedule_with_fixed_delay(f, initial_delay, delay)
    }

    /// Runs every closure and waits for all of them.
    ///
    /// Admission is checked once for the whole batch.
    pub fn invoke_all<T, F>(&self, tasks: Vec<F>) -> Result<Vec<Result<T>>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.admit()?;
        self.inner.invoke_all(tasks)
    }

    /// Runs every closure and returns the first success.
    ///
    /// Admission is checked once for the whole batch.
    pub fn invoke_any<T, E, F>(&self, tasks: Vec<F>) -> Result<T>
    where
        T: Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
        F: FnOnce() -> std::result::Result<T, E> + Send + 'static,
    {
        self.admit()?;
        self.inner.invoke_any(tasks)
    }

    /// Submits a closure and returns a handle to its result.
    pub fn submit<T, F>(&self, f: F) -> Result<TaskHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.admit()?;
        self.inner.submit(f)
    }

    /// Returns the number of worker threads of the wrapped pool.
    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.inner.pool_size()
    }

    /// Stops the wrapped pool.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    /// Stops the wrapped pool, notifying queued tasks that accept discard
    /// notification and returning the rest.
    pub fn shutdown_now(&self) -> Vec<BoxTask> {
        self.inner.shutdown_now()
    }

    /// Waits for the wrapped pool to terminate.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        self.inner.await_termination(timeout)
    }

    /// Returns true once the wrapped pool terminated.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.inner.is_terminated()
    }
}

impl Executor for BoundedScheduler {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn execute(&self, task: BoxTask) -> Result<()> {
        self.admit()?;
        self.inner.execute(task)
    }

    fn queue_len(&self) -> usize {
        self.inner.queue_len()
    }

    fn is_shutdown(&self) -> bool {
        self.inner.is_shutdown()
    }

    fn runtime(&self) -> Handle {
        self.inner.runtime()
    }
}

impl fmt::Debug for BoundedScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedScheduler")
            .field("name", &self.inner.name())
            .field("max_queue_size", &self.max_queue_size)
            .field("queue_len", &self.inner.queue_len())
            .finish()
    }
}
