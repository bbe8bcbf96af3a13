//! Fixed-size pool over a bounded FIFO queue, run on tokio's blocking pool.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::{run_guarded, BoxTask, ContextualTask, Executor, RejectionOutcome, RejectionPolicy, RejectionTarget};
use crate::errors::Result;

struct PoolState {
    queue: VecDeque<BoxTask>,
    shutdown: bool,
    /// Drain loops currently holding a blocking thread.
    workers: usize,
}

struct PoolShared {
    name: String,
    pool_size: usize,
    max_queue_size: usize,
    policy: RejectionPolicy,
    propagate_context: bool,
    runtime: Handle,
    state: Mutex<PoolState>,
    terminated: watch::Sender<bool>,
    active: AtomicUsize,
    completed: AtomicU64,
    rejected: AtomicU64,
}

impl PoolShared {
    fn is_full(&self, state: &PoolState) -> bool {
        self.max_queue_size > 0 && state.queue.len() >= self.max_queue_size
    }

    /// Hands `task` to an idle worker slot or queues it. The caller has
    /// already checked shutdown and capacity.
    fn enqueue(self: &Arc<Self>, mut state: parking_lot::MutexGuard<'_, PoolState>, task: BoxTask) {
        if state.workers < self.pool_size {
            state.workers += 1;
            drop(state);
            let shared = Arc::clone(self);
            self.runtime.spawn_blocking(move || shared.drain(task));
        } else {
            state.queue.push_back(task);
        }
    }

    fn drain(&self, first: BoxTask) {
        let mut next = Some(first);
        while let Some(task) = next {
            self.active.fetch_add(1, Ordering::SeqCst);
            run_guarded(&self.name, task);
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.completed.fetch_add(1, Ordering::Relaxed);

            let mut state = self.state.lock();
            next = state.queue.pop_front();
            if next.is_none() {
                state.workers -= 1;
                self.signal_if_terminated(&state);
            }
        }
    }

    fn signal_if_terminated(&self, state: &PoolState) {
        if state.shutdown && state.workers == 0 && !*self.terminated.borrow() {
            debug!(executor = %self.name, "Thread pool terminated");
            self.terminated.send_replace(true);
        }
    }
}

impl RejectionTarget for Arc<PoolShared> {
    fn target_name(&self) -> &str {
        &self.name
    }

    fn is_shutting_down(&self) -> bool {
        self.state.lock().shutdown
    }

    fn evict_oldest_and_offer(&self, task: BoxTask) -> std::result::Result<Option<BoxTask>, BoxTask> {
        let mut state = self.state.lock();
        if state.shutdown {
            return Err(task);
        }
        let evicted = if self.is_full(&state) {
            state.queue.pop_front()
        } else {
            None
        };
        if self.is_full(&state) {
            return Err(task);
        }
        self.enqueue(state, task);
        Ok(evicted)
    }
}

/// A fixed pool of workers consuming a bounded FIFO queue.
///
/// Workers are drain loops on the blocking pool of a dedicated tokio
/// runtime; at most `pool_size` run at once and each keeps taking queued
/// tasks until the queue is empty. When the queue is full, or the pool is
/// shut down, the configured [`RejectionPolicy`] decides what happens to the
/// submitted task.
pub struct ThreadPoolExecutor {
    shared: Arc<PoolShared>,
    runtime: Option<Runtime>,
}

impl ThreadPoolExecutor {
    /// Creates a builder.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> ThreadPoolExecutorBuilder {
        ThreadPoolExecutorBuilder::new(name)
    }

    /// Returns the number of workers.
    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.shared.pool_size
    }

    /// Returns the maximum queue size (0 means unbounded).
    #[must_use]
    pub fn max_queue_size(&self) -> usize {
        self.shared.max_queue_size
    }

    /// Returns the rejection policy.
    #[must_use]
    pub fn rejection_policy(&self) -> RejectionPolicy {
        self.shared.policy
    }

    /// Returns the number of tasks currently running.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Returns the number of tasks that finished running.
    #[must_use]
    pub fn completed_count(&self) -> u64 {
        self.shared.completed.load(Ordering::Relaxed)
    }

    /// Returns the number of submissions handed to the rejection policy.
    #[must_use]
    pub fn rejected_count(&self) -> u64 {
        self.shared.rejected.load(Ordering::Relaxed)
    }

    /// Submits a task and reports which rejection outcome, if any, applied.
    ///
    /// Returns `None` when the task was accepted normally.
    pub fn execute_with_outcome(&self, task: BoxTask) -> Result<Option<RejectionOutcome>> {
        let task = if self.shared.propagate_context {
            ContextualTask::wrap(task)
        } else {
            task
        };

        let state = self.shared.state.lock();
        if !state.shutdown && !self.shared.is_full(&state) {
            self.shared.enqueue(state, task);
            return Ok(None);
        }

        if state.shutdown {
            debug!(executor = %self.shared.name, "Task submitted after shutdown");
        } else {
            warn!(
                executor = %self.shared.name,
                queue_size = state.queue.len(),
                policy = ?self.shared.policy,
                "Queue full, applying rejection policy"
            );
        }
        drop(state);
        self.shared.rejected.fetch_add(1, Ordering::Relaxed);
        self.shared.policy.reject(task, &self.shared).map(Some)
    }

    /// Stops accepting tasks; queued tasks still run.
    pub fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        if !state.shutdown {
            state.shutdown = true;
            debug!(executor = %self.shared.name, queued = state.queue.len(), "Thread pool shutting down");
        }
        self.shared.signal_if_terminated(&state);
    }

    /// Stops accepting tasks and removes the tasks that never started.
    ///
    /// Removed tasks that accept discard notification are notified; the
    /// others are returned to the caller.
    pub fn shutdown_now(&self) -> Vec<BoxTask> {
        let drained: Vec<BoxTask> = {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            self.shared.signal_if_terminated(&state);
            state.queue.drain(..).collect()
        };
        debug!(executor = %self.shared.name, drained = drained.len(), "Thread pool stopped");
        super::notify_or_return(drained)
    }

    /// Returns true once shut down with no worker left running.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        *self.shared.terminated.borrow()
    }

    /// Waits for the workers to finish after shutdown.
    ///
    /// Returns true if the pool terminated within the timeout.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        super::await_flag(&self.shared.runtime, self.shared.terminated.subscribe(), timeout)
    }
}

impl Executor for ThreadPoolExecutor {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn execute(&self, task: BoxTask) -> Result<()> {
        self.execute_with_outcome(task).map(|_| ())
    }

    fn queue_len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    fn is_shutdown(&self) -> bool {
        self.shared.state.lock().shutdown
    }

    fn runtime(&self) -> Handle {
        self.shared.runtime.clone()
    }
}

impl Drop for ThreadPoolExecutor {
    fn drop(&mut self) {
        self.shutdown();
        // Running drain loops finish on their own; nothing waits for them.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl fmt::Debug for ThreadPoolExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPoolExecutor")
            .field("name", &self.shared.name)
            .field("pool_size", &self.shared.pool_size)
            .field("max_queue_size", &self.shared.max_queue_size)
            .field("queue_len", &self.queue_len())
            .field("active", &self.active_count())
            .finish()
    }
}

/// Builder for [`ThreadPoolExecutor`].
#[derive(Debug, Clone)]
pub struct ThreadPoolExecutorBuilder {
    name: String,
    pool_size: usize,
    max_queue_size: usize,
    policy: RejectionPolicy,
    propagate_context: bool,
    thread_name_prefix: Option<String>,
}

impl ThreadPoolExecutorBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pool_size: 10,
            max_queue_size: 1000,
            policy: RejectionPolicy::default(),
            propagate_context: false,
            thread_name_prefix: None,
        }
    }

    /// Sets the number of workers (at least one).
    #[must_use]
    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = size.max(1);
        self
    }

    /// Sets the maximum queue size (0 means unbounded).
    #[must_use]
    pub fn max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    /// Sets the rejection policy.
    #[must_use]
    pub fn rejection_policy(mut self, policy: RejectionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Captures the submitter's context bindings for every task.
    #[must_use]
    pub fn propagate_context(mut self, propagate: bool) -> Self {
        self.propagate_context = propagate;
        self
    }

    /// Sets the worker thread name prefix.
    #[must_use]
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = Some(prefix.into());
        self
    }

    /// Starts the runtime backing the pool.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the runtime cannot be started.
    pub fn build(self) -> Result<ThreadPoolExecutor> {
        let prefix = self.thread_name_prefix.clone().unwrap_or_else(|| self.name.clone());
        let runtime = super::build_runtime(&prefix, self.pool_size)?;
        let (terminated, _) = watch::channel(false);

        let shared = Arc::new(PoolShared {
            name: self.name,
            pool_size: self.pool_size,
            max_queue_size: self.max_queue_size,
            policy: self.policy,
            propagate_context: self.propagate_context,
            runtime: runtime.handle().clone(),
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                shutdown: false,
                workers: 0,
            }),
            terminated,
            active: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        });

        Ok(ThreadPoolExecutor {
            shared,
            runtime: Some(runtime),
        })
    }
}
