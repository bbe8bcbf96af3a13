//! Executors with bounded queues and rejection policies.
//!
//! This module provides:
//! - The [`Task`] abstraction with an optional discard-notification capability
//! - [`RejectionPolicy`] strategies applied when a queue is full
//! - [`ThreadPoolExecutor`], a fixed pool over a bounded FIFO queue
//! - [`ScheduledThreadPool`], a delay-queue pool for one-shot and periodic work
//! - [`BoundedScheduler`], admission control in front of a scheduled pool

mod bounded;
mod handle;
mod rejection;
mod scheduled;
mod thread_pool;

use handle::completion;

pub use bounded::BoundedScheduler;
pub use handle::TaskHandle;
pub use rejection::{RejectionOutcome, RejectionPolicy, RejectionTarget};
pub use scheduled::{ScheduledHandle, ScheduledThreadPool, ScheduledThreadPoolBuilder};
pub use thread_pool::{ThreadPoolExecutor, ThreadPoolExecutorBuilder};

use crate::context::CapturedContext;
use crate::errors::{panic_message, Result, RouteflowError};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::watch;
use tracing::warn;

/// A unit of schedulable work.
pub trait Task: Send + 'static {
    /// Runs the task, consuming it.
    fn run(self: Box<Self>);

    /// Returns the discard-notification capability, if this task has one.
    fn as_rejectable(&mut self) -> Option<&mut dyn Rejectable> {
        None
    }
}

/// Capability of a task that wants to know when it is discarded.
pub trait Rejectable {
    /// Called instead of [`Task::run`] when the task will never run.
    fn reject(&mut self);
}

/// A boxed task.
pub type BoxTask = Box<dyn Task>;

/// A task backed by a closure, without discard notification.
pub struct FnTask<F>(F);

impl<F> Task for FnTask<F>
where
    F: FnOnce() + Send + 'static,
{
    fn run(self: Box<Self>) {
        let Self(f) = *self;
        f();
    }
}

/// Boxes a closure as a task.
pub fn task<F>(f: F) -> BoxTask
where
    F: FnOnce() + Send + 'static,
{
    Box::new(FnTask(f))
}

/// A closure task that is notified when discarded.
pub struct RejectableTask {
    run: Box<dyn FnOnce() + Send>,
    on_reject: Option<Box<dyn FnOnce() + Send>>,
}

impl RejectableTask {
    /// Creates a task with a discard callback.
    pub fn new<F, R>(run: F, on_reject: R) -> Self
    where
        F: FnOnce() + Send + 'static,
        R: FnOnce() + Send + 'static,
    {
        Self {
            run: Box::new(run),
            on_reject: Some(Box::new(on_reject)),
        }
    }

    /// Boxes this task.
    #[must_use]
    pub fn boxed(self) -> BoxTask {
        Box::new(self)
    }
}

impl Task for RejectableTask {
    fn run(self: Box<Self>) {
        let this = *self;
        (this.run)();
    }

    fn as_rejectable(&mut self) -> Option<&mut dyn Rejectable> {
        Some(self)
    }
}

impl Rejectable for RejectableTask {
    fn reject(&mut self) {
        if let Some(on_reject) = self.on_reject.take() {
            on_reject();
        }
    }
}

impl fmt::Debug for RejectableTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RejectableTask")
            .field("notified", &self.on_reject.is_none())
            .finish()
    }
}

/// Runs a task on the submitter's captured context.
///
/// The discard capability of the wrapped task is preserved.
pub(crate) struct ContextualTask {
    context: CapturedContext,
    inner: BoxTask,
}

impl ContextualTask {
    pub(crate) fn wrap(inner: BoxTask) -> BoxTask {
        Box::new(Self {
            context: CapturedContext::capture(),
            inner,
        })
    }
}

impl Task for ContextualTask {
    fn run(self: Box<Self>) {
        let Self { context, inner } = *self;
        context.scope(move || inner.run());
    }

    fn as_rejectable(&mut self) -> Option<&mut dyn Rejectable> {
        self.inner.as_rejectable()
    }
}

/// Runs a task on a worker, containing panics.
pub(crate) fn run_guarded(executor: &str, task: BoxTask) {
    if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || task.run())) {
        warn!(
            executor = %executor,
            panic = %panic_message(payload.as_ref()),
            "Task panicked on worker thread"
        );
    }
}

/// Starts the runtime behind a pool: one async worker for timers and
/// bookkeeping, and a blocking pool sized for the task workers.
pub(crate) fn build_runtime(thread_name_prefix: &str, pool_size: usize) -> Result<Runtime> {
    let prefix = thread_name_prefix.to_string();
    let next_index = AtomicUsize::new(0);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .max_blocking_threads(pool_size.max(1))
        .thread_name_fn(move || format!("{prefix}-{}", next_index.fetch_add(1, Ordering::Relaxed)))
        .enable_time()
        .build()?;
    Ok(runtime)
}

/// Blocks until `flag` turns true or `timeout` elapses.
pub(crate) fn await_flag(runtime: &Handle, mut flag: watch::Receiver<bool>, timeout: Duration) -> bool {
    runtime.block_on(async move {
        let reached = matches!(tokio::time::timeout(timeout, flag.wait_for(|set| *set)).await, Ok(Ok(_)));
        reached
    })
}

/// Notifies every task that accepts discard notification and returns the
/// rest.
pub(crate) fn notify_or_return(tasks: Vec<BoxTask>) -> Vec<BoxTask> {
    tasks
        .into_iter()
        .filter_map(|mut task| {
            let notified = match task.as_rejectable() {
                Some(rejectable) => {
                    rejectable.reject();
                    true
                }
                None => false,
            };
            (!notified).then_some(task)
        })
        .collect()
}

/// An executor that accepts tasks.
pub trait Executor: Send + Sync {
    /// Returns the executor name.
    fn name(&self) -> &str;

    /// Submits a task for execution.
    ///
    /// # Errors
    ///
    /// Returns an error if the task is refused and the rejection policy
    /// surfaces the refusal to the caller.
    fn execute(&self, task: BoxTask) -> Result<()>;

    /// Returns the number of queued tasks not yet started.
    fn queue_len(&self) -> usize;

    /// Returns true once shutdown has been requested.
    fn is_shutdown(&self) -> bool;

    /// Returns the tokio runtime that drives this executor.
    fn runtime(&self) -> Handle;
}

/// Convenience operations available on every executor.
pub trait ExecutorExt: Executor {
    /// Submits a closure.
    fn execute_fn<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.execute(task(f))
    }

    /// Submits a closure and returns a handle to its result.
    ///
    /// If the task is discarded by the rejection policy, the handle resolves
    /// to a `Rejected` error.
    fn submit<T, F>(&self, f: F) -> Result<TaskHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (completer, handle) = completion(self.runtime());
        let on_reject = completer.clone();
        let executor = self.name().to_string();

        let task = RejectableTask::new(
            move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f))
                    .map_err(|payload| RouteflowError::TaskPanicked(panic_message(payload.as_ref())));
                completer.complete(outcome);
            },
            move || {
                on_reject.complete(Err(RouteflowError::rejected(executor, "task discarded")));
            },
        );

        self.execute(task.boxed())?;
        Ok(handle)
    }

    /// Runs every closure and waits for all of them.
    ///
    /// Results are returned in submission order.
    fn invoke_all<T, F>(&self, tasks: Vec<F>) -> Result<Vec<Result<T>>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let handles = tasks
            .into_iter()
            .map(|f| self.submit(f))
            .collect::<Result<Vec<_>>>()?;

        Ok(handles.into_iter().map(TaskHandle::join).collect())
    }

    /// Runs every closure and returns the first successful result.
    ///
    /// A closure discarded by the rejection policy counts as a failure, so
    /// the call returns once every closure either ran or was discarded.
    ///
    /// # Errors
    ///
    /// Returns the last failure if every closure failed.
    fn invoke_any<T, E, F>(&self, tasks: Vec<F>) -> Result<T>
    where
        T: Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
        F: FnOnce() -> std::result::Result<T, E> + Send + 'static,
    {
        if tasks.is_empty() {
            return Err(RouteflowError::rejected(self.name(), "invoke_any requires at least one task"));
        }

        let (completer, handle) = completion::<T>(self.runtime());
        let remaining = Arc::new(AtomicUsize::new(tasks.len()));

        for f in tasks {
            let (on_run, on_reject) = (completer.clone(), completer.clone());
            let (run_left, reject_left) = (Arc::clone(&remaining), Arc::clone(&remaining));
            let executor = self.name().to_string();

            let task = RejectableTask::new(
                move || {
                    if on_run.is_complete() {
                        return;
                    }
                    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));
                    let last = run_left.fetch_sub(1, Ordering::AcqRel) == 1;
                    match outcome {
                        Ok(Ok(value)) => {
                            on_run.complete(Ok(value));
                        }
                        Ok(Err(err)) if last => {
                            on_run.complete(Err(RouteflowError::Stage(err.into())));
                        }
                        Err(payload) if last => {
                            on_run.complete(Err(RouteflowError::TaskPanicked(panic_message(payload.as_ref()))));
                        }
                        _ => {}
                    }
                },
                move || {
                    if reject_left.fetch_sub(1, Ordering::AcqRel) == 1 {
                        on_reject.complete(Err(RouteflowError::rejected(executor, "every task was discarded or failed")));
                    }
                },
            );
            self.execute(task.boxed())?;
        }
        drop(completer);

        handle.join()
    }
}

impl<E: Executor + ?Sized> ExecutorExt for E {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_fn_task_has_no_rejectable_capability() {
        let mut t = task(|| {});
        assert!(t.as_rejectable().is_none());
    }

    #[test]
    fn test_rejectable_task_notifies_once() {
        let notified = Arc::new(AtomicUsize::new(0));
        let n = Arc::clone(&notified);
        let mut t = RejectableTask::new(|| {}, move || {
            n.fetch_add(1, Ordering::SeqCst);
        })
        .boxed();

        let r = t.as_rejectable().unwrap();
        r.reject();
        r.reject();

        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_contextual_task_preserves_capability() {
        let mut t = ContextualTask::wrap(RejectableTask::new(|| {}, || {}).boxed());
        assert!(t.as_rejectable().is_some());

        let mut plain = ContextualTask::wrap(task(|| {}));
        assert!(plain.as_rejectable().is_none());
    }

    #[test]
    fn test_run_guarded_contains_panic() {
        let ran = Arc::new(AtomicBool::new(false));
        let r = Arc::clone(&ran);
        run_guarded("test", task(move || {
            r.store(true, Ordering::SeqCst);
            panic!("worker failure");
        }));
        assert!(ran.load(Ordering::SeqCst));
    }
}
