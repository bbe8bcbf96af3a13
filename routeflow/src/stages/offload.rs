//! Stage that runs a processor on an executor.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::{run_processor, DoneCallback, Processor, Stage};
use crate::core::UnitOfWork;
use crate::errors::RouteflowError;
use crate::executor::{ContextualTask, Executor, RejectableTask};

type Pending = Arc<Mutex<Option<(UnitOfWork, DoneCallback)>>>;

/// A stage that runs its processor off the calling thread.
///
/// `invoke` returns false as soon as the work is queued. If the executor
/// refuses or discards the work, the refusal is recorded as the unit of
/// work's failure and `done` is still called. When `done` already ran on
/// the invoking thread, because the executor ran the work on the caller or
/// discarded it there, `invoke` returns true.
pub struct OffloadStage {
    name: String,
    processor: Arc<dyn Processor>,
    executor: Arc<dyn Executor>,
    propagate_context: bool,
}

impl OffloadStage {
    /// Creates a new offload stage.
    pub fn new(name: impl Into<String>, processor: impl Processor + 'static, executor: Arc<dyn Executor>) -> Self {
        Self {
            name: name.into(),
            processor: Arc::new(processor),
            executor,
            propagate_context: true,
        }
    }

    /// Creates an offload stage from a closure.
    pub fn from_fn<F>(name: impl Into<String>, f: F, executor: Arc<dyn Executor>) -> Self
    where
        F: Fn(&mut UnitOfWork) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::new(name, f, executor)
    }

    /// Controls whether the caller's context follows the work (default true).
    #[must_use]
    pub fn with_context_propagation(mut self, propagate: bool) -> Self {
        self.propagate_context = propagate;
        self
    }

    fn fail(pending: &Pending, err: RouteflowError) -> bool {
        let taken = pending.lock().take();
        match taken {
            Some((mut uow, done)) => {
                uow.set_failure(err);
                done(uow);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for OffloadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OffloadStage")
            .field("name", &self.name)
            .field("executor", &self.executor.name())
            .finish()
    }
}

impl Stage for OffloadStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, uow: UnitOfWork, done: DoneCallback) -> bool {
        let pending: Pending = Arc::new(Mutex::new(Some((uow, done))));
        let on_run = Arc::clone(&pending);
        let on_reject = Arc::clone(&pending);
        let processor = Arc::clone(&self.processor);
        let executor = self.executor.name().to_string();

        // Set when `done` runs on the invoking thread, e.g. under caller-runs.
        let caller = std::thread::current().id();
        let inline = Arc::new(AtomicBool::new(false));
        let (ran_inline, rejected_inline) = (Arc::clone(&inline), Arc::clone(&inline));

        let task = RejectableTask::new(
            move || {
                let taken = on_run.lock().take();
                if let Some((mut uow, done)) = taken {
                    run_processor(processor.as_ref(), &mut uow);
                    done(uow);
                    if std::thread::current().id() == caller {
                        ran_inline.store(true, Ordering::SeqCst);
                    }
                }
            },
            move || {
                debug!(executor = %executor, "Offloaded work discarded");
                let failed = Self::fail(&on_reject, RouteflowError::rejected(executor, "offloaded work discarded"));
                if failed && std::thread::current().id() == caller {
                    rejected_inline.store(true, Ordering::SeqCst);
                }
            },
        )
        .boxed();

        let task = if self.propagate_context {
            ContextualTask::wrap(task)
        } else {
            task
        };

        match self.executor.execute(task) {
            Ok(()) => inline.load(Ordering::SeqCst),
            Err(err) => Self::fail(&pending, err),
        }
    }
}
