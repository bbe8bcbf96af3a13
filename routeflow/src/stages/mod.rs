//! Stage trait and adapters.
//!
//! A stage is one step of a route. It receives a unit of work and a done
//! callback, and either completes synchronously or hands completion to
//! another thread.

mod async_stage;
mod offload;
mod processor;

pub use async_stage::{AsyncStage, TokioStage};
pub use offload::OffloadStage;
pub use processor::ProcessorStage;

use std::fmt::Debug;
use std::sync::Arc;

use crate::core::UnitOfWork;

/// Callback receiving the unit of work once a stage has finished with it.
pub type DoneCallback = Box<dyn FnOnce(UnitOfWork) + Send>;

/// Boxes a closure as a [`DoneCallback`].
pub fn done_callback<F>(f: F) -> DoneCallback
where
    F: FnOnce(UnitOfWork) + Send + 'static,
{
    Box::new(f)
}

/// A step of a route.
///
/// `done` is called exactly once. A stage failure is recorded on the unit of
/// work rather than returned.
pub trait Stage: Send + Sync + Debug {
    /// Returns the name of the stage.
    fn name(&self) -> &str;

    /// Starts processing `uow`.
    ///
    /// Returns true if `done` was already called on the calling thread, false
    /// if it will be called later, possibly from another thread.
    fn invoke(&self, uow: UnitOfWork, done: DoneCallback) -> bool;
}

impl<S: Stage + ?Sized> Stage for Arc<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn invoke(&self, uow: UnitOfWork, done: DoneCallback) -> bool {
        (**self).invoke(uow, done)
    }
}

impl<S: Stage + ?Sized> Stage for Box<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn invoke(&self, uow: UnitOfWork, done: DoneCallback) -> bool {
        (**self).invoke(uow, done)
    }
}

/// Synchronous processing logic, used by stages and redelivery hooks.
pub trait Processor: Send + Sync {
    /// Processes the unit of work in place.
    fn process(&self, uow: &mut UnitOfWork) -> anyhow::Result<()>;
}

impl<F> Processor for F
where
    F: Fn(&mut UnitOfWork) -> anyhow::Result<()> + Send + Sync,
{
    fn process(&self, uow: &mut UnitOfWork) -> anyhow::Result<()> {
        self(uow)
    }
}

/// Runs a processor, recording a failure or panic on the unit of work.
pub(crate) fn run_processor(processor: &dyn Processor, uow: &mut UnitOfWork) {
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| processor.process(uow)));
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(err)) => uow.set_failure(err),
        Err(payload) => uow.set_failure(crate::errors::RouteflowError::TaskPanicked(
            crate::errors::panic_message(payload.as_ref()),
        )),
    }
}
