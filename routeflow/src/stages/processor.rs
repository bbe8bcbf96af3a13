//! Synchronous processor stage.

use std::fmt;

use super::{run_processor, DoneCallback, Processor, Stage};
use crate::context::ROUTE_ID;
use crate::core::UnitOfWork;

/// A stage that runs a [`Processor`] on the calling thread.
///
/// Always completes synchronously. While the processor runs, the unit of
/// work's route identifier is bound to [`ROUTE_ID`].
pub struct ProcessorStage {
    name: String,
    processor: Box<dyn Processor>,
}

impl ProcessorStage {
    /// Creates a new processor stage.
    pub fn new(name: impl Into<String>, processor: impl Processor + 'static) -> Self {
        Self {
            name: name.into(),
            processor: Box::new(processor),
        }
    }

    /// Creates a processor stage from a closure.
    pub fn from_fn<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut UnitOfWork) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::new(name, f)
    }
}

impl fmt::Debug for ProcessorStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorStage")
            .field("name", &self.name)
            .finish()
    }
}

impl Stage for ProcessorStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, mut uow: UnitOfWork, done: DoneCallback) -> bool {
        match uow.route_id().map(str::to_string) {
            Some(route) => ROUTE_ID.bind(route, || run_processor(self.processor.as_ref(), &mut uow)),
            None => run_processor(self.processor.as_ref(), &mut uow),
        }
        done(uow);
        true
    }
}
