//! Async stages driven on a tokio runtime.

use async_trait::async_trait;
use futures::FutureExt;
use std::fmt::{self, Debug};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::runtime::Handle;

use super::{DoneCallback, Stage};
use crate::core::UnitOfWork;
use crate::errors::{panic_message, RouteflowError};

/// Asynchronous processing logic.
#[async_trait]
pub trait AsyncStage: Send + Sync + Debug {
    /// Returns the name of the stage.
    fn name(&self) -> &str;

    /// Processes the unit of work in place.
    async fn process(&self, uow: &mut UnitOfWork) -> anyhow::Result<()>;
}

/// Adapts an [`AsyncStage`] to the callback [`Stage`] contract.
///
/// Each invocation is spawned on the runtime handle; `invoke` returns false
/// immediately and `done` is called from a runtime worker.
pub struct TokioStage<S> {
    inner: Arc<S>,
    handle: Handle,
}

impl<S: AsyncStage + 'static> TokioStage<S> {
    /// Creates an adapter driving `stage` on `handle`.
    pub fn new(stage: S, handle: Handle) -> Self {
        Self {
            inner: Arc::new(stage),
            handle,
        }
    }

    /// Creates an adapter on the runtime of the current context.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn current(stage: S) -> Self {
        Self::new(stage, Handle::current())
    }
}

impl<S: AsyncStage> Debug for TokioStage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioStage")
            .field("inner", &self.inner)
            .finish()
    }
}

impl<S: AsyncStage + 'static> Stage for TokioStage<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn invoke(&self, uow: UnitOfWork, done: DoneCallback) -> bool {
        let stage = Arc::clone(&self.inner);
        self.handle.spawn(async move {
            let mut uow = uow;
            let outcome = AssertUnwindSafe(stage.process(&mut uow)).catch_unwind().await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => uow.set_failure(err),
                Err(payload) => uow.set_failure(RouteflowError::TaskPanicked(panic_message(payload.as_ref()))),
            }
            done(uow);
        });
        false
    }
}
