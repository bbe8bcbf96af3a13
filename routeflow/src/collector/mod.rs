//! Completion collectors over an executor.
//!
//! A collector runs a batch of independent closures on an [`Executor`] and
//! hands their results back either in completion order
//! ([`UnorderedCollector`]) or in submission order ([`OrderedCollector`]).
//!
//! Both variants support:
//! - blocking, non-blocking and timed retrieval
//! - skipping the next expected slot
//! - abandoning a ticket, whose result is discarded when it arrives

mod ordered;
mod unordered;

pub use ordered::OrderedCollector;
pub use unordered::UnorderedCollector;

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::{panic_message, Result, RouteflowError};
use crate::executor::{ContextualTask, Executor, RejectableTask};

/// Identifies a submission within one collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CompletionTicket {
    seq: u64,
}

impl CompletionTicket {
    pub(crate) const fn new(seq: u64) -> Self {
        Self { seq }
    }

    /// Returns the submission sequence number, starting at 0.
    #[must_use]
    pub const fn seq(&self) -> u64 {
        self.seq
    }
}

impl fmt::Display for CompletionTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.seq)
    }
}

/// A finished submission.
#[derive(Debug)]
pub struct Completion<T> {
    /// The ticket returned at submission.
    pub ticket: CompletionTicket,
    /// The closure's value, `TaskPanicked` if it panicked, or `Rejected` if
    /// the executor discarded it.
    pub result: Result<T>,
}

impl<T> Completion<T> {
    /// Returns the value, discarding the ticket.
    pub fn into_result(self) -> Result<T> {
        self.result
    }
}

/// Common surface of the ordered and unordered collectors.
pub trait CompletionCollector<T: Send + 'static> {
    /// Submits a closure to the executor.
    ///
    /// # Errors
    ///
    /// Surfaces the executor's admission refusal; the ticket is not issued.
    fn submit<F>(&self, f: F) -> Result<CompletionTicket>
    where
        F: FnOnce() -> T + Send + 'static;

    /// Returns the next available result without blocking.
    fn poll(&self) -> Option<Completion<T>>;

    /// Waits up to `timeout` for the next result.
    ///
    /// `None` means nothing was ready; in-flight work stays deliverable.
    fn poll_timeout(&self, timeout: Duration) -> Option<Completion<T>>;

    /// Blocks until the next result is available.
    ///
    /// Returns `None` when nothing is outstanding.
    fn take(&self) -> Option<Completion<T>>;

    /// Gives up on the next expected slot without consuming a result.
    ///
    /// Returns the skipped ticket, or `None` when nothing is outstanding.
    fn skip(&self) -> Option<CompletionTicket>;

    /// Marks a ticket as abandoned; its result is discarded on arrival.
    ///
    /// Returns false if the ticket was already retrieved or abandoned.
    fn abandon(&self, ticket: CompletionTicket) -> bool;

    /// Returns the number of submissions not yet retrieved, skipped or
    /// abandoned.
    fn outstanding(&self) -> usize;
}

/// Hands a closure to the executor and routes its outcome to `deliver`.
///
/// A discarded task delivers `Rejected` so no ticket is left dangling.
pub(crate) fn dispatch<T, F, D>(
    executor: &dyn Executor,
    propagate_context: bool,
    ticket: CompletionTicket,
    f: F,
    deliver: D,
) -> Result<()>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
    D: Fn(CompletionTicket, Result<T>) + Send + Sync + 'static,
{
    let deliver = Arc::new(deliver);
    let on_reject = Arc::clone(&deliver);
    let executor_name = executor.name().to_string();

    let task = RejectableTask::new(
        move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f))
                .map_err(|payload| RouteflowError::TaskPanicked(panic_message(payload.as_ref())));
            deliver(ticket, result);
        },
        move || on_reject(ticket, Err(RouteflowError::rejected(executor_name, "collector task discarded"))),
    )
    .boxed();

    let task = if propagate_context {
        ContextualTask::wrap(task)
    } else {
        task
    };
    executor.execute(task)
}
