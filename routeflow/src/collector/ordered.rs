//! Collector releasing results in submission order.

use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

use super::{dispatch, Completion, CompletionCollector, CompletionTicket};
use crate::errors::Result;
use crate::executor::Executor;

/// Sequence numbers below `head` have been released, skipped or abandoned.
/// A sequence number that is neither in flight nor finished, and not yet
/// released, was abandoned and is stepped over.
struct State<T> {
    head: u64,
    next_seq: u64,
    in_flight: BTreeSet<u64>,
    finished: HashMap<u64, Result<T>>,
}

impl<T> State<T> {
    fn advance_head(&mut self) {
        while self.head < self.next_seq
            && !self.in_flight.contains(&self.head)
            && !self.finished.contains_key(&self.head)
        {
            self.head += 1;
        }
    }

    fn release_head(&mut self) -> Option<Completion<T>> {
        self.advance_head();
        let result = self.finished.remove(&self.head)?;
        let ticket = CompletionTicket::new(self.head);
        self.head += 1;
        Some(Completion { ticket, result })
    }

    fn has_outstanding(&self) -> bool {
        !self.in_flight.is_empty() || !self.finished.is_empty()
    }
}

struct Shared<T> {
    state: Mutex<State<T>>,
    head_ready: Condvar,
}

impl<T> Shared<T> {
    fn deliver(&self, ticket: CompletionTicket, result: Result<T>) {
        let mut state = self.state.lock();
        if !state.in_flight.remove(&ticket.seq()) {
            trace!(ticket = %ticket, "Discarding result of abandoned submission");
            return;
        }
        state.finished.insert(ticket.seq(), result);
        self.head_ready.notify_all();
    }
}

/// Releases results strictly in the order they were submitted.
///
/// A retriever waits on a condition keyed on the head index: sequence number
/// `n` is released only once every earlier submission has been released,
/// skipped or abandoned.
pub struct OrderedCollector<T> {
    executor: Arc<dyn Executor>,
    propagate_context: bool,
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> OrderedCollector<T> {
    /// Creates a collector over `executor`.
    #[must_use]
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            executor,
            propagate_context: false,
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    head: 0,
                    next_seq: 0,
                    in_flight: BTreeSet::new(),
                    finished: HashMap::new(),
                }),
                head_ready: Condvar::new(),
            }),
        }
    }

    /// Captures the submitter's context for each task.
    #[must_use]
    pub fn with_context_propagation(mut self, propagate: bool) -> Self {
        self.propagate_context = propagate;
        self
    }

    fn wait_for(&self, deadline: Option<Instant>) -> Option<Completion<T>> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(done) = state.release_head() {
                return Some(done);
            }
            if !state.has_outstanding() {
                return None;
            }
            match deadline {
                Some(deadline) => {
                    if self.shared.head_ready.wait_until(&mut state, deadline).timed_out() {
                        return state.release_head();
                    }
                }
                None => self.shared.head_ready.wait(&mut state),
            }
        }
    }
}

impl<T: Send + 'static> CompletionCollector<T> for OrderedCollector<T> {
    fn submit<F>(&self, f: F) -> Result<CompletionTicket>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let ticket = {
            let mut state = self.shared.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.in_flight.insert(seq);
            CompletionTicket::new(seq)
        };

        let shared = Arc::clone(&self.shared);
        let outcome = dispatch(
            self.executor.as_ref(),
            self.propagate_context,
            ticket,
            f,
            move |ticket, result| shared.deliver(ticket, result),
        );

        if let Err(err) = outcome {
            let mut state = self.shared.state.lock();
            state.in_flight.remove(&ticket.seq());
            self.shared.head_ready.notify_all();
            return Err(err);
        }
        Ok(ticket)
    }

    fn poll(&self) -> Option<Completion<T>> {
        self.shared.state.lock().release_head()
    }

    fn poll_timeout(&self, timeout: Duration) -> Option<Completion<T>> {
        self.wait_for(Some(Instant::now() + timeout))
    }

    fn take(&self) -> Option<Completion<T>> {
        self.wait_for(None)
    }

    fn skip(&self) -> Option<CompletionTicket> {
        let mut state = self.shared.state.lock();
        state.advance_head();
        if state.head >= state.next_seq {
            return None;
        }
        let seq = state.head;
        state.in_flight.remove(&seq);
        state.finished.remove(&seq);
        state.head += 1;
        self.shared.head_ready.notify_all();
        Some(CompletionTicket::new(seq))
    }

    fn abandon(&self, ticket: CompletionTicket) -> bool {
        let mut state = self.shared.state.lock();
        let seq = ticket.seq();
        let found = state.in_flight.remove(&seq) || state.finished.remove(&seq).is_some();
        if found {
            self.shared.head_ready.notify_all();
        }
        found
    }

    fn outstanding(&self) -> usize {
        let state = self.shared.state.lock();
        state.in_flight.len() + state.finished.len()
    }
}

impl<T> fmt::Debug for OrderedCollector<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("OrderedCollector")
            .field("executor", &self.executor.name())
            .field("head", &state.head)
            .field("in_flight", &state.in_flight.len())
            .field("finished", &state.finished.len())
            .finish()
    }
}
