//! Collector releasing results in completion order.

use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

use super::{dispatch, Completion, CompletionCollector, CompletionTicket};
use crate::errors::Result;
use crate::executor::Executor;

struct State<T> {
    next_seq: u64,
    in_flight: BTreeSet<u64>,
    ready: VecDeque<Completion<T>>,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    ready: Condvar,
}

impl<T> Shared<T> {
    fn deliver(&self, ticket: CompletionTicket, result: Result<T>) {
        let mut state = self.state.lock();
        if !state.in_flight.remove(&ticket.seq()) {
            trace!(ticket = %ticket, "Discarding result of abandoned submission");
            return;
        }
        state.ready.push_back(Completion { ticket, result });
        self.ready.notify_all();
    }
}

/// Releases whichever submission completes first.
pub struct UnorderedCollector<T> {
    executor: Arc<dyn Executor>,
    propagate_context: bool,
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> UnorderedCollector<T> {
    /// Creates a collector over `executor`.
    #[must_use]
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            executor,
            propagate_context: false,
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    next_seq: 0,
                    in_flight: BTreeSet::new(),
                    ready: VecDeque::new(),
                }),
                ready: Condvar::new(),
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
            if let Some(done) = state.ready.pop_front() {
                return Some(done);
            }
            if state.in_flight.is_empty() {
                return None;
            }
            match deadline {
                Some(deadline) => {
                    if self.shared.ready.wait_until(&mut state, deadline).timed_out() {
                        return state.ready.pop_front();
                    }
                }
                None => self.shared.ready.wait(&mut state),
            }
        }
    }
}

impl<T: Send + 'static> CompletionCollector<T> for UnorderedCollector<T> {
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
            self.shared.state.lock().in_flight.remove(&ticket.seq());
            return Err(err);
        }
        Ok(ticket)
    }

    fn poll(&self) -> Option<Completion<T>> {
        self.shared.state.lock().ready.pop_front()
    }

    fn poll_timeout(&self, timeout: Duration) -> Option<Completion<T>> {
        self.wait_for(Some(Instant::now() + timeout))
    }

    fn take(&self) -> Option<Completion<T>> {
        self.wait_for(None)
    }

    fn skip(&self) -> Option<CompletionTicket> {
        let mut state = self.shared.state.lock();
        let seq = state.in_flight.pop_first()?;
        Some(CompletionTicket::new(seq))
    }

    fn abandon(&self, ticket: CompletionTicket) -> bool {
        let mut state = self.shared.state.lock();
        if state.in_flight.remove(&ticket.seq()) {
            return true;
        }
        let before = state.ready.len();
        state.ready.retain(|c| c.ticket != ticket);
        state.ready.len() != before
    }

    fn outstanding(&self) -> usize {
        let state = self.shared.state.lock();
        state.in_flight.len() + state.ready.len()
    }
}

impl<T> fmt::Debug for UnorderedCollector<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("UnorderedCollector")
            .field("executor", &self.executor.name())
            .field("in_flight", &state.in_flight.len())
            .field("ready", &state.ready.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::executor::{RejectionPolicy, ThreadPoolExecutor};
    use crate::testing::Latch;
    use pretty_assertions::assert_eq;
    use rand::Rng;

    fn pool(size: usize) -> Arc<dyn Executor> {
        Arc::new(ThreadPoolExecutor::builder("unordered").pool_size(size).build().unwrap())
    }

    #[test]
    fn test_multiset_preserved() {
        let collector = UnorderedCollector::new(pool(4));
        let mut rng = rand::thread_rng();

        for i in 0..20u64 {
            let delay = rng.gen_range(0..15);
            collector
                .submit(move || {
                    std::thread::sleep(Duration::from_millis(delay));
                    i
                })
                .unwrap();
        }

        let mut seen = Vec::new();
        while let Some(done) = collector.take() {
            seen.push(done.result.unwrap());
        }
        seen.sort_unstable();

        assert_eq!(seen, (0..20).collect::<Vec<_>>());
        assert_eq!(collector.outstanding(), 0);
        assert!(collector.take().is_none());
    }

    #[test]
    fn test_completion_order() {
        let collector = UnorderedCollector::new(pool(2));
        let gate = Arc::new(Latch::new());
        let g = Arc::clone(&gate);

        let slow = collector.submit(move || {
            g.wait();
            "slow"
        })
        .unwrap();
        let fast = collector.submit(|| "fast").unwrap();

        let first = collector.take().unwrap();
        assert_eq!(first.ticket, fast);
        assert_eq!(first.result.unwrap(), "fast");

        gate.open();
        let second = collector.take().unwrap();
        assert_eq!(second.ticket, slow);
    }

    #[test]
    fn test_poll_timeout_keeps_in_flight() {
        let collector = UnorderedCollector::new(pool(1));
        let gate = Arc::new(Latch::new());
        let g = Arc::clone(&gate);
        collector.submit(move || {
            g.wait();
            1
        })
        .unwrap();

        assert!(collector.poll().is_none());
        assert!(collector.poll_timeout(Duration::from_millis(20)).is_none());
        assert_eq!(collector.outstanding(), 1);

        gate.open();
        assert_eq!(collector.take().unwrap().result.unwrap(), 1);
    }

    #[test]
    fn test_abandoned_result_is_discarded() {
        let collector = UnorderedCollector::new(pool(1));
        let gate = Arc::new(Latch::new());
        let g = Arc::clone(&gate);

        let abandoned = collector.submit(move || {
            g.wait();
            "abandoned"
        })
        .unwrap();
        collector.submit(|| "kept").unwrap();

        assert!(collector.abandon(abandoned));
        assert!(!collector.abandon(abandoned));
        gate.open();

        assert_eq!(collector.take().unwrap().result.unwrap(), "kept");
        assert!(collector.take().is_none());
    }

    #[test]
    fn test_skip_oldest_outstanding() {
        let collector = UnorderedCollector::new(pool(1));
        let gate = Arc::new(Latch::new());
        let g = Arc::clone(&gate);

        let first = collector.submit(move || {
            g.wait();
            1
        })
        .unwrap();
        let second = collector.submit(|| 2).unwrap();

        assert_eq!(collector.skip(), Some(first));
        gate.open();

        let done = collector.take().unwrap();
        assert_eq!(done.ticket, second);
        assert!(collector.take().is_none());
        assert!(collector.skip().is_none());
    }

    #[test]
    fn test_panic_becomes_failure() {
        let collector: UnorderedCollector<u32> = UnorderedCollector::new(pool(1));
        collector.submit(|| panic!("branch exploded")).unwrap();

        let err = collector.take().unwrap().result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TaskPanicked);
    }

    #[test]
    fn test_discarded_submission_delivers_rejection() {
        let executor = Arc::new(
            ThreadPoolExecutor::builder("tiny")
                .pool_size(1)
                .max_queue_size(1)
                .rejection_policy(RejectionPolicy::Discard)
                .build()
                .unwrap(),
        );
        let collector = UnorderedCollector::new(executor);
        let gate = Arc::new(Latch::new());
        let started = Arc::new(Latch::new());
        let (g, s) = (Arc::clone(&gate), Arc::clone(&started));

        collector.submit(move || {
            s.open();
            g.wait();
            0
        })
        .unwrap();
        started.wait();
        collector.submit(|| 1).unwrap();
        collector.submit(|| 2).unwrap();

        let rejected = collector.take().unwrap();
        assert_eq!(rejected.result.unwrap_err().kind(), ErrorKind::Rejected);
        gate.open();
        assert_eq!(collector.outstanding(), 2);
    }
}
