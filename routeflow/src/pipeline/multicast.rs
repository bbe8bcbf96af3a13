//! Parallel branch execution.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::aggregation::{AggregationStrategy, UseLatest};
use crate::bridge::AwaitManager;
use crate::collector::{Completion, CompletionCollector, OrderedCollector, UnorderedCollector};
use crate::core::{UnitOfWork, UnitOfWorkId};
use crate::errors::{Result, RouteflowError};
use crate::executor::Executor;
use crate::stages::{DoneCallback, Stage};
use crate::utils::millis;

type BranchResult = Result<UnitOfWork>;

/// Sends a copy of the unit of work to every branch and merges the results.
///
/// Each branch runs on a worker of the executor, blocking there through the
/// [`AwaitManager`] until its stage calls back. Results are merged in branch
/// order, or in completion order when streaming. The multicast itself
/// completes synchronously.
pub struct Multicast {
    name: String,
    branches: Vec<Arc<dyn Stage>>,
    executor: Arc<dyn Executor>,
    await_manager: Arc<AwaitManager>,
    aggregation: Box<dyn AggregationStrategy>,
    streaming: bool,
    stop_on_failure: bool,
    timeout: Option<Duration>,
    propagate_context: bool,
}

impl Multicast {
    /// Creates a multicast over `executor` with no branches.
    pub fn new(name: impl Into<String>, executor: Arc<dyn Executor>) -> Self {
        Self {
            name: name.into(),
            branches: Vec::new(),
            executor,
            await_manager: Arc::new(AwaitManager::new()),
            aggregation: Box::new(UseLatest),
            streaming: false,
            stop_on_failure: false,
            timeout: None,
            propagate_context: true,
        }
    }

    /// Adds a branch.
    #[must_use]
    pub fn branch(mut self, stage: impl Stage + 'static) -> Self {
        self.branches.push(Arc::new(stage));
        self
    }

    /// Shares an await manager, so its registry shows the blocked branches.
    #[must_use]
    pub fn with_await_manager(mut self, manager: Arc<AwaitManager>) -> Self {
        self.await_manager = manager;
        self
    }

    /// Sets the aggregation strategy.
    #[must_use]
    pub fn with_aggregation(mut self, strategy: impl AggregationStrategy + 'static) -> Self {
        self.aggregation = Box::new(strategy);
        self
    }

    /// Merges results as they complete instead of in branch order.
    #[must_use]
    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    /// Stops at the first failed branch, dropping the others.
    #[must_use]
    pub fn stop_on_failure(mut self, stop: bool) -> Self {
        self.stop_on_failure = stop;
        self
    }

    /// Stops waiting for branches after `timeout`, merging what finished.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Controls whether the caller's context follows each branch (default true).
    #[must_use]
    pub fn with_context_propagation(mut self, propagate: bool) -> Self {
        self.propagate_context = propagate;
        self
    }

    /// Returns the number of branches.
    #[must_use]
    pub fn branch_count(&self) -> usize {
        self.branches.len()
    }

    fn run(&self, uow: UnitOfWork) -> UnitOfWork {
        if self.streaming {
            let collector = UnorderedCollector::new(Arc::clone(&self.executor))
                .with_context_propagation(self.propagate_context);
            self.run_with(&collector, uow)
        } else {
            let collector = OrderedCollector::new(Arc::clone(&self.executor))
                .with_context_propagation(self.propagate_context);
            self.run_with(&collector, uow)
        }
    }

    fn run_with<C>(&self, collector: &C, mut uow: UnitOfWork) -> UnitOfWork
    where
        C: CompletionCollector<BranchResult>,
    {
        let abandoned = Arc::new(AtomicBool::new(false));
        let mut branch_ids = Vec::with_capacity(self.branches.len());
        for branch in &self.branches {
            let copy = uow.copy_for_branch();
            branch_ids.push(copy.id());
            let stage = AbandonableBranch {
                multicast: self.name.clone(),
                stage: Arc::clone(branch),
                abandoned: Arc::clone(&abandoned),
            };
            let manager = Arc::clone(&self.await_manager);

            if let Err(err) = collector.submit(move || manager.await_stage(&stage, copy)) {
                warn!(multicast = %self.name, branch = %branch.name(), error = %err, "Branch refused by executor");
                uow.set_failure(err);
                self.abandon(collector, &abandoned, &branch_ids);
                return uow;
            }
        }

        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);
        let mut aggregated: Option<UnitOfWork> = None;

        while collector.outstanding() > 0 {
            let next = match deadline {
                Some(deadline) => collector.poll_timeout(deadline.saturating_duration_since(Instant::now())),
                None => collector.take(),
            };

            let Some(Completion { ticket, result }) = next else {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    warn!(
                        multicast = %self.name,
                        timeout_ms = self.timeout.map(millis).unwrap_or_default(),
                        unfinished = collector.outstanding(),
                        "Multicast timed out, skipping unfinished branches"
                    );
                    self.abandon(collector, &abandoned, &branch_ids);
                }
                continue;
            };

            match result.and_then(|branch| branch) {
                Ok(mut branch) => {
                    if self.stop_on_failure && branch.is_failed() {
                        debug!(multicast = %self.name, ticket = %ticket, "Branch failed, stopping");
                        if let Some(failure) = branch.take_failure() {
                            uow.set_failure(failure);
                        }
                        self.abandon(collector, &abandoned, &branch_ids);
                        return uow;
                    }
                    aggregated = Some(self.aggregation.aggregate(aggregated, branch));
                }
                Err(err) => {
                    warn!(multicast = %self.name, ticket = %ticket, error = %err, "Branch did not complete");
                    uow.set_failure(err);
                    if self.stop_on_failure {
                        self.abandon(collector, &abandoned, &branch_ids);
                        return uow;
                    }
                }
            }
        }

        if let Some(mut result) = aggregated {
            uow.body = std::mem::take(&mut result.body);
            uow.headers = std::mem::take(&mut result.headers);
            if !uow.is_failed() {
                if let Some(failure) = result.take_failure() {
                    uow.set_failure(failure);
                }
            }
        }
        uow
    }

    /// Gives up on every outstanding branch.
    ///
    /// Branches still queued complete as rejected without invoking their
    /// stage once a worker picks them up; workers already blocked on a
    /// branch are interrupted.
    fn abandon<C>(&self, collector: &C, abandoned: &AtomicBool, branch_ids: &[UnitOfWorkId])
    where
        C: CompletionCollector<BranchResult>,
    {
        abandoned.store(true, Ordering::SeqCst);
        while collector.skip().is_some() {}
        for id in branch_ids {
            self.await_manager.interrupt(*id);
        }
    }
}

/// A branch stage that turns into an immediate rejection once its
/// multicast gave up.
///
/// The flag is checked after the await manager registered the branch, so
/// a branch either sees the flag or is registered in time to be
/// interrupted.
#[derive(Debug)]
struct AbandonableBranch {
    multicast: String,
    stage: Arc<dyn Stage>,
    abandoned: Arc<AtomicBool>,
}

impl Stage for AbandonableBranch {
    fn name(&self) -> &str {
        self.stage.name()
    }

    fn invoke(&self, mut uow: UnitOfWork, done: DoneCallback) -> bool {
        if self.abandoned.load(Ordering::SeqCst) {
            debug!(multicast = %self.multicast, branch = %self.stage.name(), "Skipping abandoned branch");
            uow.set_failure(RouteflowError::rejected(&self.multicast, "branch abandoned before it started"));
            done(uow);
            return true;
        }
        self.stage.invoke(uow, done)
    }
}

impl fmt::Debug for Multicast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multicast")
            .field("name", &self.name)
            .field("branches", &self.branches.iter().map(|b| b.name()).collect::<Vec<_>>())
            .field("executor", &self.executor.name())
            .field("streaming", &self.streaming)
            .field("stop_on_failure", &self.stop_on_failure)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Stage for Multicast {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, uow: UnitOfWork, done: DoneCallback) -> bool {
        if self.branches.is_empty() {
            done(uow);
            return true;
        }
        done(self.run(uow));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::executor::{RejectionPolicy, ThreadPoolExecutor};
    use crate::pipeline::GroupedBodies;
    use crate::stages::{done_callback, OffloadStage, ProcessorStage};
    use crate::testing::{AlwaysFailingStage, DeferredStage, Latch};
    use pretty_assertions::assert_eq;
    use std::sync::mpsc;

    fn pool(size: usize) -> Arc<dyn Executor> {
        Arc::new(ThreadPoolExecutor::builder("multicast").pool_size(size).build().unwrap())
    }

    fn tag(name: &'static str, delay_ms: u64) -> ProcessorStage {
        ProcessorStage::from_fn(name, move |uow| {
            std::thread::sleep(Duration::from_millis(delay_ms));
            uow.body = serde_json::json!(name);
            Ok(())
        })
    }

    fn run(multicast: &Multicast, uow: UnitOfWork) -> UnitOfWork {
        let (tx, rx) = mpsc::channel();
        assert!(multicast.invoke(
            uow,
            done_callback(move |uow| {
                let _ = tx.send(uow);
            })
        ));
        rx.try_recv().unwrap()
    }

    #[test]
    fn test_ordered_merge_follows_branch_order() {
        let multicast = Multicast::new("fan-out", pool(3))
            .branch(tag("slow", 40))
            .branch(tag("medium", 20))
            .branch(tag("fast", 0))
            .with_aggregation(GroupedBodies);

        let uow = run(&multicast, UnitOfWork::new(serde_json::json!("order")));

        assert_eq!(uow.body, serde_json::json!(["slow", "medium", "fast"]));
        assert!(!uow.is_failed());
    }

    #[test]
    fn test_streaming_merge_follows_completion_order() {
        let multicast = Multicast::new("fan-out", pool(3))
            .branch(tag("slow", 150))
            .branch(tag("fast", 0))
            .streaming(true)
            .with_aggregation(GroupedBodies);

        let uow = run(&multicast, UnitOfWork::new(serde_json::json!("order")));

        assert_eq!(uow.body, serde_json::json!(["fast", "slow"]));
    }

    #[test]
    fn test_use_latest_by_default() {
        let multicast = Multicast::new("fan-out", pool(2))
            .branch(tag("first", 0))
            .branch(tag("second", 30));

        let uow = run(&multicast, UnitOfWork::new(serde_json::Value::Null));
        assert_eq!(uow.body, serde_json::json!("second"));
    }

    #[test]
    fn test_branches_receive_independent_copies() {
        let executor = pool(2);
        let multicast = Multicast::new("fan-out", Arc::clone(&executor))
            .branch(OffloadStage::from_fn(
                "mutate",
                |uow| {
                    uow.set_header("touched", serde_json::json!(true));
                    Ok(())
                },
                Arc::clone(&executor),
            ))
            .branch(tag("plain", 30))
            .with_aggregation(|acc: Option<UnitOfWork>, branch: UnitOfWork| acc.unwrap_or(branch));

        let original = UnitOfWork::new(serde_json::json!(1));
        let id = original.id();
        let uow = run(&multicast, original);

        assert_eq!(uow.id(), id);
        assert_eq!(uow.header("touched"), Some(&serde_json::json!(true)));
    }

    #[test]
    fn test_stop_on_failure() {
        let multicast = Multicast::new("fan-out", pool(2))
            .branch(AlwaysFailingStage::new("broken", "inventory down"))
            .branch(tag("slow", 50))
            .stop_on_failure(true);

        let uow = run(&multicast, UnitOfWork::new(serde_json::json!(1)));

        assert_eq!(uow.failure().map(ToString::to_string), Some("inventory down".to_string()));
        assert_eq!(uow.body, serde_json::json!(1));
    }

    #[test]
    fn test_failure_without_stop_keeps_other_branches() {
        let multicast = Multicast::new("fan-out", pool(2))
            .branch(AlwaysFailingStage::new("broken", "inventory down"))
            .branch(tag("ok", 0))
            .with_aggregation(GroupedBodies);

        let uow = run(&multicast, UnitOfWork::new(serde_json::json!(1)));

        assert_eq!(uow.body, serde_json::json!([1, "ok"]));
        assert!(uow.is_failed());
    }

    #[test]
    fn test_timeout_skips_and_interrupts_unfinished_branches() {
        let stuck = Arc::new(DeferredStage::new("stuck"));
        let manager = Arc::new(AwaitManager::new());
        let multicast = Multicast::new("fan-out", pool(2))
            .branch(tag("quick", 0))
            .branch(Arc::clone(&stuck))
            .with_await_manager(Arc::clone(&manager))
            .with_timeout(Duration::from_millis(100));

        let started = Instant::now();
        let uow = run(&multicast, UnitOfWork::new(serde_json::Value::Null));

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(uow.body, serde_json::json!("quick"));
        assert!(!uow.is_failed());
        assert_eq!(manager.statistics().threads_interrupted, 1);
        assert_eq!(manager.size(), 0);

        // The late callback for the interrupted branch is dropped.
        assert_eq!(stuck.complete_all(), 1);
    }

    #[test]
    fn test_timeout_skips_branches_still_queued() {
        let stuck = Arc::new(DeferredStage::new("stuck"));
        let never = Arc::new(DeferredStage::new("never-started"));
        let manager = Arc::new(AwaitManager::new());
        let executor = pool(1);
        let multicast = Multicast::new("fan-out", Arc::clone(&executor))
            .branch(Arc::clone(&stuck))
            .branch(Arc::clone(&never))
            .with_await_manager(Arc::clone(&manager))
            .with_timeout(Duration::from_millis(50));

        run(&multicast, UnitOfWork::new(serde_json::Value::Null));

        // The single worker is released and the queued branch never invokes
        // its stage.
        let (tx, rx) = mpsc::channel();
        executor.execute(crate::executor::task(move || {
            let _ = tx.send(());
        }))
        .unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        assert_eq!(never.pending(), 0);
        assert_eq!(manager.size(), 0);
        assert_eq!(stuck.complete_all(), 1);
    }

    #[test]
    fn test_refused_branch_fails_the_multicast() {
        let gate = Arc::new(Latch::new());
        let executor: Arc<dyn Executor> = Arc::new(
            ThreadPoolExecutor::builder("tiny")
                .pool_size(1)
                .max_queue_size(1)
                .rejection_policy(RejectionPolicy::Abort)
                .build()
                .unwrap(),
        );
        let g = Arc::clone(&gate);
        let blocker = ProcessorStage::from_fn("blocker", move |_| {
            g.wait();
            Ok(())
        });

        let multicast = Multicast::new("fan-out", Arc::clone(&executor))
            .branch(blocker)
            .branch(tag("second", 0))
            .branch(tag("third", 0));

        let opener = {
            let gate = Arc::clone(&gate);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                gate.open();
            })
        };
        let uow = run(&multicast, UnitOfWork::new(serde_json::Value::Null));
        opener.join().unwrap();

        let kind = uow
            .failure()
            .and_then(|failure| failure.downcast_ref::<RouteflowError>())
            .map(RouteflowError::kind);
        assert_eq!(kind, Some(ErrorKind::Rejected));
    }

    #[test]
    fn test_no_branches_passes_through() {
        let multicast = Multicast::new("empty", pool(1));
        assert_eq!(multicast.branch_count(), 0);
        let uow = run(&multicast, UnitOfWork::new(serde_json::json!("same")));
        assert_eq!(uow.body, serde_json::json!("same"));
    }
}
