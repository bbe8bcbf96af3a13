//! The redelivery error handler.

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::policy::RedeliveryPolicy;
use super::sink::FailureSink;
use crate::config::ErrorHandlerConfig;
use crate::core::UnitOfWork;
use crate::errors::{panic_message, Result, RouteflowError};
use crate::executor::{BoundedScheduler, Executor, RejectableTask};
use crate::stages::{done_callback, DoneCallback, Processor, Stage};
use crate::utils::millis;

type Observer = dyn Fn(&UnitOfWork) -> anyhow::Result<()> + Send + Sync;
type RetryWhile = dyn Fn(&UnitOfWork) -> bool + Send + Sync;

/// Counters of one handler instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RedeliveryStatistics {
    /// Route threads currently sleeping before a synchronous redelivery.
    pub pending_sleepers: u64,
    /// Redeliveries started, cumulative.
    pub redelivery_attempts: u64,
    /// Episodes that ran out of redeliveries.
    pub exhausted: u64,
    /// Dispatches to the terminal sink.
    pub dispatched: u64,
    /// Dispatches where the sink itself failed.
    pub dispatch_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    sleepers: AtomicU64,
    attempts: AtomicU64,
    exhausted: AtomicU64,
    dispatched: AtomicU64,
    dispatch_failures: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> RedeliveryStatistics {
        RedeliveryStatistics {
            pending_sleepers: self.sleepers.load(Ordering::Relaxed),
            redelivery_attempts: self.attempts.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
        }
    }
}

/// Per-invocation state that travels with the unit of work.
struct Episode {
    done: DoneCallback,
    previous_delay: Duration,
}

/// States of one failure-recovery episode.
enum Step {
    Attempting(Episode, UnitOfWork),
    Evaluating(Episode, UnitOfWork),
    RetryScheduled(Episode, UnitOfWork, Duration),
    Exhausted(Episode, UnitOfWork),
    Succeeded(Episode, UnitOfWork),
}

/// Meeting point between an invoking frame and the stage's callback.
///
/// While the frame is still inside `invoke`, the callback parks its result
/// here; once the frame has detached, the callback drives the machine itself.
struct Handoff {
    detached: bool,
    episode: Option<Episode>,
    returned: Option<UnitOfWork>,
}

/// A redelivery waiting on the scheduler.
struct PendingRetry {
    detached: bool,
    rejected: bool,
    episode: Option<(Episode, UnitOfWork)>,
}

struct Inner {
    name: String,
    output: Arc<dyn Stage>,
    policy: RedeliveryPolicy,
    use_original_message: bool,
    handle_new_exception: bool,
    sink: Option<Arc<dyn FailureSink>>,
    on_exception_occurred: Option<Box<Observer>>,
    on_redelivery: Option<Box<dyn Processor>>,
    on_prepare_failure: Option<Box<dyn Processor>>,
    retry_while: Option<Box<RetryWhile>>,
    scheduler: Option<BoundedScheduler>,
    stopping: AtomicBool,
    stop_lock: Mutex<()>,
    stop_signal: Condvar,
    counters: Counters,
}

/// Retries a failing stage under a [`RedeliveryPolicy`], then hands the unit
/// of work to a terminal [`FailureSink`].
///
/// The handler is itself a [`Stage`]: it completes synchronously unless the
/// guarded stage completes asynchronously or a delayed redelivery runs on the
/// scheduler.
///
/// ```rust,no_run
/// use routeflow::redelivery::{DeadLetterQueue, RedeliveryErrorHandler, RedeliveryPolicy};
/// use routeflow::stages::ProcessorStage;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let charge = ProcessorStage::from_fn("charge", |_| anyhow::bail!("gateway timeout"));
/// let dlq = Arc::new(DeadLetterQueue::new("payments.dlq"));
///
/// let handler = RedeliveryErrorHandler::builder("charge-with-retry", charge)
///     .policy(RedeliveryPolicy::new(3).with_redelivery_delay(Duration::from_millis(100)))
///     .failure_sink(dlq)
///     .build()?;
/// # Ok::<(), routeflow::RouteflowError>(())
/// ```
#[derive(Clone)]
pub struct RedeliveryErrorHandler {
    inner: Arc<Inner>,
}

impl RedeliveryErrorHandler {
    /// Starts building a handler guarding `output`.
    pub fn builder(name: impl Into<String>, output: impl Stage + 'static) -> RedeliveryErrorHandlerBuilder {
        RedeliveryErrorHandlerBuilder::new(name.into(), Arc::new(output))
    }

    /// Returns the policy.
    #[must_use]
    pub fn policy(&self) -> &RedeliveryPolicy {
        &self.inner.policy
    }

    /// Returns the handler counters.
    #[must_use]
    pub fn statistics(&self) -> RedeliveryStatistics {
        self.inner.counters.snapshot()
    }

    /// Asks the handler to stop.
    ///
    /// Unless the policy allows redelivery while stopping, sleeping and
    /// future redeliveries are abandoned and go to terminal dispatch.
    pub fn stop(&self) {
        self.inner.stopping.store(true, Ordering::SeqCst);
        let _guard = self.inner.stop_lock.lock();
        self.inner.stop_signal.notify_all();
    }

    /// Returns true once [`RedeliveryErrorHandler::stop`] was called.
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::SeqCst)
    }
}

impl Stage for RedeliveryErrorHandler {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn invoke(&self, mut uow: UnitOfWork, done: DoneCallback) -> bool {
        uow.mark_redelivery(0);
        uow.set_exhausted(false);
        let episode = Episode {
            done,
            previous_delay: Duration::ZERO,
        };
        self.inner.drive(Step::Attempting(episode, uow))
    }
}

impl fmt::Debug for RedeliveryErrorHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedeliveryErrorHandler")
            .field("name", &self.inner.name)
            .field("output", &self.inner.output.name())
            .field("policy", &self.inner.policy)
            .field("sink", &self.inner.sink.as_ref().map(|s| s.name().to_string()))
            .field("handle_new_exception", &self.inner.handle_new_exception)
            .finish_non_exhaustive()
    }
}

impl Inner {
    /// Runs the machine on the current thread until it finishes or detaches.
    ///
    /// Returns true if the episode finished on this thread.
    fn drive(self: &Arc<Self>, step: Step) -> bool {
        let mut step = step;
        loop {
            step = match step {
                Step::Attempting(episode, uow) => match self.attempt(episode, uow) {
                    Some(next) => next,
                    None => return false,
                },
                Step::Evaluating(episode, uow) => self.evaluate(episode, uow),
                Step::RetryScheduled(episode, uow, delay) => match self.wait_for_retry(episode, uow, delay) {
                    Some(next) => next,
                    None => return false,
                },
                Step::Exhausted(episode, mut uow) => {
                    self.exhaust(&mut uow);
                    (episode.done)(uow);
                    return true;
                }
                Step::Succeeded(episode, uow) => {
                    if uow.is_redelivered() {
                        debug!(
                            handler = %self.name,
                            unit_of_work_id = %uow.id(),
                            redelivery_counter = uow.redelivery_counter(),
                            "Redelivery succeeded"
                        );
                    }
                    (episode.done)(uow);
                    return true;
                }
            };
        }
    }

    fn attempt(self: &Arc<Self>, episode: Episode, uow: UnitOfWork) -> Option<Step> {
        let handoff = Arc::new(Mutex::new(Handoff {
            detached: false,
            episode: Some(episode),
            returned: None,
        }));

        let callback = {
            let handoff = Arc::clone(&handoff);
            let inner = Arc::clone(self);
            done_callback(move |uow| {
                let mut slot = handoff.lock();
                if !slot.detached {
                    slot.returned = Some(uow);
                    return;
                }
                let episode = slot.episode.take();
                drop(slot);
                if let Some(episode) = episode {
                    inner.drive(Step::Evaluating(episode, uow));
                }
            })
        };

        self.output.invoke(uow, callback);

        let mut slot = handoff.lock();
        if slot.returned.is_some() {
            if let (Some(uow), Some(episode)) = (slot.returned.take(), slot.episode.take()) {
                return Some(Step::Evaluating(episode, uow));
            }
        }
        slot.detached = true;
        None
    }

    fn evaluate(&self, mut episode: Episode, mut uow: UnitOfWork) -> Step {
        if !uow.is_failed() {
            return Step::Succeeded(episode, uow);
        }

        self.notify_exception_occurred(&uow);

        let next = uow.redelivery_counter() + 1;
        if !self.policy.allows_redelivery(next) {
            return Step::Exhausted(episode, uow);
        }
        if let Some(retry_while) = &self.retry_while {
            if !retry_while(&uow) {
                debug!(handler = %self.name, unit_of_work_id = %uow.id(), "Retry-while predicate declined redelivery");
                return Step::Exhausted(episode, uow);
            }
        }
        if self.refuses_while_stopping() {
            uow.set_failure(RouteflowError::rejected(&self.name, "redelivery not allowed while stopping"));
            return Step::Exhausted(episode, uow);
        }

        uow.mark_redelivery(next);
        self.counters.attempts.fetch_add(1, Ordering::Relaxed);
        let delay = self.policy.delay_for(episode.previous_delay, next);
        episode.previous_delay = delay;
        self.log_retry_attempted(&uow, delay);

        if let Some(hook) = &self.on_redelivery {
            if let Err(err) = run_hook("on_redelivery", hook.as_ref(), &mut uow) {
                warn!(handler = %self.name, unit_of_work_id = %uow.id(), error = %err, "On-redelivery hook failed");
                uow.set_failure(err);
                return Step::Evaluating(episode, uow);
            }
        }

        uow.take_failure();
        Step::RetryScheduled(episode, uow, delay)
    }

    fn wait_for_retry(self: &Arc<Self>, episode: Episode, mut uow: UnitOfWork, delay: Duration) -> Option<Step> {
        if delay.is_zero() {
            return Some(Step::Attempting(episode, uow));
        }
        if self.policy.async_delayed_redelivery {
            if let Some(scheduler) = &self.scheduler {
                return self.schedule_retry(scheduler, episode, uow, delay);
            }
        }

        if self.sleep(delay) {
            Some(Step::Attempting(episode, uow))
        } else {
            uow.set_failure(RouteflowError::rejected(&self.name, "redelivery abandoned while stopping"));
            Some(Step::Exhausted(episode, uow))
        }
    }

    fn schedule_retry(
        self: &Arc<Self>,
        scheduler: &BoundedScheduler,
        episode: Episode,
        uow: UnitOfWork,
        delay: Duration,
    ) -> Option<Step> {
        let pending = Arc::new(Mutex::new(PendingRetry {
            detached: false,
            rejected: false,
            episode: Some((episode, uow)),
        }));

        let run = {
            let pending = Arc::clone(&pending);
            let inner = Arc::clone(self);
            move || {
                let taken = pending.lock().episode.take();
                if let Some((episode, uow)) = taken {
                    inner.drive(Step::Attempting(episode, uow));
                }
            }
        };
        let on_reject = {
            let pending = Arc::clone(&pending);
            let inner = Arc::clone(self);
            let executor = scheduler.name().to_string();
            move || {
                let mut slot = pending.lock();
                if !slot.detached {
                    slot.rejected = true;
                    return;
                }
                let taken = slot.episode.take();
                drop(slot);
                if let Some((episode, mut uow)) = taken {
                    uow.set_failure(RouteflowError::rejected(executor, "scheduled redelivery discarded"));
                    inner.drive(Step::Exhausted(episode, uow));
                }
            }
        };

        let scheduled = scheduler.schedule(RejectableTask::new(run, on_reject).boxed(), delay);

        let mut slot = pending.lock();
        let refusal = match scheduled {
            Ok(_) if !slot.rejected => {
                slot.detached = true;
                return None;
            }
            Ok(_) => RouteflowError::rejected(scheduler.name(), "scheduled redelivery discarded"),
            Err(err) => err,
        };

        let (episode, mut uow) = slot.episode.take()?;
        warn!(
            handler = %self.name,
            unit_of_work_id = %uow.id(),
            error = %refusal,
            "Could not schedule redelivery, routing to terminal dispatch"
        );
        uow.set_failure(refusal);
        Some(Step::Exhausted(episode, uow))
    }

    /// Sleeps before a synchronous redelivery.
    ///
    /// Returns false if the sleep was cut short by a stop that forbids
    /// redelivery.
    fn sleep(&self, delay: Duration) -> bool {
        debug!(handler = %self.name, delay_ms = millis(delay), "Sleeping until redelivery");
        self.counters.sleepers.fetch_add(1, Ordering::Relaxed);
        // A saturated back-off has no representable deadline; only a stop ends it.
        let deadline = Instant::now().checked_add(delay);

        let mut guard = self.stop_lock.lock();
        let abandoned = loop {
            if self.refuses_while_stopping() {
                break true;
            }
            match deadline {
                Some(deadline) => {
                    if self.stop_signal.wait_until(&mut guard, deadline).timed_out() {
                        break false;
                    }
                }
                None => self.stop_signal.wait(&mut guard),
            }
        };
        drop(guard);

        self.counters.sleepers.fetch_sub(1, Ordering::Relaxed);
        !abandoned
    }

    fn refuses_while_stopping(&self) -> bool {
        !self.policy.allow_redelivery_while_stopping && self.stopping.load(Ordering::SeqCst)
    }

    fn notify_exception_occurred(&self, uow: &UnitOfWork) {
        let Some(hook) = &self.on_exception_occurred else {
            return;
        };
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook(uow)));
        let failure = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(err)) => format!("{err:#}"),
            Err(payload) => panic_message(payload.as_ref()),
        };
        warn!(
            handler = %self.name,
            unit_of_work_id = %uow.id(),
            error = %failure,
            "On-exception-occurred hook failed, ignoring"
        );
    }

    fn log_retry_attempted(&self, uow: &UnitOfWork, delay: Duration) {
        let interval = self.policy.retry_attempted_log_interval.max(1);
        if !self.policy.log_retry_attempted || uow.redelivery_counter() % interval != 0 {
            return;
        }
        info!(
            handler = %self.name,
            unit_of_work_id = %uow.id(),
            attempt = uow.redelivery_counter() + 1,
            max_redeliveries = self.policy.maximum_redeliveries,
            delay_ms = millis(delay),
            error = %uow.failure().map(|f| format!("{f:#}")).unwrap_or_default(),
            "Redelivery attempt scheduled"
        );
    }

    fn exhaust(&self, uow: &mut UnitOfWork) {
        uow.set_exhausted(true);
        self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
        if self.policy.log_exhausted {
            error!(
                handler = %self.name,
                unit_of_work_id = %uow.id(),
                attempts = uow.redelivery_counter() + 1,
                error = %uow.failure().map(|f| format!("{f:#}")).unwrap_or_default(),
                "Redelivery exhausted"
            );
        }

        if self.use_original_message {
            uow.restore_original();
        }
        if let Some(hook) = &self.on_prepare_failure {
            if let Err(err) = run_hook("on_prepare_failure", hook.as_ref(), uow) {
                warn!(
                    handler = %self.name,
                    unit_of_work_id = %uow.id(),
                    error = %err,
                    replaced = %uow.failure().map(|f| format!("{f:#}")).unwrap_or_default(),
                    "On-prepare-failure hook failed, dispatching with the hook failure"
                );
                uow.set_failure(err);
            }
        }

        if let Some(sink) = &self.sink {
            self.dispatch(sink.as_ref(), uow);
        }
    }

    fn dispatch(&self, sink: &dyn FailureSink, uow: &mut UnitOfWork) {
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| sink.dispatch(uow)))
            .unwrap_or_else(|payload| Err(RouteflowError::TaskPanicked(panic_message(payload.as_ref())).into()));

        match outcome {
            Ok(()) => {
                debug!(handler = %self.name, sink = %sink.name(), unit_of_work_id = %uow.id(), "Dispatched to failure sink");
                uow.move_failure_to_caught();
                uow.set_handled(true);
            }
            Err(cause) => {
                self.counters.dispatch_failures.fetch_add(1, Ordering::Relaxed);
                let err = RouteflowError::TerminalDispatchFailure {
                    sink: sink.name().to_string(),
                    cause,
                };
                if self.policy.log_new_exception {
                    error!(
                        handler = %self.name,
                        unit_of_work_id = %uow.id(),
                        error = %err,
                        handled = self.handle_new_exception,
                        "Failure sink failed"
                    );
                }
                uow.set_failure(err);
                if self.handle_new_exception {
                    uow.move_failure_to_caught();
                    uow.set_handled(true);
                } else {
                    uow.set_handled(false);
                }
            }
        }
    }
}

/// Runs a hook, turning its error or panic into a `HookFailure`.
fn run_hook(name: &str, hook: &dyn Processor, uow: &mut UnitOfWork) -> Result<()> {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook.process(uow))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(cause)) => Err(RouteflowError::hook_failure(name, cause)),
        Err(payload) => Err(RouteflowError::hook_failure(
            name,
            anyhow::anyhow!("panicked: {}", panic_message(payload.as_ref())),
        )),
    }
}

/// Builder for [`RedeliveryErrorHandler`].
pub struct RedeliveryErrorHandlerBuilder {
    name: String,
    output: Arc<dyn Stage>,
    config: ErrorHandlerConfig,
    sink: Option<Arc<dyn FailureSink>>,
    on_exception_occurred: Option<Box<Observer>>,
    on_redelivery: Option<Box<dyn Processor>>,
    on_prepare_failure: Option<Box<dyn Processor>>,
    retry_while: Option<Box<RetryWhile>>,
    scheduler: Option<BoundedScheduler>,
}

impl RedeliveryErrorHandlerBuilder {
    fn new(name: String, output: Arc<dyn Stage>) -> Self {
        Self {
            name,
            output,
            config: ErrorHandlerConfig::default(),
            sink: None,
            on_exception_occurred: None,
            on_redelivery: None,
            on_prepare_failure: None,
            retry_while: None,
            scheduler: None,
        }
    }

    /// Replaces the whole configuration.
    #[must_use]
    pub fn config(mut self, config: ErrorHandlerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the redelivery policy.
    #[must_use]
    pub fn policy(mut self, policy: RedeliveryPolicy) -> Self {
        self.config.redelivery = policy;
        self
    }

    /// Restores the original body and headers before terminal dispatch.
    #[must_use]
    pub fn use_original_message(mut self, enabled: bool) -> Self {
        self.config.use_original_message = enabled;
        self
    }

    /// Sets whether a failing sink's error is swallowed (the default) or
    /// propagated to the caller.
    #[must_use]
    pub fn handle_new_exception(mut self, handle: bool) -> Self {
        self.config.handle_new_exception = handle;
        self
    }

    /// Sets the terminal failure sink.
    ///
    /// Without a sink an exhausted unit of work keeps its failure.
    #[must_use]
    pub fn failure_sink(mut self, sink: Arc<dyn FailureSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Observes every stage failure. Errors from the hook are logged only.
    #[must_use]
    pub fn on_exception_occurred<F>(mut self, hook: F) -> Self
    where
        F: Fn(&UnitOfWork) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_exception_occurred = Some(Box::new(hook));
        self
    }

    /// Runs before each redelivery. An error consumes the redelivery.
    #[must_use]
    pub fn on_redelivery<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut UnitOfWork) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_redelivery = Some(Box::new(hook));
        self
    }

    /// Runs once before terminal dispatch.
    #[must_use]
    pub fn on_prepare_failure<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut UnitOfWork) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_prepare_failure = Some(Box::new(hook));
        self
    }

    /// Only redeliver while `predicate` holds for the failed unit of work.
    #[must_use]
    pub fn retry_while<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&UnitOfWork) -> bool + Send + Sync + 'static,
    {
        self.retry_while = Some(Box::new(predicate));
        self
    }

    /// Sets the scheduler used for asynchronous delayed redelivery.
    #[must_use]
    pub fn scheduler(mut self, scheduler: BoundedScheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Builds the handler.
    ///
    /// # Errors
    ///
    /// `InvalidConfiguration` if the policy is invalid or asks for
    /// asynchronous delayed redelivery without a scheduler.
    pub fn build(self) -> Result<RedeliveryErrorHandler> {
        let ErrorHandlerConfig {
            redelivery: policy,
            use_original_message,
            handle_new_exception,
        } = self.config;

        policy.validate()?;
        if policy.async_delayed_redelivery && self.scheduler.is_none() {
            return Err(RouteflowError::InvalidConfiguration(format!(
                "handler '{}' uses asynchronous delayed redelivery but has no scheduler",
                self.name
            )));
        }

        Ok(RedeliveryErrorHandler {
            inner: Arc::new(Inner {
                name: self.name,
                output: self.output,
                policy,
                use_original_message,
                handle_new_exception,
                sink: self.sink,
                on_exception_occurred: self.on_exception_occurred,
                on_redelivery: self.on_redelivery,
                on_prepare_failure: self.on_prepare_failure,
                retry_while: self.retry_while,
                scheduler: self.scheduler,
                stopping: AtomicBool::new(false),
                stop_lock: Mutex::new(()),
                stop_signal: Condvar::new(),
                counters: Counters::default(),
            }),
        })
    }
}

impl fmt::Debug for RedeliveryErrorHandlerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedeliveryErrorHandlerBuilder")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::AwaitManager;
    use crate::errors::ErrorKind;
    use crate::executor::{ScheduledThreadPool, ThreadPoolExecutor};
    use crate::redelivery::{DeadLetterQueue, MockFailureSink};
    use crate::stages::{OffloadStage, ProcessorStage};
    use crate::testing::{AlwaysFailingStage, CollectingSink, CountingHook, FailingSink, FlakyStage, Latch};
    use pretty_assertions::assert_eq;
    use std::sync::mpsc;

    fn run(handler: &RedeliveryErrorHandler, uow: UnitOfWork) -> UnitOfWork {
        let (tx, rx) = mpsc::channel();
        let sync = handler.invoke(
            uow,
            done_callback(move |uow| {
                let _ = tx.send(uow);
            }),
        );
        assert!(sync, "handler should complete synchronously");
        rx.try_recv().unwrap()
    }

    fn order() -> UnitOfWork {
        UnitOfWork::new(serde_json::json!({"order": 42})).with_route_id("orders")
    }

    #[test]
    fn test_always_failing_makes_n_plus_one_attempts() {
        let stage = Arc::new(AlwaysFailingStage::new("charge", "gateway timeout"));
        let sink = Arc::new(CollectingSink::new());
        let occurred = CountingHook::new();
        let redelivery = CountingHook::new();
        let prepare = CountingHook::new();

        let handler = RedeliveryErrorHandler::builder("retry", Arc::clone(&stage))
            .policy(RedeliveryPolicy::new(3))
            .failure_sink(sink.clone())
            .on_exception_occurred(occurred.observer())
            .on_redelivery(redelivery.processor())
            .on_prepare_failure(prepare.processor())
            .build()
            .unwrap();

        let uow = run(&handler, order());

        assert_eq!(stage.attempts(), 4);
        assert_eq!(occurred.count(), 4);
        assert_eq!(redelivery.count(), 3);
        assert_eq!(prepare.count(), 1);
        assert_eq!(sink.count(), 1);
        assert_eq!(sink.ids(), vec![uow.id()]);

        assert!(uow.is_exhausted());
        assert!(uow.is_handled());
        assert!(!uow.is_failed());
        assert_eq!(uow.redelivery_counter(), 3);
        assert_eq!(
            uow.caught_failure().map(ToString::to_string),
            Some("gateway timeout".to_string())
        );

        let stats = handler.statistics();
        assert_eq!(stats.redelivery_attempts, 3);
        assert_eq!(stats.exhausted, 1);
        assert_eq!(stats.dispatched, 1);
    }

    #[test]
    fn test_success_on_attempt_k_never_reaches_sink() {
        let stage = Arc::new(FlakyStage::new("flaky", 2));
        let redelivery = CountingHook::new();
        let mut sink = MockFailureSink::new();
        sink.expect_name().return_const("mock".to_string());
        sink.expect_dispatch().never();

        let handler = RedeliveryErrorHandler::builder("retry", Arc::clone(&stage))
            .policy(RedeliveryPolicy::new(5))
            .failure_sink(Arc::new(sink))
            .on_redelivery(redelivery.processor())
            .build()
            .unwrap();

        let uow = run(&handler, order());

        assert_eq!(stage.attempts(), 3);
        assert_eq!(redelivery.count(), 2);
        assert!(!uow.is_failed());
        assert!(!uow.is_exhausted());
        assert!(uow.is_redelivered());
        assert_eq!(uow.redelivery_counter(), 2);
    }

    #[test]
    fn test_zero_redeliveries_is_terminal_on_first_failure() {
        let stage = Arc::new(AlwaysFailingStage::new("charge", "declined"));
        let redelivery = CountingHook::new();
        let mut sink = MockFailureSink::new();
        sink.expect_name().return_const("mock".to_string());
        sink.expect_dispatch().times(1).returning(|_| Ok(()));

        let handler = RedeliveryErrorHandler::builder("retry", Arc::clone(&stage))
            .policy(RedeliveryPolicy::new(0))
            .failure_sink(Arc::new(sink))
            .on_redelivery(redelivery.processor())
            .build()
            .unwrap();

        let uow = run(&handler, order());

        assert_eq!(stage.attempts(), 1);
        assert_eq!(redelivery.count(), 0);
        assert!(uow.is_handled());
    }

    #[test]
    fn test_without_sink_exhaustion_reaches_caller() {
        let stage = AlwaysFailingStage::new("charge", "connection refused");
        let handler = RedeliveryErrorHandler::builder("retry", stage)
            .policy(RedeliveryPolicy::new(2))
            .build()
            .unwrap();

        let err = run(&handler, order()).into_result().unwrap_err();

        assert_eq!(err.kind(), ErrorKind::RedeliveryExhausted);
        assert!(err.to_string().contains("after 3 attempt(s): connection refused"));
    }

    #[test]
    fn test_retry_while_stops_early() {
        let stage = Arc::new(AlwaysFailingStage::new("charge", "fatal: card stolen"));
        let sink = Arc::new(CollectingSink::new());
        let handler = RedeliveryErrorHandler::builder("retry", Arc::clone(&stage))
            .policy(RedeliveryPolicy::new(10))
            .failure_sink(sink.clone())
            .retry_while(|uow| !uow.failure().is_some_and(|f| f.to_string().starts_with("fatal")))
            .build()
            .unwrap();

        let uow = run(&handler, order());

        assert_eq!(stage.attempts(), 1);
        assert_eq!(sink.count(), 1);
        assert!(uow.is_exhausted());
    }

    #[test]
    fn test_sink_failure_swallowed_by_default() {
        let sink = Arc::new(FailingSink::new("dlq unavailable"));
        let handler = RedeliveryErrorHandler::builder("retry", AlwaysFailingStage::new("charge", "declined"))
            .policy(RedeliveryPolicy::new(1))
            .failure_sink(sink.clone())
            .build()
            .unwrap();

        let uow = run(&handler, order());

        assert_eq!(sink.count(), 1);
        assert!(uow.is_handled());
        assert!(!uow.is_failed());
        let caught = uow.caught_failure().unwrap();
        assert_eq!(
            caught.downcast_ref::<RouteflowError>().map(RouteflowError::kind),
            Some(ErrorKind::TerminalDispatchFailure)
        );
        assert_eq!(handler.statistics().dispatch_failures, 1);
    }

    #[test]
    fn test_sink_failure_propagates_when_configured() {
        let handler = RedeliveryErrorHandler::builder("retry", AlwaysFailingStage::new("charge", "declined"))
            .policy(RedeliveryPolicy::new(1))
            .failure_sink(Arc::new(FailingSink::new("dlq unavailable")))
            .handle_new_exception(false)
            .build()
            .unwrap();

        let uow = run(&handler, order());
        assert!(!uow.is_handled());

        let err = uow.into_result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TerminalDispatchFailure);
        assert!(err.to_string().contains("dlq unavailable"));
    }

    #[test]
    fn test_use_original_message_restores_body_before_dispatch() {
        let stage = ProcessorStage::from_fn("enrich", |uow| {
            uow.body = serde_json::json!({"order": 42, "enriched": true});
            anyhow::bail!("downstream rejected")
        });
        let dlq = Arc::new(DeadLetterQueue::new("orders.dlq"));
        let handler = RedeliveryErrorHandler::builder("retry", stage)
            .policy(RedeliveryPolicy::new(1))
            .use_original_message(true)
            .failure_sink(dlq.clone())
            .on_prepare_failure(|uow| {
                uow.set_header("failed_at", serde_json::json!("enrich"));
                Ok(())
            })
            .build()
            .unwrap();

        run(&handler, order());

        let entries = dlq.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].body, serde_json::json!({"order": 42}));
        assert_eq!(entries[0].headers["failed_at"], serde_json::json!("enrich"));
        assert_eq!(entries[0].failure.as_deref(), Some("downstream rejected"));
    }

    #[test]
    fn test_failing_exception_observer_is_ignored() {
        let stage = Arc::new(FlakyStage::new("flaky", 1));
        let observer = CountingHook::failing("observer bug");
        let handler = RedeliveryErrorHandler::builder("retry", Arc::clone(&stage))
            .policy(RedeliveryPolicy::new(2))
            .on_exception_occurred(observer.observer())
            .build()
            .unwrap();

        let uow = run(&handler, order());

        assert_eq!(observer.count(), 1);
        assert_eq!(stage.attempts(), 2);
        assert!(!uow.is_failed());
    }

    #[test]
    fn test_failing_redelivery_hook_is_bounded_by_ceiling() {
        let stage = Arc::new(AlwaysFailingStage::new("charge", "declined"));
        let hook = CountingHook::failing("hook bug");
        let handler = RedeliveryErrorHandler::builder("retry", Arc::clone(&stage))
            .policy(RedeliveryPolicy::new(2))
            .on_redelivery(hook.processor())
            .build()
            .unwrap();

        let uow = run(&handler, order());

        assert_eq!(stage.attempts(), 1);
        assert_eq!(hook.count(), 2);
        assert!(uow.is_exhausted());
        assert_eq!(uow.into_result().unwrap_err().kind(), ErrorKind::HookFailure);
    }

    #[test]
    fn test_failing_prepare_hook_still_dispatches_once() {
        let sink = Arc::new(CollectingSink::new());
        let hook = CountingHook::failing("enrichment failed");
        let handler = RedeliveryErrorHandler::builder("retry", AlwaysFailingStage::new("charge", "declined"))
            .policy(RedeliveryPolicy::new(1))
            .failure_sink(sink.clone())
            .on_prepare_failure(hook.processor())
            .build()
            .unwrap();

        let uow = run(&handler, order());

        assert_eq!(hook.count(), 1);
        assert_eq!(sink.count(), 1);
        assert!(uow.is_handled());
        let caught = uow.caught_failure().and_then(|f| f.downcast_ref::<RouteflowError>()).map(RouteflowError::kind);
        assert_eq!(caught, Some(ErrorKind::HookFailure));
    }

    #[test]
    fn test_failing_prepare_hook_reaches_caller_without_sink() {
        let hook = CountingHook::failing("enrichment failed");
        let handler = RedeliveryErrorHandler::builder("retry", AlwaysFailingStage::new("charge", "declined"))
            .policy(RedeliveryPolicy::new(0))
            .on_prepare_failure(hook.processor())
            .build()
            .unwrap();

        let uow = run(&handler, order());

        assert!(uow.is_exhausted());
        let err = uow.into_result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HookFailure);
        assert!(err.to_string().contains("on_prepare_failure"));
    }

    #[test]
    fn test_synchronous_delay_blocks_route_thread() {
        let stage = Arc::new(FlakyStage::new("flaky", 2));
        let handler = RedeliveryErrorHandler::builder("retry", Arc::clone(&stage))
            .policy(RedeliveryPolicy::new(3).with_redelivery_delay(Duration::from_millis(20)))
            .build()
            .unwrap();

        let started = Instant::now();
        let uow = run(&handler, order());

        assert!(started.elapsed() >= Duration::from_millis(40));
        assert!(!uow.is_failed());
        assert_eq!(stage.attempts(), 3);
    }

    #[test]
    fn test_many_synchronous_redeliveries_do_not_grow_the_stack() {
        let stage = Arc::new(AlwaysFailingStage::new("charge", "declined"));
        let mut policy = RedeliveryPolicy::new(20_000);
        policy.log_retry_attempted = false;
        policy.log_exhausted = false;
        let handler = RedeliveryErrorHandler::builder("retry", Arc::clone(&stage))
            .policy(policy)
            .build()
            .unwrap();

        let uow = run(&handler, order());

        assert_eq!(stage.attempts(), 20_001);
        assert!(uow.is_exhausted());
    }

    fn scheduler(capacity: usize) -> BoundedScheduler {
        let pool = Arc::new(ScheduledThreadPool::builder("redelivery").pool_size(2).build().unwrap());
        BoundedScheduler::new(pool, capacity)
    }

    #[test]
    fn test_async_delayed_redelivery_frees_the_caller() {
        let stage = Arc::new(FlakyStage::new("flaky", 2));
        let handler = RedeliveryErrorHandler::builder("retry", Arc::clone(&stage))
            .policy(
                RedeliveryPolicy::new(3)
                    .with_redelivery_delay(Duration::from_millis(10))
                    .with_async_delayed_redelivery(true),
            )
            .scheduler(scheduler(0))
            .build()
            .unwrap();

        let (tx, rx) = mpsc::channel();
        let caller = std::thread::current().id();
        let sync = handler.invoke(
            order(),
            done_callback(move |uow| {
                let _ = tx.send((uow, std::thread::current().id()));
            }),
        );

        assert!(!sync);
        let (uow, finished_on) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!uow.is_failed());
        assert_ne!(finished_on, caller);
        assert_eq!(stage.attempts(), 3);
        assert_eq!(handler.statistics().pending_sleepers, 0);
    }

    #[test]
    fn test_full_scheduler_routes_to_terminal_dispatch() {
        let scheduler = scheduler(1);
        let gate = Arc::new(Latch::new());
        let g = Arc::clone(&gate);
        scheduler.schedule_fn(move || g.wait(), Duration::from_secs(60)).unwrap();

        let stage = Arc::new(AlwaysFailingStage::new("charge", "declined"));
        let handler = RedeliveryErrorHandler::builder("retry", Arc::clone(&stage))
            .policy(
                RedeliveryPolicy::new(3)
                    .with_redelivery_delay(Duration::from_millis(10))
                    .with_async_delayed_redelivery(true),
            )
            .scheduler(scheduler.clone())
            .build()
            .unwrap();

        let uow = run(&handler, order());

        assert_eq!(stage.attempts(), 1);
        assert!(uow.is_exhausted());
        assert_eq!(uow.into_result().unwrap_err().kind(), ErrorKind::CapacityExceeded);

        gate.open();
        scheduler.shutdown_now();
    }

    #[test]
    fn test_stopped_scheduler_still_dispatches_parked_redelivery() {
        let scheduler = scheduler(0);
        let sink = Arc::new(CollectingSink::new());
        let handler = RedeliveryErrorHandler::builder("retry", AlwaysFailingStage::new("charge", "declined"))
            .policy(
                RedeliveryPolicy::new(3)
                    .with_redelivery_delay(Duration::from_secs(30))
                    .with_async_delayed_redelivery(true),
            )
            .failure_sink(sink.clone())
            .scheduler(scheduler.clone())
            .build()
            .unwrap();

        let (tx, rx) = mpsc::channel();
        let sync = handler.invoke(
            order(),
            done_callback(move |uow| {
                let _ = tx.send(uow);
            }),
        );
        assert!(!sync);
        assert_eq!(scheduler.queue_len(), 1);

        let unnotified = scheduler.shutdown_now();

        assert!(unnotified.is_empty());
        let uow = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(uow.is_exhausted());
        assert_eq!(sink.count(), 1);
        let caught = uow.caught_failure().and_then(|f| f.downcast_ref::<RouteflowError>()).map(RouteflowError::kind);
        assert_eq!(caught, Some(ErrorKind::Rejected));
    }

    #[test]
    fn test_async_without_scheduler_is_invalid() {
        let err = RedeliveryErrorHandler::builder("retry", FlakyStage::new("flaky", 0))
            .policy(RedeliveryPolicy::new(1).with_async_delayed_redelivery(true))
            .build()
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
    }

    #[test]
    fn test_stop_abandons_sleeping_redelivery() {
        let stage = Arc::new(AlwaysFailingStage::new("charge", "declined"));
        let handler = RedeliveryErrorHandler::builder("retry", Arc::clone(&stage))
            .policy(
                RedeliveryPolicy::new(5)
                    .with_redelivery_delay(Duration::from_secs(30))
                    .with_allow_redelivery_while_stopping(false),
            )
            .build()
            .unwrap();

        let h = handler.clone();
        let route = std::thread::spawn(move || run(&h, order()));

        let deadline = Instant::now() + Duration::from_secs(5);
        while handler.statistics().pending_sleepers == 0 {
            assert!(Instant::now() < deadline, "route thread never went to sleep");
            std::thread::sleep(Duration::from_millis(1));
        }
        handler.stop();

        let uow = route.join().unwrap();
        assert!(handler.is_stopping());
        assert_eq!(stage.attempts(), 1);
        assert_eq!(uow.into_result().unwrap_err().kind(), ErrorKind::Rejected);
    }

    #[test]
    fn test_retries_asynchronous_stage_through_await_manager() {
        let pool: Arc<dyn Executor> = Arc::new(ThreadPoolExecutor::builder("workers").pool_size(2).build().unwrap());
        let stage = OffloadStage::from_fn("remote", |_| anyhow::bail!("remote call failed"), Arc::clone(&pool));
        let sink = Arc::new(CollectingSink::new());
        let handler = RedeliveryErrorHandler::builder("retry", stage)
            .policy(RedeliveryPolicy::new(2))
            .failure_sink(sink.clone())
            .build()
            .unwrap();

        let manager = AwaitManager::new();
        let uow = manager.await_stage(&handler, order()).unwrap();

        assert!(uow.is_handled());
        assert_eq!(uow.redelivery_counter(), 2);
        assert_eq!(sink.count(), 1);
        assert_eq!(manager.size(), 0);
    }
}
