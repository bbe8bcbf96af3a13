//! Delayed and periodic work driven by tokio timers.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::{watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::{run_guarded, task, BoxTask, ContextualTask, Executor, RejectionOutcome, RejectionPolicy, RejectionTarget};
use crate::context::CapturedContext;
use crate::errors::{panic_message, Result, RouteflowError};

#[derive(Debug, Default)]
struct HandleState {
    cancelled: AtomicBool,
    done: AtomicBool,
    runs: AtomicU64,
    wake: Notify,
}

impl HandleState {
    fn finish(&self) {
        self.done.store(true, Ordering::SeqCst);
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }
}

/// Handle to a scheduled task.
#[derive(Debug, Clone)]
pub struct ScheduledHandle {
    state: Arc<HandleState>,
}

impl ScheduledHandle {
    fn new() -> Self {
        Self {
            state: Arc::new(HandleState::default()),
        }
    }

    /// Cancels the task. A running execution is not interrupted.
    ///
    /// Returns false if the task had already finished or been cancelled.
    pub fn cancel(&self) -> bool {
        if self.state.done.load(Ordering::SeqCst) || self.state.cancelled.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.state.wake.notify_one();
        true
    }

    /// Returns true if the task was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Returns true once a one-shot task ran, or the task was cancelled.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state.done.load(Ordering::SeqCst) || self.is_cancelled()
    }

    /// Returns how many times the task has run.
    #[must_use]
    pub fn run_count(&self) -> u64 {
        self.state.runs.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Period {
    FixedRate(Duration),
    FixedDelay(Duration),
}

impl Period {
    fn every(self) -> Duration {
        match self {
            Self::FixedRate(every) | Self::FixedDelay(every) => every,
        }
    }
}

type PeriodicFn = Arc<dyn Fn() + Send + Sync>;

/// An entry waiting for its deadline or for a free worker.
///
/// One-shot entries own their task; periodic entries only mark the gap
/// between two runs.
struct Slot {
    handle: Arc<HandleState>,
    task: Option<BoxTask>,
}

struct SchedState {
    slots: HashMap<u64, Slot>,
    shutdown: bool,
    /// Entries taken out of `slots` that are still executing.
    running: usize,
}

struct SchedShared {
    name: String,
    pool_size: usize,
    policy: RejectionPolicy,
    propagate_context: bool,
    runtime: Handle,
    permits: Arc<Semaphore>,
    state: Mutex<SchedState>,
    terminated: watch::Sender<bool>,
    next_id: AtomicU64,
    active: AtomicUsize,
    completed: AtomicU64,
    rejected: AtomicU64,
}

impl SchedShared {
    fn signal_if_terminated(&self, state: &SchedState) {
        if state.shutdown && state.slots.is_empty() && state.running == 0 && !*self.terminated.borrow() {
            debug!(executor = %self.name, "Scheduled pool terminated");
            self.terminated.send_replace(true);
        }
    }

    /// Takes a due entry out of the pending set.
    ///
    /// Returns `None` when the entry was drained or cancelled meanwhile.
    fn start(&self, id: u64) -> Option<Slot> {
        let mut state = self.state.lock();
        let slot = state.slots.remove(&id)?;
        if slot.handle.cancelled.load(Ordering::SeqCst) {
            self.signal_if_terminated(&state);
            drop(state);
            self.discard_slot(slot);
            return None;
        }
        state.running += 1;
        Some(slot)
    }

    /// Drops a cancelled entry, notifying its task off the timer thread.
    fn discard(&self, id: u64) {
        let slot = {
            let mut state = self.state.lock();
            let slot = state.slots.remove(&id);
            self.signal_if_terminated(&state);
            slot
        };
        if let Some(slot) = slot {
            self.discard_slot(slot);
        }
    }

    fn discard_slot(&self, slot: Slot) {
        slot.handle.finish();
        if let Some(task) = slot.task {
            debug!(executor = %self.name, "Discarding cancelled task");
            self.runtime.spawn_blocking(move || {
                super::notify_or_return(vec![task]);
            });
        }
    }

    fn finish(&self) {
        let mut state = self.state.lock();
        state.running -= 1;
        self.signal_if_terminated(&state);
    }

    /// Puts a periodic entry back between runs.
    ///
    /// Returns false when the entry must not run again.
    fn requeue(&self, id: u64, handle: &Arc<HandleState>) -> bool {
        let mut state = self.state.lock();
        state.running -= 1;
        if state.shutdown || handle.cancelled.load(Ordering::SeqCst) {
            handle.finish();
            self.signal_if_terminated(&state);
            return false;
        }
        state.slots.insert(
            id,
            Slot {
                handle: Arc::clone(handle),
                task: None,
            },
        );
        true
    }

    /// Waits for a worker permit unless the entry is cancelled first.
    async fn acquire(&self, handle: &HandleState) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => permit.ok(),
            () = handle.wake.notified() => None,
        }
    }

    async fn fire_once(self: Arc<Self>, id: u64, delay: Duration, handle: Arc<HandleState>) {
        if !delay.is_zero() {
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = handle.wake.notified() => {}
            }
        }
        if handle.cancelled.load(Ordering::SeqCst) {
            self.discard(id);
            return;
        }
        let Some(permit) = self.acquire(&handle).await else {
            self.discard(id);
            return;
        };
        let Some(Slot { task: Some(task), .. }) = self.start(id) else {
            return;
        };

        let shared = Arc::clone(&self);
        self.runtime.spawn_blocking(move || {
            shared.active.fetch_add(1, Ordering::SeqCst);
            run_guarded(&shared.name, task);
            shared.active.fetch_sub(1, Ordering::SeqCst);
            handle.runs.fetch_add(1, Ordering::SeqCst);
            handle.finish();
            drop(permit);
            shared.completed.fetch_add(1, Ordering::Relaxed);
            shared.finish();
        });
    }

    async fn fire_periodic(
        self: Arc<Self>,
        id: u64,
        initial_delay: Duration,
        period: Period,
        run: PeriodicFn,
        context: Option<CapturedContext>,
        handle: Arc<HandleState>,
    ) {
        if !initial_delay.is_zero() {
            tokio::select! {
                () = tokio::time::sleep(initial_delay) => {}
                () = handle.wake.notified() => {}
            }
        }

        let mut ticks = tokio::time::interval(period.every());
        ticks.set_missed_tick_behavior(match period {
            Period::FixedRate(_) => MissedTickBehavior::Burst,
            Period::FixedDelay(_) => MissedTickBehavior::Delay,
        });

        loop {
            tokio::select! {
                _ = ticks.tick() => {}
                () = handle.wake.notified() => {}
            }
            if handle.cancelled.load(Ordering::SeqCst) {
                self.discard(id);
                return;
            }
            let Some(permit) = self.acquire(&handle).await else {
                self.discard(id);
                return;
            };
            if self.start(id).is_none() {
                return;
            }

            let (shared, run, context) = (Arc::clone(&self), Arc::clone(&run), context.clone());
            let outcome = self
                .runtime
                .spawn_blocking(move || {
                    let _permit = permit;
                    shared.active.fetch_add(1, Ordering::SeqCst);
                    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| match &context {
                        Some(ctx) => ctx.scope(|| run()),
                        None => run(),
                    }));
                    shared.active.fetch_sub(1, Ordering::SeqCst);
                    shared.completed.fetch_add(1, Ordering::Relaxed);
                    outcome.map_err(|payload| panic_message(payload.as_ref()))
                })
                .await;
            handle.runs.fetch_add(1, Ordering::SeqCst);

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(panic)) => {
                    // A panicking periodic task is not rescheduled.
                    warn!(executor = %self.name, panic = %panic, "Periodic task panicked, cancelling");
                    handle.finish();
                    self.finish();
                    return;
                }
                Err(err) => {
                    warn!(executor = %self.name, error = %err, "Periodic task was lost by the runtime");
                    handle.finish();
                    self.finish();
                    return;
                }
            }

            if !self.requeue(id, &handle) {
                return;
            }
            if matches!(period, Period::FixedDelay(_)) {
                ticks.reset();
            }
        }
    }
}

impl RejectionTarget for SchedShared {
    fn target_name(&self) -> &str {
        &self.name
    }

    fn is_shutting_down(&self) -> bool {
        self.state.lock().shutdown
    }

    fn evict_oldest_and_offer(&self, task: BoxTask) -> std::result::Result<Option<BoxTask>, BoxTask> {
        // The pending set is unbounded; refusals only happen after shutdown.
        Err(task)
    }
}

/// A pool that runs tasks after a delay or periodically.
///
/// Every entry waits on a tokio timer in a dedicated runtime and then for
/// one of `pool_size` worker permits; the work itself runs on the runtime's
/// blocking pool. Entries that have not started yet are the queue length
/// reported through [`Executor::queue_len`]. A submission refused after
/// shutdown goes through the configured [`RejectionPolicy`].
pub struct ScheduledThreadPool {
    shared: Arc<SchedShared>,
    runtime: Option<Runtime>,
}

impl ScheduledThreadPool {
    /// Creates a builder.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> ScheduledThreadPoolBuilder {
        ScheduledThreadPoolBuilder::new(name)
    }

    /// Returns the number of workers.
    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.shared.pool_size
    }

    /// Returns the rejection policy applied to refused submissions.
    #[must_use]
    pub fn rejection_policy(&self) -> RejectionPolicy {
        self.shared.policy
    }

    /// Returns the number of tasks currently running.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Returns the number of finished executions.
    #[must_use]
    pub fn completed_count(&self) -> u64 {
        self.shared.completed.load(Ordering::Relaxed)
    }

    /// Returns the number of submissions handed to the rejection policy.
    #[must_use]
    pub fn rejected_count(&self) -> u64 {
        self.shared.rejected.load(Ordering::Relaxed)
    }

    fn contextual(&self, task: BoxTask) -> BoxTask {
        if self.shared.propagate_context {
            ContextualTask::wrap(task)
        } else {
            task
        }
    }

    /// Runs `task` once after `delay`.
    ///
    /// After shutdown the task goes through the rejection policy; the
    /// returned handle is then already cancelled, or done if the caller ran
    /// it.
    ///
    /// # Errors
    ///
    /// Returns `Rejected` when the policy surfaces the refusal.
    pub fn schedule(&self, task: BoxTask, delay: Duration) -> Result<ScheduledHandle> {
        let task = self.contextual(task);
        let handle = ScheduledHandle::new();

        let mut state = self.shared.state.lock();
        if state.shutdown {
            drop(state);
            return self.refuse(task, handle);
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        state.slots.insert(
            id,
            Slot {
                handle: Arc::clone(&handle.state),
                task: Some(task),
            },
        );
        drop(state);

        let shared = Arc::clone(&self.shared);
        self.shared
            .runtime
            .spawn(shared.fire_once(id, delay, Arc::clone(&handle.state)));
        Ok(handle)
    }

    fn refuse(&self, task: BoxTask, handle: ScheduledHandle) -> Result<ScheduledHandle> {
        debug!(executor = %self.shared.name, policy = ?self.shared.policy, "Task scheduled after shutdown");
        self.shared.rejected.fetch_add(1, Ordering::Relaxed);
        match self.shared.policy.reject(task, self.shared.as_ref())? {
            RejectionOutcome::RunByCaller => {
                handle.state.runs.fetch_add(1, Ordering::SeqCst);
                handle.state.finish();
            }
            _ => {
                handle.state.cancelled.store(true, Ordering::SeqCst);
                handle.state.finish();
            }
        }
        Ok(handle)
    }

    /// Runs a closure once after `delay`.
    pub fn schedule_fn<F>(&self, f: F, delay: Duration) -> Result<ScheduledHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(task(f), delay)
    }

    /// Runs `f` every `period`, measured from the start of each run.
    ///
    /// Runs that fall behind are caught up back to back.
    ///
    /// # Errors
    ///
    /// `InvalidConfiguration` for a zero period, `Rejected` after shutdown.
    pub fn schedule_at_fixed_rate<F>(&self, f: F, initial_delay: Duration, period: Duration) -> Result<ScheduledHandle>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.push_periodic(Arc::new(f), initial_delay, Period::FixedRate(period))
    }

    /// Runs `f` repeatedly with `delay` between the end of one run and the
    /// start of the next.
    ///
    /// # Errors
    ///
    /// `InvalidConfiguration` for a zero delay, `Rejected` after shutdown.
    pub fn schedule_with_fixed_delay<F>(&self, f: F, initial_delay: Duration, delay: Duration) -> Result<ScheduledHandle>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.push_periodic(Arc::new(f), initial_delay, Period::FixedDelay(delay))
    }

    fn push_periodic(&self, run: PeriodicFn, initial_delay: Duration, period: Period) -> Result<ScheduledHandle> {
        if period.every().is_zero() {
            return Err(RouteflowError::InvalidConfiguration(
                "periodic task needs a non-zero period".to_string(),
            ));
        }
        let context = self.shared.propagate_context.then(CapturedContext::capture);
        let handle = ScheduledHandle::new();

        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(RouteflowError::shutdown(&self.shared.name));
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        state.slots.insert(
            id,
            Slot {
                handle: Arc::clone(&handle.state),
                task: None,
            },
        );
        drop(state);

        let shared = Arc::clone(&self.shared);
        self.shared.runtime.spawn(shared.fire_periodic(
            id,
            initial_delay,
            period,
            run,
            context,
            Arc::clone(&handle.state),
        ));
        Ok(handle)
    }

    /// Stops accepting work and cancels periodic tasks.
    ///
    /// Delayed one-shot tasks already scheduled still run.
    pub fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return;
        }
        state.shutdown = true;
        state.slots.retain(|_, slot| {
            if slot.task.is_some() {
                return true;
            }
            slot.handle.cancel();
            slot.handle.finish();
            false
        });
        debug!(executor = %self.shared.name, pending = state.slots.len(), "Scheduled pool shutting down");
        self.shared.signal_if_terminated(&state);
    }

    /// Stops accepting work and removes every entry that has not started.
    ///
    /// Removed one-shot tasks that accept discard notification are
    /// notified on the calling thread; the others are returned.
    pub fn shutdown_now(&self) -> Vec<BoxTask> {
        let drained: Vec<BoxTask> = {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            let slots: Vec<Slot> = state.slots.drain().map(|(_, slot)| slot).collect();
            self.shared.signal_if_terminated(&state);
            slots
                .into_iter()
                .filter_map(|slot| {
                    slot.handle.cancel();
                    slot.handle.finish();
                    slot.task
                })
                .collect()
        };
        debug!(executor = %self.shared.name, drained = drained.len(), "Scheduled pool stopped");
        super::notify_or_return(drained)
    }

    /// Returns true once shut down with nothing pending or running.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        *self.shared.terminated.borrow()
    }

    /// Waits for pending one-shots and running work to finish after
    /// shutdown.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        super::await_flag(&self.shared.runtime, self.shared.terminated.subscribe(), timeout)
    }
}

impl Executor for ScheduledThreadPool {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn execute(&self, task: BoxTask) -> Result<()> {
        self.schedule(task, Duration::ZERO).map(|_| ())
    }

    fn queue_len(&self) -> usize {
        self.shared.state.lock().slots.len()
    }

    fn is_shutdown(&self) -> bool {
        self.shared.state.lock().shutdown
    }

    fn runtime(&self) -> Handle {
        self.shared.runtime.clone()
    }
}

impl Drop for ScheduledThreadPool {
    fn drop(&mut self) {
        // Timers die with the runtime, so pending entries are drained here.
        let unnotified = self.shutdown_now();
        if !unnotified.is_empty() {
            debug!(executor = %self.shared.name, dropped = unnotified.len(), "Dropping pending tasks");
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl fmt::Debug for ScheduledThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledThreadPool")
            .field("name", &self.shared.name)
            .field("pool_size", &self.shared.pool_size)
            .field("queue_len", &self.queue_len())
            .finish()
    }
}

/// Builder for [`ScheduledThreadPool`].
#[derive(Debug, Clone)]
pub struct ScheduledThreadPoolBuilder {
    name: String,
    pool_size: usize,
    policy: RejectionPolicy,
    propagate_context: bool,
    thread_name_prefix: Option<String>,
}

impl ScheduledThreadPoolBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pool_size: 1,
            policy: RejectionPolicy::Abort,
            propagate_context: false,
            thread_name_prefix: None,
        }
    }

    /// Sets the number of workers (at least one).
    #[must_use]
    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = size.max(1);
        self
    }

    /// Sets the policy for submissions refused after shutdown.
    ///
    /// Defaults to [`RejectionPolicy::Abort`].
    #[must_use]
    pub fn rejection_policy(mut self, policy: RejectionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Captures the submitter's context bindings for every task.
    #[must_use]
    pub fn propagate_context(mut self, propagate: bool) -> Self {
        self.propagate_context = propagate;
        self
    }

    /// Sets the worker thread name prefix.
    #[must_use]
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = Some(prefix.into());
        self
    }

    /// Starts the runtime backing the pool.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the runtime cannot be started.
    pub fn build(self) -> Result<ScheduledThreadPool> {
        let prefix = self.thread_name_prefix.clone().unwrap_or_else(|| self.name.clone());
        let runtime = super::build_runtime(&prefix, self.pool_size)?;
        let (terminated, _) = watch::channel(false);

        let shared = Arc::new(SchedShared {
            name: self.name,
            pool_size: self.pool_size,
            policy: self.policy,
            propagate_context: self.propagate_context,
            runtime: runtime.handle().clone(),
            permits: Arc::new(Semaphore::new(self.pool_size)),
            state: Mutex::new(SchedState {
                slots: HashMap::new(),
                shutdown: false,
                running: 0,
            }),
            terminated,
            next_id: AtomicU64::new(0),
            active: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        });

        Ok(ScheduledThreadPool {
            shared,
            runtime: Some(runtime),
        })
    }
}
