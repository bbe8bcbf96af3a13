//! The await manager.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::entry::{AwaitEntry, AwaitEntrySnapshot};
use super::statistics::{AwaitStatistics, Counters};
use crate::core::{UnitOfWork, UnitOfWorkId};
use crate::errors::{Result, RouteflowError};
use crate::stages::{done_callback, Stage};
use crate::utils::{iso_timestamp, millis};

type Registry = DashMap<UnitOfWorkId, Arc<AwaitEntry>>;

/// Tracks callers blocked on asynchronous stages.
///
/// Each instance owns its registry and counters, so independent managers
/// never share state.
pub struct AwaitManager {
    registry: Arc<Registry>,
    counters: Arc<Counters>,
    interrupt_threads_while_stopping: bool,
    stopping: AtomicBool,
}

impl Default for AwaitManager {
    fn default() -> Self {
        Self::new()
    }
}

impl AwaitManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self {
            registry: Arc::new(DashMap::new()),
            counters: Arc::new(Counters::default()),
            interrupt_threads_while_stopping: false,
            stopping: AtomicBool::new(false),
        }
    }

    /// Interrupts every blocked caller on [`AwaitManager::shutdown`].
    #[must_use]
    pub fn with_interrupt_threads_while_stopping(mut self, interrupt: bool) -> Self {
        self.interrupt_threads_while_stopping = interrupt;
        self
    }

    /// Invokes `stage` and blocks until it calls back.
    ///
    /// A stage that completes synchronously returns without registering an
    /// entry. The returned unit of work carries the stage's failure, if any.
    ///
    /// # Errors
    ///
    /// `AlreadyAwaiting` if another caller is blocked on the same identifier,
    /// `InterruptedWait` if this caller was interrupted.
    pub fn await_stage<S>(&self, stage: &S, uow: UnitOfWork) -> Result<UnitOfWork>
    where
        S: Stage + ?Sized,
    {
        let id = uow.id();
        let entry = Arc::new(AwaitEntry::new(id, uow.route_id().map(str::to_string), stage.name()));

        // The slot is claimed before the stage runs, so a duplicate caller
        // never triggers the stage.
        match self.registry.entry(id) {
            Entry::Occupied(_) => return Err(RouteflowError::AlreadyAwaiting { unit_of_work_id: id }),
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::clone(&entry));
            }
        }
        let _registration = Registration {
            registry: &self.registry,
            entry: &entry,
        };

        let callback = {
            let registry = Arc::clone(&self.registry);
            let entry = Arc::clone(&entry);
            done_callback(move |uow| {
                registry.remove_if(&entry.id, |_, e| Arc::ptr_eq(e, &entry));
                if let Err(late) = entry.complete(uow) {
                    debug!(
                        unit_of_work_id = %late.id(),
                        "Callback fired after the waiting caller was interrupted, dropping unit of work"
                    );
                }
            })
        };

        if stage.invoke(uow, callback) {
            if let Some(done) = entry.take_completed() {
                return Ok(done);
            }
        }

        let (parked, done) = entry.block(|| {
            self.counters.record_blocked();
            debug!(unit_of_work_id = %id, stage = %stage.name(), "Waiting for asynchronous callback");
        });
        if parked {
            self.counters.record_duration(entry.elapsed());
        }

        done.ok_or(RouteflowError::InterruptedWait { unit_of_work_id: id })
    }

    /// Returns the number of registered callers.
    #[must_use]
    pub fn size(&self) -> usize {
        self.registry.len()
    }

    /// Returns a snapshot of every registered caller.
    #[must_use]
    pub fn browse(&self) -> Vec<AwaitEntrySnapshot> {
        let mut entries: Vec<_> = self.registry.iter().map(|e| e.value().snapshot()).collect();
        entries.sort_by_key(|e| e.started_at);
        entries
    }

    /// Interrupts the caller blocked on `id`.
    ///
    /// Returns false if no caller is blocked on it or it already completed.
    pub fn interrupt(&self, id: UnitOfWorkId) -> bool {
        let Some((_, entry)) = self.registry.remove(&id) else {
            return false;
        };
        if !entry.interrupt() {
            return false;
        }

        self.counters.record_interrupted();
        warn!(
            unit_of_work_id = %id,
            waited_ms = millis(entry.elapsed()),
            "Interrupted caller waiting for asynchronous callback"
        );
        true
    }

    /// Interrupts every registered caller, returning how many were woken.
    pub fn interrupt_all(&self) -> usize {
        let ids: Vec<_> = self.registry.iter().map(|e| *e.key()).collect();
        ids.into_iter().filter(|id| self.interrupt(*id)).count()
    }

    /// Marks the manager as stopping.
    ///
    /// Blocked callers are interrupted when configured to, otherwise they are
    /// only reported.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        let blocked = self.size();
        if blocked == 0 {
            return;
        }
        if self.interrupt_threads_while_stopping {
            let woken = self.interrupt_all();
            info!(interrupted = woken, "Interrupted blocked callers while stopping");
        } else {
            warn!(blocked, "Shutting down with callers still waiting for asynchronous callbacks");
        }
    }

    /// Returns true once [`AwaitManager::shutdown`] was called.
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Returns the counters.
    #[must_use]
    pub fn statistics(&self) -> AwaitStatistics {
        self.counters.snapshot()
    }

    /// Resets the counters.
    pub fn reset_statistics(&self) {
        self.counters.reset();
    }

    /// Converts to a dictionary representation for diagnostics.
    #[must_use]
    pub fn to_dict(&self) -> serde_json::Value {
        serde_json::json!({
            "generated_at": iso_timestamp(),
            "size": self.size(),
            "statistics": self.statistics(),
            "entries": self.browse(),
        })
    }
}

/// Removes a caller's own entry when `await_stage` returns or unwinds.
struct Registration<'a> {
    registry: &'a Registry,
    entry: &'a Arc<AwaitEntry>,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.registry.remove_if(&self.entry.id, |_, e| Arc::ptr_eq(e, self.entry));
    }
}

impl fmt::Debug for AwaitManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwaitManager")
            .field("size", &self.size())
            .field("interrupt_threads_while_stopping", &self.interrupt_threads_while_stopping)
            .finish()
    }
}
