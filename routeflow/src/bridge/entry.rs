//! Per-caller await entries and their state machine.

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use crate::core::{UnitOfWork, UnitOfWorkId};

/// State of one await entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AwaitState {
    /// Registered, caller not yet parked.
    NotWaiting,
    /// Caller parked on the entry.
    Blocked,
    /// Stage called back; terminal.
    Completed,
    /// Interrupted by an external actor; terminal.
    Interrupted,
}

const NOT_WAITING: u8 = 0;
const BLOCKED: u8 = 1;
const COMPLETED: u8 = 2;
const INTERRUPTED: u8 = 3;

impl AwaitState {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            NOT_WAITING => Self::NotWaiting,
            BLOCKED => Self::Blocked,
            COMPLETED => Self::Completed,
            _ => Self::Interrupted,
        }
    }
}

/// Read-only view of an await entry, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct AwaitEntrySnapshot {
    /// Identifier of the awaited unit of work.
    pub unit_of_work_id: UnitOfWorkId,
    /// Route of the unit of work, if any.
    pub route_id: Option<String>,
    /// Name of the stage being awaited.
    pub node_id: String,
    /// Name of the blocked thread.
    pub thread_name: Option<String>,
    /// Debug form of the blocked thread's id.
    pub thread_id: String,
    /// Wall-clock time the caller registered.
    pub started_at: DateTime<Utc>,
    /// How long the caller has been waiting, in milliseconds.
    pub waiting_ms: u64,
    /// Current state.
    pub state: AwaitState,
}

/// One blocked caller.
///
/// All transitions are single compare-and-set operations on `state`, taken
/// under `slot` so a parked caller cannot miss its wake-up.
pub(crate) struct AwaitEntry {
    pub(crate) id: UnitOfWorkId,
    route_id: Option<String>,
    node_id: String,
    thread_name: Option<String>,
    thread_id: String,
    started_at: DateTime<Utc>,
    started: Instant,
    state: AtomicU8,
    slot: Mutex<Option<UnitOfWork>>,
    wake: Condvar,
}

impl AwaitEntry {
    pub(crate) fn new(id: UnitOfWorkId, route_id: Option<String>, node_id: impl Into<String>) -> Self {
        let thread = std::thread::current();
        Self {
            id,
            route_id,
            node_id: node_id.into(),
            thread_name: thread.name().map(str::to_string),
            thread_id: format!("{:?}", thread.id()),
            started_at: Utc::now(),
            started: Instant::now(),
            state: AtomicU8::new(NOT_WAITING),
            slot: Mutex::new(None),
            wake: Condvar::new(),
        }
    }

    pub(crate) fn state(&self) -> AwaitState {
        AwaitState::from_raw(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// `NotWaiting | Blocked -> Completed`.
    ///
    /// Gives the unit of work back if the entry was already interrupted.
    pub(crate) fn complete(&self, uow: UnitOfWork) -> Result<(), UnitOfWork> {
        let mut slot = self.slot.lock();
        let moved = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |s| {
                matches!(s, NOT_WAITING | BLOCKED).then_some(COMPLETED)
            })
            .is_ok();
        if !moved {
            return Err(uow);
        }
        *slot = Some(uow);
        self.wake.notify_all();
        Ok(())
    }

    /// `NotWaiting | Blocked -> Interrupted`.
    pub(crate) fn interrupt(&self) -> bool {
        let _slot = self.slot.lock();
        let moved = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |s| {
                matches!(s, NOT_WAITING | BLOCKED).then_some(INTERRUPTED)
            })
            .is_ok();
        if moved {
            self.wake.notify_all();
        }
        moved
    }

    /// `NotWaiting -> Blocked`, then parks until a terminal state.
    ///
    /// `on_park` runs once the transition succeeded, before parking. Returns
    /// whether the caller actually parked, and the unit of work if the entry
    /// completed.
    pub(crate) fn block(&self, on_park: impl FnOnce()) -> (bool, Option<UnitOfWork>) {
        let mut slot = self.slot.lock();
        let parked = self
            .state
            .compare_exchange(NOT_WAITING, BLOCKED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if parked {
            on_park();
            while self.state.load(Ordering::SeqCst) == BLOCKED {
                self.wake.wait(&mut slot);
            }
        }
        (parked, slot.take())
    }

    /// Takes the result of an entry completed before anyone parked.
    pub(crate) fn take_completed(&self) -> Option<UnitOfWork> {
        self.slot.lock().take()
    }

    pub(crate) fn snapshot(&self) -> AwaitEntrySnapshot {
        AwaitEntrySnapshot {
            unit_of_work_id: self.id,
            route_id: self.route_id.clone(),
            node_id: self.node_id.clone(),
            thread_name: self.thread_name.clone(),
            thread_id: self.thread_id.clone(),
            started_at: self.started_at,
            waiting_ms: u64::try_from(self.elapsed().as_millis()).unwrap_or(u64::MAX),
            state: self.state(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn entry() -> AwaitEntry {
        AwaitEntry::new(UnitOfWorkId::new(), Some("orders".into()), "enrich")
    }

    #[test]
    fn test_complete_before_block() {
        let entry = entry();
        assert!(entry.complete(UnitOfWork::new(serde_json::json!(1))).is_ok());
        assert_eq!(entry.state(), AwaitState::Completed);

        let (parked, uow) = entry.block(|| {});
        assert!(!parked);
        assert!(uow.is_some());
    }

    #[test]
    fn test_interrupt_wins_over_late_complete() {
        let entry = entry();
        assert!(entry.interrupt());
        assert!(!entry.interrupt());

        let late = entry.complete(UnitOfWork::new(serde_json::json!(1)));
        assert!(late.is_err());
        assert_eq!(entry.state(), AwaitState::Interrupted);
    }

    #[test]
    fn test_blocked_caller_woken_by_complete() {
        let entry = Arc::new(entry());
        let e = Arc::clone(&entry);
        let waiter = std::thread::spawn(move || e.block(|| {}));

        while entry.state() != AwaitState::Blocked {
            std::thread::yield_now();
        }
        entry.complete(UnitOfWork::new(serde_json::json!("done"))).unwrap();

        let (parked, uow) = waiter.join().unwrap();
        assert!(parked);
        assert_eq!(uow.unwrap().body, serde_json::json!("done"));
    }

    #[test]
    fn test_snapshot_serializes() {
        let entry = entry();
        let json = serde_json::to_value(entry.snapshot()).unwrap();

        assert_eq!(json["node_id"], "enrich");
        assert_eq!(json["route_id"], "orders");
        assert_eq!(json["state"], "not_waiting");
    }
}
