//! Result handles for submitted closures, backed by tokio oneshot channels.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

use crate::errors::{Result, RouteflowError};

/// The sending half shared by a task's run and discard paths.
///
/// Only the first completion is delivered.
pub(crate) struct Completer<T> {
    tx: Arc<Mutex<Option<oneshot::Sender<T>>>>,
}

impl<T> Clone for Completer<T> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
        }
    }
}

impl<T> Completer<T> {
    pub(crate) fn complete(&self, value: T) -> bool {
        match self.tx.lock().take() {
            // A dropped handle is not an error for the sender.
            Some(tx) => {
                let _ = tx.send(value);
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.tx.lock().is_none()
    }
}

/// Creates a completer and the handle that observes it.
pub(crate) fn completion<T>(runtime: Handle) -> (Completer<Result<T>>, TaskHandle<T>) {
    let (tx, rx) = oneshot::channel();
    let completer = Completer {
        tx: Arc::new(Mutex::new(Some(tx))),
    };
    let handle = TaskHandle {
        slot: Mutex::new(Slot::Waiting(rx)),
        runtime,
    };
    (completer, handle)
}

enum Slot<T> {
    Waiting(oneshot::Receiver<Result<T>>),
    Ready(Result<T>),
}

fn dropped() -> RouteflowError {
    RouteflowError::rejected("task-handle", "task dropped without completing")
}

/// Handle to the result of a submitted closure.
///
/// The blocking joins must not be called from inside an async context.
pub struct TaskHandle<T> {
    slot: Mutex<Slot<T>>,
    runtime: Handle,
}

impl<T> TaskHandle<T> {
    /// Returns true once the task finished, failed or was discarded.
    #[must_use]
    pub fn is_done(&self) -> bool {
        let mut slot = self.slot.lock();
        let received = match &mut *slot {
            Slot::Ready(_) => return true,
            Slot::Waiting(rx) => match rx.try_recv() {
                Ok(value) => value,
                Err(oneshot::error::TryRecvError::Empty) => return false,
                Err(oneshot::error::TryRecvError::Closed) => Err(dropped()),
            },
        };
        *slot = Slot::Ready(received);
        true
    }

    /// Blocks until the task finishes.
    ///
    /// # Errors
    ///
    /// `TaskPanicked` if the closure panicked, `Rejected` if it was discarded
    /// or dropped by a stopped executor.
    pub fn join(self) -> Result<T> {
        match self.slot.into_inner() {
            Slot::Ready(value) => value,
            Slot::Waiting(rx) => rx.blocking_recv().unwrap_or_else(|_| Err(dropped())),
        }
    }

    /// Blocks until the task finishes or the timeout elapses.
    ///
    /// On timeout the handle is returned so the caller can wait again.
    pub fn join_timeout(self, timeout: Duration) -> std::result::Result<Result<T>, Self> {
        let Self { slot, runtime } = self;
        let mut rx = match slot.into_inner() {
            Slot::Ready(value) => return Ok(value),
            Slot::Waiting(rx) => rx,
        };

        match runtime.block_on(async { tokio::time::timeout(timeout, &mut rx).await }) {
            Ok(received) => Ok(received.unwrap_or_else(|_| Err(dropped()))),
            Err(_) => Err(Self {
                slot: Mutex::new(Slot::Waiting(rx)),
                runtime,
            }),
        }
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("done", &self.is_done())
            .finish()
    }
}
