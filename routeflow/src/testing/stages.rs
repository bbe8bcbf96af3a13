//! Stage doubles.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::core::UnitOfWork;
use crate::stages::{DoneCallback, Stage};

/// A synchronous stage that fails its first `failures` invocations.
#[derive(Debug)]
pub struct FlakyStage {
    name: String,
    failures: usize,
    attempts: AtomicUsize,
}

impl FlakyStage {
    /// Creates a stage that succeeds from invocation `failures + 1` on.
    #[must_use]
    pub fn new(name: impl Into<String>, failures: usize) -> Self {
        Self {
            name: name.into(),
            failures,
            attempts: AtomicUsize::new(0),
        }
    }

    /// Returns how many times the stage was invoked.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Stage for FlakyStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, mut uow: UnitOfWork, done: DoneCallback) -> bool {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.failures {
            uow.set_failure(anyhow::anyhow!("{} failed on attempt {attempt}", self.name));
        }
        done(uow);
        true
    }
}

/// A synchronous stage that always fails with the same message.
#[derive(Debug)]
pub struct AlwaysFailingStage {
    name: String,
    message: String,
    attempts: AtomicUsize,
}

impl AlwaysFailingStage {
    /// Creates a stage failing with `message`.
    #[must_use]
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Returns how many times the stage was invoked.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Stage for AlwaysFailingStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, mut uow: UnitOfWork, done: DoneCallback) -> bool {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        uow.set_failure(anyhow::anyhow!("{}", self.message));
        done(uow);
        true
    }
}

/// An asynchronous stage that parks every invocation until released.
///
/// Invocations return "pending"; the test completes them from any thread
/// with [`DeferredStage::complete_next`] or [`DeferredStage::fail_next`].
pub struct DeferredStage {
    name: String,
    pending: Mutex<VecDeque<(UnitOfWork, DoneCallback)>>,
}

impl DeferredStage {
    /// Creates a stage with nothing parked.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Returns the number of parked invocations.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Completes the oldest parked invocation successfully.
    ///
    /// Returns false if nothing was parked.
    pub fn complete_next(&self) -> bool {
        self.release(None)
    }

    /// Completes the oldest parked invocation with a failure.
    pub fn fail_next(&self, message: &str) -> bool {
        self.release(Some(message))
    }

    /// Completes every parked invocation, returning how many there were.
    pub fn complete_all(&self) -> usize {
        let parked: Vec<_> = self.pending.lock().drain(..).collect();
        let count = parked.len();
        for (uow, done) in parked {
            done(uow);
        }
        count
    }

    fn release(&self, failure: Option<&str>) -> bool {
        let next = self.pending.lock().pop_front();
        let Some((mut uow, done)) = next else {
            return false;
        };
        if let Some(message) = failure {
            uow.set_failure(anyhow::anyhow!("{message}"));
        }
        done(uow);
        true
    }
}

impl fmt::Debug for DeferredStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredStage")
            .field("name", &self.name)
            .field("pending", &self.pending())
            .finish()
    }
}

impl Stage for DeferredStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, uow: UnitOfWork, done: DoneCallback) -> bool {
        self.pending.lock().push_back((uow, done));
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::done_callback;
    use std::sync::Arc;

    #[test]
    fn test_flaky_stage_recovers() {
        let stage = FlakyStage::new("flaky", 1);
        let failed = Arc::new(Mutex::new(Vec::new()));

        for _ in 0..3 {
            let f = Arc::clone(&failed);
            stage.invoke(
                UnitOfWork::new(serde_json::Value::Null),
                done_callback(move |uow| f.lock().push(uow.is_failed())),
            );
        }

        assert_eq!(*failed.lock(), vec![true, false, false]);
        assert_eq!(stage.attempts(), 3);
    }

    #[test]
    fn test_deferred_stage_parks_until_released() {
        let stage = DeferredStage::new("deferred");
        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);

        let sync = stage.invoke(
            UnitOfWork::new(serde_json::Value::Null),
            done_callback(move |uow| *s.lock() = Some(uow.is_failed())),
        );

        assert!(!sync);
        assert_eq!(stage.pending(), 1);
        assert!(stage.fail_next("late failure"));
        assert_eq!(*seen.lock(), Some(true));
        assert!(!stage.complete_next());
    }
}
