//! Hook and failure sink doubles.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::core::{UnitOfWork, UnitOfWorkId};
use crate::redelivery::FailureSink;

/// Counts hook invocations, optionally failing each one.
#[derive(Debug, Clone, Default)]
pub struct CountingHook {
    calls: Arc<AtomicUsize>,
    failure: Option<String>,
}

impl CountingHook {
    /// Creates a hook that always succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a hook that fails with `message` on every call.
    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            failure: Some(message.into()),
        }
    }

    /// Returns how many times the hook ran.
    #[must_use]
    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn record(&self) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.failure {
            Some(message) => Err(anyhow::anyhow!("{message}")),
            None => Ok(()),
        }
    }

    /// Returns the hook as a processor closure.
    pub fn processor(&self) -> impl Fn(&mut UnitOfWork) -> anyhow::Result<()> + Send + Sync + 'static {
        let hook = self.clone();
        move |_| hook.record()
    }

    /// Returns the hook as a read-only observer closure.
    pub fn observer(&self) -> impl Fn(&UnitOfWork) -> anyhow::Result<()> + Send + Sync + 'static {
        let hook = self.clone();
        move |_| hook.record()
    }
}

/// A sink that records what it received.
#[derive(Debug, Default)]
pub struct CollectingSink {
    received: Mutex<Vec<(UnitOfWorkId, serde_json::Value)>>,
}

impl CollectingSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns how many units of work were dispatched.
    #[must_use]
    pub fn count(&self) -> usize {
        self.received.lock().len()
    }

    /// Returns the identifiers received, in dispatch order.
    #[must_use]
    pub fn ids(&self) -> Vec<UnitOfWorkId> {
        self.received.lock().iter().map(|(id, _)| *id).collect()
    }

    /// Returns the bodies received, in dispatch order.
    #[must_use]
    pub fn bodies(&self) -> Vec<serde_json::Value> {
        self.received.lock().iter().map(|(_, body)| body.clone()).collect()
    }
}

impl FailureSink for CollectingSink {
    fn name(&self) -> &str {
        "collecting"
    }

    fn dispatch(&self, uow: &mut UnitOfWork) -> anyhow::Result<()> {
        self.received.lock().push((uow.id(), uow.body.clone()));
        Ok(())
    }
}

/// A sink whose every dispatch fails.
#[derive(Debug)]
pub struct FailingSink {
    message: String,
    calls: AtomicUsize,
}

impl FailingSink {
    /// Creates a sink failing with `message`.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Returns how many dispatches were attempted.
    #[must_use]
    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl FailureSink for FailingSink {
    fn name(&self) -> &str {
        "failing"
    }

    fn dispatch(&self, _uow: &mut UnitOfWork) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("{}", self.message)
    }
}
