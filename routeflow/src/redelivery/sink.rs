//! Terminal failure sinks.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use tracing::error;

use crate::core::{UnitOfWork, UnitOfWorkId};

/// Destination for units of work whose redelivery is exhausted.
///
/// The sink sees the unit of work after on-prepare-failure ran, with the
/// failure still attached. A returned error is the secondary failure the
/// handler swallows or propagates.
#[cfg_attr(test, mockall::automock)]
pub trait FailureSink: Send + Sync {
    /// Returns the sink name used in logs and errors.
    fn name(&self) -> &str;

    /// Delivers the unit of work out of band.
    fn dispatch(&self, uow: &mut UnitOfWork) -> anyhow::Result<()>;
}

/// A unit of work parked in a [`DeadLetterQueue`].
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    /// Identifier of the unit of work.
    pub unit_of_work_id: UnitOfWorkId,
    /// Route it failed on.
    pub route_id: Option<String>,
    /// Body at dispatch time.
    pub body: serde_json::Value,
    /// Headers at dispatch time.
    pub headers: HashMap<String, serde_json::Value>,
    /// Display form of the failure.
    pub failure: Option<String>,
    /// Retries made before giving up.
    pub redelivery_counter: u32,
    /// When the entry was parked.
    pub dead_lettered_at: DateTime<Utc>,
}

/// An in-memory dead-letter destination.
///
/// With a capacity set, dispatch fails once the queue is full.
pub struct DeadLetterQueue {
    name: String,
    capacity: Option<usize>,
    entries: Mutex<VecDeque<DeadLetter>>,
}

impl DeadLetterQueue {
    /// Creates an unbounded queue.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capacity: None,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Bounds the queue.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Returns the number of parked entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if nothing is parked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Returns a copy of the parked entries, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<DeadLetter> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Removes and returns the oldest entry.
    pub fn pop(&self) -> Option<DeadLetter> {
        self.entries.lock().pop_front()
    }

    /// Removes every entry.
    pub fn drain(&self) -> Vec<DeadLetter> {
        self.entries.lock().drain(..).collect()
    }
}

impl FailureSink for DeadLetterQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn dispatch(&self, uow: &mut UnitOfWork) -> anyhow::Result<()> {
        let mut entries = self.entries.lock();
        if let Some(capacity) = self.capacity {
            anyhow::ensure!(
                entries.len() < capacity,
                "dead letter queue '{}' is full ({capacity} entries)",
                self.name
            );
        }

        entries.push_back(DeadLetter {
            unit_of_work_id: uow.id(),
            route_id: uow.route_id().map(str::to_string),
            body: uow.body.clone(),
            headers: uow.headers.clone(),
            failure: uow.failure().map(|f| format!("{f:#}")),
            redelivery_counter: uow.redelivery_counter(),
            dead_lettered_at: Utc::now(),
        });
        Ok(())
    }
}

impl fmt::Debug for DeadLetterQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadLetterQueue")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

/// A sink that only logs the failure at error level.
#[derive(Debug, Clone, Default)]
pub struct LoggingFailureSink;

impl FailureSink for LoggingFailureSink {
    fn name(&self) -> &str {
        "logging"
    }

    fn dispatch(&self, uow: &mut UnitOfWork) -> anyhow::Result<()> {
        error!(
            unit_of_work_id = %uow.id(),
            route_id = uow.route_id().unwrap_or_default(),
            redelivery_counter = uow.redelivery_counter(),
            failure = uow.failure().map(|f| format!("{f:#}")).unwrap_or_default(),
            "Unit of work failed after redelivery"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed_uow() -> UnitOfWork {
        let mut uow = UnitOfWork::new(serde_json::json!({"order": 42})).with_route_id("orders");
        uow.set_failure(anyhow::anyhow!("gateway timeout"));
        uow
    }

    #[test]
    fn test_dead_letter_queue_records_entry() {
        let dlq = DeadLetterQueue::new("dlq");
        let mut uow = failed_uow();
        dlq.dispatch(&mut uow).unwrap();

        let entries = dlq.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].unit_of_work_id, uow.id());
        assert_eq!(entries[0].failure.as_deref(), Some("gateway timeout"));
        assert_eq!(entries[0].body, serde_json::json!({"order": 42}));

        let json = serde_json::to_value(&entries[0]).unwrap();
        assert_eq!(json["route_id"], "orders");
    }

    #[test]
    fn test_bounded_dead_letter_queue_fails_when_full() {
        let dlq = DeadLetterQueue::new("dlq").with_capacity(1);
        dlq.dispatch(&mut failed_uow()).unwrap();

        let err = dlq.dispatch(&mut failed_uow()).unwrap_err();
        assert!(err.to_string().contains("is full"));
        assert_eq!(dlq.len(), 1);

        assert!(dlq.pop().is_some());
        assert!(dlq.is_empty());
    }

    #[test]
    fn test_logging_sink_never_fails() {
        assert!(LoggingFailureSink.dispatch(&mut failed_uow()).is_ok());
    }
}
