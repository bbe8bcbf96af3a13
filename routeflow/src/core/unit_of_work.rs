//! The unit of work routed through pipeline stages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::RouteflowError;

/// Unique identifier of a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitOfWorkId(Uuid);

impl UnitOfWorkId {
    /// Creates a new time-ordered identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Wraps an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for UnitOfWorkId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UnitOfWorkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Immutable copy of a message captured at pipeline entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageSnapshot {
    /// The message body.
    pub body: serde_json::Value,
    /// The message headers.
    pub headers: HashMap<String, serde_json::Value>,
    /// When the snapshot was captured.
    pub captured_at: DateTime<Utc>,
}

/// A message flowing through the pipeline.
///
/// Carries a mutable failure slot and redelivery bookkeeping alongside the
/// payload. The original snapshot is captured once and never mutated.
#[derive(Debug)]
pub struct UnitOfWork {
    id: UnitOfWorkId,
    route_id: Option<String>,
    /// The message body.
    pub body: serde_json::Value,
    /// The message headers.
    pub headers: HashMap<String, serde_json::Value>,
    original: Arc<MessageSnapshot>,
    failure: Option<anyhow::Error>,
    caught_failure: Option<anyhow::Error>,
    redelivery_counter: u32,
    redelivered: bool,
    exhausted: bool,
    handled: bool,
    created_at: DateTime<Utc>,
}

impl UnitOfWork {
    /// Creates a new unit of work and captures its original snapshot.
    #[must_use]
    pub fn new(body: serde_json::Value) -> Self {
        Self::with_headers(body, HashMap::new())
    }

    /// Creates a new unit of work with headers.
    #[must_use]
    pub fn with_headers(body: serde_json::Value, headers: HashMap<String, serde_json::Value>) -> Self {
        let now = Utc::now();
        let original = Arc::new(MessageSnapshot {
            body: body.clone(),
            headers: headers.clone(),
            captured_at: now,
        });

        Self {
            id: UnitOfWorkId::new(),
            route_id: None,
            body,
            headers,
            original,
            failure: None,
            caught_failure: None,
            redelivery_counter: 0,
            redelivered: false,
            exhausted: false,
            handled: false,
            created_at: now,
        }
    }

    /// Sets the route this unit of work belongs to.
    #[must_use]
    pub fn with_route_id(mut self, route_id: impl Into<String>) -> Self {
        self.route_id = Some(route_id.into());
        self
    }

    /// Replaces the generated identifier.
    #[must_use]
    pub fn with_id(mut self, id: UnitOfWorkId) -> Self {
        self.id = id;
        self
    }

    /// Returns the identifier.
    #[must_use]
    pub const fn id(&self) -> UnitOfWorkId {
        self.id
    }

    /// Returns the route identifier, if any.
    #[must_use]
    pub fn route_id(&self) -> Option<&str> {
        self.route_id.as_deref()
    }

    /// Returns when the unit of work was created.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns a shared reference to the original snapshot.
    #[must_use]
    pub fn original(&self) -> Arc<MessageSnapshot> {
        Arc::clone(&self.original)
    }

    /// Replaces body and headers with the original snapshot.
    pub fn restore_original(&mut self) {
        self.body = self.original.body.clone();
        self.headers = self.original.headers.clone();
    }

    /// Gets a header value.
    #[must_use]
    pub fn header(&self, key: &str) -> Option<&serde_json::Value> {
        self.headers.get(key)
    }

    /// Sets a header value.
    pub fn set_header(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.headers.insert(key.into(), value);
    }

    /// Returns the current failure, if any.
    #[must_use]
    pub const fn failure(&self) -> Option<&anyhow::Error> {
        self.failure.as_ref()
    }

    /// Returns true if a failure is set.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Records a failure, replacing any previous one.
    pub fn set_failure(&mut self, failure: impl Into<anyhow::Error>) {
        self.failure = Some(failure.into());
    }

    /// Removes and returns the current failure.
    pub fn take_failure(&mut self) -> Option<anyhow::Error> {
        self.failure.take()
    }

    /// Returns the failure moved aside when a terminal sink handled it.
    #[must_use]
    pub const fn caught_failure(&self) -> Option<&anyhow::Error> {
        self.caught_failure.as_ref()
    }

    /// Moves the current failure into the caught slot.
    pub fn move_failure_to_caught(&mut self) {
        if let Some(failure) = self.failure.take() {
            self.caught_failure = Some(failure);
        }
    }

    /// Returns the redelivery counter.
    #[must_use]
    pub const fn redelivery_counter(&self) -> u32 {
        self.redelivery_counter
    }

    /// Returns true if this unit of work has been redelivered at least once.
    #[must_use]
    pub const fn is_redelivered(&self) -> bool {
        self.redelivered
    }

    /// Returns true if redelivery has been exhausted.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Returns true if a terminal sink handled the failure.
    #[must_use]
    pub const fn is_handled(&self) -> bool {
        self.handled
    }

    pub(crate) fn mark_redelivery(&mut self, counter: u32) {
        self.redelivery_counter = counter;
        self.redelivered = counter > 0;
    }

    pub(crate) fn set_exhausted(&mut self, exhausted: bool) {
        self.exhausted = exhausted;
    }

    pub(crate) fn set_handled(&mut self, handled: bool) {
        self.handled = handled;
    }

    /// Creates a copy for a parallel branch.
    ///
    /// The copy gets a fresh identifier and a clean failure slot but shares
    /// the original snapshot.
    #[must_use]
    pub fn copy_for_branch(&self) -> Self {
        Self {
            id: UnitOfWorkId::new(),
            route_id: self.route_id.clone(),
            body: self.body.clone(),
            headers: self.headers.clone(),
            original: Arc::clone(&self.original),
            failure: None,
            caught_failure: None,
            redelivery_counter: 0,
            redelivered: false,
            exhausted: false,
            handled: false,
            created_at: Utc::now(),
        }
    }

    /// Converts into a result for synchronous callers.
    ///
    /// A failed, exhausted unit of work becomes `RedeliveryExhausted` wrapping
    /// the last real cause; any other failure is returned as-is.
    pub fn into_result(mut self) -> Result<Self, RouteflowError> {
        match self.failure.take() {
            None => Ok(self),
            Some(cause) => match cause.downcast::<RouteflowError>() {
                Ok(err) => Err(err),
                Err(cause) if self.exhausted => Err(RouteflowError::RedeliveryExhausted {
                    unit_of_work_id: self.id,
                    attempts: self.redelivery_counter + 1,
                    cause,
                }),
                Err(cause) => Err(RouteflowError::Stage(cause)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_original_snapshot_is_immutable() {
        let mut uow = UnitOfWork::new(serde_json::json!({"order": 1}));
        uow.body = serde_json::json!({"order": 2});
        uow.set_header("stage", serde_json::json!("enriched"));

        let original = uow.original();
        assert_eq!(original.body, serde_json::json!({"order": 1}));
        assert!(original.headers.is_empty());

        uow.restore_original();
        assert_eq!(uow.body, serde_json::json!({"order": 1}));
        assert!(uow.header("stage").is_none());
    }

    #[test]
    fn test_failure_slot() {
        let mut uow = UnitOfWork::new(serde_json::Value::Null);
        assert!(!uow.is_failed());

        uow.set_failure(anyhow::anyhow!("first"));
        uow.set_failure(anyhow::anyhow!("second"));
        assert_eq!(uow.failure().map(ToString::to_string), Some("second".to_string()));

        uow.move_failure_to_caught();
        assert!(!uow.is_failed());
        assert_eq!(uow.caught_failure().map(ToString::to_string), Some("second".to_string()));
    }

    #[test]
    fn test_copy_for_branch() {
        let uow = UnitOfWork::new(serde_json::json!("payload")).with_route_id("orders");
        let copy = uow.copy_for_branch();

        assert_ne!(copy.id(), uow.id());
        assert_eq!(copy.route_id(), Some("orders"));
        assert_eq!(copy.body, uow.body);
        assert!(Arc::ptr_eq(&copy.original(), &uow.original()));
    }

    #[test]
    fn test_into_result_ok() {
        let uow = UnitOfWork::new(serde_json::json!(1));
        assert!(uow.into_result().is_ok());
    }

    #[test]
    fn test_into_result_exhausted() {
        let mut uow = UnitOfWork::new(serde_json::json!(1));
        uow.set_failure(anyhow::anyhow!("down"));
        uow.mark_redelivery(2);
        uow.set_exhausted(true);

        let err = uow.into_result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RedeliveryExhausted);
        assert!(err.to_string().contains("after 3 attempt(s): down"));
    }

    #[test]
    fn test_into_result_unwraps_core_errors() {
        let mut uow = UnitOfWork::new(serde_json::json!(1));
        uow.set_failure(RouteflowError::capacity_exceeded("pool", 1, 1));

        let err = uow.into_result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CapacityExceeded);
    }
}
