//! Error types for the routeflow core.
//!
//! Every refusal or failure the core raises on its own account is a variant of
//! [`RouteflowError`]. Failures raised by user code (stages, hooks, sinks) are
//! carried as [`anyhow::Error`] and wrapped at most once.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::core::UnitOfWorkId;

/// The main error type for routeflow operations.
#[derive(Debug, Error)]
pub enum RouteflowError {
    /// A bounded scheduler or collector refused admission.
    #[error("Capacity exceeded on '{executor}': queue size {queue_size} reached the limit of {capacity}")]
    CapacityExceeded {
        /// Name of the refusing executor.
        executor: String,
        /// Live queue size observed at admission time.
        queue_size: usize,
        /// Configured maximum queue size.
        capacity: usize,
    },

    /// A task was rejected by the rejection policy.
    #[error("Task rejected by '{executor}': {reason}")]
    Rejected {
        /// Name of the rejecting executor.
        executor: String,
        /// Why the task was rejected.
        reason: String,
    },

    /// The executor no longer accepts work.
    #[error("Executor '{executor}' is shut down")]
    Shutdown {
        /// Name of the executor.
        executor: String,
    },

    /// A blocked caller was interrupted.
    #[error("Interrupted while waiting for asynchronous callback for unit of work {unit_of_work_id}")]
    InterruptedWait {
        /// Identifier of the unit of work the caller was waiting on.
        unit_of_work_id: UnitOfWorkId,
    },

    /// A caller tried to block on an identifier that already has a blocked caller.
    #[error("A caller is already awaiting unit of work {unit_of_work_id}")]
    AlreadyAwaiting {
        /// The duplicated identifier.
        unit_of_work_id: UnitOfWorkId,
    },

    /// No more redelivery attempts are permitted.
    #[error("Redelivery exhausted for unit of work {unit_of_work_id} after {attempts} attempt(s): {cause}")]
    RedeliveryExhausted {
        /// The unit of work identifier.
        unit_of_work_id: UnitOfWorkId,
        /// Total delivery attempts made.
        attempts: u32,
        /// The last real failure.
        #[source]
        cause: anyhow::Error,
    },

    /// The terminal failure sink itself failed.
    #[error("Terminal dispatch to '{sink}' failed: {cause}")]
    TerminalDispatchFailure {
        /// Name of the sink.
        sink: String,
        /// The failure raised by the sink.
        #[source]
        cause: anyhow::Error,
    },

    /// A redelivery hook failed.
    #[error("Hook '{hook}' failed: {cause}")]
    HookFailure {
        /// Which hook failed.
        hook: String,
        /// The failure raised by the hook.
        #[source]
        cause: anyhow::Error,
    },

    /// A unit of work panicked on a worker thread.
    #[error("Task panicked: {0}")]
    TaskPanicked(String),

    /// A configuration value is invalid.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// IO error, raised when an executor runtime cannot be started.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A failure raised by a stage.
    #[error(transparent)]
    Stage(#[from] anyhow::Error),
}

impl RouteflowError {
    /// Creates a capacity exceeded error.
    #[must_use]
    pub fn capacity_exceeded(executor: impl Into<String>, queue_size: usize, capacity: usize) -> Self {
        Self::CapacityExceeded {
            executor: executor.into(),
            queue_size,
            capacity,
        }
    }

    /// Creates a rejected error.
    #[must_use]
    pub fn rejected(executor: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Rejected {
            executor: executor.into(),
            reason: reason.into(),
        }
    }

    /// Creates a shutdown error.
    #[must_use]
    pub fn shutdown(executor: impl Into<String>) -> Self {
        Self::Shutdown {
            executor: executor.into(),
        }
    }

    /// Creates a hook failure error.
    #[must_use]
    pub fn hook_failure(hook: impl Into<String>, cause: anyhow::Error) -> Self {
        Self::HookFailure {
            hook: hook.into(),
            cause,
        }
    }

    /// Returns the taxonomy kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
            Self::Rejected { .. } | Self::Shutdown { .. } => ErrorKind::Rejected,
            Self::InterruptedWait { .. } => ErrorKind::InterruptedWait,
            Self::AlreadyAwaiting { .. } => ErrorKind::AlreadyAwaiting,
            Self::RedeliveryExhausted { .. } => ErrorKind::RedeliveryExhausted,
            Self::TerminalDispatchFailure { .. } => ErrorKind::TerminalDispatchFailure,
            Self::HookFailure { .. } => ErrorKind::HookFailure,
            Self::TaskPanicked(_) => ErrorKind::TaskPanicked,
            Self::InvalidConfiguration(_) => ErrorKind::InvalidConfiguration,
            Self::Io(_) => ErrorKind::Io,
            Self::Stage(_) => ErrorKind::Stage,
        }
    }

    /// Returns true if the error signals that work was refused at admission.
    #[must_use]
    pub fn is_admission_refusal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::CapacityExceeded | ErrorKind::Rejected
        )
    }

    /// Converts to a dictionary representation for diagnostics.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("type".to_string(), serde_json::json!(self.kind()));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));

        match self {
            Self::CapacityExceeded {
                executor,
                queue_size,
                capacity,
            } => {
                map.insert("executor".to_string(), serde_json::json!(executor));
                map.insert("queue_size".to_string(), serde_json::json!(queue_size));
                map.insert("capacity".to_string(), serde_json::json!(capacity));
            }
            Self::Rejected { executor, .. } | Self::Shutdown { executor } => {
                map.insert("executor".to_string(), serde_json::json!(executor));
            }
            Self::InterruptedWait { unit_of_work_id } | Self::AlreadyAwaiting { unit_of_work_id } => {
                map.insert(
                    "unit_of_work_id".to_string(),
                    serde_json::json!(unit_of_work_id.to_string()),
                );
            }
            Self::RedeliveryExhausted {
                unit_of_work_id,
                attempts,
                ..
            } => {
                map.insert(
                    "unit_of_work_id".to_string(),
                    serde_json::json!(unit_of_work_id.to_string()),
                );
                map.insert("attempts".to_string(), serde_json::json!(attempts));
            }
            Self::TerminalDispatchFailure { sink, .. } => {
                map.insert("sink".to_string(), serde_json::json!(sink));
            }
            Self::HookFailure { hook, .. } => {
                map.insert("hook".to_string(), serde_json::json!(hook));
            }
            Self::TaskPanicked(_)
            | Self::InvalidConfiguration(_)
            | Self::Io(_)
            | Self::Stage(_) => {}
        }

        map
    }
}

/// Kinds of errors, used for diagnostics and assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Admission refused by a bounded component.
    CapacityExceeded,
    /// Rejected by policy or shutdown.
    Rejected,
    /// A blocked caller was interrupted.
    InterruptedWait,
    /// Duplicate await registration.
    AlreadyAwaiting,
    /// No more redeliveries.
    RedeliveryExhausted,
    /// Terminal sink failed.
    TerminalDispatchFailure,
    /// A hook failed.
    HookFailure,
    /// A task panicked.
    TaskPanicked,
    /// Invalid configuration.
    InvalidConfiguration,
    /// An IO failure.
    Io,
    /// A stage failure.
    Stage,
}

/// Convenience result alias.
pub type Result<T, E = RouteflowError> = std::result::Result<T, E>;

/// Extracts a readable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_exceeded_message() {
        let err = RouteflowError::capacity_exceeded("redelivery", 10, 10);
        assert!(err.to_string().contains("queue size 10"));
        assert_eq!(err.kind(), ErrorKind::CapacityExceeded);
        assert!(err.is_admission_refusal());
    }

    #[test]
    fn test_stage_error_is_transparent() {
        let err: RouteflowError = anyhow::anyhow!("boom").into();
        assert_eq!(err.to_string(), "boom");
        assert_eq!(err.kind(), ErrorKind::Stage);
    }

    #[test]
    fn test_exhausted_wraps_cause_once() {
        let id = UnitOfWorkId::new();
        let err = RouteflowError::RedeliveryExhausted {
            unit_of_work_id: id,
            attempts: 3,
            cause: anyhow::anyhow!("connection refused"),
        };

        let source = std::error::Error::source(&err).map(ToString::to_string);
        assert_eq!(source, Some("connection refused".to_string()));
        assert!(err.to_string().contains("after 3 attempt(s)"));
    }

    #[test]
    fn test_to_dict() {
        let err = RouteflowError::rejected("pool", "queue full");
        let dict = err.to_dict();

        assert_eq!(dict.get("type").unwrap(), "rejected");
        assert_eq!(dict.get("executor").unwrap(), "pool");
    }

    #[test]
    fn test_shutdown_and_io_map_to_their_kinds() {
        let shutdown = RouteflowError::shutdown("sched");
        assert_eq!(shutdown.kind(), ErrorKind::Rejected);
        assert_eq!(shutdown.to_dict().get("executor").unwrap(), "sched");

        let io: RouteflowError = std::io::Error::new(std::io::ErrorKind::Other, "no threads").into();
        assert_eq!(io.kind(), ErrorKind::Io);

        assert!(serde_json::from_value::<ErrorKind>(serde_json::json!("timeout")).is_err());
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("bad state");
        assert_eq!(panic_message(payload.as_ref()), "bad state");

        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
    }
}
