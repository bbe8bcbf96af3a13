//! Rejection policies applied when an executor cannot accept a task.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::BoxTask;
use crate::errors::{Result, RouteflowError};

/// What happens to a task when a bounded queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionPolicy {
    /// Notify the task if it can be notified, otherwise fail the submission.
    Abort,
    /// Run the task on the submitting thread.
    #[default]
    CallerRuns,
    /// Drop the task, notifying it if it can be notified.
    Discard,
    /// Drop the oldest queued task, then enqueue the new one.
    DiscardOldest,
}

/// Result of applying a rejection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionOutcome {
    /// The task was notified and not run.
    Aborted,
    /// The task ran on the calling thread.
    RunByCaller,
    /// The task was dropped without running.
    Dropped,
    /// The oldest queued task was dropped and the new one enqueued.
    DroppedOldestThenEnqueue,
}

/// The executor-side operations a rejection policy needs.
pub trait RejectionTarget {
    /// Name used in errors and logs.
    fn target_name(&self) -> &str;

    /// Returns true if the executor is shutting down.
    fn is_shutting_down(&self) -> bool;

    /// Atomically removes the oldest queued task and enqueues `task`.
    ///
    /// Returns the evicted task, or gives `task` back if it could not be
    /// enqueued.
    fn evict_oldest_and_offer(&self, task: BoxTask) -> std::result::Result<Option<BoxTask>, BoxTask>;
}

fn notify(mut task: BoxTask) -> bool {
    match task.as_rejectable() {
        Some(rejectable) => {
            rejectable.reject();
            true
        }
        None => false,
    }
}

impl RejectionPolicy {
    /// Applies the policy to a task the executor could not accept.
    ///
    /// # Errors
    ///
    /// Returns `Rejected` under [`RejectionPolicy::Abort`] when the task has
    /// no discard-notification capability.
    pub fn reject(self, task: BoxTask, target: &dyn RejectionTarget) -> Result<RejectionOutcome> {
        match self {
            Self::Abort => {
                if notify(task) {
                    debug!(executor = %target.target_name(), "Rejected task notified (abort)");
                    Ok(RejectionOutcome::Aborted)
                } else if target.is_shutting_down() {
                    Err(RouteflowError::shutdown(target.target_name()))
                } else {
                    Err(RouteflowError::rejected(
                        target.target_name(),
                        "queue is full and the task cannot be notified",
                    ))
                }
            }
            Self::CallerRuns => {
                if target.is_shutting_down() {
                    notify(task);
                    Ok(RejectionOutcome::Dropped)
                } else {
                    task.run();
                    Ok(RejectionOutcome::RunByCaller)
                }
            }
            Self::Discard => {
                notify(task);
                Ok(RejectionOutcome::Dropped)
            }
            Self::DiscardOldest => {
                if target.is_shutting_down() {
                    notify(task);
                    return Ok(RejectionOutcome::Dropped);
                }
                match target.evict_oldest_and_offer(task) {
                    Ok(evicted) => {
                        if let Some(oldest) = evicted {
                            notify(oldest);
                        }
                        Ok(RejectionOutcome::DroppedOldestThenEnqueue)
                    }
                    Err(task) => {
                        notify(task);
                        Ok(RejectionOutcome::Dropped)
                    }
                }
            }
        }
    }
}
