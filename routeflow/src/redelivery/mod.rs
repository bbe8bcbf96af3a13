//! Redelivery and terminal failure handling.
//!
//! A [`RedeliveryErrorHandler`] wraps a stage. When the stage records a
//! failure, the handler:
//! - notifies the on-exception-occurred observer
//! - redelivers under its [`RedeliveryPolicy`], sleeping or scheduling the delay
//! - on exhaustion, prepares the unit of work and dispatches it to a
//!   [`FailureSink`]

mod handler;
mod policy;
mod sink;

pub use handler::{RedeliveryErrorHandler, RedeliveryErrorHandlerBuilder, RedeliveryStatistics};
pub use policy::RedeliveryPolicy;
pub use sink::{DeadLetter, DeadLetterQueue, FailureSink, LoggingFailureSink};

#[cfg(test)]
pub(crate) use sink::MockFailureSink;
