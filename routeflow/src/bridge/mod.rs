//! Blocking bridge over asynchronous stages.
//!
//! The [`AwaitManager`] lets a caller that must stay synchronous block until
//! an asynchronous stage calls back, while keeping a registry of every
//! blocked caller for diagnostics and targeted interruption.

mod entry;
mod manager;
mod statistics;

pub use entry::{AwaitEntrySnapshot, AwaitState};
pub use manager::AwaitManager;
pub use statistics::AwaitStatistics;
