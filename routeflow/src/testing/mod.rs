//! Testing utilities for routeflow stages and handlers.
//!
//! This module provides:
//! - A [`Latch`] for gating worker threads
//! - Stage doubles that fail, recover or complete later
//! - Counting hooks and recording failure sinks

mod hooks;
mod latch;
mod stages;

pub use hooks::{CollectingSink, CountingHook, FailingSink};
pub use latch::Latch;
pub use stages::{AlwaysFailingStage, DeferredStage, FlakyStage};
