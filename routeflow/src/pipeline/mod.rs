//! Composite stages.
//!
//! This module provides:
//! - [`Multicast`], running a copy of a unit of work through parallel branches
//! - Aggregation strategies merging the branch results

mod aggregation;
mod multicast;

#[cfg(test)]
mod integration_tests;

pub use aggregation::{AggregationStrategy, GroupedBodies, UseLatest};
pub use multicast::Multicast;
