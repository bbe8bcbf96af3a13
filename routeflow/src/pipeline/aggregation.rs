//! Strategies merging branch results.

use crate::core::UnitOfWork;

/// Merges a finished branch into the running aggregate.
///
/// `aggregated` is `None` for the first branch to be merged.
pub trait AggregationStrategy: Send + Sync {
    /// Returns the new aggregate.
    fn aggregate(&self, aggregated: Option<UnitOfWork>, branch: UnitOfWork) -> UnitOfWork;
}

impl<F> AggregationStrategy for F
where
    F: Fn(Option<UnitOfWork>, UnitOfWork) -> UnitOfWork + Send + Sync,
{
    fn aggregate(&self, aggregated: Option<UnitOfWork>, branch: UnitOfWork) -> UnitOfWork {
        self(aggregated, branch)
    }
}

/// Keeps the most recently merged branch.
///
/// A failure already on the aggregate carries over to the newer branch.
#[derive(Debug, Clone, Copy, Default)]
pub struct UseLatest;

impl AggregationStrategy for UseLatest {
    fn aggregate(&self, aggregated: Option<UnitOfWork>, mut branch: UnitOfWork) -> UnitOfWork {
        if let Some(failure) = aggregated.and_then(|mut previous| previous.take_failure()) {
            if !branch.is_failed() {
                branch.set_failure(failure);
            }
        }
        branch
    }
}

/// Collects every branch body into a JSON array, in merge order.
///
/// The first branch's failure, if any, is kept on the aggregate.
#[derive(Debug, Clone, Copy, Default)]
pub struct GroupedBodies;

impl AggregationStrategy for GroupedBodies {
    fn aggregate(&self, aggregated: Option<UnitOfWork>, mut branch: UnitOfWork) -> UnitOfWork {
        let Some(mut aggregate) = aggregated else {
            let body = std::mem::take(&mut branch.body);
            branch.body = serde_json::Value::Array(vec![body]);
            return branch;
        };

        if let serde_json::Value::Array(bodies) = &mut aggregate.body {
            bodies.push(std::mem::take(&mut branch.body));
        }
        if !aggregate.is_failed() {
            if let Some(failure) = branch.take_failure() {
                aggregate.set_failure(failure);
            }
        }
        aggregate
    }
}
