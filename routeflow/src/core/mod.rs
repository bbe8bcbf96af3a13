//! Core domain model types for routeflow.
//!
//! This module contains the unit of work routed through pipeline stages,
//! its identifier and the immutable snapshot captured at pipeline entry.

mod unit_of_work;

pub use unit_of_work::{MessageSnapshot, UnitOfWork, UnitOfWorkId};
