//! Planning and execution.
//!
//! The diff engine turns desired and recorded state into a change plan, the
//! graph orders that plan into dependency levels, and the executor applies
//! it level by level.

mod diff;
mod executor;
mod graph;
mod plan;

pub use diff::DiffEngine;
pub use executor::{Executor, Outcome, ResourceOutcome, RunCounts, RunReport};
pub use graph::{DependencyGraph, EdgeKind, GraphBuilder};
pub use plan::{Action, ActionKind, AttributeChange, ChangePlan};
