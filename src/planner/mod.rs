//! Planning and execution.
//!
//! This module diffs the resource graph against recorded state, produces
//! an ordered [`Plan`] and applies it through a provider.

mod diff;
mod engine;
mod executor;
mod plan;
mod report;

pub use diff::{AttributeChange, DiffEngine, PlannedAttributes, PlannedValue};
pub use engine::{Planner, destroy_plan};
pub use executor::{DEFAULT_PARALLELISM, Executor, ExecutorOptions};
pub use plan::{Action, Plan, PlanEntry, PlanSummary, ReviewEntry};
pub use report::{ApplyReport, StepOutcome, StepStatus};
