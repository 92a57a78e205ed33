//! Execution graph: building it from a plan, ordering it, and running it.

pub mod builder;
pub mod executor;
pub mod scheduler;
pub mod workspace;

pub use builder::{step_label, DagBuilder, DagMap, PLANNING_LABEL, TERMINATOR_LABEL};
pub use executor::{DagExecutor, ExecutionSummary, LevelOutcome, NodeOutcome};
pub use scheduler::Scheduler;
pub use workspace::{copy_tree, file_digests, RunWorkspace};
