//! Forking runs at a node, replaying from a node, and comparing the results.

pub mod compare;
pub mod manager;
pub mod replay;

pub use compare::{
    BranchComparator, BranchComparison, BranchTree, FileDiff, MetricComparison, MetricSummary,
    StepDiff,
};
pub use manager::{BranchManager, BranchOptions, Modifications};
pub use replay::ReplayManager;

use tracing::warn;

use strata_core::error::Result;
use strata_core::types::*;
use strata_store::WorkflowStore;

/// Checkpoint context at or before `step_number`, or an empty one.
pub(crate) fn context_at(store: &WorkflowStore, run_id: &str, step_number: i64) -> Result<ContextSnapshot> {
    match store.latest_checkpoint(run_id, Some(step_number))? {
        Some(cp) => Ok(cp.context_snapshot),
        None => {
            warn!(run_id, step_number, "No checkpoint at or before step, starting from empty context");
            Ok(ContextSnapshot::default())
        }
    }
}

/// Load a node and make sure it belongs to `run_id`.
pub(crate) fn node_of_run(store: &WorkflowStore, run_id: &str, node_id: &str) -> Result<Node> {
    let node = store.require_node(node_id)?;
    if node.run_id != run_id {
        return Err(strata_core::error::StrataError::not_found(
            "node",
            format!("{} in run {}", node_id, run_id),
        ));
    }
    Ok(node)
}
