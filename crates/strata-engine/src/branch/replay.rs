use std::sync::Arc;

use tracing::info;

use strata_core::error::Result;
use strata_core::types::*;
use strata_store::WorkflowStore;

use super::{context_at, node_of_run};
use crate::state_machine::Machines;

/// Rewinds a run so execution can resume from a chosen node.
pub struct ReplayManager {
    store: Arc<WorkflowStore>,
    machines: Machines,
    actor: String,
}

impl ReplayManager {
    pub fn new(store: Arc<WorkflowStore>, machines: Machines, actor: impl Into<String>) -> Self {
        Self {
            store,
            machines,
            actor: actor.into(),
        }
    }

    /// Reset `node_id` and every later node (and their steps) to `pending`,
    /// restore the nearest earlier checkpoint with `context_override` merged
    /// in, and leave the run `executing`. Nothing is executed.
    pub fn play_from_node(
        &self,
        run_id: &str,
        node_id: &str,
        context_override: Option<&ExtraFields>,
    ) -> Result<ContextSnapshot> {
        let run = self.store.require_run(run_id)?;
        let target = node_of_run(&self.store, run_id, node_id)?;
        let from = target.order_index;
        let reason = format!("replay from node {}", node_id);

        let mut context = context_at(&self.store, run_id, from - 1)?;
        if let Some(overrides) = context_override {
            context.merge_overrides(overrides);
        }

        let nodes = self.store.list_nodes(run_id)?;
        let reset_ids: Vec<String> = nodes
            .iter()
            .filter(|n| n.order_index >= from)
            .map(|n| n.id.clone())
            .collect();
        context.completed_nodes.retain(|id| !reset_ids.contains(id));
        context.outputs.retain(|id, _| !reset_ids.contains(id));

        for id in &reset_ids {
            self.machines
                .nodes
                .reset(id, NodeStatus::Pending, Some(&reason), &self.actor)?;
        }
        let steps = self.store.list_steps(run_id)?;
        for step in steps.iter().filter(|s| s.step_number >= from) {
            self.machines
                .steps
                .reset(&step.id, StepStatus::Pending, Some(&reason), &self.actor)?;
        }
        self.store.clear_results(&reset_ids)?;

        // The executor resumes from the latest checkpoint.
        let checkpoint = Checkpoint::new(run_id, CheckpointType::Manual, context.clone())
            .at_step(None, from - 1);
        self.store.insert_checkpoint(&checkpoint)?;

        if run.status != RunStatus::Executing {
            if self.machines.runs.can_transition_to(run_id, RunStatus::Executing) {
                self.machines
                    .runs
                    .transition_to(run_id, RunStatus::Executing, Some(&reason), &self.actor)?;
            } else {
                self.machines
                    .runs
                    .reset(run_id, RunStatus::Executing, Some(&reason), &self.actor)?;
            }
        }

        info!(
            run_id,
            node_id,
            order_index = from,
            reset_nodes = reset_ids.len(),
            "Run rewound for replay"
        );
        Ok(context)
    }
}
