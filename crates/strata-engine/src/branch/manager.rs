use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use strata_core::error::Result;
use strata_core::event::{EventBus, WorkflowEvent};
use strata_core::types::*;
use strata_store::{BranchFork, WorkflowStore};

use super::{context_at, node_of_run};
use crate::dag::{copy_tree, RunWorkspace};

/// Working-directory folders a branch inherits from its parent.
const INHERITED_DIRS: &[&str] = &["data", "codebase"];

/// Changes applied to the branch's starting context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Modifications {
    #[serde(default)]
    pub context_overrides: ExtraFields,
    #[serde(default)]
    pub parameter_overrides: ExtraFields,
    #[serde(default)]
    pub alternative_approach: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct BranchOptions {
    pub hypothesis: Option<String>,
    pub instructions: Option<String>,
    pub modifications: Option<Modifications>,
}

/// Forks a run at a node into a new child run.
pub struct BranchManager {
    store: Arc<WorkflowStore>,
    workspace: RunWorkspace,
    events: Arc<EventBus>,
}

impl BranchManager {
    pub fn new(store: Arc<WorkflowStore>, workspace: RunWorkspace, events: Arc<EventBus>) -> Self {
        Self {
            store,
            workspace,
            events,
        }
    }

    /// Create a `draft` child run whose history up to `node_id` mirrors the
    /// parent and whose later nodes are pending.
    pub fn create_branch(
        &self,
        run_id: &str,
        node_id: &str,
        name: &str,
        options: BranchOptions,
    ) -> Result<Branch> {
        let parent = self.store.require_run(run_id)?;
        let branch_node = node_of_run(&self.store, run_id, node_id)?;
        let point = branch_node.order_index;

        let parent_step = match self.store.find_step_for_node(run_id, node_id)? {
            Some(step) => step,
            None => {
                warn!(run_id, node_id, "Branch node has no step, using a placeholder");
                let mut step = Step::new(&parent, point, branch_node.task()).for_node(&branch_node);
                step.status = StepStatus::Completed;
                step
            }
        };

        let mut snapshot = context_at(&self.store, run_id, point)?;
        let child = Run::branch_of(&parent);

        // Nodes: keep status up to the branch point, reset the rest.
        let parent_nodes = self.store.list_nodes(run_id)?;
        let id_map: HashMap<String, String> = parent_nodes
            .iter()
            .map(|n| (n.id.clone(), new_id()))
            .collect();
        let nodes: Vec<Node> = parent_nodes
            .iter()
            .map(|n| fork_node(n, &child.id, point, &id_map))
            .collect();

        let edges: Vec<Edge> = self
            .store
            .list_edges(run_id)?
            .into_iter()
            .filter_map(|e| {
                let from = id_map.get(&e.from_node)?;
                let to = id_map.get(&e.to_node)?;
                let mut edge = Edge::new(&child.id, from, to, e.dependency_type);
                edge.condition = e.condition;
                Some(edge)
            })
            .collect();

        let mut child_step_id = None;
        let steps: Vec<Step> = self
            .store
            .list_steps(run_id)?
            .into_iter()
            .filter(|s| s.step_number <= point)
            .map(|s| {
                let copy = fork_step(&s, &child, &id_map);
                if s.step_number == point {
                    child_step_id = Some(copy.id.clone());
                }
                copy
            })
            .collect();

        remap_snapshot(&mut snapshot, &id_map);
        if let Some(mods) = options.modifications {
            snapshot.merge_overrides(&mods.context_overrides);
            for (k, v) in mods.parameter_overrides {
                snapshot.parameter_overrides.insert(k, v);
            }
            if mods.alternative_approach.is_some() {
                snapshot.alternative_approach = mods.alternative_approach;
            }
        }
        if options.instructions.is_some() {
            snapshot.instructions = options.instructions;
        }
        let checkpoint = Checkpoint::new(&child.id, CheckpointType::BranchInitial, snapshot)
            .at_step(child_step_id, point);

        let branch = Branch {
            id: new_id(),
            parent_run_id: parent.id.clone(),
            parent_step_id: Some(parent_step.id.clone()),
            child_run_id: child.id.clone(),
            branch_name: name.to_string(),
            hypothesis: options.hypothesis,
            status: BranchStatus::Active,
            created_at: Utc::now(),
        };

        let fork = BranchFork {
            run: child,
            steps,
            nodes,
            edges,
            checkpoint,
            branch: branch.clone(),
        };
        self.store.insert_branch_fork(&fork)?;
        self.copy_inherited_dirs(&parent.id, &fork.run.id);

        self.events.publish(WorkflowEvent::BranchCreated {
            branch: branch.clone(),
        });
        info!(
            parent_run_id = %parent.id,
            child_run_id = %branch.child_run_id,
            branch = %branch.branch_name,
            step_number = point,
            nodes = fork.nodes.len(),
            steps = fork.steps.len(),
            "Branch created"
        );
        Ok(branch)
    }

    /// Close a branch (completed, merged or abandoned).
    pub fn set_branch_status(&self, child_run_id: &str, status: BranchStatus) -> Result<Branch> {
        let branch = self
            .store
            .get_branch_for_child(child_run_id)?
            .ok_or_else(|| strata_core::error::StrataError::not_found("branch", child_run_id))?;
        self.store.update_branch_status(&branch.id, status)?;
        Ok(Branch { status, ..branch })
    }

    fn copy_inherited_dirs(&self, parent_id: &str, child_id: &str) {
        let from = self.workspace.run_dir(parent_id);
        let to = self.workspace.run_dir(child_id);
        for dir in INHERITED_DIRS {
            match copy_tree(&from.join(dir), &to.join(dir)) {
                Ok(0) => {}
                Ok(files) => info!(child_run_id = child_id, dir, files, "Copied working files into branch"),
                Err(e) => warn!(child_run_id = child_id, dir, error = %e, "Failed to copy working files"),
            }
        }
    }
}

fn fork_node(node: &Node, child_run_id: &str, point: i64, id_map: &HashMap<String, String>) -> Node {
    let mut copy = node.clone();
    copy.id = id_map.get(&node.id).cloned().unwrap_or_else(new_id);
    copy.run_id = child_run_id.to_string();
    copy.parent_node_id = node
        .parent_node_id
        .as_ref()
        .and_then(|p| id_map.get(p).cloned());
    if node.order_index <= point {
        if node.status == NodeStatus::Pending {
            copy.status = NodeStatus::Completed;
        }
    } else {
        copy.status = NodeStatus::Pending;
        copy.outputs = serde_json::Value::Null;
        copy.error = None;
        copy.started_at = None;
        copy.completed_at = None;
    }
    copy.created_at = Utc::now();
    copy
}

fn fork_step(step: &Step, child: &Run, id_map: &HashMap<String, String>) -> Step {
    let mut copy = step.clone();
    copy.id = new_id();
    copy.run_id = child.id.clone();
    copy.session_id = child.session_id.clone();
    copy.node_id = step.node_id.as_ref().and_then(|n| id_map.get(n).cloned());
    copy.created_at = Utc::now();
    copy
}

/// Re-key outputs recorded under parent node ids to the child's ids.
fn remap_snapshot(snapshot: &mut ContextSnapshot, id_map: &HashMap<String, String>) {
    let remap = |id: &String| id_map.get(id).cloned().unwrap_or_else(|| id.clone());
    snapshot.completed_nodes = snapshot.completed_nodes.iter().map(remap).collect();
    snapshot.outputs = std::mem::take(&mut snapshot.outputs)
        .into_iter()
        .map(|(k, v)| (remap(&k), v))
        .collect();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::DagBuilder;
    use crate::state_machine::Machines;
    use strata_test_utils::linear_plan;

    struct Fixture {
        store: Arc<WorkflowStore>,
        manager: BranchManager,
        workspace: RunWorkspace,
        run: Run,
        map: crate::dag::DagMap,
        _dir: tempfile::TempDir,
    }

    /// A 4-step run where steps 0 and 1 completed with checkpoints.
    fn half_done_run() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(WorkflowStore::in_memory().unwrap());
        let machines = Machines::new(store.clone());
        let workspace = RunWorkspace::new(dir.path());
        let run = Run::new("sess", "analyse data").with_agent("coder").with_model("m1");
        store.insert_run(&run).unwrap();
        let map = DagBuilder::new(store.clone())
            .build_dag_from_plan(&run.id, &linear_plan(4))
            .unwrap();

        let mut context = ContextSnapshot::default();
        for i in 0..2 {
            let node = store.require_node(map.step(i).unwrap()).unwrap();
            let step = Step::new(&run, node.order_index, node.task()).for_node(&node);
            store.insert_step(&step).unwrap();
            for target in [StepStatus::Running, StepStatus::Completed] {
                machines.nodes.transition_to(&node.id, target, None, "t").unwrap();
                machines.steps.transition_to(&step.id, target, None, "t").unwrap();
            }
            let output = serde_json::json!({ "step": i });
            store.update_node_result(&node.id, &output, None).unwrap();
            context.record_output(&node.id, output);
            let cp = Checkpoint::new(&run.id, CheckpointType::StepComplete, context.clone())
                .at_step(Some(step.id.clone()), step.step_number);
            store.insert_checkpoint(&cp).unwrap();
        }

        std::fs::create_dir_all(workspace.run_dir(&run.id).join("data")).unwrap();
        std::fs::write(workspace.run_dir(&run.id).join("data/input.csv"), "a,b\n1,2\n").unwrap();

        let manager = BranchManager::new(store.clone(), workspace.clone(), Arc::new(EventBus::default()));
        Fixture {
            store,
            manager,
            workspace,
            run,
            map,
            _dir: dir,
        }
    }

    #[test]
    fn test_branch_fidelity() {
        let f = half_done_run();
        let branch_node = f.map.step(1).unwrap();
        let branch = f
            .manager
            .create_branch(&f.run.id, branch_node, "try-b", BranchOptions::default())
            .unwrap();

        let child = f.store.require_run(&branch.child_run_id).unwrap();
        assert_eq!(child.status, RunStatus::Draft);
        assert!(child.is_branch);
        assert_eq!(child.branch_parent_id.as_deref(), Some(f.run.id.as_str()));
        assert_eq!(child.branch_depth, 1);
        assert_eq!(child.primary_agent.as_deref(), Some("coder"));
        assert_eq!(child.task_description, f.run.task_description);

        // step_1 has order_index 2: planning, step_0, step_1 keep status.
        let nodes = f.store.list_nodes(&child.id).unwrap();
        assert_eq!(nodes.len(), 6);
        for node in &nodes {
            if node.order_index <= 2 {
                assert_ne!(node.status, NodeStatus::Pending, "node {}", node.order_index);
            } else {
                assert_eq!(node.status, NodeStatus::Pending);
            }
        }
        assert_eq!(nodes[1].status, NodeStatus::Completed);
        assert_eq!(nodes[1].outputs["step"], 0);

        let parent_edges = f.store.list_edges(&f.run.id).unwrap();
        let child_edges = f.store.list_edges(&child.id).unwrap();
        assert_eq!(child_edges.len(), parent_edges.len());
        let child_ids: std::collections::HashSet<_> = nodes.iter().map(|n| n.id.as_str()).collect();
        assert!(child_edges
            .iter()
            .all(|e| child_ids.contains(e.from_node.as_str()) && child_ids.contains(e.to_node.as_str())));

        let steps = f.store.list_steps(&child.id).unwrap();
        assert_eq!(steps.len(), 2);
        assert!(steps.iter().all(|s| s.step_number <= 2));
        assert!(steps.iter().all(|s| child_ids.contains(s.node_id.as_deref().unwrap())));

        let cp = f.store.latest_checkpoint(&child.id, None).unwrap().unwrap();
        assert_eq!(cp.checkpoint_type, CheckpointType::BranchInitial);
        assert_eq!(cp.context_snapshot.outputs.len(), 2);
        assert!(cp
            .context_snapshot
            .outputs
            .keys()
            .all(|k| child_ids.contains(k.as_str())));

        assert!(f
            .workspace
            .run_dir(&child.id)
            .join("data/input.csv")
            .exists());
        assert_eq!(f.store.list_child_branches(&f.run.id).unwrap().len(), 1);
    }

    #[test]
    fn test_branch_applies_modifications() {
        let f = half_done_run();
        let mut overrides = ExtraFields::new();
        overrides.insert("temperature".into(), serde_json::json!(0.2));
        let options = BranchOptions {
            hypothesis: Some("lower temperature helps".into()),
            instructions: Some("be concise".into()),
            modifications: Some(Modifications {
                context_overrides: overrides,
                parameter_overrides: ExtraFields::new(),
                alternative_approach: Some("use pandas".into()),
            }),
        };
        let branch = f
            .manager
            .create_branch(&f.run.id, f.map.step(0).unwrap(), "cool", options)
            .unwrap();
        assert_eq!(branch.hypothesis.as_deref(), Some("lower temperature helps"));

        let snap = f
            .store
            .latest_checkpoint(&branch.child_run_id, None)
            .unwrap()
            .unwrap()
            .context_snapshot;
        assert_eq!(snap.context_overrides["temperature"], 0.2);
        assert_eq!(snap.alternative_approach.as_deref(), Some("use pandas"));
        assert_eq!(snap.instructions.as_deref(), Some("be concise"));
        // Only the checkpoint at step 1 (order_index 1) applies.
        assert_eq!(snap.outputs.len(), 1);
    }

    #[test]
    fn test_branch_at_node_without_step() {
        let f = half_done_run();
        let last = f.map.step(3).unwrap();
        let branch = f
            .manager
            .create_branch(&f.run.id, last, "late", BranchOptions::default())
            .unwrap();
        assert!(branch.parent_step_id.is_some());
        let child_nodes = f.store.list_nodes(&branch.child_run_id).unwrap();
        // step_3 (order 4) was pending in the parent, so it defaults to completed.
        assert_eq!(child_nodes[4].status, NodeStatus::Completed);
        assert_eq!(child_nodes[5].status, NodeStatus::Pending);
    }

    #[test]
    fn test_branch_rejects_foreign_node() {
        let f = half_done_run();
        let other = Run::new("sess", "other");
        f.store.insert_run(&other).unwrap();
        assert!(f
            .manager
            .create_branch(&other.id, f.map.step(0).unwrap(), "x", BranchOptions::default())
            .is_err());
    }

    #[test]
    fn test_set_branch_status() {
        let f = half_done_run();
        let branch = f
            .manager
            .create_branch(&f.run.id, f.map.step(1).unwrap(), "b", BranchOptions::default())
            .unwrap();
        let closed = f
            .manager
            .set_branch_status(&branch.child_run_id, BranchStatus::Abandoned)
            .unwrap();
        assert_eq!(closed.status, BranchStatus::Abandoned);
        let stored = f.store.get_branch_for_child(&branch.child_run_id).unwrap().unwrap();
        assert_eq!(stored.status, BranchStatus::Abandoned);
    }
}
