use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use strata_core::error::{Result, StrataError, ValidationError};
use strata_core::types::*;
use strata_store::WorkflowStore;

use super::scheduler::Scheduler;

pub const PLANNING_LABEL: &str = "planning";
pub const TERMINATOR_LABEL: &str = "terminator";

pub fn step_label(index: usize) -> String {
    format!("step_{}", index)
}

/// Label to node id for one run's graph.
#[derive(Debug, Clone, Serialize)]
pub struct DagMap {
    pub run_id: String,
    pub root: String,
    pub terminator: String,
    /// `planning`, `step_<i>` and `terminator` labels.
    pub labels: BTreeMap<String, String>,
    /// Nodes ordered by `order_index`.
    pub nodes: Vec<Node>,
}

impl DagMap {
    pub fn node_id(&self, label: &str) -> Option<&str> {
        self.labels.get(label).map(String::as_str)
    }

    pub fn step(&self, index: usize) -> Option<&str> {
        self.node_id(&step_label(index))
    }
}

/// Turns an ordered plan into a persisted DAG.
pub struct DagBuilder {
    store: Arc<WorkflowStore>,
}

impl DagBuilder {
    pub fn new(store: Arc<WorkflowStore>) -> Self {
        Self { store }
    }

    /// Build, validate and persist the graph for `run_id`.
    ///
    /// Steps without `depends_on` follow the most recent non-parallel node, so
    /// consecutive parallel steps fan out from the same anchor. Nothing is
    /// written when validation fails.
    pub fn build_dag_from_plan(&self, run_id: &str, plan: &[PlanStep]) -> Result<DagMap> {
        self.store.require_run(run_id)?;
        if plan.is_empty() {
            return Err(ValidationError::EmptyPlan.into());
        }
        for (index, step) in plan.iter().enumerate() {
            if step.task.trim().is_empty() {
                return Err(ValidationError::InvalidStep {
                    index,
                    reason: "task is empty".to_string(),
                }
                .into());
            }
        }
        if !self.store.list_nodes(run_id)?.is_empty() {
            return Err(ValidationError::PolicyViolation(format!(
                "run {} already has an execution graph",
                run_id
            ))
            .into());
        }

        let root = Node::new(run_id, NodeType::Planning, 0).with_meta(NodeMeta {
            task: PLANNING_LABEL.to_string(),
            ..Default::default()
        });

        // Phase 1: every plan node exists before any explicit reference is resolved.
        let mut step_nodes: Vec<Node> = Vec::with_capacity(plan.len());
        let mut default_deps: Vec<Option<String>> = Vec::with_capacity(plan.len());
        let mut anchor = root.id.clone();
        for (i, step) in plan.iter().enumerate() {
            let mut node = Node::new(run_id, NodeType::Agent, i as i64 + 1)
                .with_parent(&root)
                .with_meta(NodeMeta {
                    task: step.task.clone(),
                    parallel: step.parallel,
                    parallel_group: step.parallel_group.clone(),
                    approval_required: step.approval_required,
                    retry: step.retry,
                    extra: ExtraFields::new(),
                });
            node.agent = step.agent.clone();

            default_deps.push(match step.depends_on {
                None => Some(anchor.clone()),
                Some(_) => None,
            });
            if !step.parallel {
                anchor = node.id.clone();
            }
            step_nodes.push(node);
        }

        // Phase 2: edges.
        let mut edges = Vec::new();
        for (i, step) in plan.iter().enumerate() {
            let node = &step_nodes[i];
            let dependency_type = if step.parallel {
                DependencyType::Parallel
            } else {
                DependencyType::Sequential
            };
            let deps: Vec<String> = match (&step.depends_on, &default_deps[i]) {
                (Some(refs), _) if refs.is_empty() => vec![root.id.clone()],
                (Some(refs), _) => {
                    let mut seen = HashSet::new();
                    let mut resolved = Vec::new();
                    for r in refs {
                        let id = resolve_ref(r, i, &root, &step_nodes)?;
                        if seen.insert(id.clone()) {
                            resolved.push(id);
                        }
                    }
                    resolved
                }
                (None, Some(anchor)) => vec![anchor.clone()],
                (None, None) => vec![root.id.clone()],
            };
            for dep in deps {
                edges.push(Edge::new(run_id, dep, &node.id, dependency_type));
            }
        }

        let terminator = Node::new(run_id, NodeType::Terminator, plan.len() as i64 + 1)
            .with_meta(NodeMeta {
                task: TERMINATOR_LABEL.to_string(),
                ..Default::default()
            });
        let has_outgoing: HashSet<&str> = edges.iter().map(|e| e.from_node.as_str()).collect();
        let sinks: Vec<String> = std::iter::once(&root)
            .chain(step_nodes.iter())
            .filter(|n| !has_outgoing.contains(n.id.as_str()))
            .map(|n| n.id.clone())
            .collect();
        for sink in sinks {
            edges.push(Edge::new(run_id, sink, &terminator.id, DependencyType::Sequential));
        }

        let mut labels = BTreeMap::new();
        labels.insert(PLANNING_LABEL.to_string(), root.id.clone());
        for (i, node) in step_nodes.iter().enumerate() {
            labels.insert(step_label(i), node.id.clone());
        }
        labels.insert(TERMINATOR_LABEL.to_string(), terminator.id.clone());

        let root_id = root.id.clone();
        let terminator_id = terminator.id.clone();
        let mut nodes = Vec::with_capacity(plan.len() + 2);
        nodes.push(root);
        nodes.extend(step_nodes);
        nodes.push(terminator);

        Scheduler::new(nodes.clone(), &edges)?.validate()?;
        self.store.insert_dag(&nodes, &edges)?;

        info!(
            run_id,
            nodes = nodes.len(),
            edges = edges.len(),
            "Execution graph built"
        );

        Ok(DagMap {
            run_id: run_id.to_string(),
            root: root_id,
            terminator: terminator_id,
            labels,
            nodes,
        })
    }

    /// Reconstruct the label map from the persisted graph. Read-only.
    pub fn rebuild_dag(&self, run_id: &str) -> Result<DagMap> {
        let nodes = self.store.list_nodes(run_id)?;
        let root = nodes
            .iter()
            .find(|n| n.node_type == NodeType::Planning)
            .ok_or_else(|| StrataError::not_found("execution graph", run_id))?
            .id
            .clone();
        let terminator = nodes
            .iter()
            .rev()
            .find(|n| n.node_type == NodeType::Terminator)
            .ok_or_else(|| StrataError::not_found("execution graph", run_id))?
            .id
            .clone();

        let mut labels = BTreeMap::new();
        labels.insert(PLANNING_LABEL.to_string(), root.clone());
        labels.insert(TERMINATOR_LABEL.to_string(), terminator.clone());
        for (i, node) in nodes
            .iter()
            .filter(|n| n.id != root && n.id != terminator)
            .enumerate()
        {
            labels.insert(step_label(i), node.id.clone());
        }

        Ok(DagMap {
            run_id: run_id.to_string(),
            root,
            terminator,
            labels,
            nodes,
        })
    }
}

/// Resolve one `depends_on` entry of plan step `index`.
fn resolve_ref(r: &StepRef, index: usize, root: &Node, steps: &[Node]) -> Result<String> {
    let invalid = || -> StrataError {
        ValidationError::InvalidDependency {
            node: step_label(index),
            dependency: r.to_string(),
        }
        .into()
    };
    let position = match r {
        StepRef::Index(i) => *i,
        StepRef::Label(label) if label == PLANNING_LABEL => return Ok(root.id.clone()),
        StepRef::Label(label) => label
            .strip_prefix("step_")
            .unwrap_or(label)
            .parse::<usize>()
            .map_err(|_| invalid())?,
    };
    steps
        .get(position)
        .map(|n| n.id.clone())
        .ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Arc<WorkflowStore>, DagBuilder, Run) {
        let store = Arc::new(WorkflowStore::in_memory().unwrap());
        let run = Run::new("sess", "build a thing");
        store.insert_run(&run).unwrap();
        (store.clone(), DagBuilder::new(store), run)
    }

    fn levels(store: &WorkflowStore, run_id: &str) -> Vec<Vec<String>> {
        let nodes = store.list_nodes(run_id).unwrap();
        let edges = store.list_edges(run_id).unwrap();
        Scheduler::new(nodes, &edges).unwrap().execution_levels().unwrap()
    }

    #[test]
    fn test_parallel_step_shares_anchor() {
        let (store, builder, run) = setup();
        let plan = vec![
            PlanStep::new("t1"),
            PlanStep::new("t2").parallel(),
            PlanStep::new("t3"),
        ];
        let dag = builder.build_dag_from_plan(&run.id, &plan).unwrap();

        let id = |label: &str| dag.node_id(label).unwrap().to_string();
        let mut middle = vec![id("step_1"), id("step_2")];
        middle.sort_by_key(|n| dag.nodes.iter().position(|x| &x.id == n));
        assert_eq!(
            levels(&store, &run.id),
            vec![
                vec![id("planning")],
                vec![id("step_0")],
                middle,
                vec![id("terminator")],
            ]
        );

        let edges = store.list_edges(&run.id).unwrap();
        let into_terminator = edges.iter().filter(|e| e.to_node == dag.terminator).count();
        assert_eq!(into_terminator, 2);
        let parallel_edge = edges.iter().find(|e| e.to_node == id("step_1")).unwrap();
        assert_eq!(parallel_edge.dependency_type, DependencyType::Parallel);
    }

    #[test]
    fn test_order_indices_and_types() {
        let (_store, builder, run) = setup();
        let plan = vec![PlanStep::new("a").with_agent("coder"), PlanStep::new("b")];
        let dag = builder.build_dag_from_plan(&run.id, &plan).unwrap();

        let orders: Vec<i64> = dag.nodes.iter().map(|n| n.order_index).collect();
        assert_eq!(orders, vec![0, 1, 2, 3]);
        assert_eq!(dag.nodes[0].node_type, NodeType::Planning);
        assert_eq!(dag.nodes[3].node_type, NodeType::Terminator);
        assert_eq!(dag.nodes[1].agent.as_deref(), Some("coder"));
        assert_eq!(dag.nodes[1].depth, 1);
        assert_eq!(dag.nodes[1].task(), "a");
    }

    #[test]
    fn test_back_reference_cycle_detected_and_nothing_persisted() {
        let (store, builder, run) = setup();
        let plan = vec![
            PlanStep::new("a").depends_on(vec![StepRef::Label("step_1".into())]),
            PlanStep::new("b").depends_on(vec![StepRef::Index(0)]),
        ];
        let err = builder.build_dag_from_plan(&run.id, &plan).unwrap_err();
        match err {
            StrataError::Validation(ValidationError::CycleDetected { nodes }) => {
                assert!(!nodes.is_empty());
            }
            other => panic!("expected cycle, got {:?}", other),
        }
        assert!(store.list_nodes(&run.id).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_dependency() {
        let (_store, builder, run) = setup();
        let plan = vec![PlanStep::new("a").depends_on(vec![StepRef::Label("step_9".into())])];
        let err = builder.build_dag_from_plan(&run.id, &plan).unwrap_err();
        assert!(matches!(
            err,
            StrataError::Validation(ValidationError::InvalidDependency { .. })
        ));
    }

    #[test]
    fn test_explicit_dependencies_fan_in() {
        let (store, builder, run) = setup();
        let plan = vec![
            PlanStep::new("fetch a").depends_on(vec![StepRef::Label("planning".into())]),
            PlanStep::new("fetch b").depends_on(vec![StepRef::Label("planning".into())]),
            PlanStep::new("merge").depends_on(vec![StepRef::Index(0), StepRef::Label("1".into())]),
        ];
        let dag = builder.build_dag_from_plan(&run.id, &plan).unwrap();
        let lv = levels(&store, &run.id);
        assert_eq!(lv.len(), 4);
        assert_eq!(lv[1].len(), 2);
        assert_eq!(lv[2], vec![dag.step(2).unwrap().to_string()]);
    }

    #[test]
    fn test_empty_plan_and_blank_task() {
        let (_store, builder, run) = setup();
        assert!(matches!(
            builder.build_dag_from_plan(&run.id, &[]),
            Err(StrataError::Validation(ValidationError::EmptyPlan))
        ));
        assert!(matches!(
            builder.build_dag_from_plan(&run.id, &[PlanStep::new(" ")]),
            Err(StrataError::Validation(ValidationError::InvalidStep { index: 0, .. }))
        ));
    }

    #[test]
    fn test_second_build_rejected() {
        let (_store, builder, run) = setup();
        builder.build_dag_from_plan(&run.id, &[PlanStep::new("a")]).unwrap();
        assert!(matches!(
            builder.build_dag_from_plan(&run.id, &[PlanStep::new("a")]),
            Err(StrataError::Validation(ValidationError::PolicyViolation(_)))
        ));
    }

    #[test]
    fn test_rebuild_matches_build() {
        let (_store, builder, run) = setup();
        let plan = vec![PlanStep::new("a"), PlanStep::new("b").parallel(), PlanStep::new("c")];
        let built = builder.build_dag_from_plan(&run.id, &plan).unwrap();
        let rebuilt = builder.rebuild_dag(&run.id).unwrap();
        assert_eq!(built.labels, rebuilt.labels);
        assert_eq!(built.root, rebuilt.root);
        assert_eq!(built.terminator, rebuilt.terminator);
        // Idempotent
        assert_eq!(builder.rebuild_dag(&run.id).unwrap().labels, rebuilt.labels);
    }
}
