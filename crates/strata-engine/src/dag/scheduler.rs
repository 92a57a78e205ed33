use std::collections::{BTreeMap, HashMap, VecDeque};

use strata_core::error::{Result, ValidationError};
use strata_core::types::{Edge, Node, NodeStatus};

/// Dependency view over one run's nodes and edges.
///
/// Levels come from Kahn's algorithm: every node in a level has all of its
/// dependencies in earlier levels, so a level can run concurrently.
pub struct Scheduler {
    nodes: HashMap<String, Node>,
    /// Node ids sorted by (order_index, id).
    order: Vec<String>,
    dependencies: HashMap<String, Vec<String>>,
    dependents: HashMap<String, Vec<String>>,
}

impl Scheduler {
    /// Index a node set. Edges must only reference nodes in the set.
    pub fn new(nodes: Vec<Node>, edges: &[Edge]) -> Result<Self> {
        let mut order: Vec<(i64, String)> = nodes
            .iter()
            .map(|n| (n.order_index, n.id.clone()))
            .collect();
        order.sort();
        let nodes: HashMap<String, Node> = nodes.into_iter().map(|n| (n.id.clone(), n)).collect();

        let mut dependencies: HashMap<String, Vec<String>> = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for edge in edges {
            for endpoint in [&edge.from_node, &edge.to_node] {
                if !nodes.contains_key(endpoint) {
                    return Err(ValidationError::InvalidDependency {
                        node: edge.to_node.clone(),
                        dependency: edge.from_node.clone(),
                    }
                    .into());
                }
            }
            dependencies
                .entry(edge.to_node.clone())
                .or_default()
                .push(edge.from_node.clone());
            dependents
                .entry(edge.from_node.clone())
                .or_default()
                .push(edge.to_node.clone());
        }

        Ok(Self {
            nodes,
            order: order.into_iter().map(|(_, id)| id).collect(),
            dependencies,
            dependents,
        })
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in `order_index` order.
    pub fn nodes_in_order(&self) -> impl Iterator<Item = &Node> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    /// Layered topological sort. Nodes within a level are ordered by `order_index`.
    pub fn execution_levels(&self) -> Result<Vec<Vec<String>>> {
        let mut in_degree: HashMap<&str, usize> = self
            .order
            .iter()
            .map(|id| (id.as_str(), self.dependencies(id).len()))
            .collect();

        let mut queue: VecDeque<&str> = self
            .order
            .iter()
            .map(String::as_str)
            .filter(|id| in_degree.get(id).copied() == Some(0))
            .collect();

        let mut levels = Vec::new();
        let mut processed = 0;

        while !queue.is_empty() {
            let mut level: Vec<&str> = queue.drain(..).collect();
            level.sort_by_key(|id| self.rank(id));
            processed += level.len();

            for id in &level {
                for dependent in self.dependents(id) {
                    if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(dependent.as_str());
                        }
                    }
                }
            }
            levels.push(level.into_iter().map(str::to_string).collect());
        }

        if processed != self.nodes.len() {
            let unresolved = self
                .order
                .iter()
                .filter(|id| in_degree.get(id.as_str()).copied().unwrap_or(0) > 0)
                .cloned()
                .collect();
            return Err(ValidationError::CycleDetected { nodes: unresolved }.into());
        }
        Ok(levels)
    }

    /// Cycle check only.
    pub fn validate(&self) -> Result<()> {
        self.execution_levels().map(|_| ())
    }

    /// Direct dependencies of a node.
    pub fn dependencies(&self, id: &str) -> &[String] {
        self.dependencies.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Nodes that directly depend on `id`.
    pub fn dependents(&self, id: &str) -> &[String] {
        self.dependents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Pending nodes whose dependencies are all completed or skipped.
    pub fn ready_nodes(&self) -> Vec<&Node> {
        self.nodes_in_order()
            .filter(|n| n.status == NodeStatus::Pending)
            .filter(|n| {
                self.dependencies(&n.id).iter().all(|dep| {
                    self.nodes
                        .get(dep)
                        .map(|d| d.status.is_resolved())
                        .unwrap_or(false)
                })
            })
            .collect()
    }

    /// Parallel group name to member node ids, from node metadata.
    pub fn parallel_groups(&self) -> BTreeMap<String, Vec<String>> {
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for node in self.nodes_in_order() {
            if let Some(group) = &node.meta.parallel_group {
                groups.entry(group.clone()).or_default().push(node.id.clone());
            }
        }
        groups
    }

    fn rank(&self, id: &str) -> (i64, String) {
        let order = self.nodes.get(id).map(|n| n.order_index).unwrap_or(i64::MAX);
        (order, id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::error::StrataError;
    use strata_core::types::{DependencyType, NodeMeta, NodeType};

    fn node(order: i64) -> Node {
        Node::new("run", NodeType::Agent, order)
    }

    fn edge(from: &Node, to: &Node) -> Edge {
        Edge::new("run", &from.id, &to.id, DependencyType::Sequential)
    }

    #[test]
    fn test_diamond_levels() {
        let a = node(0);
        let b = node(1);
        let c = node(2);
        let d = node(3);
        let edges = vec![edge(&a, &b), edge(&a, &c), edge(&b, &d), edge(&c, &d)];
        let ids = [a.id.clone(), b.id.clone(), c.id.clone(), d.id.clone()];
        let s = Scheduler::new(vec![d, c, b, a], &edges).unwrap();

        let levels = s.execution_levels().unwrap();
        assert_eq!(
            levels,
            vec![
                vec![ids[0].clone()],
                vec![ids[1].clone(), ids[2].clone()],
                vec![ids[3].clone()],
            ]
        );
        assert_eq!(s.dependencies(&ids[3]).len(), 2);
        assert_eq!(s.dependents(&ids[0]).len(), 2);
        assert!(s.dependencies(&ids[0]).is_empty());
    }

    #[test]
    fn test_cycle_names_nodes() {
        let a = node(0);
        let b = node(1);
        let c = node(2);
        let edges = vec![edge(&a, &b), edge(&b, &c), edge(&c, &b)];
        let (b_id, c_id) = (b.id.clone(), c.id.clone());
        let s = Scheduler::new(vec![a, b, c], &edges).unwrap();

        match s.validate() {
            Err(StrataError::Validation(ValidationError::CycleDetected { nodes })) => {
                assert_eq!(nodes, vec![b_id, c_id]);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_dangling_edge_rejected() {
        let a = node(0);
        let ghost = node(1);
        let edges = vec![edge(&a, &ghost)];
        let err = Scheduler::new(vec![a], &edges).err().unwrap();
        assert!(matches!(
            err,
            StrataError::Validation(ValidationError::InvalidDependency { .. })
        ));
    }

    #[test]
    fn test_ready_nodes_treat_skipped_as_resolved() {
        let mut root = Node::new("run", NodeType::Planning, 0);
        root.status = NodeStatus::Skipped;
        let mut done = node(1);
        done.status = NodeStatus::Completed;
        let waiting = node(2);
        let blocked = node(3);
        let edges = vec![edge(&root, &done), edge(&done, &waiting), edge(&waiting, &blocked)];
        let waiting_id = waiting.id.clone();
        let s = Scheduler::new(vec![root, done, waiting, blocked], &edges).unwrap();

        let ready: Vec<_> = s.ready_nodes().into_iter().map(|n| n.id.clone()).collect();
        assert_eq!(ready, vec![waiting_id]);
    }

    #[test]
    fn test_parallel_groups() {
        let a = node(1).with_meta(NodeMeta {
            parallel_group: Some("fetch".into()),
            ..Default::default()
        });
        let b = node(2).with_meta(NodeMeta {
            parallel_group: Some("fetch".into()),
            ..Default::default()
        });
        let c = node(3);
        let s = Scheduler::new(vec![a, b, c], &[]).unwrap();
        let groups = s.parallel_groups();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups["fetch"].len(), 2);
    }
}
