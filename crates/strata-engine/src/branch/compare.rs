use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use serde::Serialize;

use strata_core::error::Result;
use strata_core::types::*;
use strata_store::WorkflowStore;

use crate::dag::workspace::{file_digests, NODES_DIR};
use crate::dag::RunWorkspace;

/// Position-wise comparison of two runs' steps.
#[derive(Debug, Clone, Serialize)]
pub struct StepDiff {
    pub position: usize,
    pub task_a: Option<String>,
    pub task_b: Option<String>,
    pub status_a: Option<StepStatus>,
    pub status_b: Option<StepStatus>,
    pub outputs_equal: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FileDiff {
    pub only_in_a: Vec<String>,
    pub only_in_b: Vec<String>,
    pub changed: Vec<String>,
    pub identical: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricSummary {
    pub count: usize,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
}

impl MetricSummary {
    fn of(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let sum: f64 = values.iter().sum();
        Some(Self {
            count: values.len(),
            avg: sum / values.len() as f64,
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricComparison {
    pub a: Option<MetricSummary>,
    pub b: Option<MetricSummary>,
    /// `b.avg - a.avg` when both sides have values.
    pub avg_delta: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BranchComparison {
    pub run_a: String,
    pub run_b: String,
    /// Seconds, `b - a`.
    pub time_delta_secs: Option<f64>,
    pub cost_a: f64,
    pub cost_b: f64,
    pub cost_delta: f64,
    pub steps: Vec<StepDiff>,
    pub files: FileDiff,
    pub metrics: BTreeMap<String, MetricComparison>,
}

/// A run and its branches, recursively.
#[derive(Debug, Clone, Serialize)]
pub struct BranchTree {
    pub run_id: String,
    pub status: RunStatus,
    pub branch_name: Option<String>,
    pub hypothesis: Option<String>,
    pub depth: u32,
    pub children: Vec<BranchTree>,
}

impl BranchTree {
    /// Indented text rendering, one run per line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out, "", true, true);
        out
    }

    fn render_into(&self, out: &mut String, prefix: &str, last: bool, root: bool) {
        let label = match &self.branch_name {
            Some(name) => format!("{} [{}] ({})", name, short_id(&self.run_id), self.status),
            None => format!("{} ({})", short_id(&self.run_id), self.status),
        };
        if root {
            let _ = writeln!(out, "{}", label);
        } else {
            let connector = if last { "└── " } else { "├── " };
            let _ = writeln!(out, "{}{}{}", prefix, connector, label);
        }
        let child_prefix = if root {
            String::new()
        } else if last {
            format!("{}    ", prefix)
        } else {
            format!("{}│   ", prefix)
        };
        for (i, child) in self.children.iter().enumerate() {
            child.render_into(out, &child_prefix, i + 1 == self.children.len(), false);
        }
    }

    /// Number of runs in the tree, this one included.
    pub fn size(&self) -> usize {
        1 + self.children.iter().map(BranchTree::size).sum::<usize>()
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// Compares runs and walks branch trees.
pub struct BranchComparator {
    store: Arc<WorkflowStore>,
    workspace: RunWorkspace,
}

impl BranchComparator {
    pub fn new(store: Arc<WorkflowStore>, workspace: RunWorkspace) -> Self {
        Self { store, workspace }
    }

    pub fn compare_branches(&self, run_a: &str, run_b: &str) -> Result<BranchComparison> {
        let a = self.store.require_run(run_a)?;
        let b = self.store.require_run(run_b)?;
        let steps_a = self.store.list_steps(run_a)?;
        let steps_b = self.store.list_steps(run_b)?;

        let time_delta_secs = match (a.elapsed_secs(), b.elapsed_secs()) {
            (Some(ta), Some(tb)) => Some(tb - ta),
            _ => None,
        };
        let cost_a = total_cost(&steps_a);
        let cost_b = total_cost(&steps_b);

        let files = diff_files(
            &file_digests(&self.workspace.run_dir(run_a), &[NODES_DIR])?,
            &file_digests(&self.workspace.run_dir(run_b), &[NODES_DIR])?,
        );

        let metrics_a = collect_metrics(&steps_a);
        let metrics_b = collect_metrics(&steps_b);
        let mut names: Vec<&String> = metrics_a.keys().chain(metrics_b.keys()).collect();
        names.sort();
        names.dedup();
        let metrics = names
            .into_iter()
            .map(|name| {
                let sa = metrics_a.get(name).and_then(|v| MetricSummary::of(v));
                let sb = metrics_b.get(name).and_then(|v| MetricSummary::of(v));
                let avg_delta = match (sa, sb) {
                    (Some(x), Some(y)) => Some(y.avg - x.avg),
                    _ => None,
                };
                (
                    name.clone(),
                    MetricComparison {
                        a: sa,
                        b: sb,
                        avg_delta,
                    },
                )
            })
            .collect();

        Ok(BranchComparison {
            run_a: a.id,
            run_b: b.id,
            time_delta_secs,
            cost_a,
            cost_b,
            cost_delta: cost_b - cost_a,
            steps: diff_steps(&steps_a, &steps_b),
            files,
            metrics,
        })
    }

    pub fn get_branch_tree(&self, run_id: &str) -> Result<BranchTree> {
        let run = self.store.require_run(run_id)?;
        let branch = self.store.get_branch_for_child(run_id)?;
        let mut children = Vec::new();
        for child in self.store.list_child_branches(run_id)? {
            children.push(self.get_branch_tree(&child.child_run_id)?);
        }
        Ok(BranchTree {
            run_id: run.id,
            status: run.status,
            branch_name: branch.as_ref().map(|b| b.branch_name.clone()),
            hypothesis: branch.and_then(|b| b.hypothesis),
            depth: run.branch_depth,
            children,
        })
    }
}

fn total_cost(steps: &[Step]) -> f64 {
    steps.iter().filter_map(|s| s.meta.cost).sum()
}

fn diff_steps(a: &[Step], b: &[Step]) -> Vec<StepDiff> {
    (0..a.len().max(b.len()))
        .map(|i| {
            let sa = a.get(i);
            let sb = b.get(i);
            StepDiff {
                position: i,
                task_a: sa.map(|s| s.task.clone()),
                task_b: sb.map(|s| s.task.clone()),
                status_a: sa.map(|s| s.status),
                status_b: sb.map(|s| s.status),
                outputs_equal: match (sa, sb) {
                    (Some(x), Some(y)) => x.outputs == y.outputs,
                    _ => false,
                },
            }
        })
        .collect()
}

fn diff_files(a: &BTreeMap<String, String>, b: &BTreeMap<String, String>) -> FileDiff {
    let mut diff = FileDiff::default();
    for (path, digest) in a {
        match b.get(path) {
            None => diff.only_in_a.push(path.clone()),
            Some(other) if other != digest => diff.changed.push(path.clone()),
            Some(_) => diff.identical += 1,
        }
    }
    diff.only_in_b = b.keys().filter(|p| !a.contains_key(*p)).cloned().collect();
    diff
}

/// Numeric `outputs.metrics.*` values plus step durations, per metric name.
fn collect_metrics(steps: &[Step]) -> BTreeMap<String, Vec<f64>> {
    let mut metrics: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for step in steps {
        if let Some(map) = step.outputs.get("metrics").and_then(|m| m.as_object()) {
            for (name, value) in map {
                if let Some(v) = value.as_f64() {
                    metrics.entry(name.clone()).or_default().push(v);
                }
            }
        }
        if let Some(ms) = step.meta.duration_ms {
            metrics
                .entry("duration_ms".to_string())
                .or_default()
                .push(ms as f64);
        }
    }
    metrics
}
