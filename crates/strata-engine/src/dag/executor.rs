use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use strata_core::config::{AppConfig, ExecutorConfig};
use strata_core::error::{Result, StrataError, ValidationError};
use strata_core::event::{EventBus, WorkflowEvent};
use strata_core::traits::{LevelPlanner, NodeExecutor};
use strata_core::types::*;
use strata_store::WorkflowStore;

use super::scheduler::Scheduler;
use super::workspace::RunWorkspace;
use crate::approval::{ApprovalDraft, ApprovalGate};
use crate::controller::{RunSignals, WorkflowController};
use crate::retry::{format_retry_brief, select_strategy, RetryContextManager};
use crate::state_machine::Machines;

/// How one node ended for this execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeOutcome {
    Completed,
    Failed,
    Skipped,
    Cancelled,
    /// Approval wait timed out; the run stays `waiting_approval`.
    Suspended,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LevelOutcome {
    pub index: usize,
    pub node_ids: Vec<String>,
    /// Nodes already completed or skipped before this execution.
    pub resolved_before: usize,
    pub completed: usize,
    pub skipped: usize,
    pub failed: Vec<String>,
}

/// Result of driving a run through its levels.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSummary {
    pub run_id: String,
    pub levels: Vec<LevelOutcome>,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub final_status: RunStatus,
    /// Execution stopped before the last level (cancel or approval timeout).
    pub halted: bool,
}

impl ExecutionSummary {
    fn new(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            levels: Vec::new(),
            completed: 0,
            failed: 0,
            skipped: 0,
            final_status: RunStatus::Executing,
            halted: false,
        }
    }

    fn absorb(&mut self, level: LevelOutcome) {
        self.completed += level.completed;
        self.skipped += level.skipped;
        self.failed += level.failed.len();
        self.levels.push(level);
    }
}

/// Per-execution state shared by every node future.
struct RunCtx {
    run: Run,
    executor: Arc<dyn NodeExecutor>,
    signals: RunSignals,
    context: Mutex<ContextSnapshot>,
}

/// Drives a run's DAG level by level.
///
/// Node failures are soft: they are recorded and later levels still run.
pub struct DagExecutor {
    store: Arc<WorkflowStore>,
    machines: Machines,
    controller: Arc<WorkflowController>,
    gate: Arc<ApprovalGate>,
    retry: RetryContextManager,
    events: Arc<EventBus>,
    config: ExecutorConfig,
    default_attempts: u32,
    max_backoff_secs: u64,
    workspace: RunWorkspace,
    planner: Option<Arc<dyn LevelPlanner>>,
    actor: String,
}

impl DagExecutor {
    pub fn new(
        store: Arc<WorkflowStore>,
        machines: Machines,
        controller: Arc<WorkflowController>,
        gate: Arc<ApprovalGate>,
        events: Arc<EventBus>,
        config: &AppConfig,
    ) -> Self {
        Self {
            retry: RetryContextManager::new(store.clone(), config.retry.max_backoff_secs),
            store,
            machines,
            controller,
            gate,
            events,
            config: config.executor.clone(),
            default_attempts: config.retry.max_attempts.max(1),
            max_backoff_secs: config.retry.max_backoff_secs,
            workspace: RunWorkspace::new(config.runs_dir()),
            planner: None,
            actor: config.engine.actor.clone(),
        }
    }

    pub fn with_planner(mut self, planner: Arc<dyn LevelPlanner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn workspace(&self) -> &RunWorkspace {
        &self.workspace
    }

    /// Execute every runnable node of a run.
    pub async fn execute(
        &self,
        run_id: &str,
        executor: Arc<dyn NodeExecutor>,
    ) -> Result<ExecutionSummary> {
        self.enter_executing(run_id)?;
        let signals = self.controller.attach(run_id)?;
        let result = self.drive(run_id, executor, signals).await;
        self.controller.detach(run_id);
        result
    }

    fn enter_executing(&self, run_id: &str) -> Result<()> {
        let run = self.store.require_run(run_id)?;
        let runs = &self.machines.runs;
        match run.status {
            RunStatus::Draft => {
                runs.transition_to(run_id, RunStatus::Planning, Some("execution requested"), &self.actor)?;
                runs.transition_to(run_id, RunStatus::Executing, Some("execution started"), &self.actor)?;
            }
            RunStatus::Planning => {
                runs.transition_to(run_id, RunStatus::Executing, Some("execution started"), &self.actor)?;
            }
            RunStatus::Executing => {}
            other => {
                return Err(StrataError::NotExecutable {
                    run_id: run_id.to_string(),
                    status: other.to_string(),
                })
            }
        }
        Ok(())
    }

    async fn drive(
        &self,
        run_id: &str,
        executor: Arc<dyn NodeExecutor>,
        signals: RunSignals,
    ) -> Result<ExecutionSummary> {
        let nodes = self.store.list_nodes(run_id)?;
        let edges = self.store.list_edges(run_id)?;
        let levels = Scheduler::new(nodes, &edges)?.execution_levels()?;

        let context = self
            .store
            .latest_checkpoint(run_id, None)?
            .map(|cp| cp.context_snapshot)
            .unwrap_or_default();
        let ctx = RunCtx {
            run: self.store.require_run(run_id)?,
            executor,
            signals,
            context: Mutex::new(context),
        };

        info!(run_id, levels = levels.len(), "Executing run");
        let mut summary = ExecutionSummary::new(run_id);

        for (index, level) in levels.iter().enumerate() {
            if let Some(status) = self.halt_status(&ctx).await? {
                summary.halted = true;
                summary.final_status = status;
                return Ok(self.finish(summary));
            }

            let runnable = self.runnable_nodes(level)?;
            let mut outcome = LevelOutcome {
                index,
                node_ids: level.clone(),
                resolved_before: level.len() - runnable.len(),
                ..Default::default()
            };
            if runnable.is_empty() {
                summary.absorb(outcome);
                continue;
            }

            self.events.publish(WorkflowEvent::LevelStarted {
                run_id: run_id.to_string(),
                level: index,
                node_ids: runnable.iter().map(|n| n.id.clone()).collect(),
            });
            debug!(run_id, level = index, nodes = runnable.len(), "Level started");

            let results = if self.config.isolated_workdirs {
                self.run_level_isolated(&ctx, runnable).await
            } else {
                self.run_level(&ctx, runnable, None).await
            };

            let mut suspended = false;
            for (node_id, result) in results {
                match result {
                    NodeOutcome::Completed => outcome.completed += 1,
                    NodeOutcome::Skipped => outcome.skipped += 1,
                    NodeOutcome::Failed => outcome.failed.push(node_id),
                    NodeOutcome::Cancelled => {}
                    NodeOutcome::Suspended => suspended = true,
                }
            }

            self.events.publish(WorkflowEvent::LevelCompleted {
                run_id: run_id.to_string(),
                level: index,
                completed: outcome.completed,
                failed: outcome.failed.len(),
                skipped: outcome.skipped,
            });
            summary.absorb(outcome);

            if suspended {
                summary.halted = true;
                summary.final_status = self.store.require_run(run_id)?.status;
                info!(run_id, level = index, "Run suspended on approval");
                return Ok(self.finish(summary));
            }
        }

        if let Some(status) = self.halt_status(&ctx).await? {
            summary.halted = true;
            summary.final_status = status;
            return Ok(self.finish(summary));
        }

        let final_status = if summary.failed > 0 && self.config.fail_run_on_node_failure {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        let reason = format!(
            "{} completed, {} failed, {} skipped",
            summary.completed, summary.failed, summary.skipped
        );
        self.machines
            .runs
            .transition_to(run_id, final_status, Some(&reason), &self.actor)?;
        summary.final_status = final_status;
        Ok(self.finish(summary))
    }

    fn finish(&self, summary: ExecutionSummary) -> ExecutionSummary {
        self.events.publish(WorkflowEvent::RunFinished {
            run_id: summary.run_id.clone(),
            status: summary.final_status,
            completed_nodes: summary.completed,
            failed_nodes: summary.failed,
        });
        info!(
            run_id = %summary.run_id,
            status = %summary.final_status,
            completed = summary.completed,
            failed = summary.failed,
            halted = summary.halted,
            "Run execution finished"
        );
        summary
    }

    /// Level-boundary check: wait out a pause, stop on cancel or when the run
    /// left `executing` behind our back.
    async fn halt_status(&self, ctx: &RunCtx) -> Result<Option<RunStatus>> {
        if let Err(StrataError::Cancelled) = ctx.signals.wait_if_paused().await {
            return Ok(Some(self.store.require_run(&ctx.run.id)?.status));
        }
        let status = self.store.require_run(&ctx.run.id)?.status;
        Ok((status != RunStatus::Executing).then_some(status))
    }

    /// Fresh copies of a level's nodes that still need work.
    fn runnable_nodes(&self, level: &[String]) -> Result<Vec<Node>> {
        let mut nodes = Vec::new();
        for id in level {
            let node = self.store.require_node(id)?;
            if node.status.is_resolved() || node.status == NodeStatus::Cancelled {
                continue;
            }
            nodes.push(node);
        }
        Ok(nodes)
    }

    /// Ungated nodes run concurrently (bounded by `max_workers`), then
    /// approval-gated nodes run one at a time.
    async fn run_level(
        &self,
        ctx: &RunCtx,
        nodes: Vec<Node>,
        workdirs: Option<&std::collections::HashMap<String, PathBuf>>,
    ) -> Vec<(String, NodeOutcome)> {
        let (gated, free): (Vec<Node>, Vec<Node>) = nodes.into_iter().partition(needs_approval);
        let workdir = |id: &str| workdirs.and_then(|w| w.get(id).cloned());

        let mut results = if self.config.parallel && free.len() > 1 {
            stream::iter(free.into_iter().map(|node| {
                let dir = workdir(&node.id);
                self.run_node(ctx, node, dir)
            }))
            .buffer_unordered(self.config.max_workers.max(1))
            .collect::<Vec<_>>()
            .await
        } else {
            let mut results = Vec::new();
            for node in free {
                let dir = workdir(&node.id);
                results.push(self.run_node(ctx, node, dir).await);
            }
            results
        };

        for node in gated {
            let dir = workdir(&node.id);
            let result = self.run_node(ctx, node, dir).await;
            let stop = matches!(result.1, NodeOutcome::Suspended | NodeOutcome::Cancelled);
            results.push(result);
            if stop {
                break;
            }
        }
        results
    }

    /// Isolated working directories, optional planner split and a merge into
    /// `shared/` after each group. Falls back to plain sequential execution
    /// of whatever is left if any of that fails.
    async fn run_level_isolated(&self, ctx: &RunCtx, nodes: Vec<Node>) -> Vec<(String, NodeOutcome)> {
        let mut results = Vec::new();
        if let Err(e) = self.try_run_isolated(ctx, &nodes, &mut results).await {
            warn!(run_id = %ctx.run.id, error = %e, "Enhanced level execution failed, falling back");
            for node in nodes {
                if results.iter().any(|(id, _)| *id == node.id) {
                    continue;
                }
                let fresh = match self.store.require_node(&node.id) {
                    Ok(n) if !n.status.is_resolved() => n,
                    Ok(_) => continue,
                    Err(e) => {
                        error!(node_id = %node.id, error = %e, "Failed to reload node");
                        results.push((node.id, NodeOutcome::Failed));
                        continue;
                    }
                };
                results.push(self.run_node(ctx, fresh, None).await);
            }
        }
        results
    }

    async fn try_run_isolated(
        &self,
        ctx: &RunCtx,
        nodes: &[Node],
        results: &mut Vec<(String, NodeOutcome)>,
    ) -> Result<()> {
        let run_id = &ctx.run.id;
        let groups = match &self.planner {
            Some(planner) => {
                let groups = planner.plan_level(run_id, nodes).await?;
                check_partition(nodes, &groups)?;
                groups
            }
            None => vec![nodes.iter().map(|n| n.id.clone()).collect()],
        };

        for group in groups {
            let mut dirs = std::collections::HashMap::new();
            let mut members = Vec::new();
            for id in &group {
                if let Some(node) = nodes.iter().find(|n| &n.id == id) {
                    dirs.insert(id.clone(), self.workspace.prepare_node_dir(run_id, id)?);
                    members.push(self.store.require_node(&node.id)?);
                }
            }
            let outcomes = self.run_level(ctx, members, Some(&dirs)).await;
            let merged: Vec<String> = outcomes
                .iter()
                .filter(|(_, o)| *o == NodeOutcome::Completed)
                .map(|(id, _)| id.clone())
                .collect();
            results.extend(outcomes);
            self.workspace.merge_level(run_id, &merged)?;
        }
        Ok(())
    }

    /// Run one node, turning infrastructure errors into a failed outcome.
    async fn run_node(&self, ctx: &RunCtx, node: Node, workdir: Option<PathBuf>) -> (String, NodeOutcome) {
        let node_id = node.id.clone();
        let outcome = match self.try_run_node(ctx, node, workdir).await {
            Ok(outcome) => outcome,
            Err(StrataError::Cancelled) => NodeOutcome::Cancelled,
            Err(StrataError::ApprovalTimeout { .. }) => NodeOutcome::Suspended,
            Err(e) => {
                error!(run_id = %ctx.run.id, node_id = %node_id, error = %e, "Node execution error");
                if ctx.signals.wait_if_paused().await.is_err() {
                    return (node_id, NodeOutcome::Cancelled);
                }
                self.mark_failed(&node_id, None, &e.to_string());
                NodeOutcome::Failed
            }
        };
        (node_id, outcome)
    }

    async fn try_run_node(&self, ctx: &RunCtx, node: Node, workdir: Option<PathBuf>) -> Result<NodeOutcome> {
        if node.node_type.is_bookkeeping() {
            self.machines
                .nodes
                .transition_to(&node.id, NodeStatus::Skipped, Some("bookkeeping node"), &self.actor)?;
            return Ok(NodeOutcome::Skipped);
        }

        let step = self.ensure_step(&ctx.run, &node)?;
        let mut feedback = None;

        if needs_approval(&node) {
            match self.pass_gate(ctx, &node, &step).await? {
                GateResult::Proceed(fb) => feedback = fb,
                GateResult::Skipped => return Ok(NodeOutcome::Skipped),
                GateResult::Stopped => return Ok(NodeOutcome::Cancelled),
            }
            if node.node_type == NodeType::Approval {
                let outputs = serde_json::json!({ "approved": true, "feedback": feedback });
                return self.commit_success(ctx, &node, &step, outputs, None).await;
            }
        }

        self.execute_with_retry(ctx, &node, &step, workdir, feedback).await
    }

    fn ensure_step(&self, run: &Run, node: &Node) -> Result<Step> {
        if let Some(step) = self.store.find_step_for_node(&run.id, &node.id)? {
            return Ok(step);
        }
        let mut step = Step::new(run, node.order_index, node.task()).for_node(node);
        step.inputs = serde_json::json!({ "node_type": node.node_type });
        self.store.insert_step(&step)?;
        Ok(step)
    }

    async fn pass_gate(&self, ctx: &RunCtx, node: &Node, step: &Step) -> Result<GateResult> {
        // Re-execution after the decision was already made. A replay reset of
        // the node invalidates grants resolved before it.
        let reset_at = self
            .store
            .list_history(EntityKind::Node, &node.id)?
            .into_iter()
            .filter(|h| h.to_state == NodeStatus::Pending.as_str())
            .map(|h| h.timestamp)
            .max();
        let granted = self
            .store
            .list_approvals(Some(&ctx.run.id), Some(ApprovalStatus::Approved))?
            .into_iter()
            .chain(
                self.store
                    .list_approvals(Some(&ctx.run.id), Some(ApprovalStatus::Modified))?,
            )
            .filter(|r| r.node_id.as_deref() == Some(&node.id))
            .find(|r| match (reset_at, r.resolved_at) {
                (Some(reset), Some(resolved)) => resolved > reset,
                (Some(_), None) => false,
                (None, _) => true,
            });
        if let Some(request) = granted {
            if request.resolution == Some(ApprovalResolution::Skip) {
                self.set_status(node, step, NodeStatus::Skipped, "approval skipped")?;
                return Ok(GateResult::Skipped);
            }
            return Ok(GateResult::Proceed(request.feedback));
        }

        ctx.signals.wait_if_paused().await?;
        self.set_status(node, step, NodeStatus::Running, "awaiting approval")?;
        let draft = ApprovalDraft::new(node.node_type.to_string(), format!("Approve: {}", node.task()))
            .for_step(&step.id)
            .for_node(&node.id)
            .with_context(serde_json::json!({
                "task": node.task(),
                "agent": node.agent,
                "order_index": node.order_index,
            }));
        let request = self.gate.create_approval_request(&ctx.run.id, draft)?;

        let resolved = tokio::select! {
            _ = ctx.signals.cancel_token().cancelled() => return Err(StrataError::Cancelled),
            r = self.gate.wait_for_approval(&request.id, None) => r?,
        };

        match (resolved.status, resolved.resolution) {
            (_, Some(ApprovalResolution::Skip)) => Ok(GateResult::Skipped),
            (ApprovalStatus::Approved | ApprovalStatus::Modified, _) => {
                Ok(GateResult::Proceed(resolved.feedback))
            }
            (ApprovalStatus::Expired, _) => Err(StrataError::ApprovalTimeout {
                request_id: resolved.id,
                timeout_secs: self.gate.default_timeout().as_secs(),
            }),
            _ => Ok(GateResult::Stopped),
        }
    }

    async fn execute_with_retry(
        &self,
        ctx: &RunCtx,
        node: &Node,
        step: &Step,
        workdir: Option<PathBuf>,
        feedback: Option<String>,
    ) -> Result<NodeOutcome> {
        let max_attempts = node
            .meta
            .retry
            .map(|p| p.max_attempts)
            .unwrap_or(self.default_attempts)
            .max(1);
        let max_backoff = node
            .meta
            .retry
            .and_then(|p| p.max_backoff_secs)
            .unwrap_or(self.max_backoff_secs);
        // Attempt numbers continue across re-executions of the same step.
        let base = self.store.require_step(&step.id)?.meta.retry_attempts.len() as u32;
        let mut brief = feedback
            .as_deref()
            .map(|fb| format!("## Reviewer feedback\n\n{}\n", fb));

        for attempt in 1..=max_attempts {
            let number = base + attempt;
            ctx.signals.wait_if_paused().await?;
            let reason = format!("attempt {}", number);
            self.set_status(node, step, NodeStatus::Running, &reason)?;
            self.events.publish(WorkflowEvent::NodeStarted {
                run_id: ctx.run.id.clone(),
                node_id: node.id.clone(),
                attempt: number,
            });

            let request = NodeRequest {
                run_id: ctx.run.id.clone(),
                node_id: node.id.clone(),
                step_id: Some(step.id.clone()),
                agent: node.agent.clone(),
                task: node.task().to_string(),
                attempt: number,
                working_dir: workdir.clone(),
                retry_brief: brief.take(),
                context: ctx.context.lock().await.clone(),
            };

            let started = Instant::now();
            let message = match self.invoke(ctx, request).await {
                Ok(outputs) => {
                    let elapsed = started.elapsed().as_millis() as u64;
                    let mut meta = self.retry.record_attempt(&step.id, RetryAttempt::success(number))?;
                    meta.duration_ms = Some(elapsed);
                    meta.cost = outputs.get("cost").and_then(serde_json::Value::as_f64).or(meta.cost);
                    return self.commit_success(ctx, node, step, outputs, Some(meta)).await;
                }
                Err(StrataError::Cancelled) => return Err(StrataError::Cancelled),
                Err(StrataError::Execution { message, .. }) => message,
                Err(e) => e.to_string(),
            };

            let category = self.retry.analyzer().classify(&message);
            // A paused step cannot move to failed; record the failure after resume.
            ctx.signals.wait_if_paused().await?;
            self.mark_failed(&node.id, Some(&step.id), &message);

            if attempt == max_attempts {
                self.retry
                    .record_attempt(&step.id, RetryAttempt::failure(number, &message, category))?;
                self.events.publish(WorkflowEvent::NodeFinished {
                    run_id: ctx.run.id.clone(),
                    node_id: node.id.clone(),
                    status: NodeStatus::Failed,
                    error: Some(message.clone()),
                });
                warn!(
                    run_id = %ctx.run.id,
                    node_id = %node.id,
                    attempts = attempt,
                    category = %category,
                    error = %message,
                    "Node failed"
                );
                return Ok(NodeOutcome::Failed);
            }

            let strategy = select_strategy(number + 1, false, max_backoff);
            let mut record = RetryAttempt::failure(number, &message, category);
            record.strategy = Some(strategy.kind);
            record.delay_secs = strategy.delay_secs;
            self.retry.record_attempt(&step.id, record)?;

            let retry_ctx = self
                .retry
                .create_retry_context(&step.id, number + 1, base + max_attempts, None)?;
            brief = Some(format_retry_brief(&retry_ctx));

            self.events.publish(WorkflowEvent::RetryScheduled {
                run_id: ctx.run.id.clone(),
                node_id: node.id.clone(),
                attempt: number + 1,
                delay_secs: strategy.delay_secs,
                category,
            });
            info!(
                run_id = %ctx.run.id,
                node_id = %node.id,
                next_attempt = number + 1,
                delay_secs = strategy.delay_secs,
                category = %category,
                "Retrying node"
            );

            if strategy.delay_secs > 0 {
                tokio::select! {
                    _ = ctx.signals.cancel_token().cancelled() => return Err(StrataError::Cancelled),
                    _ = tokio::time::sleep(Duration::from_secs(strategy.delay_secs)) => {}
                }
            }
        }
        Ok(NodeOutcome::Failed)
    }

    /// Call the node executor under the cancel token and the task timeout.
    async fn invoke(&self, ctx: &RunCtx, request: NodeRequest) -> Result<serde_json::Value> {
        let node_id = request.node_id.clone();
        let timeout_secs = ctx
            .executor
            .timeout_secs()
            .unwrap_or(self.config.task_timeout_secs);
        let call = ctx.executor.execute(request);

        let bounded = async {
            if timeout_secs == 0 {
                return call.await;
            }
            match tokio::time::timeout(Duration::from_secs(timeout_secs), call).await {
                Ok(result) => result,
                Err(_) => Err(StrataError::NodeTimeout {
                    node_id: node_id.clone(),
                    timeout_secs,
                }),
            }
        };

        tokio::select! {
            _ = ctx.signals.cancel_token().cancelled() => Err(StrataError::Cancelled),
            result = bounded => result,
        }
    }

    async fn commit_success(
        &self,
        ctx: &RunCtx,
        node: &Node,
        step: &Step,
        outputs: serde_json::Value,
        meta: Option<StepMeta>,
    ) -> Result<NodeOutcome> {
        // Results are committed only while the run is not paused.
        ctx.signals.wait_if_paused().await?;

        self.store.update_node_result(&node.id, &outputs, None)?;
        self.store.update_step(
            &step.id,
            StepUpdate {
                outputs: Some(outputs.clone()),
                meta,
                error: Some(None),
                ..Default::default()
            },
        )?;
        self.set_status(node, step, NodeStatus::Completed, "execution succeeded")?;

        let snapshot = {
            let mut context = ctx.context.lock().await;
            context.record_output(&node.id, outputs);
            context.clone()
        };
        let checkpoint = Checkpoint::new(&ctx.run.id, CheckpointType::StepComplete, snapshot)
            .at_step(Some(step.id.clone()), step.step_number);
        self.store.insert_checkpoint(&checkpoint)?;

        self.events.publish(WorkflowEvent::NodeFinished {
            run_id: ctx.run.id.clone(),
            node_id: node.id.clone(),
            status: NodeStatus::Completed,
            error: None,
        });
        debug!(run_id = %ctx.run.id, node_id = %node.id, "Node completed");
        Ok(NodeOutcome::Completed)
    }

    /// Move a node and its step together.
    fn set_status(&self, node: &Node, step: &Step, to: NodeStatus, reason: &str) -> Result<()> {
        self.machines
            .nodes
            .transition_to(&node.id, to, Some(reason), &self.actor)?;
        self.machines
            .steps
            .transition_to(&step.id, to, Some(reason), &self.actor)?;
        Ok(())
    }

    /// Best effort: record the error and move node (and step) to `failed`.
    fn mark_failed(&self, node_id: &str, step_id: Option<&str>, message: &str) {
        if let Err(e) = self
            .store
            .update_node_result(node_id, &serde_json::Value::Null, Some(message))
        {
            warn!(node_id, error = %e, "Failed to store node error");
        }
        if let Err(e) = self
            .machines
            .nodes
            .transition_to(node_id, NodeStatus::Failed, Some(message), &self.actor)
        {
            warn!(node_id, error = %e, "Failed to mark node failed");
        }
        if let Some(step_id) = step_id {
            let update = StepUpdate {
                error: Some(Some(message.to_string())),
                ..Default::default()
            };
            if let Err(e) = self.store.update_step(step_id, update) {
                warn!(step_id, error = %e, "Failed to store step error");
            }
            if let Err(e) = self
                .machines
                .steps
                .transition_to(step_id, StepStatus::Failed, Some(message), &self.actor)
            {
                warn!(step_id, error = %e, "Failed to mark step failed");
            }
        }
    }
}

enum GateResult {
    Proceed(Option<String>),
    Skipped,
    Stopped,
}

fn needs_approval(node: &Node) -> bool {
    node.node_type == NodeType::Approval || node.meta.approval_required
}

/// Planner output must cover every node of the level exactly once.
fn check_partition(nodes: &[Node], groups: &[Vec<String>]) -> Result<()> {
    let mut seen: Vec<&str> = groups.iter().flatten().map(String::as_str).collect();
    seen.sort_unstable();
    let mut expected: Vec<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
    expected.sort_unstable();
    if seen != expected {
        return Err(ValidationError::PolicyViolation(
            "level planner must return every node of the level exactly once".to_string(),
        )
        .into());
    }
    Ok(())
}
