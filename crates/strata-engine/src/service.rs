use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use strata_core::config::AppConfig;
use strata_core::error::Result;
use strata_core::event::EventBus;
use strata_core::hooks::HookListener;
use strata_core::traits::{ApprovalNotifier, LevelPlanner, NodeExecutor};
use strata_core::types::*;
use strata_store::WorkflowStore;

use crate::approval::{ApprovalDraft, ApprovalGate, ApprovalRegistry};
use crate::branch::{
    BranchComparator, BranchComparison, BranchManager, BranchOptions, BranchTree, ReplayManager,
};
use crate::controller::{WorkflowController, WorkflowStatus};
use crate::dag::{DagBuilder, DagExecutor, DagMap, ExecutionSummary, RunWorkspace, Scheduler};
use crate::retry::{RetryContextManager, RetryStats};
use crate::run_log::RunLogger;
use crate::state_machine::Machines;

/// Optional collaborators plugged into an [`Orchestrator`].
#[derive(Default)]
pub struct Extensions {
    pub notifier: Option<Arc<dyn ApprovalNotifier>>,
    pub planner: Option<Arc<dyn LevelPlanner>>,
}

/// One engine instance: every component wired to one store and event bus.
pub struct Orchestrator {
    config: AppConfig,
    store: Arc<WorkflowStore>,
    events: Arc<EventBus>,
    machines: Machines,
    builder: DagBuilder,
    controller: Arc<WorkflowController>,
    gate: Arc<ApprovalGate>,
    executor: DagExecutor,
    branches: BranchManager,
    replay: ReplayManager,
    comparator: BranchComparator,
    retry: RetryContextManager,
}

impl Orchestrator {
    /// Open the configured database (creating the workspace) and wire the engine.
    pub fn open(config: AppConfig) -> Result<Self> {
        std::fs::create_dir_all(config.workspace_dir())?;
        let store = Arc::new(WorkflowStore::open(&config.database_path())?);
        Ok(Self::new(config, store))
    }

    pub fn new(config: AppConfig, store: Arc<WorkflowStore>) -> Self {
        Self::with_extensions(config, store, Extensions::default())
    }

    pub fn with_extensions(config: AppConfig, store: Arc<WorkflowStore>, ext: Extensions) -> Self {
        let actor = config.engine.actor.clone();
        let events = Arc::new(EventBus::default());
        let machines = Machines::new(store.clone());
        machines.add_listener(events.clone());
        if let Some(hooks) = config.hooks.clone().filter(|h| !h.is_empty()) {
            machines.add_listener(Arc::new(HookListener::new(hooks)));
        }

        let registry = Arc::new(ApprovalRegistry::new(store.clone()));
        let controller = Arc::new(WorkflowController::new(
            store.clone(),
            machines.clone(),
            registry.clone(),
            actor.clone(),
        ));
        let mut gate = ApprovalGate::new(
            store.clone(),
            machines.clone(),
            registry,
            events.clone(),
            config.approval.clone(),
            actor.clone(),
        );
        if let Some(notifier) = ext.notifier {
            gate = gate.with_notifier(notifier);
        }
        let gate = Arc::new(gate);

        let mut executor = DagExecutor::new(
            store.clone(),
            machines.clone(),
            controller.clone(),
            gate.clone(),
            events.clone(),
            &config,
        );
        if let Some(planner) = ext.planner {
            executor = executor.with_planner(planner);
        }

        let workspace = RunWorkspace::new(config.runs_dir());
        Self {
            builder: DagBuilder::new(store.clone()),
            branches: BranchManager::new(store.clone(), workspace.clone(), events.clone()),
            replay: ReplayManager::new(store.clone(), machines.clone(), actor),
            comparator: BranchComparator::new(store.clone(), workspace),
            retry: RetryContextManager::new(store.clone(), config.retry.max_backoff_secs),
            config,
            store,
            events,
            machines,
            controller,
            gate,
            executor,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<WorkflowStore> {
        &self.store
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn machines(&self) -> &Machines {
        &self.machines
    }

    pub fn workspace(&self) -> &RunWorkspace {
        self.executor.workspace()
    }

    // -- runs ---------------------------------------------------------------

    /// Create a `draft` run; `session_id` defaults to the configured session.
    pub fn create_run(&self, task_description: &str, session_id: Option<&str>) -> Result<Run> {
        let session = session_id.unwrap_or(&self.config.engine.session_id);
        let run = Run::new(session, task_description);
        self.store.insert_run(&run)?;
        info!(run_id = %run.id, session_id = %run.session_id, "Run created");
        Ok(run)
    }

    pub fn get_run(&self, run_id: &str) -> Result<Run> {
        self.store.require_run(run_id)
    }

    pub fn list_runs(&self, session_id: Option<&str>, status: Option<RunStatus>) -> Result<Vec<Run>> {
        self.store.list_runs(session_id, status)
    }

    /// Guarded status change through the run state machine.
    pub fn update_run_status(&self, run_id: &str, status: RunStatus, reason: Option<&str>) -> Result<Run> {
        self.machines
            .runs
            .transition_to(run_id, status, reason, &self.config.engine.actor)?;
        self.store.require_run(run_id)
    }

    pub fn get_state_history(&self, run_id: &str) -> Result<Vec<StateHistory>> {
        self.store.list_history_for_run(run_id)
    }

    // -- steps --------------------------------------------------------------

    /// Append a `pending` step numbered after the run's last step.
    pub fn create_step(&self, run_id: &str, task: &str, agent: Option<&str>) -> Result<Step> {
        let run = self.store.require_run(run_id)?;
        let next = self
            .store
            .list_steps(run_id)?
            .iter()
            .map(|s| s.step_number)
            .max()
            .unwrap_or(0)
            + 1;
        let mut step = Step::new(&run, next, task);
        step.agent = agent.map(str::to_string);
        self.store.insert_step(&step)?;
        debug!(run_id, step_id = %step.id, step_number = next, "Step created");
        Ok(step)
    }

    pub fn list_steps(&self, run_id: &str) -> Result<Vec<Step>> {
        self.store.list_steps(run_id)
    }

    /// Update step content. Status changes go through [`Machines::steps`].
    pub fn update_step(&self, step_id: &str, update: StepUpdate) -> Result<Step> {
        self.store.update_step(step_id, update)
    }

    // -- control ------------------------------------------------------------

    pub fn pause(&self, run_id: &str, reason: Option<&str>) -> Result<Run> {
        self.controller.pause(run_id, reason)
    }

    pub fn resume(&self, run_id: &str, reason: Option<&str>) -> Result<Run> {
        self.controller.resume(run_id, reason)
    }

    pub fn cancel(&self, run_id: &str, reason: Option<&str>) -> Result<Run> {
        self.controller.cancel(run_id, reason)
    }

    pub fn get_workflow_status(&self, run_id: &str) -> Result<WorkflowStatus> {
        self.controller.get_workflow_status(run_id)
    }

    // -- DAG ----------------------------------------------------------------

    pub fn build_dag_from_plan(&self, run_id: &str, plan: &[PlanStep]) -> Result<DagMap> {
        self.builder.build_dag_from_plan(run_id, plan)
    }

    /// Execution levels of a run's DAG, as node ids.
    pub fn get_execution_order(&self, run_id: &str) -> Result<Vec<Vec<String>>> {
        let nodes = self.store.list_nodes(run_id)?;
        let edges = self.store.list_edges(run_id)?;
        Scheduler::new(nodes, &edges)?.execution_levels()
    }

    /// Nodes a branch or replay can start from: completed or failed, by order.
    pub fn get_resumable_nodes(&self, run_id: &str) -> Result<Vec<Node>> {
        let mut nodes: Vec<Node> = self
            .store
            .list_nodes(run_id)?
            .into_iter()
            .filter(|n| matches!(n.status, NodeStatus::Completed | NodeStatus::Failed))
            .collect();
        nodes.sort_by_key(|n| n.order_index);
        Ok(nodes)
    }

    /// Drive a run to completion, logging its events to JSONL when enabled.
    pub async fn execute(&self, run_id: &str, executor: Arc<dyn NodeExecutor>) -> Result<ExecutionSummary> {
        let cancel = CancellationToken::new();
        let logger = match (self.config.log_dir(), &self.config.log) {
            (Some(dir), Some(log)) => Some(RunLogger::new(dir, log.level).start(
                &self.events,
                run_id.to_string(),
                cancel.clone(),
            )),
            _ => None,
        };

        let result = self.executor.execute(run_id, executor).await;

        if let Some(handle) = logger {
            if result.is_err() {
                cancel.cancel();
            }
            // the logger stops by itself on RunFinished
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                cancel.cancel();
            }
        }
        result
    }

    // -- branching ----------------------------------------------------------

    pub fn create_branch(
        &self,
        run_id: &str,
        node_id: &str,
        name: &str,
        options: BranchOptions,
    ) -> Result<Branch> {
        self.branches.create_branch(run_id, node_id, name, options)
    }

    pub fn set_branch_status(&self, child_run_id: &str, status: BranchStatus) -> Result<Branch> {
        self.branches.set_branch_status(child_run_id, status)
    }

    pub fn play_from_node(
        &self,
        run_id: &str,
        node_id: &str,
        context_override: Option<&ExtraFields>,
    ) -> Result<ContextSnapshot> {
        self.replay.play_from_node(run_id, node_id, context_override)
    }

    pub fn compare_branches(&self, run_a: &str, run_b: &str) -> Result<BranchComparison> {
        self.comparator.compare_branches(run_a, run_b)
    }

    pub fn get_branch_tree(&self, run_id: &str) -> Result<BranchTree> {
        self.comparator.get_branch_tree(run_id)
    }

    // -- approvals ----------------------------------------------------------

    pub fn create_approval_request(&self, run_id: &str, draft: ApprovalDraft) -> Result<ApprovalRequest> {
        self.gate.create_approval_request(run_id, draft)
    }

    /// Resolve a request. Requests created by another process are resolved
    /// durably; a local waiter, if any, is woken.
    pub fn resolve_approval(
        &self,
        request_id: &str,
        resolution: ApprovalResolution,
        feedback: Option<&str>,
    ) -> Result<ApprovalRequest> {
        self.gate.resolve_approval(request_id, resolution, feedback)
    }

    pub async fn wait_for_approval(&self, request_id: &str, timeout: Option<Duration>) -> Result<ApprovalRequest> {
        self.gate.wait_for_approval(request_id, timeout).await
    }

    pub fn list_pending_approvals(&self, run_id: Option<&str>) -> Result<Vec<ApprovalRequest>> {
        self.gate.list_pending(run_id)
    }

    pub fn expire_stale_approvals(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        self.gate.expire_stale(now)
    }

    // -- retry --------------------------------------------------------------

    pub fn record_attempt(&self, step_id: &str, attempt: RetryAttempt) -> Result<StepMeta> {
        self.retry.record_attempt(step_id, attempt)
    }

    pub fn get_retry_stats(&self, run_id: &str) -> Result<RetryStats> {
        self.retry.get_retry_stats(run_id)
    }
}
