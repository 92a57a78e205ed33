use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use strata_core::error::{Result, StateMachineError, StrataError};
use strata_core::types::*;
use strata_store::WorkflowStore;

use crate::approval::ApprovalRegistry;
use crate::state_machine::Machines;

/// Cancel token and pause barrier handed to an executor driving one run.
#[derive(Clone)]
pub struct RunSignals {
    cancel: CancellationToken,
    paused: watch::Receiver<bool>,
}

impl RunSignals {
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Hold while the run is paused. Fails with `Cancelled` if the run is
    /// cancelled first.
    pub async fn wait_if_paused(&self) -> Result<()> {
        let mut rx = self.paused.clone();
        loop {
            if self.cancel.is_cancelled() {
                return Err(StrataError::Cancelled);
            }
            if !*rx.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(StrataError::Cancelled),
                changed = rx.changed() => {
                    // Controller dropped the run; nothing left to wait for.
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

struct SignalSlot {
    cancel: CancellationToken,
    paused: watch::Sender<bool>,
}

impl SignalSlot {
    fn signals(&self) -> RunSignals {
        RunSignals {
            cancel: self.cancel.clone(),
            paused: self.paused.subscribe(),
        }
    }
}

/// A run with its steps and the run transitions currently allowed.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowStatus {
    pub run: Run,
    pub steps: Vec<Step>,
    pub allowed_transitions: Vec<RunStatus>,
    pub pending_approvals: Vec<ApprovalRequest>,
}

/// Pause, resume and cancel for runs, plus the signal registry executors
/// attach to.
pub struct WorkflowController {
    store: Arc<WorkflowStore>,
    machines: Machines,
    approvals: Arc<ApprovalRegistry>,
    actor: String,
    signals: Mutex<HashMap<String, SignalSlot>>,
}

impl WorkflowController {
    pub fn new(
        store: Arc<WorkflowStore>,
        machines: Machines,
        approvals: Arc<ApprovalRegistry>,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            store,
            machines,
            approvals,
            actor: actor.into(),
            signals: Mutex::new(HashMap::new()),
        }
    }

    /// Register (or reuse) the signal set for a run about to be executed.
    pub fn attach(&self, run_id: &str) -> Result<RunSignals> {
        let run = self.store.require_run(run_id)?;
        let mut slots = self.lock_signals()?;
        let slot = slots.entry(run_id.to_string()).or_insert_with(|| SignalSlot {
            cancel: CancellationToken::new(),
            paused: watch::channel(run.status == RunStatus::Paused).0,
        });
        Ok(slot.signals())
    }

    pub fn detach(&self, run_id: &str) {
        if let Ok(mut slots) = self.lock_signals() {
            slots.remove(run_id);
        }
    }

    /// Signals of an attached run.
    pub fn signals(&self, run_id: &str) -> Option<RunSignals> {
        self.lock_signals()
            .ok()
            .and_then(|slots| slots.get(run_id).map(SignalSlot::signals))
    }

    pub fn pause(&self, run_id: &str, reason: Option<&str>) -> Result<Run> {
        let run = self.store.require_run(run_id)?;
        self.require_status(&run, &[RunStatus::Executing], RunStatus::Paused)?;

        let reason = reason.unwrap_or("paused by controller");
        self.machines
            .runs
            .transition_to(run_id, RunStatus::Paused, Some(reason), &self.actor)?;
        let paused = self.cascade_steps(run_id, &[StepStatus::Running], StepStatus::Paused, reason);
        self.set_paused(run_id, true);

        info!(run_id, steps = paused, "Run paused");
        self.store.require_run(run_id)
    }

    pub fn resume(&self, run_id: &str, reason: Option<&str>) -> Result<Run> {
        let run = self.store.require_run(run_id)?;
        self.require_status(&run, &[RunStatus::Paused], RunStatus::Executing)?;

        let reason = reason.unwrap_or("resumed by controller");
        self.machines
            .runs
            .transition_to(run_id, RunStatus::Executing, Some(reason), &self.actor)?;
        let resumed = self.cascade_steps(run_id, &[StepStatus::Paused], StepStatus::Running, reason);
        self.set_paused(run_id, false);

        info!(run_id, steps = resumed, "Run resumed");
        self.store.require_run(run_id)
    }

    /// Cancel a non-terminal run, its open steps and nodes, and any pending
    /// approval requests. In-flight node executions are abandoned.
    pub fn cancel(&self, run_id: &str, reason: Option<&str>) -> Result<Run> {
        let run = self.store.require_run(run_id)?;
        if run.status.is_terminal() {
            return Err(StateMachineError::IllegalTransition {
                entity: EntityKind::Run.to_string(),
                id: run_id.to_string(),
                from: run.status.to_string(),
                to: RunStatus::Cancelled.to_string(),
            }
            .into());
        }

        let reason = reason.unwrap_or("cancelled by controller");
        self.machines
            .runs
            .transition_to(run_id, RunStatus::Cancelled, Some(reason), &self.actor)?;

        let open = [
            StepStatus::Pending,
            StepStatus::Running,
            StepStatus::Paused,
            StepStatus::WaitingApproval,
        ];
        let steps = self.cascade_steps(run_id, &open, StepStatus::Cancelled, reason);
        let nodes = self.cascade_nodes(run_id, &open, StepStatus::Cancelled, reason);

        if let Some(slot) = self.lock_signals()?.get(run_id) {
            slot.cancel.cancel();
            let _ = slot.paused.send(false);
        }
        let approvals = match self.approvals.cancel_pending(run_id) {
            Ok(ids) => ids.len(),
            Err(e) => {
                warn!(run_id, error = %e, "Failed to cancel pending approvals");
                0
            }
        };

        info!(run_id, steps, nodes, approvals, "Run cancelled");
        self.store.require_run(run_id)
    }

    pub fn get_workflow_status(&self, run_id: &str) -> Result<WorkflowStatus> {
        let run = self.store.require_run(run_id)?;
        let steps = self.store.list_steps(run_id)?;
        let allowed_transitions = self.machines.runs.get_allowed_transitions(run_id)?;
        let pending_approvals = self
            .store
            .list_approvals(Some(run_id), Some(ApprovalStatus::Pending))?;
        Ok(WorkflowStatus {
            run,
            steps,
            allowed_transitions,
            pending_approvals,
        })
    }

    fn require_status(&self, run: &Run, allowed: &[RunStatus], to: RunStatus) -> Result<()> {
        if allowed.contains(&run.status) {
            return Ok(());
        }
        Err(StateMachineError::IllegalTransition {
            entity: EntityKind::Run.to_string(),
            id: run.id.clone(),
            from: run.status.to_string(),
            to: to.to_string(),
        }
        .into())
    }

    fn cascade_steps(&self, run_id: &str, from: &[StepStatus], to: StepStatus, reason: &str) -> usize {
        let steps = match self.store.list_steps(run_id) {
            Ok(steps) => steps,
            Err(e) => {
                warn!(run_id, error = %e, "Failed to list steps for cascade");
                return 0;
            }
        };
        let mut moved = 0;
        for step in steps.iter().filter(|s| from.contains(&s.status)) {
            match self.machines.steps.transition_to(&step.id, to, Some(reason), &self.actor) {
                Ok(_) => moved += 1,
                Err(e) => warn!(run_id, step_id = %step.id, error = %e, "Step cascade skipped"),
            }
        }
        moved
    }

    fn cascade_nodes(&self, run_id: &str, from: &[NodeStatus], to: NodeStatus, reason: &str) -> usize {
        let nodes = match self.store.list_nodes(run_id) {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!(run_id, error = %e, "Failed to list nodes for cascade");
                return 0;
            }
        };
        let mut moved = 0;
        for node in nodes.iter().filter(|n| from.contains(&n.status)) {
            match self.machines.nodes.transition_to(&node.id, to, Some(reason), &self.actor) {
                Ok(_) => moved += 1,
                Err(e) => warn!(run_id, node_id = %node.id, error = %e, "Node cascade skipped"),
            }
        }
        moved
    }

    fn set_paused(&self, run_id: &str, paused: bool) {
        if let Ok(slots) = self.lock_signals() {
            if let Some(slot) = slots.get(run_id) {
                let _ = slot.paused.send(paused);
            }
        }
    }

    fn lock_signals(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, SignalSlot>>> {
        self.signals
            .lock()
            .map_err(|e| StrataError::Config(format!("signal registry poisoned: {}", e)))
    }
}
