use serde::Serialize;

use crate::error::Result;
use crate::traits::TransitionListener;
use crate::types::*;

/// Workflow event broadcast to all subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// A run, step or node changed status.
    Transitioned {
        entity_type: EntityKind,
        entity_id: String,
        run_id: String,
        from: String,
        to: String,
        reason: Option<String>,
    },
    /// The executor started a level.
    LevelStarted {
        run_id: String,
        level: usize,
        node_ids: Vec<String>,
    },
    /// The executor finished a level.
    LevelCompleted {
        run_id: String,
        level: usize,
        completed: usize,
        failed: usize,
        skipped: usize,
    },
    /// A node execution attempt started.
    NodeStarted {
        run_id: String,
        node_id: String,
        attempt: u32,
    },
    /// A node reached a final status for this execution.
    NodeFinished {
        run_id: String,
        node_id: String,
        status: NodeStatus,
        error: Option<String>,
    },
    /// A failed node will be attempted again.
    RetryScheduled {
        run_id: String,
        node_id: String,
        attempt: u32,
        delay_secs: u64,
        category: ErrorCategory,
    },
    /// A human decision is required.
    ApprovalRequested { request: ApprovalRequest },
    /// A pending approval was resolved.
    ApprovalResolved {
        request_id: String,
        run_id: String,
        resolution: ApprovalResolution,
    },
    /// A child run was forked from a parent.
    BranchCreated { branch: Branch },
    /// The executor finished driving a run.
    RunFinished {
        run_id: String,
        status: RunStatus,
        completed_nodes: usize,
        failed_nodes: usize,
    },
}

impl WorkflowEvent {
    /// Run the event belongs to.
    pub fn run_id(&self) -> &str {
        match self {
            Self::Transitioned { run_id, .. }
            | Self::LevelStarted { run_id, .. }
            | Self::LevelCompleted { run_id, .. }
            | Self::NodeStarted { run_id, .. }
            | Self::NodeFinished { run_id, .. }
            | Self::RetryScheduled { run_id, .. }
            | Self::ApprovalResolved { run_id, .. }
            | Self::RunFinished { run_id, .. } => run_id,
            Self::ApprovalRequested { request } => &request.run_id,
            Self::BranchCreated { branch } => &branch.parent_run_id,
        }
    }
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: WorkflowEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl TransitionListener for EventBus {
    fn after_transition(&self, event: &TransitionEvent) -> Result<()> {
        self.publish(WorkflowEvent::Transitioned {
            entity_type: event.entity_type,
            entity_id: event.entity_id.clone(),
            run_id: event.run_id.clone(),
            from: event.from.clone(),
            to: event.to.clone(),
            reason: event.reason.clone(),
        });
        Ok(())
    }
}
