use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::*;

/// Performs the actual unit of work behind an agent node.
pub trait NodeExecutor: Send + Sync + 'static {
    /// Execute one attempt. The returned value becomes the node's outputs.
    fn execute(&self, request: NodeRequest) -> BoxFuture<'_, Result<serde_json::Value>>;

    /// Per-node timeout override in seconds. `None` uses the executor config.
    fn timeout_secs(&self) -> Option<u64> {
        None
    }
}

/// Tells humans a decision is waiting.
/// Fire-and-forget: the gate never waits on delivery.
pub trait ApprovalNotifier: Send + Sync + 'static {
    fn notify(&self, request: &ApprovalRequest);
}

/// Observes state machine transitions.
///
/// Errors are logged by the state machine and never abort the transition.
pub trait TransitionListener: Send + Sync + 'static {
    fn before_transition(&self, event: &TransitionEvent) -> Result<()> {
        let _ = event;
        Ok(())
    }

    fn after_transition(&self, event: &TransitionEvent) -> Result<()>;
}

/// Optionally splits a level into ordered sub-levels before
/// the enhanced executor dispatches it.
pub trait LevelPlanner: Send + Sync + 'static {
    /// Return groups of node ids; groups run in order, nodes within a group in
    /// parallel. Every node of `level` must appear exactly once.
    fn plan_level<'a>(
        &'a self,
        run_id: &'a str,
        level: &'a [Node],
    ) -> BoxFuture<'a, Result<Vec<Vec<String>>>>;
}
