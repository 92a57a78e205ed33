pub mod approval;
pub mod branch;
pub mod controller;
pub mod dag;
pub mod retry;
pub mod run_log;
pub mod service;
pub mod state_machine;

pub use approval::{ApprovalGate, ApprovalRegistry};
pub use branch::{BranchComparator, BranchManager, BranchTree, Modifications, ReplayManager};
pub use controller::{RunSignals, WorkflowController, WorkflowStatus};
pub use dag::{DagBuilder, DagExecutor, DagMap, ExecutionSummary, RunWorkspace, Scheduler};
pub use retry::{ErrorAnalyzer, RetryContext, RetryContextManager, RetryStats};
pub use run_log::RunLogger;
pub use service::Orchestrator;
pub use state_machine::{Machines, StateMachine};
