mod approvals;
mod branches;
mod checkpoints;
mod dag;
mod history;
mod row;
mod runs;
mod schema;
mod steps;
mod store;

pub use branches::BranchFork;
pub use history::TransitionRecord;
pub use store::WorkflowStore;
