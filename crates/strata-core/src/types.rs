use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Residual map for metadata keys this version does not model explicitly.
pub type ExtraFields = serde_json::Map<String, serde_json::Value>;

/// Generate a new entity identifier.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Declares a snake_case string enum with `as_str`, `Display` and `FromStr`,
/// matching the serde representation used in persisted rows.
macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident { $($variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("unknown {} '{}'", stringify!($name), other)),
                }
            }
        }
    };
}

string_enum! {
    /// Lifecycle of a workflow run.
    pub enum RunStatus {
        Draft => "draft",
        Planning => "planning",
        Executing => "executing",
        Paused => "paused",
        WaitingApproval => "waiting_approval",
        Completed => "completed",
        Failed => "failed",
        Cancelled => "cancelled",
    }
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

string_enum! {
    /// Lifecycle of a step (and of a DAG node, which shares the same states).
    pub enum StepStatus {
        Pending => "pending",
        Running => "running",
        Paused => "paused",
        WaitingApproval => "waiting_approval",
        Completed => "completed",
        Failed => "failed",
        Skipped => "skipped",
        Cancelled => "cancelled",
    }
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped | Self::Cancelled)
    }

    /// A dependency in this state no longer blocks its dependents.
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    /// States the controller's cancel cascades over.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Running | Self::Paused | Self::WaitingApproval
        )
    }
}

/// Nodes follow the step lifecycle.
pub type NodeStatus = StepStatus;

string_enum! {
    pub enum NodeType {
        Planning => "planning",
        Control => "control",
        Agent => "agent",
        Approval => "approval",
        ParallelGroup => "parallel_group",
        Terminator => "terminator",
        SubAgent => "sub_agent",
        BranchPoint => "branch_point",
    }
}

impl NodeType {
    /// Bookkeeping nodes carry no work and finish as `skipped`.
    pub fn is_bookkeeping(&self) -> bool {
        matches!(
            self,
            Self::Planning | Self::Terminator | Self::Control | Self::ParallelGroup | Self::BranchPoint
        )
    }
}

string_enum! {
    pub enum DependencyType {
        Sequential => "sequential",
        Parallel => "parallel",
        Conditional => "conditional",
        Optional => "optional",
    }
}

string_enum! {
    pub enum CheckpointType {
        StepComplete => "step_complete",
        Timed => "timed",
        Manual => "manual",
        Error => "error",
        Emergency => "emergency",
        BranchInitial => "branch_initial",
    }
}

string_enum! {
    pub enum BranchStatus {
        Active => "active",
        Completed => "completed",
        Merged => "merged",
        Abandoned => "abandoned",
    }
}

string_enum! {
    pub enum ApprovalStatus {
        Pending => "pending",
        Approved => "approved",
        Rejected => "rejected",
        Modified => "modified",
        Expired => "expired",
        Cancelled => "cancelled",
    }
}

string_enum! {
    /// Decision supplied by the human resolving an approval request.
    pub enum ApprovalResolution {
        Approved => "approved",
        Modified => "modified",
        Retry => "retry",
        Skip => "skip",
        Rejected => "rejected",
        Abort => "abort",
    }
}

impl ApprovalResolution {
    /// Whether the run may continue after this resolution.
    pub fn lets_run_continue(&self) -> bool {
        !matches!(self, Self::Rejected | Self::Abort)
    }

    /// Persisted request status for this resolution.
    pub fn request_status(&self) -> ApprovalStatus {
        match self {
            Self::Approved | Self::Retry | Self::Skip => ApprovalStatus::Approved,
            Self::Modified => ApprovalStatus::Modified,
            Self::Rejected | Self::Abort => ApprovalStatus::Rejected,
        }
    }
}

string_enum! {
    /// Kind of entity tracked by the state machine and the audit log.
    pub enum EntityKind {
        Run => "run",
        Step => "step",
        Node => "node",
    }
}

string_enum! {
    /// Failure classification produced by the error analyzer.
    pub enum ErrorCategory {
        FileNotFound => "file_not_found",
        ApiError => "api_error",
        Timeout => "timeout",
        ImportError => "import_error",
        TypeError => "type_error",
        ValueError => "value_error",
        KeyError => "key_error",
        AttributeError => "attribute_error",
        IndexError => "index_error",
        PermissionError => "permission_error",
        ConnectionError => "connection_error",
        MemoryError => "memory_error",
        Unknown => "unknown",
    }
}

string_enum! {
    pub enum RetryStrategyKind {
        UserGuided => "user_guided",
        ExponentialBackoff => "exponential_backoff",
        Immediate => "immediate",
    }
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// One workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub session_id: String,
    pub status: RunStatus,
    pub mode: String,
    pub primary_agent: Option<String>,
    pub model: Option<String>,
    pub task_description: String,
    pub is_branch: bool,
    pub branch_parent_id: Option<String>,
    pub branch_depth: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Run {
    /// Create a new root run in `draft`.
    pub fn new(session_id: impl Into<String>, task_description: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            session_id: session_id.into(),
            status: RunStatus::Draft,
            mode: "standard".to_string(),
            primary_agent: None,
            model: None,
            task_description: task_description.into(),
            is_branch: false,
            branch_parent_id: None,
            branch_depth: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = mode.into();
        self
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.primary_agent = Some(agent.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Create a `draft` child run that forks from `parent`.
    pub fn branch_of(parent: &Run) -> Self {
        Self {
            id: new_id(),
            session_id: parent.session_id.clone(),
            status: RunStatus::Draft,
            mode: parent.mode.clone(),
            primary_agent: parent.primary_agent.clone(),
            model: parent.model.clone(),
            task_description: parent.task_description.clone(),
            is_branch: true,
            branch_parent_id: Some(parent.id.clone()),
            branch_depth: parent.branch_depth + 1,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Wall-clock execution time, if the run has started.
    pub fn elapsed_secs(&self) -> Option<f64> {
        let start = self.started_at?;
        let end = self.completed_at.unwrap_or_else(Utc::now);
        Some((end - start).num_milliseconds() as f64 / 1000.0)
    }
}

/// Snapshot of one attempt at executing a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub attempt: u32,
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_category: Option<ErrorCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_feedback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<RetryStrategyKind>,
    #[serde(default)]
    pub delay_secs: u64,
    pub timestamp: DateTime<Utc>,
}

impl RetryAttempt {
    pub fn success(attempt: u32) -> Self {
        Self {
            attempt,
            succeeded: true,
            error: None,
            error_category: None,
            user_feedback: None,
            strategy: None,
            delay_secs: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(attempt: u32, error: impl Into<String>, category: ErrorCategory) -> Self {
        Self {
            attempt,
            succeeded: false,
            error: Some(error.into()),
            error_category: Some(category),
            user_feedback: None,
            strategy: None,
            delay_secs: 0,
            timestamp: Utc::now(),
        }
    }
}

/// Typed step metadata with a residual map for forward compatibility.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepMeta {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retry_attempts: Vec<RetryAttempt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(flatten)]
    pub extra: ExtraFields,
}

/// One logical unit of work inside a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub run_id: String,
    pub session_id: String,
    pub node_id: Option<String>,
    pub step_number: i64,
    pub task: String,
    pub agent: Option<String>,
    pub status: StepStatus,
    pub inputs: serde_json::Value,
    pub outputs: serde_json::Value,
    pub meta: StepMeta,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Step {
    pub fn new(run: &Run, step_number: i64, task: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            run_id: run.id.clone(),
            session_id: run.session_id.clone(),
            node_id: None,
            step_number,
            task: task.into(),
            agent: None,
            status: StepStatus::Pending,
            inputs: serde_json::Value::Null,
            outputs: serde_json::Value::Null,
            meta: StepMeta::default(),
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn for_node(mut self, node: &Node) -> Self {
        self.node_id = Some(node.id.clone());
        self.agent = node.agent.clone();
        self
    }

    /// The most recent recorded attempt, if any.
    pub fn last_attempt(&self) -> Option<&RetryAttempt> {
        self.meta.retry_attempts.last()
    }
}

/// Partial update applied by `update_step`.
#[derive(Debug, Clone, Default)]
pub struct StepUpdate {
    pub task: Option<String>,
    pub inputs: Option<serde_json::Value>,
    pub outputs: Option<serde_json::Value>,
    pub meta: Option<StepMeta>,
    pub error: Option<Option<String>>,
}

/// Per-node retry policy supplied by the plan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_policy_attempts")]
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_backoff_secs: Option<u64>,
}

fn default_policy_attempts() -> u32 {
    3
}

/// Typed node metadata with a residual map for forward compatibility.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMeta {
    #[serde(default)]
    pub task: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub parallel: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_group: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub approval_required: bool,
    #[serde(default, alias = "retry_config", skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(flatten)]
    pub extra: ExtraFields,
}

/// A vertex in a run's execution DAG.
///
/// Hierarchy (`parent_node_id`) is stored as ids so the node set can be
/// cloned into a branch without rebuilding references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub run_id: String,
    pub node_type: NodeType,
    pub agent: Option<String>,
    pub status: NodeStatus,
    pub order_index: i64,
    pub depth: u32,
    pub parent_node_id: Option<String>,
    pub meta: NodeMeta,
    pub outputs: serde_json::Value,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Node {
    pub fn new(run_id: impl Into<String>, node_type: NodeType, order_index: i64) -> Self {
        Self {
            id: new_id(),
            run_id: run_id.into(),
            node_type,
            agent: None,
            status: NodeStatus::Pending,
            order_index,
            depth: 0,
            parent_node_id: None,
            meta: NodeMeta::default(),
            outputs: serde_json::Value::Null,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn with_meta(mut self, meta: NodeMeta) -> Self {
        self.meta = meta;
        self
    }

    pub fn with_parent(mut self, parent: &Node) -> Self {
        self.parent_node_id = Some(parent.id.clone());
        self.depth = parent.depth + 1;
        self
    }

    pub fn task(&self) -> &str {
        &self.meta.task
    }
}

/// Directed dependency `from_node → to_node`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub run_id: String,
    pub from_node: String,
    pub to_node: String,
    pub dependency_type: DependencyType,
    pub condition: Option<String>,
}

impl Edge {
    pub fn new(
        run_id: impl Into<String>,
        from_node: impl Into<String>,
        to_node: impl Into<String>,
        dependency_type: DependencyType,
    ) -> Self {
        Self {
            id: new_id(),
            run_id: run_id.into(),
            from_node: from_node.into(),
            to_node: to_node.into(),
            dependency_type,
            condition: None,
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }
}

/// Current context snapshot format.
pub const CONTEXT_SNAPSHOT_VERSION: u32 = 1;

/// Execution context captured by a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    #[serde(default = "default_snapshot_version")]
    pub version: u32,
    #[serde(default)]
    pub completed_nodes: Vec<String>,
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub context_overrides: ExtraFields,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub parameter_overrides: ExtraFields,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alternative_approach: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(flatten)]
    pub extra: ExtraFields,
}

fn default_snapshot_version() -> u32 {
    CONTEXT_SNAPSHOT_VERSION
}

impl Default for ContextSnapshot {
    fn default() -> Self {
        Self {
            version: CONTEXT_SNAPSHOT_VERSION,
            completed_nodes: Vec::new(),
            outputs: BTreeMap::new(),
            context_overrides: ExtraFields::new(),
            parameter_overrides: ExtraFields::new(),
            alternative_approach: None,
            instructions: None,
            extra: ExtraFields::new(),
        }
    }
}

impl ContextSnapshot {
    /// Record a node's output (overwrites a previous value).
    pub fn record_output(&mut self, node_id: &str, output: serde_json::Value) {
        if !self.completed_nodes.iter().any(|n| n == node_id) {
            self.completed_nodes.push(node_id.to_string());
        }
        self.outputs.insert(node_id.to_string(), output);
    }

    /// Merge context overrides into this snapshot (overwrites on conflict).
    pub fn merge_overrides(&mut self, overrides: &ExtraFields) {
        for (k, v) in overrides {
            self.context_overrides.insert(k.clone(), v.clone());
        }
    }
}

/// Immutable snapshot of execution context for replay and branching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub run_id: String,
    pub step_id: Option<String>,
    pub step_number: Option<i64>,
    pub checkpoint_type: CheckpointType,
    pub context_snapshot: ContextSnapshot,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        run_id: impl Into<String>,
        checkpoint_type: CheckpointType,
        context_snapshot: ContextSnapshot,
    ) -> Self {
        Self {
            id: new_id(),
            run_id: run_id.into(),
            step_id: None,
            step_number: None,
            checkpoint_type,
            context_snapshot,
            created_at: Utc::now(),
        }
    }

    pub fn at_step(mut self, step_id: Option<String>, step_number: i64) -> Self {
        self.step_id = step_id;
        self.step_number = Some(step_number);
        self
    }
}

/// Relation between a parent run (at a step) and a forked child run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub id: String,
    pub parent_run_id: String,
    pub parent_step_id: Option<String>,
    pub child_run_id: String,
    pub branch_name: String,
    pub hypothesis: Option<String>,
    pub status: BranchStatus,
    pub created_at: DateTime<Utc>,
}

/// A human checkpoint instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub run_id: String,
    pub step_id: Option<String>,
    pub node_id: Option<String>,
    pub approval_type: String,
    pub status: ApprovalStatus,
    pub context: serde_json::Value,
    pub message: String,
    pub options: Vec<String>,
    pub resolution: Option<ApprovalResolution>,
    pub feedback: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    pub fn is_resolved(&self) -> bool {
        self.status != ApprovalStatus::Pending
    }
}

/// Append-only audit record of one status transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateHistory {
    pub id: i64,
    pub entity_type: EntityKind,
    pub entity_id: String,
    pub run_id: String,
    pub from_state: String,
    pub to_state: String,
    pub reason: Option<String>,
    pub actor: String,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Plans
// ---------------------------------------------------------------------------

/// Reference to another plan step inside `depends_on`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepRef {
    /// Zero-based plan position.
    Index(usize),
    /// `step_<i>`, `planning`, or a plain position string.
    Label(String),
}

impl fmt::Display for StepRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepRef::Index(i) => write!(f, "step_{}", i),
            StepRef::Label(s) => f.write_str(s),
        }
    }
}

/// One entry of an ordered plan handed to the DAG builder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub task: String,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub depends_on: Option<Vec<StepRef>>,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub parallel_group: Option<String>,
    #[serde(default)]
    pub approval_required: bool,
    #[serde(default, alias = "retry_config")]
    pub retry: Option<RetryPolicy>,
}

impl PlanStep {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            ..Default::default()
        }
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.parallel_group = Some(group.into());
        self
    }

    pub fn depends_on(mut self, deps: Vec<StepRef>) -> Self {
        self.depends_on = Some(deps);
        self
    }

    pub fn requires_approval(mut self) -> Self {
        self.approval_required = true;
        self
    }

    pub fn with_retry(mut self, max_attempts: u32) -> Self {
        self.retry = Some(RetryPolicy {
            max_attempts,
            max_backoff_secs: None,
        });
        self
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Input handed to the external node executor.
#[derive(Debug, Clone)]
pub struct NodeRequest {
    pub run_id: String,
    pub node_id: String,
    pub step_id: Option<String>,
    pub agent: Option<String>,
    pub task: String,
    pub attempt: u32,
    /// Isolated working directory when the enhanced executor is enabled.
    pub working_dir: Option<PathBuf>,
    /// Rendered retry brief for attempts after the first.
    pub retry_brief: Option<String>,
    pub context: ContextSnapshot,
}

/// A status transition about to happen, or just committed.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionEvent {
    pub entity_type: EntityKind,
    pub entity_id: String,
    pub run_id: String,
    pub from: String,
    pub to: String,
    pub reason: Option<String>,
    pub actor: String,
    /// Entity as loaded before the transition.
    pub entity: serde_json::Value,
}
