//! Mocks and fixtures shared by the Strata crates' tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use strata_core::error::{Result, StrataError};
use strata_core::traits::{ApprovalNotifier, LevelPlanner, NodeExecutor, TransitionListener};
use strata_core::types::{ApprovalRequest, Node, NodeRequest, PlanStep, TransitionEvent};
use strata_store::WorkflowStore;

/// A plan of `n` sequential steps named `task 1` .. `task n`.
pub fn linear_plan(n: usize) -> Vec<PlanStep> {
    (1..=n).map(|i| PlanStep::new(format!("task {}", i))).collect()
}

/// An on-disk store in a fresh temporary directory.
pub fn temp_store() -> (tempfile::TempDir, Arc<WorkflowStore>) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let store = WorkflowStore::open(&dir.path().join("strata.db")).expect("open store");
    (dir, Arc::new(store))
}

/// Node executor whose behaviour is scripted per task name.
///
/// Unscripted tasks succeed with `{"task": <task>}`.
#[derive(Default)]
pub struct ScriptedExecutor {
    failures: HashMap<String, (Option<u32>, String)>,
    responses: HashMap<String, serde_json::Value>,
    delays: HashMap<String, Duration>,
    write_files: bool,
    state: Mutex<ScriptState>,
}

#[derive(Default)]
struct ScriptState {
    calls: Vec<NodeRequest>,
    failed: HashMap<String, u32>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always fail `task` with `message`.
    pub fn fail_task(mut self, task: &str, message: &str) -> Self {
        self.failures
            .insert(task.to_string(), (None, message.to_string()));
        self
    }

    /// Fail `task` for the first `times` calls, then succeed.
    pub fn fail_times(mut self, task: &str, times: u32, message: &str) -> Self {
        self.failures
            .insert(task.to_string(), (Some(times), message.to_string()));
        self
    }

    pub fn respond(mut self, task: &str, value: serde_json::Value) -> Self {
        self.responses.insert(task.to_string(), value);
        self
    }

    pub fn delay_task(mut self, task: &str, delay: Duration) -> Self {
        self.delays.insert(task.to_string(), delay);
        self
    }

    /// Write `<task>.txt` into the request's working directory.
    pub fn write_files(mut self, enabled: bool) -> Self {
        self.write_files = enabled;
        self
    }

    /// Every request received so far, in call order.
    pub fn calls(&self) -> Vec<NodeRequest> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Decide the outcome of a call and record it.
    fn script(&self, request: &NodeRequest) -> std::result::Result<serde_json::Value, String> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(request.clone());

        if let Some((limit, message)) = self.failures.get(&request.task) {
            let failed = state.failed.entry(request.task.clone()).or_default();
            if limit.map_or(true, |n| *failed < n) {
                *failed += 1;
                return Err(message.clone());
            }
        }
        Ok(self
            .responses
            .get(&request.task)
            .cloned()
            .unwrap_or_else(|| serde_json::json!({ "task": request.task })))
    }
}

impl NodeExecutor for ScriptedExecutor {
    fn execute(&self, request: NodeRequest) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move {
            if let Some(delay) = self.delays.get(&request.task) {
                tokio::time::sleep(*delay).await;
            }
            if self.write_files {
                if let Some(dir) = &request.working_dir {
                    write_marker(dir, &request.task)?;
                }
            }
            self.script(&request)
                .map_err(|message| StrataError::execution(request.node_id.clone(), message))
        })
    }
}

fn write_marker(dir: &Path, task: &str) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    std::fs::write(dir.join(format!("{}.txt", task)), task)?;
    Ok(())
}

/// Notifier that keeps every request it was told about.
#[derive(Default)]
pub struct RecordingNotifier {
    requests: Mutex<Vec<ApprovalRequest>>,
}

impl RecordingNotifier {
    pub fn requests(&self) -> Vec<ApprovalRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl ApprovalNotifier for RecordingNotifier {
    fn notify(&self, request: &ApprovalRequest) {
        self.requests.lock().unwrap().push(request.clone());
    }
}

/// Transition listener that records events, or fails on both hooks.
#[derive(Default)]
pub struct RecordingListener {
    fail: bool,
    before: Mutex<usize>,
    events: Mutex<Vec<TransitionEvent>>,
}

impl RecordingListener {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Events seen by `after_transition`.
    pub fn events(&self) -> Vec<TransitionEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn before_count(&self) -> usize {
        *self.before.lock().unwrap()
    }
}

impl TransitionListener for RecordingListener {
    fn before_transition(&self, _event: &TransitionEvent) -> Result<()> {
        if self.fail {
            return Err(StrataError::Config("listener failure".into()));
        }
        *self.before.lock().unwrap() += 1;
        Ok(())
    }

    fn after_transition(&self, event: &TransitionEvent) -> Result<()> {
        if self.fail {
            return Err(StrataError::Config("listener failure".into()));
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Level planner that returns the same groups for every level.
pub struct StaticPlanner {
    groups: Vec<Vec<String>>,
}

impl StaticPlanner {
    pub fn new(groups: Vec<Vec<String>>) -> Self {
        Self { groups }
    }
}

impl LevelPlanner for StaticPlanner {
    fn plan_level<'a>(
        &'a self,
        _run_id: &'a str,
        _level: &'a [Node],
    ) -> BoxFuture<'a, Result<Vec<Vec<String>>>> {
        Box::pin(async move { Ok(self.groups.clone()) })
    }
}
