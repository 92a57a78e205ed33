//! Human-in-the-loop approval gate.
//!
//! Requests are durable rows in the store. Waiters in this process are woken
//! through a per-request watch channel; a waiter in a fresh process falls
//! back to the stored record.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use strata_core::config::ApprovalConfig;
use strata_core::error::{Result, StrataError, ValidationError};
use strata_core::event::{EventBus, WorkflowEvent};
use strata_core::traits::ApprovalNotifier;
use strata_core::types::*;
use strata_store::WorkflowStore;

use crate::state_machine::Machines;

type Waiter = watch::Sender<Option<ApprovalRequest>>;

/// Two-tier approval registry: in-process watch channels over the durable
/// request table.
pub struct ApprovalRegistry {
    store: Arc<WorkflowStore>,
    waiters: Mutex<HashMap<String, Waiter>>,
}

impl ApprovalRegistry {
    pub fn new(store: Arc<WorkflowStore>) -> Self {
        Self {
            store,
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Register a local waiter for a request, or join an existing one.
    pub fn register(&self, request_id: &str) -> watch::Receiver<Option<ApprovalRequest>> {
        match self.waiters.lock() {
            Ok(mut waiters) => waiters
                .entry(request_id.to_string())
                .or_insert_with(|| watch::channel(None).0)
                .subscribe(),
            Err(e) => {
                warn!(request_id, error = %e, "Approval registry poisoned");
                watch::channel(None).1
            }
        }
    }

    /// Local waiter for a request, if one was registered in this process.
    pub fn subscribe(&self, request_id: &str) -> Option<watch::Receiver<Option<ApprovalRequest>>> {
        self.waiters
            .lock()
            .ok()
            .and_then(|w| w.get(request_id).map(watch::Sender::subscribe))
    }

    /// Ids of requests with a local waiter.
    pub fn waiting_ids(&self) -> Vec<String> {
        self.waiters
            .lock()
            .map(|w| w.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Durable record of a request.
    pub fn load(&self, request_id: &str) -> Result<ApprovalRequest> {
        self.store
            .get_approval(request_id)?
            .ok_or_else(|| StrataError::not_found("approval_request", request_id))
    }

    /// Drop the local waiter of a request nobody is listening to anymore.
    /// The durable record is untouched.
    pub fn release(&self, request_id: &str) -> bool {
        match self.waiters.lock() {
            Ok(mut waiters) => {
                let idle = waiters
                    .get(request_id)
                    .is_some_and(|tx| tx.receiver_count() == 0);
                if idle {
                    waiters.remove(request_id);
                }
                idle
            }
            Err(_) => false,
        }
    }

    /// Wake the local waiter (if any) with the final request and drop it.
    pub fn complete(&self, request: &ApprovalRequest) -> bool {
        let waiter = self
            .waiters
            .lock()
            .ok()
            .and_then(|mut w| w.remove(&request.id));
        match waiter {
            Some(tx) => {
                let _ = tx.send(Some(request.clone()));
                true
            }
            None => false,
        }
    }

    /// Resolve a pending request in the durable tier. Fails when it was
    /// already resolved. Local waiters are not woken.
    pub fn resolve_from_db(
        &self,
        request_id: &str,
        resolution: ApprovalResolution,
        feedback: Option<&str>,
    ) -> Result<ApprovalRequest> {
        let request = self.load(request_id)?;
        if request.is_resolved() {
            return Err(StrataError::ApprovalAlreadyResolved(request_id.to_string()));
        }
        let resolved = self.store.resolve_approval_record(
            request_id,
            resolution.request_status(),
            resolution,
            feedback,
            Utc::now(),
        )?;
        if !resolved {
            return Err(StrataError::ApprovalAlreadyResolved(request_id.to_string()));
        }
        self.load(request_id)
    }

    /// Mark pending requests past their deadline as expired.
    pub fn expire_stale(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let ids = self.store.expire_pending(now)?;
        self.complete_all(&ids);
        if !ids.is_empty() {
            info!(count = ids.len(), "Expired stale approval requests");
        }
        Ok(ids)
    }

    /// Cancel every pending request of a run.
    pub fn cancel_pending(&self, run_id: &str) -> Result<Vec<String>> {
        let ids = self.store.cancel_pending_approvals(run_id)?;
        self.complete_all(&ids);
        Ok(ids)
    }

    fn complete_all(&self, ids: &[String]) {
        for id in ids {
            match self.load(id) {
                Ok(request) => {
                    self.complete(&request);
                }
                Err(e) => warn!(request_id = %id, error = %e, "Failed to reload approval request"),
            }
        }
    }
}

/// What a new approval request asks for.
#[derive(Debug, Clone)]
pub struct ApprovalDraft {
    pub step_id: Option<String>,
    pub node_id: Option<String>,
    pub approval_type: String,
    pub context: serde_json::Value,
    pub message: String,
    pub options: Vec<String>,
}

impl ApprovalDraft {
    pub fn new(approval_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            step_id: None,
            node_id: None,
            approval_type: approval_type.into(),
            context: serde_json::Value::Null,
            message: message.into(),
            options: Vec::new(),
        }
    }

    pub fn for_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    pub fn for_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    pub fn with_options(mut self, options: Vec<String>) -> Self {
        self.options = options;
        self
    }
}

fn default_options() -> Vec<String> {
    [
        ApprovalResolution::Approved,
        ApprovalResolution::Rejected,
        ApprovalResolution::Modified,
    ]
    .iter()
    .map(|r| r.to_string())
    .collect()
}

/// Suspends runs on human decisions.
pub struct ApprovalGate {
    store: Arc<WorkflowStore>,
    machines: Machines,
    registry: Arc<ApprovalRegistry>,
    events: Arc<EventBus>,
    notifier: Option<Arc<dyn ApprovalNotifier>>,
    config: ApprovalConfig,
    actor: String,
}

impl ApprovalGate {
    pub fn new(
        store: Arc<WorkflowStore>,
        machines: Machines,
        registry: Arc<ApprovalRegistry>,
        events: Arc<EventBus>,
        config: ApprovalConfig,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            store,
            machines,
            registry,
            events,
            notifier: None,
            config,
            actor: actor.into(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ApprovalNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn registry(&self) -> &Arc<ApprovalRegistry> {
        &self.registry
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    /// Persist a pending request and move the run (and step/node) to
    /// `waiting_approval`.
    pub fn create_approval_request(&self, run_id: &str, draft: ApprovalDraft) -> Result<ApprovalRequest> {
        let run = self.store.require_run(run_id)?;
        if !self.machines.runs.can_transition_to(run_id, RunStatus::WaitingApproval)
            && run.status != RunStatus::WaitingApproval
        {
            return Err(StrataError::NotExecutable {
                run_id: run_id.to_string(),
                status: run.status.to_string(),
            });
        }

        let pending = self
            .store
            .list_approvals(Some(run_id), Some(ApprovalStatus::Pending))?;
        if !pending.is_empty() {
            if self.config.enforce_single_pending {
                return Err(ValidationError::PolicyViolation(format!(
                    "run {} already has {} pending approval request(s)",
                    run_id,
                    pending.len()
                ))
                .into());
            }
            warn!(run_id, pending = pending.len(), "Run already has pending approval requests");
        }

        let now = Utc::now();
        let expires_at = chrono::Duration::try_seconds(self.config.timeout_secs as i64)
            .and_then(|d| now.checked_add_signed(d));
        let request = ApprovalRequest {
            id: new_id(),
            run_id: run_id.to_string(),
            step_id: draft.step_id,
            node_id: draft.node_id,
            approval_type: draft.approval_type,
            status: ApprovalStatus::Pending,
            context: draft.context,
            message: draft.message,
            options: if draft.options.is_empty() {
                default_options()
            } else {
                draft.options
            },
            resolution: None,
            feedback: None,
            created_at: now,
            resolved_at: None,
            expires_at,
        };
        self.store.insert_approval(&request)?;
        self.registry.register(&request.id);

        let reason = format!("approval requested: {}", request.approval_type);
        self.machines
            .runs
            .transition_to(run_id, RunStatus::WaitingApproval, Some(&reason), &self.actor)?;
        if let Some(step_id) = &request.step_id {
            self.machines
                .steps
                .transition_to(step_id, StepStatus::WaitingApproval, Some(&reason), &self.actor)?;
        }
        if let Some(node_id) = &request.node_id {
            self.machines
                .nodes
                .transition_to(node_id, NodeStatus::WaitingApproval, Some(&reason), &self.actor)?;
        }

        if let Some(notifier) = &self.notifier {
            notifier.notify(&request);
        }
        self.events.publish(WorkflowEvent::ApprovalRequested {
            request: request.clone(),
        });
        info!(
            run_id,
            request_id = %request.id,
            approval_type = %request.approval_type,
            "Approval requested"
        );
        Ok(request)
    }

    /// Wait for a request to be resolved. The run stays `waiting_approval`
    /// when the wait times out.
    pub async fn wait_for_approval(
        &self,
        request_id: &str,
        timeout: Option<Duration>,
    ) -> Result<ApprovalRequest> {
        let timeout = timeout.unwrap_or_else(|| self.default_timeout());
        let mut rx = match self.registry.subscribe(request_id) {
            Some(rx) => rx,
            None => {
                let request = self.registry.load(request_id)?;
                if request.is_resolved() {
                    return Ok(request);
                }
                debug!(request_id, "No local waiter, registering one");
                self.registry.register(request_id)
            }
        };

        let wait = async {
            loop {
                if let Some(request) = rx.borrow_and_update().clone() {
                    return Ok(request);
                }
                if rx.changed().await.is_err() {
                    // Waiter dropped without a value; trust the durable record.
                    return self.registry.load(request_id);
                }
            }
        };

        let outcome = tokio::time::timeout(timeout, wait).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                drop(rx);
                self.registry.release(request_id);
                warn!(request_id, timeout_secs = timeout.as_secs(), "Approval wait timed out");
                Err(StrataError::ApprovalTimeout {
                    request_id: request_id.to_string(),
                    timeout_secs: timeout.as_secs(),
                })
            }
        }
    }

    /// Record a decision, move the run/step/node accordingly and wake the
    /// local waiter.
    pub fn resolve_approval(
        &self,
        request_id: &str,
        resolution: ApprovalResolution,
        feedback: Option<&str>,
    ) -> Result<ApprovalRequest> {
        let request = self.resolve_from_db(request_id, resolution, feedback)?;
        self.registry.complete(&request);
        Ok(request)
    }

    /// Durable resolution without touching local waiters, for processes
    /// that did not create the request.
    pub fn resolve_from_db(
        &self,
        request_id: &str,
        resolution: ApprovalResolution,
        feedback: Option<&str>,
    ) -> Result<ApprovalRequest> {
        let request = self.registry.resolve_from_db(request_id, resolution, feedback)?;
        let reason = format!("approval {}", resolution);

        if resolution.lets_run_continue() {
            let run = self.store.require_run(&request.run_id)?;
            if run.status == RunStatus::WaitingApproval {
                self.machines.runs.transition_to(
                    &request.run_id,
                    RunStatus::Executing,
                    Some(&reason),
                    &self.actor,
                )?;
            }
            let target = if resolution == ApprovalResolution::Skip {
                StepStatus::Skipped
            } else {
                StepStatus::Running
            };
            self.move_waiting(&request, target, &reason)?;
        } else {
            self.machines.runs.transition_to(
                &request.run_id,
                RunStatus::Cancelled,
                Some(&reason),
                &self.actor,
            )?;
            self.move_waiting(&request, StepStatus::Cancelled, &reason)?;
        }

        self.events.publish(WorkflowEvent::ApprovalResolved {
            request_id: request.id.clone(),
            run_id: request.run_id.clone(),
            resolution,
        });
        info!(
            run_id = %request.run_id,
            request_id,
            resolution = %resolution,
            "Approval resolved"
        );
        Ok(request)
    }

    pub fn expire_stale(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        self.registry.expire_stale(now)
    }

    pub fn cancel_pending(&self, run_id: &str) -> Result<Vec<String>> {
        self.registry.cancel_pending(run_id)
    }

    pub fn list_pending(&self, run_id: Option<&str>) -> Result<Vec<ApprovalRequest>> {
        self.store.list_approvals(run_id, Some(ApprovalStatus::Pending))
    }

    fn move_waiting(&self, request: &ApprovalRequest, to: StepStatus, reason: &str) -> Result<()> {
        if let Some(step_id) = &request.step_id {
            if self.store.require_step(step_id)?.status == StepStatus::WaitingApproval {
                self.machines.steps.transition_to(step_id, to, Some(reason), &self.actor)?;
            }
        }
        if let Some(node_id) = &request.node_id {
            if self.store.require_node(node_id)?.status == NodeStatus::WaitingApproval {
                self.machines.nodes.transition_to(node_id, to, Some(reason), &self.actor)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_test_utils::RecordingNotifier;

    struct Fixture {
        store: Arc<WorkflowStore>,
        machines: Machines,
        gate: Arc<ApprovalGate>,
        notifier: Arc<RecordingNotifier>,
        run: Run,
        step: Step,
    }

    fn fixture(config: ApprovalConfig) -> Fixture {
        let store = Arc::new(WorkflowStore::in_memory().unwrap());
        let machines = Machines::new(store.clone());
        let registry = Arc::new(ApprovalRegistry::new(store.clone()));
        let notifier = Arc::new(RecordingNotifier::default());
        let gate = ApprovalGate::new(
            store.clone(),
            machines.clone(),
            registry,
            Arc::new(EventBus::default()),
            config,
            "tester",
        )
        .with_notifier(notifier.clone());

        let run = Run::new("sess", "deploy");
        store.insert_run(&run).unwrap();
        store
            .insert_dag(&[Node::new(&run.id, NodeType::Planning, 0)], &[])
            .unwrap();
        machines.runs.transition_to(&run.id, RunStatus::Planning, None, "t").unwrap();
        machines.runs.transition_to(&run.id, RunStatus::Executing, None, "t").unwrap();
        let step = Step::new(&run, 1, "deploy to prod");
        store.insert_step(&step).unwrap();
        machines.steps.transition_to(&step.id, StepStatus::Running, None, "t").unwrap();

        Fixture {
            store,
            machines,
            gate: Arc::new(gate),
            notifier,
            run,
            step,
        }
    }

    fn draft(f: &Fixture) -> ApprovalDraft {
        ApprovalDraft::new("deploy", "Ship to production?")
            .for_step(&f.step.id)
            .with_context(serde_json::json!({"env": "prod"}))
    }

    #[tokio::test]
    async fn test_approval_round_trip() {
        let f = fixture(ApprovalConfig::default());
        let request = f.gate.create_approval_request(&f.run.id, draft(&f)).unwrap();
        assert_eq!(request.status, ApprovalStatus::Pending);
        assert!(request.expires_at.is_some());
        assert_eq!(request.options.len(), 3);
        assert_eq!(f.store.require_run(&f.run.id).unwrap().status, RunStatus::WaitingApproval);
        assert_eq!(f.store.require_step(&f.step.id).unwrap().status, StepStatus::WaitingApproval);
        assert_eq!(f.notifier.requests().len(), 1);

        let gate = f.gate.clone();
        let id = request.id.clone();
        let waiter = tokio::spawn(async move {
            gate.wait_for_approval(&id, Some(Duration::from_secs(5))).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        f.gate
            .resolve_approval(&request.id, ApprovalResolution::Approved, Some("looks good"))
            .unwrap();
        let resolved = waiter.await.unwrap().unwrap();
        assert_eq!(resolved.status, ApprovalStatus::Approved);
        assert_eq!(resolved.feedback.as_deref(), Some("looks good"));

        assert_eq!(f.store.require_run(&f.run.id).unwrap().status, RunStatus::Executing);
        assert_eq!(f.store.require_step(&f.step.id).unwrap().status, StepStatus::Running);

        let err = f
            .gate
            .resolve_approval(&request.id, ApprovalResolution::Rejected, None)
            .unwrap_err();
        assert!(matches!(err, StrataError::ApprovalAlreadyResolved(_)));
    }

    #[tokio::test]
    async fn test_wait_times_out_and_run_stays_waiting() {
        let f = fixture(ApprovalConfig::default());
        let request = f.gate.create_approval_request(&f.run.id, draft(&f)).unwrap();

        let err = f
            .gate
            .wait_for_approval(&request.id, Some(Duration::from_millis(30)))
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::ApprovalTimeout { .. }));
        assert_eq!(f.store.require_run(&f.run.id).unwrap().status, RunStatus::WaitingApproval);
        assert!(!f.gate.registry().waiting_ids().contains(&request.id));

        // Still resolvable afterwards; a later wait reads the durable record.
        f.gate
            .resolve_approval(&request.id, ApprovalResolution::Approved, None)
            .unwrap();
        let resolved = f
            .gate
            .wait_for_approval(&request.id, Some(Duration::from_millis(30)))
            .await
            .unwrap();
        assert_eq!(resolved.status, ApprovalStatus::Approved);
    }

    #[tokio::test]
    async fn test_timeout_keeps_waiter_other_tasks_still_hold() {
        let f = fixture(ApprovalConfig::default());
        let request = f.gate.create_approval_request(&f.run.id, draft(&f)).unwrap();
        let _listener = f.gate.registry().subscribe(&request.id).unwrap();

        f.gate
            .wait_for_approval(&request.id, Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(f.gate.registry().waiting_ids().contains(&request.id));
    }

    #[tokio::test]
    async fn test_wait_without_local_waiter_reads_durable_record() {
        let f = fixture(ApprovalConfig::default());
        let request = f.gate.create_approval_request(&f.run.id, draft(&f)).unwrap();

        // A second registry models another process that never saw the request.
        let other_registry = Arc::new(ApprovalRegistry::new(f.store.clone()));
        let other = ApprovalGate::new(
            f.store.clone(),
            f.machines.clone(),
            other_registry,
            Arc::new(EventBus::default()),
            ApprovalConfig::default(),
            "cli",
        );
        other
            .resolve_from_db(&request.id, ApprovalResolution::Modified, Some("use canary"))
            .unwrap();

        let resolved = other
            .wait_for_approval(&request.id, Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert_eq!(resolved.status, ApprovalStatus::Modified);
        assert_eq!(f.store.require_run(&f.run.id).unwrap().status, RunStatus::Executing);
    }

    #[test]
    fn test_reject_cancels_run() {
        let f = fixture(ApprovalConfig::default());
        let request = f.gate.create_approval_request(&f.run.id, draft(&f)).unwrap();
        f.gate
            .resolve_approval(&request.id, ApprovalResolution::Rejected, None)
            .unwrap();
        assert_eq!(f.store.require_run(&f.run.id).unwrap().status, RunStatus::Cancelled);
        assert_eq!(f.store.require_step(&f.step.id).unwrap().status, StepStatus::Cancelled);
    }

    #[test]
    fn test_skip_resolution_skips_step() {
        let f = fixture(ApprovalConfig::default());
        let request = f.gate.create_approval_request(&f.run.id, draft(&f)).unwrap();
        let resolved = f
            .gate
            .resolve_approval(&request.id, ApprovalResolution::Skip, None)
            .unwrap();
        assert_eq!(resolved.status, ApprovalStatus::Approved);
        assert_eq!(f.store.require_run(&f.run.id).unwrap().status, RunStatus::Executing);
        assert_eq!(f.store.require_step(&f.step.id).unwrap().status, StepStatus::Skipped);
    }

    #[test]
    fn test_single_pending_policy() {
        let f = fixture(ApprovalConfig {
            enforce_single_pending: true,
            ..Default::default()
        });
        f.gate
            .create_approval_request(&f.run.id, ApprovalDraft::new("review", "first"))
            .unwrap();
        let err = f
            .gate
            .create_approval_request(&f.run.id, ApprovalDraft::new("review", "second"))
            .unwrap_err();
        assert!(matches!(
            err,
            StrataError::Validation(ValidationError::PolicyViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_expire_stale_wakes_waiter() {
        let f = fixture(ApprovalConfig::default());
        let request = f.gate.create_approval_request(&f.run.id, draft(&f)).unwrap();

        let gate = f.gate.clone();
        let id = request.id.clone();
        let waiter = tokio::spawn(async move {
            gate.wait_for_approval(&id, Some(Duration::from_secs(5))).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let later = Utc::now() + chrono::Duration::hours(2);
        let expired = f.gate.expire_stale(later).unwrap();
        assert_eq!(expired, vec![request.id.clone()]);

        let result = waiter.await.unwrap().unwrap();
        assert_eq!(result.status, ApprovalStatus::Expired);
        assert!(f.gate.list_pending(Some(&f.run.id)).unwrap().is_empty());
    }

    #[test]
    fn test_request_refused_when_run_not_executing() {
        let f = fixture(ApprovalConfig::default());
        f.machines.runs.transition_to(&f.run.id, RunStatus::Paused, None, "t").unwrap();
        let err = f
            .gate
            .create_approval_request(&f.run.id, ApprovalDraft::new("review", "x"))
            .unwrap_err();
        assert!(matches!(err, StrataError::NotExecutable { .. }));
        assert!(f.gate.list_pending(None).unwrap().is_empty());
    }
}
