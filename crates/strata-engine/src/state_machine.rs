//! Guarded, audited status transitions for runs, steps and nodes.
//!
//! Each entity kind gets a [`TransitionTable`] of allowed moves plus optional
//! guard predicates. Every successful transition is a compare-and-set status
//! update and one `state_history` row, written in a single store transaction.

use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tracing::{debug, warn};

use strata_core::error::{Result, StateMachineError};
use strata_core::traits::TransitionListener;
use strata_core::types::*;
use strata_store::{TransitionRecord, WorkflowStore};

use crate::dag::Scheduler;

/// An entity whose status is driven by a [`StateMachine`].
pub trait MachineEntity: Clone + Serialize + Send + Sync + 'static {
    type State: Copy + Eq + Hash + Display + FromStr + Send + Sync + 'static;

    const KIND: EntityKind;

    fn load(store: &WorkflowStore, id: &str) -> Result<Option<Self>>;
    fn id(&self) -> &str;
    fn run_id(&self) -> &str;
    fn state(&self) -> Self::State;

    /// Entering this state stamps `started_at` (first time only).
    fn marks_start(state: Self::State) -> bool;
    /// Entering this state stamps `completed_at`.
    fn marks_end(state: Self::State) -> bool;
    /// Resetting into this state clears both timestamps.
    fn is_initial(state: Self::State) -> bool;
}

impl MachineEntity for Run {
    type State = RunStatus;
    const KIND: EntityKind = EntityKind::Run;

    fn load(store: &WorkflowStore, id: &str) -> Result<Option<Self>> {
        store.get_run(id)
    }
    fn id(&self) -> &str {
        &self.id
    }
    fn run_id(&self) -> &str {
        &self.id
    }
    fn state(&self) -> RunStatus {
        self.status
    }
    fn marks_start(state: RunStatus) -> bool {
        state == RunStatus::Executing
    }
    fn marks_end(state: RunStatus) -> bool {
        state.is_terminal()
    }
    fn is_initial(state: RunStatus) -> bool {
        state == RunStatus::Draft
    }
}

impl MachineEntity for Step {
    type State = StepStatus;
    const KIND: EntityKind = EntityKind::Step;

    fn load(store: &WorkflowStore, id: &str) -> Result<Option<Self>> {
        store.get_step(id)
    }
    fn id(&self) -> &str {
        &self.id
    }
    fn run_id(&self) -> &str {
        &self.run_id
    }
    fn state(&self) -> StepStatus {
        self.status
    }
    fn marks_start(state: StepStatus) -> bool {
        state == StepStatus::Running
    }
    fn marks_end(state: StepStatus) -> bool {
        state.is_terminal() || state == StepStatus::Failed
    }
    fn is_initial(state: StepStatus) -> bool {
        state == StepStatus::Pending
    }
}

impl MachineEntity for Node {
    type State = NodeStatus;
    const KIND: EntityKind = EntityKind::Node;

    fn load(store: &WorkflowStore, id: &str) -> Result<Option<Self>> {
        store.get_node(id)
    }
    fn id(&self) -> &str {
        &self.id
    }
    fn run_id(&self) -> &str {
        &self.run_id
    }
    fn state(&self) -> NodeStatus {
        self.status
    }
    fn marks_start(state: NodeStatus) -> bool {
        state == NodeStatus::Running
    }
    fn marks_end(state: NodeStatus) -> bool {
        state.is_terminal() || state == NodeStatus::Failed
    }
    fn is_initial(state: NodeStatus) -> bool {
        state == NodeStatus::Pending
    }
}

/// What a guard can consult besides the entity itself.
pub struct GuardContext<'a> {
    pub store: &'a WorkflowStore,
}

type GuardFn<E> =
    dyn Fn(&E, &GuardContext<'_>) -> std::result::Result<(), String> + Send + Sync;

/// A named predicate that must hold for one transition.
pub struct Guard<E> {
    pub description: &'static str,
    check: Arc<GuardFn<E>>,
}

impl<E> Clone for Guard<E> {
    fn clone(&self) -> Self {
        Self {
            description: self.description,
            check: self.check.clone(),
        }
    }
}

/// Allowed next states and guards, keyed by current state.
pub struct TransitionTable<E: MachineEntity> {
    allowed: HashMap<E::State, Vec<E::State>>,
    guards: HashMap<(E::State, E::State), Guard<E>>,
}

impl<E: MachineEntity> TransitionTable<E> {
    pub fn new() -> Self {
        Self {
            allowed: HashMap::new(),
            guards: HashMap::new(),
        }
    }

    pub fn allow(mut self, from: E::State, to: &[E::State]) -> Self {
        self.allowed.entry(from).or_default().extend_from_slice(to);
        self
    }

    pub fn guard<F>(mut self, from: E::State, to: E::State, description: &'static str, check: F) -> Self
    where
        F: Fn(&E, &GuardContext<'_>) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.guards.insert(
            (from, to),
            Guard {
                description,
                check: Arc::new(check),
            },
        );
        self
    }

    pub fn allowed(&self, from: E::State) -> &[E::State] {
        self.allowed.get(&from).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_allowed(&self, from: E::State, to: E::State) -> bool {
        self.allowed(from).contains(&to)
    }

    pub fn guard_for(&self, from: E::State, to: E::State) -> Option<&Guard<E>> {
        self.guards.get(&(from, to))
    }
}

impl<E: MachineEntity> Default for TransitionTable<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Run lifecycle table with its guards.
pub fn run_table() -> TransitionTable<Run> {
    use RunStatus::*;
    TransitionTable::<Run>::new()
        .allow(Draft, &[Planning, Cancelled])
        .allow(Planning, &[Executing, Failed, Cancelled])
        .allow(Executing, &[Paused, WaitingApproval, Completed, Failed, Cancelled])
        .allow(Paused, &[Executing, Cancelled])
        .allow(WaitingApproval, &[Executing, Cancelled])
        .guard(Draft, Planning, "task description is present", |run, _| {
            if run.task_description.trim().is_empty() {
                Err("task description is empty".to_string())
            } else {
                Ok(())
            }
        })
        .guard(Planning, Executing, "execution plan is valid", |run, ctx| {
            let nodes = ctx.store.list_nodes(&run.id).map_err(|e| e.to_string())?;
            if nodes.is_empty() {
                return Err("run has no execution plan".to_string());
            }
            let edges = ctx.store.list_edges(&run.id).map_err(|e| e.to_string())?;
            Scheduler::new(nodes, &edges)
                .and_then(|s| s.validate())
                .map_err(|e| e.to_string())
        })
        .guard(WaitingApproval, Executing, "approval was granted", |run, ctx| {
            let latest = ctx
                .store
                .latest_resolved_approval(&run.id)
                .map_err(|e| e.to_string())?;
            match latest.map(|r| r.status) {
                Some(ApprovalStatus::Approved) | Some(ApprovalStatus::Modified) => Ok(()),
                Some(other) => Err(format!("latest approval request is {}", other)),
                None => Err("no approval has been recorded".to_string()),
            }
        })
}

/// Step lifecycle table. Nodes share it.
pub fn step_table<E: MachineEntity<State = StepStatus>>() -> TransitionTable<E> {
    use StepStatus::*;
    TransitionTable::<E>::new()
        .allow(Pending, &[Running, Skipped, Cancelled])
        .allow(Running, &[Paused, WaitingApproval, Completed, Failed, Cancelled])
        .allow(Paused, &[Running, Cancelled])
        .allow(WaitingApproval, &[Running, Skipped, Cancelled])
        .allow(Failed, &[Running])
}

/// Listener set shared by every machine of one engine.
#[derive(Clone, Default)]
pub struct Listeners {
    inner: Arc<RwLock<Vec<Arc<dyn TransitionListener>>>>,
}

impl Listeners {
    pub fn add(&self, listener: Arc<dyn TransitionListener>) {
        match self.inner.write() {
            Ok(mut list) => list.push(listener),
            Err(e) => warn!(error = %e, "Listener registry poisoned, listener dropped"),
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn TransitionListener>> {
        self.inner.read().map(|l| l.clone()).unwrap_or_default()
    }

    fn fire_before(&self, event: &TransitionEvent) {
        for listener in self.snapshot() {
            if let Err(e) = listener.before_transition(event) {
                warn!(entity_id = %event.entity_id, error = %e, "before_transition listener failed");
            }
        }
    }

    fn fire_after(&self, event: &TransitionEvent) {
        for listener in self.snapshot() {
            if let Err(e) = listener.after_transition(event) {
                warn!(entity_id = %event.entity_id, error = %e, "after_transition listener failed");
            }
        }
    }
}

/// Drives one entity kind through its transition table.
pub struct StateMachine<E: MachineEntity> {
    store: Arc<WorkflowStore>,
    table: Arc<TransitionTable<E>>,
    listeners: Listeners,
}

impl<E: MachineEntity> Clone for StateMachine<E> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            table: self.table.clone(),
            listeners: self.listeners.clone(),
        }
    }
}

impl<E: MachineEntity> StateMachine<E> {
    pub fn new(store: Arc<WorkflowStore>, table: TransitionTable<E>, listeners: Listeners) -> Self {
        Self {
            store,
            table: Arc::new(table),
            listeners,
        }
    }

    fn load(&self, id: &str) -> Result<E> {
        E::load(&self.store, id)?.ok_or_else(|| {
            StateMachineError::NotFound {
                entity: E::KIND.to_string(),
                id: id.to_string(),
            }
            .into()
        })
    }

    fn check_guard(&self, entity: &E, to: E::State) -> std::result::Result<(), StateMachineError> {
        let from = entity.state();
        if let Some(guard) = self.table.guard_for(from, to) {
            let ctx = GuardContext { store: &self.store };
            if let Err(reason) = (guard.check)(entity, &ctx) {
                return Err(StateMachineError::GuardFailed {
                    entity: E::KIND.to_string(),
                    id: entity.id().to_string(),
                    from: from.to_string(),
                    to: to.to_string(),
                    reason: format!("{}: {}", guard.description, reason),
                });
            }
        }
        Ok(())
    }

    /// Move an entity to `to`. Returns `None` when it is already there.
    pub fn transition_to(
        &self,
        id: &str,
        to: E::State,
        reason: Option<&str>,
        actor: &str,
    ) -> Result<Option<StateHistory>> {
        let entity = self.load(id)?;
        let from = entity.state();
        if from == to {
            return Ok(None);
        }
        if !self.table.is_allowed(from, to) {
            return Err(StateMachineError::IllegalTransition {
                entity: E::KIND.to_string(),
                id: id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            }
            .into());
        }
        self.check_guard(&entity, to)?;
        self.commit(&entity, to, reason, actor, false).map(Some)
    }

    /// Administrative override: set the status regardless of the table,
    /// still atomically audited and observed by listeners.
    pub fn reset(
        &self,
        id: &str,
        to: E::State,
        reason: Option<&str>,
        actor: &str,
    ) -> Result<Option<StateHistory>> {
        let entity = self.load(id)?;
        if entity.state() == to {
            return Ok(None);
        }
        self.commit(&entity, to, reason, actor, true).map(Some)
    }

    fn commit(
        &self,
        entity: &E,
        to: E::State,
        reason: Option<&str>,
        actor: &str,
        is_reset: bool,
    ) -> Result<StateHistory> {
        let from = entity.state();
        let event = TransitionEvent {
            entity_type: E::KIND,
            entity_id: entity.id().to_string(),
            run_id: entity.run_id().to_string(),
            from: from.to_string(),
            to: to.to_string(),
            reason: reason.map(str::to_string),
            actor: actor.to_string(),
            entity: serde_json::to_value(entity).unwrap_or(serde_json::Value::Null),
        };
        self.listeners.fire_before(&event);

        let record = TransitionRecord {
            entity_type: E::KIND,
            entity_id: event.entity_id.clone(),
            run_id: event.run_id.clone(),
            from: event.from.clone(),
            to: event.to.clone(),
            reason: event.reason.clone(),
            actor: event.actor.clone(),
            marks_start: E::marks_start(to),
            marks_end: E::marks_end(to),
            clears_times: is_reset && E::is_initial(to),
        };
        let history = self.store.apply_transition(&record)?;
        debug!(
            entity = %E::KIND,
            entity_id = %event.entity_id,
            from = %event.from,
            to = %event.to,
            reset = is_reset,
            "State transition"
        );

        self.listeners.fire_after(&event);
        Ok(history)
    }

    /// Next states the table allows from the entity's current state.
    pub fn get_allowed_transitions(&self, id: &str) -> Result<Vec<E::State>> {
        let entity = self.load(id)?;
        Ok(self.table.allowed(entity.state()).to_vec())
    }

    /// Non-throwing probe: table and guard both pass.
    pub fn can_transition_to(&self, id: &str, to: E::State) -> bool {
        let Ok(entity) = self.load(id) else {
            return false;
        };
        self.table.is_allowed(entity.state(), to) && self.check_guard(&entity, to).is_ok()
    }

    pub fn get_state_history(&self, id: &str) -> Result<Vec<StateHistory>> {
        self.store.list_history(E::KIND, id)
    }
}

/// The run, step and node machines of one engine, sharing one listener set.
#[derive(Clone)]
pub struct Machines {
    pub runs: StateMachine<Run>,
    pub steps: StateMachine<Step>,
    pub nodes: StateMachine<Node>,
    listeners: Listeners,
}

impl Machines {
    pub fn new(store: Arc<WorkflowStore>) -> Self {
        let listeners = Listeners::default();
        Self {
            runs: StateMachine::new(store.clone(), run_table(), listeners.clone()),
            steps: StateMachine::new(store.clone(), step_table(), listeners.clone()),
            nodes: StateMachine::new(store, step_table(), listeners.clone()),
            listeners,
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn TransitionListener>) {
        self.listeners.add(listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::error::StrataError;
    use strata_test_utils::RecordingListener;

    fn setup(task: &str) -> (Arc<WorkflowStore>, Machines, Run) {
        let store = Arc::new(WorkflowStore::in_memory().unwrap());
        let machines = Machines::new(store.clone());
        let run = Run::new("sess", task);
        store.insert_run(&run).unwrap();
        (store, machines, run)
    }

    #[test]
    fn test_skipping_planning_is_illegal() {
        let (_store, m, run) = setup("write a report");
        let err = m
            .runs
            .transition_to(&run.id, RunStatus::Executing, None, "tester")
            .unwrap_err();
        assert!(matches!(
            err,
            StrataError::StateMachine(StateMachineError::IllegalTransition { .. })
        ));

        let h = m
            .runs
            .transition_to(&run.id, RunStatus::Planning, Some("plan it"), "tester")
            .unwrap()
            .unwrap();
        assert_eq!(h.from_state, "draft");
        assert_eq!(h.to_state, "planning");
        assert_eq!(h.actor, "tester");
        assert_eq!(m.runs.get_state_history(&run.id).unwrap().len(), 1);
    }

    #[test]
    fn test_same_state_is_noop() {
        let (_store, m, run) = setup("task");
        let result = m
            .runs
            .transition_to(&run.id, RunStatus::Draft, None, "tester")
            .unwrap();
        assert!(result.is_none());
        assert!(m.runs.get_state_history(&run.id).unwrap().is_empty());
    }

    #[test]
    fn test_empty_task_guard() {
        let (_store, m, run) = setup("   ");
        let err = m
            .runs
            .transition_to(&run.id, RunStatus::Planning, None, "tester")
            .unwrap_err();
        assert!(matches!(
            err,
            StrataError::StateMachine(StateMachineError::GuardFailed { .. })
        ));
        assert!(!m.runs.can_transition_to(&run.id, RunStatus::Planning));
        assert!(m.runs.can_transition_to(&run.id, RunStatus::Cancelled));
    }

    #[test]
    fn test_planning_requires_nodes() {
        let (_store, m, run) = setup("task");
        m.runs.transition_to(&run.id, RunStatus::Planning, None, "t").unwrap();
        let err = m
            .runs
            .transition_to(&run.id, RunStatus::Executing, None, "t")
            .unwrap_err();
        assert!(err.to_string().contains("no execution plan"));
    }

    #[test]
    fn test_waiting_approval_requires_grant() {
        let (store, m, run) = setup("task");
        let node = Node::new(&run.id, NodeType::Planning, 0);
        store.insert_dag(&[node], &[]).unwrap();
        m.runs.transition_to(&run.id, RunStatus::Planning, None, "t").unwrap();
        m.runs.transition_to(&run.id, RunStatus::Executing, None, "t").unwrap();
        m.runs.transition_to(&run.id, RunStatus::WaitingApproval, None, "t").unwrap();

        assert!(!m.runs.can_transition_to(&run.id, RunStatus::Executing));
        assert!(m.runs.can_transition_to(&run.id, RunStatus::Cancelled));
    }

    #[test]
    fn test_missing_entity() {
        let (_store, m, _run) = setup("task");
        let err = m
            .steps
            .transition_to("nope", StepStatus::Running, None, "t")
            .unwrap_err();
        assert!(matches!(
            err,
            StrataError::StateMachine(StateMachineError::NotFound { .. })
        ));
        assert!(!m.steps.can_transition_to("nope", StepStatus::Running));
    }

    #[test]
    fn test_allowed_transitions_and_retry_edge() {
        let (store, m, run) = setup("task");
        let step = Step::new(&run, 1, "work");
        store.insert_step(&step).unwrap();

        let allowed = m.steps.get_allowed_transitions(&step.id).unwrap();
        assert_eq!(
            allowed,
            vec![StepStatus::Running, StepStatus::Skipped, StepStatus::Cancelled]
        );

        m.steps.transition_to(&step.id, StepStatus::Running, None, "t").unwrap();
        m.steps.transition_to(&step.id, StepStatus::Failed, None, "t").unwrap();
        m.steps.transition_to(&step.id, StepStatus::Running, Some("retry"), "t").unwrap();
        m.steps.transition_to(&step.id, StepStatus::Completed, None, "t").unwrap();

        let loaded = store.require_step(&step.id).unwrap();
        assert!(loaded.started_at.is_some());
        assert!(loaded.completed_at.is_some());
        assert!(m
            .steps
            .transition_to(&step.id, StepStatus::Running, None, "t")
            .is_err());
    }

    #[test]
    fn test_reset_bypasses_table_and_audits() {
        let (store, m, run) = setup("task");
        let step = Step::new(&run, 1, "work");
        store.insert_step(&step).unwrap();
        m.steps.transition_to(&step.id, StepStatus::Running, None, "t").unwrap();
        m.steps.transition_to(&step.id, StepStatus::Completed, None, "t").unwrap();

        m.steps
            .reset(&step.id, StepStatus::Pending, Some("replay"), "admin")
            .unwrap();
        let loaded = store.require_step(&step.id).unwrap();
        assert_eq!(loaded.status, StepStatus::Pending);
        assert!(loaded.started_at.is_none());
        assert!(loaded.completed_at.is_none());

        let history = m.steps.get_state_history(&step.id).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].actor, "admin");
    }

    #[test]
    fn test_listeners_observe_and_errors_do_not_abort() {
        let (_store, m, run) = setup("task");
        let recorder = Arc::new(RecordingListener::default());
        m.add_listener(recorder.clone());
        m.add_listener(Arc::new(RecordingListener::failing()));

        m.runs.transition_to(&run.id, RunStatus::Planning, None, "t").unwrap();

        let seen = recorder.events();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].from, "draft");
        assert_eq!(seen[0].to, "planning");
        assert_eq!(recorder.before_count(), 1);
    }
}
