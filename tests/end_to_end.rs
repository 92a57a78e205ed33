use std::sync::Arc;
use std::time::Duration;

use strata_core::config::AppConfig;
use strata_core::types::*;
use strata_engine::Orchestrator;
use strata_test_utils::{linear_plan, ScriptedExecutor};

fn config_in(dir: &std::path::Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.engine.workspace = dir.display().to_string();
    config.executor.task_timeout_secs = 10;
    config
}

async fn wait_for_status(orch: &Orchestrator, run_id: &str, status: RunStatus) {
    for _ in 0..200 {
        if orch.get_run(run_id).unwrap().status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run {} never reached {}", run_id, status);
}

#[tokio::test]
async fn test_approval_resolved_by_another_process() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_in(dir.path());
    config.approval.timeout_secs = 1;

    let first = Orchestrator::open(config.clone()).unwrap();
    let run = first.create_run("release", None).unwrap();
    let plan = vec![
        PlanStep::new("build"),
        PlanStep::new("publish").requires_approval(),
    ];
    let map = first.build_dag_from_plan(&run.id, &plan).unwrap();

    let script = Arc::new(ScriptedExecutor::new());
    let summary = first.execute(&run.id, script.clone()).await.unwrap();
    assert!(summary.halted);
    assert_eq!(summary.final_status, RunStatus::WaitingApproval);
    assert_eq!(summary.completed, 1);

    // A second engine on the same database resolves the request durably.
    let second = Orchestrator::open(config).unwrap();
    let pending = second.list_pending_approvals(Some(&run.id)).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].node_id.as_deref(), map.step(1));
    second
        .resolve_approval(&pending[0].id, ApprovalResolution::Approved, Some("ship it"))
        .unwrap();
    assert_eq!(second.get_run(&run.id).unwrap().status, RunStatus::Executing);

    // Re-executing reuses the grant instead of asking again.
    let summary = first.execute(&run.id, script.clone()).await.unwrap();
    assert_eq!(summary.final_status, RunStatus::Completed);
    assert_eq!(summary.completed, 1);
    assert!(first.list_pending_approvals(Some(&run.id)).unwrap().is_empty());

    let publish = script.calls().into_iter().find(|c| c.task == "publish").unwrap();
    assert!(publish.retry_brief.unwrap().contains("ship it"));
}

#[tokio::test]
async fn test_pause_holds_commit_until_resume() {
    let dir = tempfile::tempdir().unwrap();
    let orch = Arc::new(Orchestrator::open(config_in(dir.path())).unwrap());
    let run = orch.create_run("two steps", None).unwrap();
    let map = orch
        .build_dag_from_plan(&run.id, &[PlanStep::new("slow"), PlanStep::new("after")])
        .unwrap();
    let script = Arc::new(ScriptedExecutor::new().delay_task("slow", Duration::from_millis(300)));

    let runner = {
        let orch = orch.clone();
        let run_id = run.id.clone();
        let script = script.clone();
        tokio::spawn(async move { orch.execute(&run_id, script).await })
    };

    wait_for_status(&orch, &run.id, RunStatus::Executing).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    orch.pause(&run.id, Some("operator break")).unwrap();
    let status = orch.get_workflow_status(&run.id).unwrap();
    assert_eq!(status.run.status, RunStatus::Paused);
    assert_eq!(status.steps[0].status, StepStatus::Paused);

    // The slow node finishes while paused but its result is not committed.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let slow = orch.store().require_node(map.step(0).unwrap()).unwrap();
    assert_eq!(slow.status, NodeStatus::Running);
    assert!(!runner.is_finished());

    orch.resume(&run.id, None).unwrap();
    let summary = tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(summary.final_status, RunStatus::Completed);
    assert_eq!(summary.completed, 2);

    let history = orch.get_state_history(&run.id).unwrap();
    let run_path: Vec<_> = history
        .iter()
        .filter(|h| h.entity_type == EntityKind::Run)
        .map(|h| h.to_state.as_str())
        .collect();
    assert_eq!(
        run_path,
        vec!["planning", "executing", "paused", "executing", "completed"]
    );
}

#[tokio::test]
async fn test_cancel_while_waiting_for_approval() {
    let dir = tempfile::tempdir().unwrap();
    let orch = Arc::new(Orchestrator::open(config_in(dir.path())).unwrap());
    let run = orch.create_run("guarded", None).unwrap();
    let map = orch
        .build_dag_from_plan(
            &run.id,
            &[PlanStep::new("deploy").requires_approval(), PlanStep::new("notify")],
        )
        .unwrap();

    let runner = {
        let orch = orch.clone();
        let run_id = run.id.clone();
        tokio::spawn(async move { orch.execute(&run_id, Arc::new(ScriptedExecutor::new())).await })
    };
    wait_for_status(&orch, &run.id, RunStatus::WaitingApproval).await;

    orch.cancel(&run.id, Some("change freeze")).unwrap();
    let summary = tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(summary.halted);
    assert_eq!(summary.final_status, RunStatus::Cancelled);

    assert!(orch.list_pending_approvals(Some(&run.id)).unwrap().is_empty());
    for label in [0, 1] {
        let node = orch.store().require_node(map.step(label).unwrap()).unwrap();
        assert_eq!(node.status, NodeStatus::Cancelled);
    }
}

#[tokio::test]
async fn test_branch_then_replay_child() {
    let dir = tempfile::tempdir().unwrap();
    let orch = Orchestrator::open(config_in(dir.path())).unwrap();
    let run = orch.create_run("experiment", None).unwrap();
    let map = orch.build_dag_from_plan(&run.id, &linear_plan(3)).unwrap();
    orch.execute(
        &run.id,
        Arc::new(ScriptedExecutor::new().respond(
            "task 3",
            serde_json::json!({ "metrics": { "score": 0.5 } }),
        )),
    )
    .await
    .unwrap();

    let mut overrides = ExtraFields::new();
    overrides.insert("learning_rate".into(), serde_json::json!(0.01));
    let branch = orch
        .create_branch(
            &run.id,
            map.step(1).unwrap(),
            "lower-lr",
            strata_engine::branch::BranchOptions {
                hypothesis: Some("smaller steps converge".into()),
                instructions: None,
                modifications: Some(strata_engine::Modifications {
                    context_overrides: overrides,
                    ..Default::default()
                }),
            },
        )
        .unwrap();

    let script = Arc::new(ScriptedExecutor::new().respond(
        "task 3",
        serde_json::json!({ "metrics": { "score": 0.75 } }),
    ));
    orch.execute(&branch.child_run_id, script.clone())
        .await
        .unwrap();
    let call = &script.calls()[0];
    assert_eq!(call.task, "task 3");
    assert_eq!(call.context.context_overrides["learning_rate"], 0.01);

    let cmp = orch.compare_branches(&run.id, &branch.child_run_id).unwrap();
    assert!((cmp.metrics["score"].avg_delta.unwrap() - 0.25).abs() < 1e-9);
    assert!(!cmp.steps[2].outputs_equal);
    assert!(cmp.steps[0].outputs_equal);

    let tree = orch.get_branch_tree(&run.id).unwrap();
    assert!(tree.render().contains("lower-lr"));

    // Replaying the child from its last task runs only that task again.
    let child_nodes = orch.store().list_nodes(&branch.child_run_id).unwrap();
    let last = child_nodes.iter().find(|n| n.task() == "task 3").unwrap();
    orch.play_from_node(&branch.child_run_id, &last.id, None).unwrap();
    let summary = orch
        .execute(&branch.child_run_id, script.clone())
        .await
        .unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(script.calls().len(), 2);
    assert!(orch.get_resumable_nodes(&branch.child_run_id).unwrap().len() >= 3);
}

#[tokio::test]
async fn test_replay_asks_for_approval_again() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_in(dir.path());
    config.approval.timeout_secs = 1;
    let orch = Orchestrator::open(config).unwrap();
    let run = orch.create_run("release", None).unwrap();
    let map = orch
        .build_dag_from_plan(&run.id, &[PlanStep::new("publish").requires_approval()])
        .unwrap();
    let publish = map.step(0).unwrap();
    let script = Arc::new(ScriptedExecutor::new());

    orch.execute(&run.id, script.clone()).await.unwrap();
    let first = orch.list_pending_approvals(Some(&run.id)).unwrap().remove(0);
    orch.resolve_approval(&first.id, ApprovalResolution::Approved, None)
        .unwrap();
    let summary = orch.execute(&run.id, script.clone()).await.unwrap();
    assert_eq!(summary.final_status, RunStatus::Completed);
    assert_eq!(script.calls().len(), 1);

    // The earlier grant belongs to the previous pass over the node.
    orch.play_from_node(&run.id, publish, None).unwrap();
    let summary = orch.execute(&run.id, script.clone()).await.unwrap();
    assert!(summary.halted);
    assert_eq!(summary.final_status, RunStatus::WaitingApproval);
    assert_eq!(script.calls().len(), 1);

    let pending = orch.list_pending_approvals(Some(&run.id)).unwrap();
    assert_eq!(pending.len(), 1);
    assert_ne!(pending[0].id, first.id);
    assert_eq!(pending[0].node_id.as_deref(), Some(publish));
}
