mod shell;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::EnvFilter;

use strata_core::config::AppConfig;
use strata_core::event::WorkflowEvent;
use strata_core::types::{ApprovalResolution, ExtraFields, PlanStep, RunStatus};
use strata_engine::branch::{BranchOptions, Modifications};
use strata_engine::Orchestrator;

use shell::ShellExecutor;

#[derive(Parser)]
#[command(name = "strata", version, about = "Workflow orchestration: DAG runs, approvals, branches and replay")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "strata.toml")]
    config: PathBuf,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a run from a plan file (TOML or JSON) and build its DAG
    Plan {
        /// Plan file with `task` and `[[steps]]`
        file: PathBuf,
        /// Session to file the run under
        #[arg(short, long)]
        session: Option<String>,
    },
    /// Execute a run, each node's task being a shell command
    Run {
        run_id: String,
        /// Prompt on stdin for approvals instead of waiting for `strata approve`
        #[arg(short, long)]
        interactive: bool,
        /// Override approval.timeout_secs
        #[arg(long)]
        approval_timeout: Option<u64>,
    },
    /// Show a run, its steps and allowed transitions
    Status { run_id: String },
    /// List runs
    Runs {
        #[arg(short, long)]
        session: Option<String>,
        #[arg(long)]
        status: Option<RunStatus>,
    },
    /// Pause an executing run
    Pause {
        run_id: String,
        #[arg(short, long)]
        reason: Option<String>,
    },
    /// Resume a paused run
    Resume {
        run_id: String,
        #[arg(short, long)]
        reason: Option<String>,
    },
    /// Cancel a run
    Cancel {
        run_id: String,
        #[arg(short, long)]
        reason: Option<String>,
    },
    /// Nodes of a run; `--resumable` keeps completed and failed ones
    Nodes {
        run_id: String,
        #[arg(long)]
        resumable: bool,
    },
    /// Fork a run at a node
    Branch {
        run_id: String,
        node_id: String,
        name: String,
        #[arg(long)]
        hypothesis: Option<String>,
        #[arg(long)]
        instructions: Option<String>,
        #[arg(long)]
        approach: Option<String>,
        /// Context override, KEY=VALUE (VALUE parsed as JSON when possible)
        #[arg(long = "set", value_name = "KEY=VALUE")]
        overrides: Vec<String>,
        /// Parameter override, KEY=VALUE
        #[arg(long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
    },
    /// Rewind a run so it resumes from a node
    Replay {
        run_id: String,
        node_id: String,
        #[arg(long = "set", value_name = "KEY=VALUE")]
        overrides: Vec<String>,
    },
    /// Compare two runs
    Compare { run_a: String, run_b: String },
    /// Show the branch tree rooted at a run
    Tree { run_id: String },
    /// List pending approval requests
    Approvals {
        #[arg(long)]
        run: Option<String>,
        /// Expire requests past their deadline first
        #[arg(long)]
        expire: bool,
    },
    /// Resolve an approval request
    Approve {
        request_id: String,
        #[arg(short, long, default_value = "approved")]
        resolution: ApprovalResolution,
        #[arg(short, long)]
        feedback: Option<String>,
    },
    /// Audit history of a run and its steps and nodes
    History { run_id: String },
    /// Attempt statistics of a run
    RetryStats { run_id: String },
    /// Execution levels of a run's DAG
    Levels { run_id: String },
}

/// On-disk plan format.
#[derive(Debug, Deserialize)]
struct PlanFile {
    task: String,
    steps: Vec<PlanStep>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("strata=info,warn")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = load_config(&cli.config)?;
    if let Commands::Run {
        approval_timeout: Some(secs),
        ..
    } = &cli.command
    {
        config.approval.timeout_secs = *secs;
    }
    let orch = Arc::new(Orchestrator::open(config)?);
    let json = cli.json;

    match cli.command {
        Commands::Plan { file, session } => {
            let plan = load_plan(&file)?;
            let run = orch.create_run(&plan.task, session.as_deref())?;
            let map = orch.build_dag_from_plan(&run.id, &plan.steps)?;
            if json {
                return print_json(&serde_json::json!({ "run": run, "nodes": map }));
            }
            println!("Run {} ({} steps)", run.id, plan.steps.len());
            let mut labels: Vec<_> = map.labels.iter().collect();
            labels.sort_by_key(|(_, id)| orch.store().get_node(id).ok().flatten().map(|n| n.order_index));
            for (label, id) in labels {
                println!("  {:<12} {}", label, id);
            }
        }
        Commands::Run {
            run_id,
            interactive,
            ..
        } => {
            let printer = spawn_printer(orch.clone(), run_id.clone(), interactive);
            let workdir = orch.workspace().shared_dir(&run_id);
            let result = orch
                .execute(&run_id, Arc::new(ShellExecutor::new(workdir)))
                .await;
            printer.abort();
            let summary = result?;
            if json {
                return print_json(&summary);
            }
            println!(
                "Run {}: {} ({} completed, {} failed, {} skipped{})",
                summary.run_id,
                summary.final_status,
                summary.completed,
                summary.failed,
                summary.skipped,
                if summary.halted { ", halted" } else { "" }
            );
        }
        Commands::Status { run_id } => {
            let status = orch.get_workflow_status(&run_id)?;
            if json {
                return print_json(&status);
            }
            let run = &status.run;
            println!("Run {} [{}]", run.id, run.status);
            println!("  task:    {}", run.task_description);
            println!("  session: {}", run.session_id);
            if let Some(parent) = &run.branch_parent_id {
                println!("  branch of {} (depth {})", parent, run.branch_depth);
            }
            if let Some(secs) = run.elapsed_secs() {
                println!("  elapsed: {:.1}s", secs);
            }
            for step in &status.steps {
                println!(
                    "  {:>3}. [{}] {}{}",
                    step.step_number,
                    step.status,
                    truncate(&step.task, 60),
                    step.error
                        .as_deref()
                        .map(|e| format!("  ({})", truncate(e, 80)))
                        .unwrap_or_default()
                );
            }
            let allowed: Vec<_> = status.allowed_transitions.iter().map(|s| s.as_str()).collect();
            println!("  next:    {}", allowed.join(", "));
            for req in &status.pending_approvals {
                println!("  approval pending: {} \"{}\"", req.id, req.message);
            }
        }
        Commands::Runs { session, status } => {
            let runs = orch.list_runs(session.as_deref(), status)?;
            if json {
                return print_json(&runs);
            }
            for run in runs {
                println!(
                    "{}  {:<16} {}  {}",
                    run.id,
                    run.status.as_str(),
                    run.created_at.format("%Y-%m-%d %H:%M"),
                    truncate(&run.task_description, 60)
                );
            }
        }
        Commands::Pause { run_id, reason } => {
            let run = orch.pause(&run_id, reason.as_deref())?;
            report_status(json, &run.id, run.status)?;
        }
        Commands::Resume { run_id, reason } => {
            let run = orch.resume(&run_id, reason.as_deref())?;
            report_status(json, &run.id, run.status)?;
        }
        Commands::Cancel { run_id, reason } => {
            let run = orch.cancel(&run_id, reason.as_deref())?;
            report_status(json, &run.id, run.status)?;
        }
        Commands::Nodes { run_id, resumable } => {
            let nodes = if resumable {
                orch.get_resumable_nodes(&run_id)?
            } else {
                orch.store().list_nodes(&run_id)?
            };
            if json {
                return print_json(&nodes);
            }
            for node in nodes {
                println!(
                    "{}  {:>3} {:<15} {:<16} {}",
                    node.id,
                    node.order_index,
                    node.node_type.as_str(),
                    node.status.as_str(),
                    truncate(node.task(), 60)
                );
            }
        }
        Commands::Branch {
            run_id,
            node_id,
            name,
            hypothesis,
            instructions,
            approach,
            overrides,
            params,
        } => {
            let modifications = if overrides.is_empty() && params.is_empty() && approach.is_none() {
                None
            } else {
                Some(Modifications {
                    context_overrides: parse_overrides(&overrides)?,
                    parameter_overrides: parse_overrides(&params)?,
                    alternative_approach: approach,
                })
            };
            let branch = orch.create_branch(
                &run_id,
                &node_id,
                &name,
                BranchOptions {
                    hypothesis,
                    instructions,
                    modifications,
                },
            )?;
            if json {
                return print_json(&branch);
            }
            println!("Branch '{}' created: run {}", branch.branch_name, branch.child_run_id);
        }
        Commands::Replay {
            run_id,
            node_id,
            overrides,
        } => {
            let overrides = parse_overrides(&overrides)?;
            let context = orch.play_from_node(
                &run_id,
                &node_id,
                (!overrides.is_empty()).then_some(&overrides),
            )?;
            if json {
                return print_json(&context);
            }
            println!(
                "Run {} rewound to node {} ({} outputs kept). Continue with `strata run {}`.",
                run_id,
                node_id,
                context.outputs.len(),
                run_id
            );
        }
        Commands::Compare { run_a, run_b } => {
            let cmp = orch.compare_branches(&run_a, &run_b)?;
            if json {
                return print_json(&cmp);
            }
            if let Some(delta) = cmp.time_delta_secs {
                println!("time delta: {:+.1}s", delta);
            }
            println!(
                "cost:       {:.4} vs {:.4} ({:+.4})",
                cmp.cost_a, cmp.cost_b, cmp.cost_delta
            );
            for step in &cmp.steps {
                let mark = if step.outputs_equal { "=" } else { "≠" };
                println!(
                    "  {:>3} {} {:<30} | {}",
                    step.position,
                    mark,
                    truncate(step.task_a.as_deref().unwrap_or("-"), 30),
                    truncate(step.task_b.as_deref().unwrap_or("-"), 30)
                );
            }
            println!(
                "files:      {} identical, {} changed, {} only in a, {} only in b",
                cmp.files.identical,
                cmp.files.changed.len(),
                cmp.files.only_in_a.len(),
                cmp.files.only_in_b.len()
            );
            for (name, metric) in &cmp.metrics {
                let avg = |s: Option<strata_engine::branch::MetricSummary>| {
                    s.map(|s| format!("{:.3}", s.avg)).unwrap_or_else(|| "-".into())
                };
                println!("  {:<20} {} -> {}", name, avg(metric.a), avg(metric.b));
            }
        }
        Commands::Tree { run_id } => {
            let tree = orch.get_branch_tree(&run_id)?;
            if json {
                return print_json(&tree);
            }
            print!("{}", tree.render());
        }
        Commands::Approvals { run, expire } => {
            if expire {
                let expired = orch.expire_stale_approvals(chrono::Utc::now())?;
                if !expired.is_empty() {
                    info!(count = expired.len(), "Expired stale approval requests");
                }
            }
            let pending = orch.list_pending_approvals(run.as_deref())?;
            if json {
                return print_json(&pending);
            }
            for req in pending {
                println!(
                    "{}  run {}  [{}] {}",
                    req.id, req.run_id, req.approval_type, req.message
                );
            }
        }
        Commands::Approve {
            request_id,
            resolution,
            feedback,
        } => {
            let req = orch.resolve_approval(&request_id, resolution, feedback.as_deref())?;
            if json {
                return print_json(&req);
            }
            println!("Request {} resolved: {}", req.id, req.status);
        }
        Commands::History { run_id } => {
            let history = orch.get_state_history(&run_id)?;
            if json {
                return print_json(&history);
            }
            for h in history {
                println!(
                    "{}  {:<4} {}  {} -> {}  by {}{}",
                    h.timestamp.format("%H:%M:%S%.3f"),
                    h.entity_type.as_str(),
                    short(&h.entity_id),
                    h.from_state,
                    h.to_state,
                    h.actor,
                    h.reason.map(|r| format!(" ({})", r)).unwrap_or_default()
                );
            }
        }
        Commands::RetryStats { run_id } => {
            let stats = orch.get_retry_stats(&run_id)?;
            if json {
                return print_json(&stats);
            }
            println!(
                "{} attempts: {} succeeded, {} failed, {} steps retried",
                stats.total_attempts, stats.successes, stats.failures, stats.retried_steps
            );
            for (category, count) in &stats.by_category {
                println!("  {:<20} {}", category, count);
            }
        }
        Commands::Levels { run_id } => {
            let levels = orch.get_execution_order(&run_id)?;
            if json {
                return print_json(&levels);
            }
            for (i, level) in levels.iter().enumerate() {
                let tasks: Vec<String> = level
                    .iter()
                    .map(|id| match orch.store().get_node(id) {
                        Ok(Some(node)) => format!("{} ({})", truncate(node.task(), 30), short(id)),
                        _ => short(id).to_string(),
                    })
                    .collect();
                println!("level {}: {}", i, tasks.join(", "));
            }
        }
    }

    Ok(())
}

/// Config from `path`, then `~/.strata/config.toml`, then defaults.
fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    if let Some(home) = dirs_home().map(|h| h.join(".strata").join("config.toml")) {
        if home.exists() {
            info!(path = %home.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home)?);
        }
    }
    Ok(AppConfig::default())
}

fn load_plan(path: &Path) -> anyhow::Result<PlanFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading plan {}", path.display()))?;
    let plan = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&content)?,
        _ => toml::from_str(&content)?,
    };
    Ok(plan)
}

/// `KEY=VALUE` pairs; values that parse as JSON keep their type.
fn parse_overrides(pairs: &[String]) -> anyhow::Result<ExtraFields> {
    let mut map = ExtraFields::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("expected KEY=VALUE, got '{}'", pair))?;
        let value = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        map.insert(key.trim().to_string(), value);
    }
    Ok(map)
}

/// Print this run's progress to stderr; optionally answer approvals on stdin.
fn spawn_printer(
    orch: Arc<Orchestrator>,
    run_id: String,
    interactive: bool,
) -> tokio::task::JoinHandle<()> {
    let mut rx = orch.events().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            if event.run_id() != run_id {
                continue;
            }
            match event {
                WorkflowEvent::LevelStarted { level, node_ids, .. } => {
                    eprintln!("[level {}] {} node(s)", level, node_ids.len());
                }
                WorkflowEvent::NodeStarted { node_id, attempt, .. } => {
                    eprintln!("[node {}] attempt {}", short(&node_id), attempt);
                }
                WorkflowEvent::NodeFinished {
                    node_id,
                    status,
                    error,
                    ..
                } => match error {
                    Some(e) => eprintln!("[node {}: {}] {}", short(&node_id), status, truncate(&e, 200)),
                    None => eprintln!("[node {}: {}]", short(&node_id), status),
                },
                WorkflowEvent::RetryScheduled {
                    node_id,
                    delay_secs,
                    category,
                    ..
                } => {
                    eprintln!(
                        "[node {}] {} error, retrying in {}s",
                        short(&node_id),
                        category,
                        delay_secs
                    );
                }
                WorkflowEvent::ApprovalRequested { request } => {
                    eprintln!("\n[APPROVAL {}] {}", request.id, request.message);
                    if !interactive {
                        eprintln!("  resolve with: strata approve {}", request.id);
                        continue;
                    }
                    let answer = tokio::task::spawn_blocking(prompt_resolution)
                        .await
                        .ok()
                        .flatten();
                    if let Some((resolution, feedback)) = answer {
                        if let Err(e) =
                            orch.resolve_approval(&request.id, resolution, feedback.as_deref())
                        {
                            eprintln!("  failed to resolve: {}", e);
                        }
                    }
                }
                _ => {}
            }
        }
    })
}

/// Choices offered by the interactive approval prompt; the first is the default.
const DECISIONS: [(ApprovalResolution, &str); 4] = [
    (ApprovalResolution::Approved, "Approve"),
    (ApprovalResolution::Modified, "Approve with changes"),
    (ApprovalResolution::Skip, "Skip this node"),
    (ApprovalResolution::Rejected, "Reject and cancel the run"),
];

/// Ask the operator for a decision, with feedback when modifying.
fn prompt_resolution() -> Option<(ApprovalResolution, Option<String>)> {
    let labels: Vec<&str> = DECISIONS.iter().map(|(_, label)| *label).collect();
    let picked = dialoguer::Select::new()
        .with_prompt("Decision")
        .items(&labels)
        .default(0)
        .interact()
        .ok()?;
    let (resolution, _) = DECISIONS[picked];
    if resolution != ApprovalResolution::Modified {
        return Some((resolution, None));
    }
    let feedback: String = dialoguer::Input::new()
        .with_prompt("Feedback")
        .allow_empty(true)
        .interact_text()
        .ok()?;
    let feedback = feedback.trim().to_string();
    Some((resolution, (!feedback.is_empty()).then_some(feedback)))
}

fn report_status(json: bool, run_id: &str, status: RunStatus) -> anyhow::Result<()> {
    if json {
        return print_json(&serde_json::json!({ "run_id": run_id, "status": status }));
    }
    println!("Run {} is now {}", run_id, status);
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

fn short(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
