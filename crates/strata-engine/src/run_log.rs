use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use strata_core::event::{EventBus, WorkflowEvent};
use strata_core::types::EntityKind;

/// JSONL run logger.
///
/// Subscribes to the EventBus and appends one JSON object per line for a
/// single run. Lines already written survive a crash mid-run.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single log entry written to the JSONL file.
#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    run_id: String,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `log_dir` is the base directory; logs go to
    /// `{log_dir}/{run_id}/{timestamp}.jsonl`.
    /// `level` controls verbosity: 1=run summary, 2=levels and approvals,
    /// 3=every node, retry and transition.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Run the logger as a background task until cancellation or `RunFinished`.
    pub async fn run(self, event_bus: Arc<EventBus>, run_id: String, cancel: CancellationToken) {
        let rx = event_bus.subscribe();
        self.write_loop(rx, run_id, cancel).await
    }

    /// Subscribe now and spawn the logger, so no event published after this
    /// call is missed.
    pub fn start(
        self,
        event_bus: &EventBus,
        run_id: String,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let rx = event_bus.subscribe();
        tokio::spawn(self.write_loop(rx, run_id, cancel))
    }

    async fn write_loop(
        self,
        mut rx: broadcast::Receiver<WorkflowEvent>,
        run_id: String,
        cancel: CancellationToken,
    ) {
        let run_dir = self.log_dir.join(&run_id);
        if let Err(e) = tokio::fs::create_dir_all(&run_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = run_dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");
        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if event.run_id() != run_id {
                                continue;
                            }
                            let Some(entry) = self.event_to_entry(&event) else {
                                continue;
                            };

                            if let Ok(json) = serde_json::to_string(&entry) {
                                let line = format!("{}\n", json);
                                if let Err(e) = writer.write_all(line.as_bytes()).await {
                                    error!(error = %e, "Failed to write log entry");
                                    break;
                                }
                                if let Err(e) = writer.flush().await {
                                    error!(error = %e, "Failed to flush log");
                                }
                            }

                            if matches!(event, WorkflowEvent::RunFinished { .. }) {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }

    /// Minimum verbosity at which an event is logged.
    fn event_level(event: &WorkflowEvent) -> u8 {
        match event {
            WorkflowEvent::RunFinished { .. } => 1,
            WorkflowEvent::Transitioned { entity_type, .. } if *entity_type == EntityKind::Run => 1,
            WorkflowEvent::LevelStarted { .. }
            | WorkflowEvent::LevelCompleted { .. }
            | WorkflowEvent::ApprovalRequested { .. }
            | WorkflowEvent::ApprovalResolved { .. }
            | WorkflowEvent::BranchCreated { .. } => 2,
            WorkflowEvent::NodeStarted { .. }
            | WorkflowEvent::NodeFinished { .. }
            | WorkflowEvent::RetryScheduled { .. }
            | WorkflowEvent::Transitioned { .. } => 3,
        }
    }

    /// Convert an event to a log entry (None if filtered by level).
    fn event_to_entry(&self, event: &WorkflowEvent) -> Option<LogEntry> {
        if Self::event_level(event) > self.level {
            return None;
        }

        let detail = match event {
            WorkflowEvent::Transitioned {
                entity_type,
                entity_id,
                from,
                to,
                reason,
                ..
            } => serde_json::json!({
                "entity_type": entity_type,
                "entity_id": entity_id,
                "from": from,
                "to": to,
                "reason": reason,
            }),
            WorkflowEvent::LevelStarted { level, node_ids, .. } => serde_json::json!({
                "level": level,
                "nodes": node_ids.len(),
            }),
            WorkflowEvent::LevelCompleted {
                level,
                completed,
                failed,
                skipped,
                ..
            } => serde_json::json!({
                "level": level,
                "completed": completed,
                "failed": failed,
                "skipped": skipped,
            }),
            WorkflowEvent::NodeStarted { node_id, attempt, .. } => serde_json::json!({
                "node_id": node_id,
                "attempt": attempt,
            }),
            WorkflowEvent::NodeFinished {
                node_id,
                status,
                error,
                ..
            } => serde_json::json!({
                "node_id": node_id,
                "status": status,
                "error": error.as_deref().map(|e| truncate_str(e, 200)),
            }),
            WorkflowEvent::RetryScheduled {
                node_id,
                attempt,
                delay_secs,
                category,
                ..
            } => serde_json::json!({
                "node_id": node_id,
                "attempt": attempt,
                "delay_secs": delay_secs,
                "category": category,
            }),
            WorkflowEvent::ApprovalRequested { request } => serde_json::json!({
                "request_id": request.id,
                "approval_type": request.approval_type,
                "node_id": request.node_id,
                "message": truncate_str(&request.message, 200),
            }),
            WorkflowEvent::ApprovalResolved {
                request_id,
                resolution,
                ..
            } => serde_json::json!({
                "request_id": request_id,
                "resolution": resolution,
            }),
            WorkflowEvent::BranchCreated { branch } => serde_json::json!({
                "branch_id": branch.id,
                "child_run_id": branch.child_run_id,
                "name": branch.branch_name,
            }),
            WorkflowEvent::RunFinished {
                status,
                completed_nodes,
                failed_nodes,
                ..
            } => serde_json::json!({
                "status": status,
                "completed_nodes": completed_nodes,
                "failed_nodes": failed_nodes,
            }),
        };

        Some(LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            run_id: event.run_id().to_string(),
            event_type: event_type(event),
            detail: Some(detail),
        })
    }
}

/// The serde tag of an event, e.g. `node_started`.
fn event_type(event: &WorkflowEvent) -> String {
    serde_json::to_value(event)
        .ok()
        .and_then(|v| v.get("event").and_then(|t| t.as_str()).map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Truncate a string for logging, on a char boundary.
fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
