use tracing::{debug, warn};

use crate::config::HooksConfig;
use crate::error::Result;
use crate::traits::TransitionListener;
use crate::types::{EntityKind, RunStatus, TransitionEvent};

/// Execute hook commands with environment variables.
/// Fire-and-forget: errors are logged, not propagated.
pub async fn run_hooks(commands: &[String], env_vars: &[(&str, &str)]) {
    for cmd in commands {
        let mut command = tokio::process::Command::new("sh");
        command.args(["-c", cmd]);
        for (key, val) in env_vars {
            command.env(key, val);
        }
        command.stdout(std::process::Stdio::null());
        command.stderr(std::process::Stdio::null());
        match command.status().await {
            Ok(s) if !s.success() => warn!(hook = %cmd, code = s.code(), "Hook exited non-zero"),
            Err(e) => warn!(hook = %cmd, error = %e, "Hook failed to execute"),
            _ => {}
        }
    }
}

/// Runs configured shell hooks when a run changes status.
pub struct HookListener {
    hooks: HooksConfig,
}

impl HookListener {
    pub fn new(hooks: HooksConfig) -> Self {
        Self { hooks }
    }

    /// Hook commands matching a run transition into `to`.
    fn commands_for(&self, from: &str, to: RunStatus) -> &[String] {
        match to {
            RunStatus::Executing if from == RunStatus::Planning.as_str() => &self.hooks.on_run_start,
            RunStatus::Completed => &self.hooks.on_run_complete,
            RunStatus::Failed => &self.hooks.on_run_failed,
            RunStatus::WaitingApproval => &self.hooks.on_approval_requested,
            _ => &[],
        }
    }
}

impl TransitionListener for HookListener {
    fn after_transition(&self, event: &TransitionEvent) -> Result<()> {
        if event.entity_type != EntityKind::Run {
            return Ok(());
        }
        let Ok(to) = event.to.parse::<RunStatus>() else {
            return Ok(());
        };
        let commands = self.commands_for(&event.from, to).to_vec();
        if commands.is_empty() {
            return Ok(());
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(run_id = %event.run_id, "No runtime available, skipping hooks");
            return Ok(());
        };
        let run_id = event.run_id.clone();
        let from = event.from.clone();
        let to = event.to.clone();
        handle.spawn(async move {
            run_hooks(
                &commands,
                &[
                    ("STRATA_RUN_ID", run_id.as_str()),
                    ("STRATA_FROM", from.as_str()),
                    ("STRATA_TO", to.as_str()),
                ],
            )
            .await;
        });
        Ok(())
    }
}
