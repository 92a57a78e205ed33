use std::path::PathBuf;

use futures::future::BoxFuture;
use tracing::debug;

use strata_core::error::{Result, StrataError};
use strata_core::traits::NodeExecutor;
use strata_core::types::NodeRequest;

const MAX_OUTPUT: usize = 30_000;

/// Runs each node's task as a `sh -c` command.
///
/// The command runs in the node's isolated directory when there is one,
/// otherwise in `default_dir`. Stdout that parses as JSON becomes the node
/// outputs; anything else is wrapped as `{"stdout", "stderr"}`.
pub struct ShellExecutor {
    default_dir: PathBuf,
}

impl ShellExecutor {
    pub fn new(default_dir: PathBuf) -> Self {
        Self { default_dir }
    }
}

impl NodeExecutor for ShellExecutor {
    fn execute(&self, request: NodeRequest) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move {
            let dir = request
                .working_dir
                .clone()
                .unwrap_or_else(|| self.default_dir.clone());
            tokio::fs::create_dir_all(&dir).await?;
            debug!(node_id = %request.node_id, command = %request.task, "Executing shell node");

            let mut command = tokio::process::Command::new("sh");
            command
                .arg("-c")
                .arg(&request.task)
                .current_dir(&dir)
                .env("STRATA_RUN_ID", &request.run_id)
                .env("STRATA_NODE_ID", &request.node_id)
                .env("STRATA_ATTEMPT", request.attempt.to_string())
                .kill_on_drop(true);
            if let Some(brief) = &request.retry_brief {
                command.env("STRATA_RETRY_BRIEF", brief);
            }

            let output = command
                .output()
                .await
                .map_err(|e| StrataError::execution(&request.node_id, e.to_string()))?;
            let stdout = clip(String::from_utf8_lossy(&output.stdout).into_owned());
            let stderr = clip(String::from_utf8_lossy(&output.stderr).into_owned());

            if !output.status.success() {
                let code = output.status.code().unwrap_or(-1);
                let detail = if stderr.trim().is_empty() { &stdout } else { &stderr };
                return Err(StrataError::execution(
                    &request.node_id,
                    format!("Exit code {}\n{}", code, detail.trim()),
                ));
            }

            Ok(serde_json::from_str(stdout.trim())
                .unwrap_or_else(|_| serde_json::json!({ "stdout": stdout, "stderr": stderr })))
        })
    }
}

fn clip(mut s: String) -> String {
    if s.len() > MAX_OUTPUT {
        let mut end = MAX_OUTPUT;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
        s.push_str("\n... (output truncated)");
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::types::ContextSnapshot;

    fn request(task: &str) -> NodeRequest {
        NodeRequest {
            run_id: "r1".into(),
            node_id: "n1".into(),
            step_id: None,
            agent: None,
            task: task.into(),
            attempt: 2,
            working_dir: None,
            retry_brief: Some("try harder".into()),
            context: ContextSnapshot::default(),
        }
    }

    #[tokio::test]
    async fn test_json_stdout_becomes_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let exec = ShellExecutor::new(dir.path().to_path_buf());
        let out = exec
            .execute(request(r#"echo '{"metrics": {"accuracy": 0.9}}'"#))
            .await
            .unwrap();
        assert_eq!(out["metrics"]["accuracy"], 0.9);
    }

    #[tokio::test]
    async fn test_env_and_plain_output() {
        let dir = tempfile::tempdir().unwrap();
        let exec = ShellExecutor::new(dir.path().to_path_buf());
        let out = exec
            .execute(request("echo \"$STRATA_NODE_ID $STRATA_ATTEMPT $STRATA_RETRY_BRIEF\""))
            .await
            .unwrap();
        assert_eq!(out["stdout"].as_str().unwrap().trim(), "n1 2 try harder");
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let exec = ShellExecutor::new(dir.path().to_path_buf());
        let err = exec
            .execute(request("echo 'No such file or directory' >&2; exit 3"))
            .await
            .unwrap_err();
        match err {
            StrataError::Execution { message, .. } => {
                assert!(message.starts_with("Exit code 3"));
                assert!(message.contains("No such file"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
