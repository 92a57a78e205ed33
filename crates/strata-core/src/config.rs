use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StrataError};

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
    #[serde(default)]
    pub hooks: Option<HooksConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// SQLite database path. Relative paths resolve against the workspace.
    #[serde(default = "default_database_path")]
    pub database_path: String,
    /// Root directory holding per-run working directories.
    #[serde(default = "default_workspace")]
    pub workspace: String,
    /// Actor recorded in the audit log for transitions the engine performs.
    #[serde(default = "default_actor")]
    pub actor: String,
    /// Default session id for runs created from the CLI.
    #[serde(default = "default_session")]
    pub session_id: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            workspace: default_workspace(),
            actor: default_actor(),
            session_id: default_session(),
        }
    }
}

fn default_database_path() -> String { "strata.db".to_string() }
fn default_workspace() -> String { "~/.strata".to_string() }
fn default_actor() -> String { "system".to_string() }
fn default_session() -> String { "default".to_string() }

/// DAG executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Run multi-node levels concurrently.
    #[serde(default = "default_parallel")]
    pub parallel: bool,
    /// Maximum node executions in flight within one level.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Per-node timeout. 0 disables it.
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    /// Give every node its own working directory and merge into `shared/`.
    #[serde(default)]
    pub isolated_workdirs: bool,
    /// Mark the run `failed` at the end when any node failed.
    #[serde(default)]
    pub fail_run_on_node_failure: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            parallel: true,
            max_workers: default_max_workers(),
            task_timeout_secs: default_task_timeout_secs(),
            isolated_workdirs: false,
            fail_run_on_node_failure: false,
        }
    }
}

fn default_parallel() -> bool { true }
fn default_max_workers() -> usize { 4 }
fn default_task_timeout_secs() -> u64 { 600 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    #[serde(default = "default_approval_timeout")]
    pub timeout_secs: u64,
    /// Refuse a second pending request for the same run instead of warning.
    #[serde(default)]
    pub enforce_single_pending: bool,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_approval_timeout(),
            enforce_single_pending: false,
        }
    }
}

fn default_approval_timeout() -> u64 { 3600 }

/// Defaults for nodes whose plan step carries no retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Upper bound on the exponential backoff delay.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            max_backoff_secs: default_max_backoff(),
        }
    }
}

fn default_max_attempts() -> u32 { 1 }
fn default_max_backoff() -> u64 { 60 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable run logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: <workspace>/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// Logging level: 1 = run summary only, 2 = levels and approvals, 3 = every node and transition.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: 2,
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

/// Shell commands run on lifecycle events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HooksConfig {
    #[serde(default)]
    pub on_run_start: Vec<String>,
    #[serde(default)]
    pub on_run_complete: Vec<String>,
    #[serde(default)]
    pub on_run_failed: Vec<String>,
    #[serde(default)]
    pub on_approval_requested: Vec<String>,
}

impl HooksConfig {
    pub fn is_empty(&self) -> bool {
        self.on_run_start.is_empty()
            && self.on_run_complete.is_empty()
            && self.on_run_failed.is_empty()
            && self.on_approval_requested.is_empty()
    }
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| StrataError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| StrataError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.executor.max_workers == 0 {
            return Err(StrataError::Config(
                "executor.max_workers must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(StrataError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if let Some(log) = &self.log {
            if !(1..=3).contains(&log.level) {
                return Err(StrataError::Config(format!(
                    "log.level must be 1, 2 or 3 (got {})",
                    log.level
                )));
            }
        }
        Ok(())
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        expand_home(&self.engine.workspace)
    }

    /// Resolve the database path; relative paths land in the workspace.
    pub fn database_path(&self) -> PathBuf {
        let path = expand_home(&self.engine.database_path);
        if path.is_absolute() {
            path
        } else {
            self.workspace_dir().join(path)
        }
    }

    /// Directory holding per-run working directories.
    pub fn runs_dir(&self) -> PathBuf {
        self.workspace_dir().join("runs")
    }

    /// Resolve the run log directory, if logging is enabled.
    pub fn log_dir(&self) -> Option<PathBuf> {
        let log = self.log.as_ref().filter(|l| l.enabled)?;
        Some(match &log.log_dir {
            Some(dir) => expand_home(dir),
            None => self.workspace_dir().join("logs"),
        })
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Unset variables are left verbatim
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert!(config.executor.parallel);
        assert_eq!(config.executor.max_workers, 4);
        assert!(!config.executor.fail_run_on_node_failure);
        assert_eq!(config.approval.timeout_secs, 3600);
        assert!(!config.approval.enforce_single_pending);
        assert_eq!(config.retry.max_attempts, 1);
        assert_eq!(config.retry.max_backoff_secs, 60);
        assert!(config.log.is_none());
        assert!(config.hooks.is_none());
    }

    #[test]
    fn test_partial_sections_keep_defaults() {
        let toml_str = r#"
[executor]
max_workers = 8
isolated_workdirs = true

[log]
level = 3

[hooks]
on_run_failed = ["echo failed"]
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.executor.max_workers, 8);
        assert!(config.executor.isolated_workdirs);
        assert_eq!(config.executor.task_timeout_secs, 600);
        let log = config.log.unwrap();
        assert!(log.enabled);
        assert_eq!(log.level, 3);
        let hooks = config.hooks.unwrap();
        assert_eq!(hooks.on_run_failed, vec!["echo failed"]);
        assert!(hooks.on_run_start.is_empty());
        assert!(!hooks.is_empty());
    }

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("STRATA_TEST_DB_DIR", "/var/lib/strata");
        let expanded = expand_env_vars("path = \"${STRATA_TEST_DB_DIR}/runs.db\"");
        assert_eq!(expanded, "path = \"/var/lib/strata/runs.db\"");
        let untouched = expand_env_vars("x = \"${STRATA_TEST_SURELY_UNSET_VAR}\"");
        assert_eq!(untouched, "x = \"${STRATA_TEST_SURELY_UNSET_VAR}\"");
    }

    #[test]
    fn test_database_path_resolution() {
        let mut config = AppConfig::default();
        config.engine.workspace = "/tmp/strata-ws".to_string();
        assert_eq!(config.database_path(), PathBuf::from("/tmp/strata-ws/strata.db"));
        config.engine.database_path = "/data/other.db".to_string();
        assert_eq!(config.database_path(), PathBuf::from("/data/other.db"));
        assert_eq!(config.runs_dir(), PathBuf::from("/tmp/strata-ws/runs"));
    }

    #[test]
    fn test_log_dir_respects_enabled() {
        let mut config = AppConfig::default();
        config.engine.workspace = "/tmp/ws".to_string();
        assert!(config.log_dir().is_none());
        config.log = Some(LogConfig::default());
        assert_eq!(config.log_dir(), Some(PathBuf::from("/tmp/ws/logs")));
        config.log = Some(LogConfig {
            enabled: false,
            ..LogConfig::default()
        });
        assert!(config.log_dir().is_none());
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = AppConfig::default();
        config.executor.max_workers = 0;
        assert!(matches!(config.validate(), Err(StrataError::Config(_))));
    }
}
