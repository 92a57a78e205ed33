use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use strata_core::error::Result;
use strata_core::types::{ErrorCategory, RetryAttempt, RetryStrategyKind, Step, StepMeta, StepStatus};
use strata_store::WorkflowStore;

use super::analyzer::{ErrorAnalysis, ErrorAnalyzer};

const MAX_SIMILAR_ERRORS: usize = 5;

/// How and when the next attempt should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryStrategy {
    pub kind: RetryStrategyKind,
    pub delay_secs: u64,
}

/// A completed step that hit the same kind of error and then succeeded.
#[derive(Debug, Clone, Serialize)]
pub struct SimilarError {
    pub step_id: String,
    pub task: String,
    pub error: String,
    /// Attempt number that finally succeeded.
    pub resolved_on_attempt: u32,
}

/// Everything known about a step that is about to be retried.
#[derive(Debug, Clone, Serialize)]
pub struct RetryContext {
    pub step_id: String,
    pub task: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub error_message: Option<String>,
    pub analysis: ErrorAnalysis,
    pub previous_attempts: Vec<RetryAttempt>,
    pub user_feedback: Option<String>,
    pub user_suggestions: Vec<String>,
    pub similar_errors: Vec<SimilarError>,
    pub strategy: RetryStrategy,
    pub success_probability: f64,
}

impl RetryContext {
    pub fn attempts_remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt)
    }
}

/// Aggregated attempt statistics for a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetryStats {
    pub total_attempts: usize,
    pub successes: usize,
    pub failures: usize,
    /// Steps with more than one attempt.
    pub retried_steps: usize,
    pub by_category: BTreeMap<String, usize>,
}

/// Builds retry contexts and keeps the per-step attempt ledger.
pub struct RetryContextManager {
    store: Arc<WorkflowStore>,
    analyzer: ErrorAnalyzer,
    max_backoff_secs: u64,
}

impl RetryContextManager {
    pub fn new(store: Arc<WorkflowStore>, max_backoff_secs: u64) -> Self {
        Self {
            store,
            analyzer: ErrorAnalyzer::new(),
            max_backoff_secs,
        }
    }

    pub fn analyzer(&self) -> &ErrorAnalyzer {
        &self.analyzer
    }

    /// Build the context for the upcoming `attempt` of a step.
    pub fn create_retry_context(
        &self,
        step_id: &str,
        attempt: u32,
        max_attempts: u32,
        feedback: Option<&str>,
    ) -> Result<RetryContext> {
        let step = self.store.require_step(step_id)?;

        let error_message = step
            .error
            .clone()
            .or_else(|| step.last_attempt().and_then(|a| a.error.clone()));
        let analysis = self
            .analyzer
            .analyze_error(error_message.as_deref().unwrap_or_default(), None);

        let has_feedback = feedback.map(|f| !f.trim().is_empty()).unwrap_or(false);
        let user_suggestions = feedback.map(parse_user_suggestions).unwrap_or_default();
        let similar_errors = self.find_similar_errors(&step, analysis.category)?;
        let strategy = select_strategy(attempt, has_feedback, self.max_backoff_secs);
        let success_probability =
            self.analyzer
                .estimate_success_probability(attempt, analysis.category, has_feedback);

        debug!(
            step_id,
            attempt,
            category = %analysis.category,
            strategy = %strategy.kind,
            "Retry context created"
        );

        Ok(RetryContext {
            step_id: step.id.clone(),
            task: step.task.clone(),
            attempt,
            max_attempts,
            error_message,
            analysis,
            previous_attempts: step.meta.retry_attempts.clone(),
            user_feedback: feedback.filter(|_| has_feedback).map(str::to_string),
            user_suggestions,
            similar_errors,
            strategy,
            success_probability,
        })
    }

    /// Append an attempt to the step's ledger.
    pub fn record_attempt(&self, step_id: &str, attempt: RetryAttempt) -> Result<StepMeta> {
        let step = self.store.require_step(step_id)?;
        let mut meta = step.meta;
        meta.retry_attempts.push(attempt);
        self.store.save_step_meta(step_id, &meta)?;
        Ok(meta)
    }

    pub fn get_retry_stats(&self, run_id: &str) -> Result<RetryStats> {
        let steps = self.store.list_steps(run_id)?;
        let mut stats = RetryStats::default();
        for step in &steps {
            let attempts = &step.meta.retry_attempts;
            if attempts.len() > 1 {
                stats.retried_steps += 1;
            }
            for attempt in attempts {
                stats.total_attempts += 1;
                if attempt.succeeded {
                    stats.successes += 1;
                } else {
                    stats.failures += 1;
                    let category = attempt.error_category.unwrap_or(ErrorCategory::Unknown);
                    *stats.by_category.entry(category.to_string()).or_default() += 1;
                }
            }
        }
        Ok(stats)
    }

    /// Completed steps in the same session whose ledger shows a failure of
    /// `category` followed by a success.
    fn find_similar_errors(&self, step: &Step, category: ErrorCategory) -> Result<Vec<SimilarError>> {
        if category == ErrorCategory::Unknown {
            return Ok(Vec::new());
        }
        let candidates = self
            .store
            .list_steps_in_session(&step.session_id, Some(StepStatus::Completed))?;

        let similar = candidates
            .into_iter()
            .filter(|s| s.id != step.id)
            .filter_map(|s| {
                let attempts = &s.meta.retry_attempts;
                let failed_at = attempts
                    .iter()
                    .position(|a| !a.succeeded && a.error_category == Some(category))?;
                let success = attempts[failed_at..].iter().find(|a| a.succeeded)?;
                Some(SimilarError {
                    step_id: s.id.clone(),
                    task: s.task.clone(),
                    error: attempts[failed_at].error.clone().unwrap_or_default(),
                    resolved_on_attempt: success.attempt,
                })
            })
            .take(MAX_SIMILAR_ERRORS)
            .collect();
        Ok(similar)
    }
}

/// Feedback wins; otherwise back off exponentially after the second attempt.
pub fn select_strategy(attempt: u32, has_feedback: bool, max_backoff_secs: u64) -> RetryStrategy {
    if has_feedback {
        RetryStrategy {
            kind: RetryStrategyKind::UserGuided,
            delay_secs: 0,
        }
    } else if attempt > 2 {
        let delay = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
        RetryStrategy {
            kind: RetryStrategyKind::ExponentialBackoff,
            delay_secs: delay.min(max_backoff_secs),
        }
    } else {
        RetryStrategy {
            kind: RetryStrategyKind::Immediate,
            delay_secs: 0,
        }
    }
}

/// Split free-form feedback into one suggestion per line, dropping list markers.
pub fn parse_user_suggestions(feedback: &str) -> Vec<String> {
    feedback
        .lines()
        .map(str::trim)
        .map(strip_list_marker)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn strip_list_marker(line: &str) -> &str {
    for marker in ["- ", "* ", "• ", "+ "] {
        if let Some(rest) = line.strip_prefix(marker) {
            return rest.trim();
        }
    }
    // "1. step" / "2) step"
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0 {
        let rest = &line[digits..];
        if let Some(rest) = rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") ")) {
            return rest.trim();
        }
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::types::Run;

    fn setup() -> (Arc<WorkflowStore>, Run) {
        let store = Arc::new(WorkflowStore::in_memory().unwrap());
        let run = Run::new("sess", "task");
        store.insert_run(&run).unwrap();
        (store, run)
    }

    #[test]
    fn test_strategy_selection() {
        assert_eq!(
            select_strategy(5, true, 60),
            RetryStrategy { kind: RetryStrategyKind::UserGuided, delay_secs: 0 }
        );
        assert_eq!(select_strategy(1, false, 60).kind, RetryStrategyKind::Immediate);
        assert_eq!(select_strategy(2, false, 60).kind, RetryStrategyKind::Immediate);
        assert_eq!(
            select_strategy(3, false, 60),
            RetryStrategy { kind: RetryStrategyKind::ExponentialBackoff, delay_secs: 8 }
        );
        assert_eq!(select_strategy(6, false, 60).delay_secs, 60);
        assert_eq!(select_strategy(80, false, 60).delay_secs, 60);
    }

    #[test]
    fn test_parse_user_suggestions() {
        let parsed = parse_user_suggestions("- use the v2 endpoint\n\n* add retries\n1. check auth\n2) log body\nplain line");
        assert_eq!(
            parsed,
            vec!["use the v2 endpoint", "add retries", "check auth", "log body", "plain line"]
        );
    }

    #[test]
    fn test_record_attempt_and_stats() {
        let (store, run) = setup();
        let step = Step::new(&run, 1, "fetch data");
        store.insert_step(&step).unwrap();
        let mgr = RetryContextManager::new(store.clone(), 60);

        mgr.record_attempt(&step.id, RetryAttempt::failure(1, "No such file or directory", ErrorCategory::FileNotFound))
            .unwrap();
        mgr.record_attempt(&step.id, RetryAttempt::failure(2, "timed out", ErrorCategory::Timeout))
            .unwrap();
        let meta = mgr.record_attempt(&step.id, RetryAttempt::success(3)).unwrap();
        assert_eq!(meta.retry_attempts.len(), 3);

        let stats = mgr.get_retry_stats(&run.id).unwrap();
        assert_eq!(stats.total_attempts, 3);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.failures, 2);
        assert_eq!(stats.retried_steps, 1);
        assert_eq!(stats.by_category.get("file_not_found"), Some(&1));
        assert_eq!(stats.by_category.get("timeout"), Some(&1));
    }

    #[test]
    fn test_context_includes_feedback_and_similar_errors() {
        let (store, run) = setup();

        // A completed step that recovered from the same category earlier.
        let mut solved = Step::new(&run, 1, "load config");
        solved.status = StepStatus::Completed;
        solved.meta.retry_attempts = vec![
            RetryAttempt::failure(1, "config.toml: No such file or directory", ErrorCategory::FileNotFound),
            RetryAttempt::success(2),
        ];
        store.insert_step(&solved).unwrap();

        let mut failing = Step::new(&run, 2, "read input");
        failing.status = StepStatus::Failed;
        failing.error = Some("FileNotFoundError: input.csv".into());
        store.insert_step(&failing).unwrap();

        let mgr = RetryContextManager::new(store, 60);
        let ctx = mgr
            .create_retry_context(&failing.id, 1, 3, Some("- look in data/\n- use the absolute path"))
            .unwrap();

        assert_eq!(ctx.analysis.category, ErrorCategory::FileNotFound);
        assert_eq!(ctx.strategy.kind, RetryStrategyKind::UserGuided);
        assert_eq!(ctx.user_suggestions.len(), 2);
        assert_eq!(ctx.success_probability, 0.6);
        assert_eq!(ctx.similar_errors.len(), 1);
        assert_eq!(ctx.similar_errors[0].resolved_on_attempt, 2);
        assert_eq!(ctx.attempts_remaining(), 2);
    }

    #[test]
    fn test_blank_feedback_is_ignored() {
        let (store, run) = setup();
        let mut step = Step::new(&run, 1, "t");
        step.error = Some("weird".into());
        store.insert_step(&step).unwrap();

        let mgr = RetryContextManager::new(store, 60);
        let ctx = mgr.create_retry_context(&step.id, 1, 2, Some("   ")).unwrap();
        assert!(ctx.user_feedback.is_none());
        assert_eq!(ctx.strategy.kind, RetryStrategyKind::Immediate);
        assert_eq!(ctx.analysis.category, ErrorCategory::Unknown);
    }
}
