use std::fmt::Write;

use strata_core::types::RetryStrategyKind;

use super::context::RetryContext;

/// Render a markdown brief handed to the node executor on a retry.
pub fn format_retry_brief(ctx: &RetryContext) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "## Retry attempt {} of {}", ctx.attempt, ctx.max_attempts);
    let _ = writeln!(out);
    let _ = writeln!(out, "**Task:** {}", ctx.task);

    if let Some(error) = &ctx.error_message {
        let _ = writeln!(
            out,
            "**Previous error** ({}): {}",
            ctx.analysis.category,
            error.trim()
        );
    }

    if !ctx.analysis.suggestions.is_empty() {
        let _ = writeln!(out, "\n### Suggested fixes");
        for s in &ctx.analysis.suggestions {
            let _ = writeln!(out, "- {}", s);
        }
    }

    if !ctx.user_suggestions.is_empty() {
        let _ = writeln!(out, "\n### User guidance");
        for s in &ctx.user_suggestions {
            let _ = writeln!(out, "- {}", s);
        }
    }

    let failed: Vec<_> = ctx.previous_attempts.iter().filter(|a| !a.succeeded).collect();
    if !failed.is_empty() {
        let _ = writeln!(out, "\n### Previous attempts");
        for a in failed {
            let category = a
                .error_category
                .map(|c| c.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            let _ = writeln!(
                out,
                "- Attempt {}: failed ({}) {}",
                a.attempt,
                category,
                a.error.as_deref().unwrap_or("").trim()
            );
        }
    }

    if !ctx.similar_errors.is_empty() {
        let _ = writeln!(out, "\n### Similar errors resolved before");
        for s in &ctx.similar_errors {
            let _ = writeln!(
                out,
                "- \"{}\" recovered on attempt {} after: {}",
                s.task, s.resolved_on_attempt, s.error
            );
        }
    }

    let strategy = match ctx.strategy.kind {
        RetryStrategyKind::UserGuided => "follow the user guidance".to_string(),
        RetryStrategyKind::ExponentialBackoff => {
            format!("exponential backoff ({}s delay)", ctx.strategy.delay_secs)
        }
        RetryStrategyKind::Immediate => "retry immediately".to_string(),
    };
    let _ = writeln!(
        out,
        "\n**Strategy:** {} | **Estimated success:** {:.0}%",
        strategy,
        ctx.success_probability * 100.0
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::analyzer::ErrorAnalyzer;
    use crate::retry::context::{select_strategy, SimilarError};
    use strata_core::types::{ErrorCategory, RetryAttempt};

    #[test]
    fn test_brief_sections() {
        let analysis = ErrorAnalyzer::new().analyze_error("KeyError: 'id'", None);
        let ctx = RetryContext {
            step_id: "s1".into(),
            task: "join tables".into(),
            attempt: 2,
            max_attempts: 3,
            error_message: Some("KeyError: 'id'".into()),
            analysis,
            previous_attempts: vec![RetryAttempt::failure(1, "KeyError: 'id'", ErrorCategory::KeyError)],
            user_feedback: Some("use customer_id".into()),
            user_suggestions: vec!["use customer_id".into()],
            similar_errors: vec![SimilarError {
                step_id: "s0".into(),
                task: "merge".into(),
                error: "KeyError: 'name'".into(),
                resolved_on_attempt: 2,
            }],
            strategy: select_strategy(2, true, 60),
            success_probability: 0.4,
        };

        let brief = format_retry_brief(&ctx);
        assert!(brief.starts_with("## Retry attempt 2 of 3"));
        assert!(brief.contains("**Previous error** (key_error): KeyError: 'id'"));
        assert!(brief.contains("### User guidance\n- use customer_id"));
        assert!(brief.contains("- Attempt 1: failed (key_error)"));
        assert!(brief.contains("recovered on attempt 2"));
        assert!(brief.contains("**Estimated success:** 40%"));
    }
}
