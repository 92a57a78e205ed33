//! Adaptive retry: failure classification, retry context and attempt ledger.

pub mod analyzer;
pub mod brief;
pub mod context;

pub use analyzer::{category_weight, ErrorAnalysis, ErrorAnalyzer};
pub use brief::format_retry_brief;
pub use context::{
    parse_user_suggestions, select_strategy, RetryContext, RetryContextManager, RetryStats,
    RetryStrategy, SimilarError,
};
