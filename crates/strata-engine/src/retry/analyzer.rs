use regex::Regex;
use serde::Serialize;
use tracing::warn;

use strata_core::types::ErrorCategory;

/// Classification of one failure message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorAnalysis {
    pub category: ErrorCategory,
    /// The pattern that matched, if any.
    pub pattern: Option<String>,
    pub suggestions: Vec<String>,
    /// Whether this is a well-known failure with standard remedies.
    pub common_error: bool,
}

/// Ordered pattern table; the first match wins.
const PATTERNS: &[(ErrorCategory, &str)] = &[
    (
        ErrorCategory::FileNotFound,
        r"(?i)(no such file or directory|file not found|filenotfounderror|cannot find (the )?file|\benoent\b)",
    ),
    (
        ErrorCategory::ApiError,
        r"(?i)(api error|apierror|rate limit|quota exceeded|invalid api key|status code:? [45]\d\d|http [45]\d\d)",
    ),
    (
        ErrorCategory::Timeout,
        r"(?i)(timed out|timeout|deadline exceeded)",
    ),
    (
        ErrorCategory::ImportError,
        r"(?i)(importerror|modulenotfounderror|no module named|cannot import name|unresolved import)",
    ),
    (
        ErrorCategory::TypeError,
        r"(?i)(typeerror|mismatched types|type mismatch|unsupported operand type)",
    ),
    (
        ErrorCategory::ValueError,
        r"(?i)(valueerror|invalid value|invalid literal|could not convert)",
    ),
    (
        ErrorCategory::KeyError,
        r"(?i)(keyerror|key not found|missing key)",
    ),
    (
        ErrorCategory::AttributeError,
        r"(?i)(attributeerror|has no attribute|no method named|no field)",
    ),
    (
        ErrorCategory::IndexError,
        r"(?i)(indexerror|index out of (range|bounds)|list index)",
    ),
    (
        ErrorCategory::PermissionError,
        r"(?i)(permission denied|permissionerror|access denied|operation not permitted|\beacces\b)",
    ),
    (
        ErrorCategory::ConnectionError,
        r"(?i)(connection (refused|reset|aborted|error)|connectionerror|failed to connect|network is unreachable|\beconnrefused\b)",
    ),
    (
        ErrorCategory::MemoryError,
        r"(?i)(memoryerror|out of memory|cannot allocate memory|\boom\b)",
    ),
];

fn suggestions_for(category: ErrorCategory) -> &'static [&'static str] {
    match category {
        ErrorCategory::FileNotFound => &[
            "Verify the file path is correct and relative to the working directory",
            "Create the file or directory before it is read",
            "List the directory to confirm the expected name",
        ],
        ErrorCategory::ApiError => &[
            "Check the API credentials and endpoint",
            "Back off before retrying if the service is rate limiting",
        ],
        ErrorCategory::Timeout => &[
            "Split the task into smaller pieces",
            "Increase the task timeout if the work is legitimately slow",
        ],
        ErrorCategory::ImportError => &[
            "Install the missing package or module",
            "Check the module name and import path for typos",
        ],
        ErrorCategory::TypeError => &[
            "Check argument types against the function signature",
            "Convert values to the expected type before use",
        ],
        ErrorCategory::ValueError => &[
            "Validate input values before processing",
            "Check the expected format of the data",
        ],
        ErrorCategory::KeyError => &[
            "Check that the key exists before accessing it",
            "Print the available keys to find the correct name",
        ],
        ErrorCategory::AttributeError => &[
            "Check the object type and the attribute name",
            "Confirm the object was initialised as expected",
        ],
        ErrorCategory::IndexError => &[
            "Check collection bounds before indexing",
            "Handle the empty collection case",
        ],
        ErrorCategory::PermissionError => &[
            "Check file and directory permissions",
            "Write to a location the process owns",
        ],
        ErrorCategory::ConnectionError => &[
            "Check that the remote service is reachable",
            "Retry after a short delay",
        ],
        ErrorCategory::MemoryError => &[
            "Process the data in smaller batches",
            "Release large intermediate values early",
        ],
        ErrorCategory::Unknown => &[
            "Read the full error output for the root cause",
            "Try a different approach to the task",
        ],
    }
}

/// Relative likelihood that a retry fixes an error of this category.
pub fn category_weight(category: ErrorCategory) -> f64 {
    match category {
        ErrorCategory::ImportError => 0.9,
        ErrorCategory::FileNotFound | ErrorCategory::KeyError | ErrorCategory::IndexError => 0.8,
        ErrorCategory::TypeError
        | ErrorCategory::ValueError
        | ErrorCategory::AttributeError
        | ErrorCategory::Timeout => 0.7,
        ErrorCategory::ApiError | ErrorCategory::ConnectionError | ErrorCategory::Unknown => 0.6,
        ErrorCategory::PermissionError | ErrorCategory::MemoryError => 0.5,
    }
}

/// Classifies failure messages with a compiled regex table.
pub struct ErrorAnalyzer {
    patterns: Vec<(ErrorCategory, Regex)>,
}

impl ErrorAnalyzer {
    pub fn new() -> Self {
        let patterns = PATTERNS
            .iter()
            .filter_map(|(category, pattern)| match Regex::new(pattern) {
                Ok(re) => Some((*category, re)),
                Err(e) => {
                    warn!(category = %category, error = %e, "Invalid error pattern, skipping");
                    None
                }
            })
            .collect();
        Self { patterns }
    }

    /// Classify an error message, falling back to the traceback when the
    /// message alone is not recognised.
    pub fn analyze_error(&self, message: &str, traceback: Option<&str>) -> ErrorAnalysis {
        let found = self
            .match_text(message)
            .or_else(|| traceback.and_then(|tb| self.match_text(tb)));

        match found {
            Some((category, pattern)) => ErrorAnalysis {
                category,
                pattern: Some(pattern),
                suggestions: owned(suggestions_for(category)),
                common_error: true,
            },
            None => ErrorAnalysis {
                category: ErrorCategory::Unknown,
                pattern: None,
                suggestions: owned(suggestions_for(ErrorCategory::Unknown)),
                common_error: false,
            },
        }
    }

    /// Shortcut for the category alone.
    pub fn classify(&self, message: &str) -> ErrorCategory {
        self.analyze_error(message, None).category
    }

    fn match_text(&self, text: &str) -> Option<(ErrorCategory, String)> {
        self.patterns
            .iter()
            .find(|(_, re)| re.is_match(text))
            .map(|(category, re)| (*category, re.as_str().to_string()))
    }

    /// `1/(attempt+1)`, boosted 1.5x by user feedback, scaled by the category
    /// weight, clamped to [0, 1] and rounded to two decimals.
    pub fn estimate_success_probability(
        &self,
        attempt: u32,
        category: ErrorCategory,
        has_feedback: bool,
    ) -> f64 {
        let mut p = 1.0 / (attempt as f64 + 1.0);
        if has_feedback {
            p *= 1.5;
        }
        p *= category_weight(category);
        (p.clamp(0.0, 1.0) * 100.0).round() / 100.0
    }
}

impl Default for ErrorAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
