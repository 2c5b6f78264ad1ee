//! Pipeline error taxonomy with retry classification.
//!
//! Callers decide how to react by querying `retry_category()` instead of
//! string matching.
//!
//! ## Retry categories
//!
//! | Category   | Effect on the run                                  |
//! |------------|----------------------------------------------------|
//! | Transient  | retried with bounded backoff, then run fails       |
//! | FailFast   | run fails immediately, no retry                    |
//! | Recorded   | absorbed into the report, run keeps going          |
//! | Cancelled  | terminal, recorded with reason `cancelled`         |

use std::fmt;

use thiserror::Error;

/// Classification used by the orchestrator to decide whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryCategory {
    /// Network / backend hiccup — retry with exponential backoff.
    Transient,
    /// Bad input or unresolvable configuration — surface immediately.
    FailFast,
    /// Expected operational failure — goes into the report, never thrown on.
    Recorded,
    /// Explicitly cancelled by the caller — terminal.
    Cancelled,
}

impl RetryCategory {
    pub fn is_retriable(self) -> bool {
        matches!(self, Self::Transient)
    }
}

impl fmt::Display for RetryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::FailFast => write!(f, "fail_fast"),
            Self::Recorded => write!(f, "recorded"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Unified error type for pipeline operations.
///
/// Ordinary compilation failure is *not* an error — it is state on the
/// scenario. Only conditions that prevent the pipeline from making progress
/// are represented here.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Bad input, e.g. empty requirements text.
    #[error("Invalid input: {0}")]
    Validation(String),

    /// The analysis stage resolved a language with no registered profile.
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    /// LLM / network hiccup — safe to retry.
    #[error("Backend transient failure: {0}")]
    BackendTransient(String),

    /// The backend's own retry budget was exhausted.
    #[error("Backend unreachable after {attempts} attempts: {message}")]
    BackendExhausted { attempts: u32, message: String },

    /// The test command itself malfunctioned (distinct from tests failing).
    #[error("Test execution failure: {0}")]
    TestExecution(String),

    /// The run was explicitly cancelled.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Any other error that doesn't fit the above categories.
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl PipelineError {
    /// Classify this error for retry logic.
    pub fn retry_category(&self) -> RetryCategory {
        match self {
            Self::Validation(_) => RetryCategory::FailFast,
            Self::UnsupportedLanguage(_) => RetryCategory::FailFast,
            Self::BackendTransient(_) => RetryCategory::Transient,
            Self::BackendExhausted { .. } => RetryCategory::FailFast,
            Self::TestExecution(_) => RetryCategory::Recorded,
            Self::Cancelled(_) => RetryCategory::Cancelled,
            Self::Internal(_) => RetryCategory::FailFast,
        }
    }

    /// Returns `true` if the caller may retry after this error.
    pub fn is_retriable(&self) -> bool {
        self.retry_category().is_retriable()
    }
}

/// Error surfaced by a [`crate::backend::GenerationBackend`].
///
/// Both variants are retriable; the retry budget lives in
/// [`crate::backend::generate_with_retry`], not in the backend itself.
#[derive(Debug, Error)]
pub enum GenerationError {
    /// The backend could not be reached (network, timeout, HTTP 5xx).
    #[error("Generation backend unavailable: {0}")]
    Unavailable(String),

    /// The backend responded but the payload failed schema parsing.
    #[error("Generation response unparseable: {0}")]
    InvalidResponse(String),
}
