//! Core data model: scenarios, attempts, and classified diagnostics.
//!
//! A `Scenario` is one discrete testable unit of functionality extracted
//! from the requirements. It is created by the analysis stage, mutated only
//! by the feedback loop, and never deleted — failed scenarios keep their
//! last-known code and diagnostics so the report can explain what happened.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Generated source artifacts: relative file path → content.
///
/// `BTreeMap` so snapshots serialize in a stable order.
pub type Artifacts = BTreeMap<String, String>;

/// Compilation status of a scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioStatus {
    /// No generation attempt has been made yet.
    NotAttempted,
    /// The feedback loop is driving generate/compile cycles.
    Compiling,
    /// Latest attempt compiled — terminal.
    Compiled,
    /// Attempt budget exhausted without compiling — terminal.
    Failed,
}

impl ScenarioStatus {
    /// Whether this status will not change further.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Compiled | Self::Failed)
    }
}

impl fmt::Display for ScenarioStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAttempted => write!(f, "not_attempted"),
            Self::Compiling => write!(f, "compiling"),
            Self::Compiled => write!(f, "compiled"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Severity of a classified diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

/// Likely-cause category of a classified diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticCategory {
    /// Malformed source: unexpected token, unclosed delimiter, bad indent.
    Syntax,
    /// Type mismatch or incompatible operation.
    Type,
    /// Unresolved import, missing module or package.
    Dependency,
    /// Build manifest / project configuration problem.
    Configuration,
    /// Nothing matched — carries the raw output for human inspection.
    Unknown,
}

impl fmt::Display for DiagnosticCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Syntax => write!(f, "syntax"),
            Self::Type => write!(f, "type"),
            Self::Dependency => write!(f, "dependency"),
            Self::Configuration => write!(f, "configuration"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// One classified compiler/test message. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Source file, relative to the scenario's project directory.
    /// `None` when the location could not be extracted.
    pub file: Option<String>,
    /// 1-indexed line number, when extractable.
    pub line: Option<usize>,
    pub severity: Severity,
    pub category: DiagnosticCategory,
    /// Raw message text.
    pub message: String,
    /// Suggested-fix hint, when the tool offered one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl Diagnostic {
    /// Fallback diagnostic for output no pattern matched.
    pub fn unknown(raw_output: &str) -> Self {
        Self {
            file: None,
            line: None,
            severity: Severity::Error,
            category: DiagnosticCategory::Unknown,
            message: raw_output.to_string(),
            hint: None,
        }
    }

    /// Human-readable `file:line` location, or `<unknown>`.
    pub fn location(&self) -> String {
        match (&self.file, self.line) {
            (Some(file), Some(line)) => format!("{file}:{line}"),
            (Some(file), None) => file.clone(),
            _ => "<unknown>".to_string(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.category,
            self.location(),
            self.message
        )
    }
}

/// One generate-then-compile cycle. Append-only; never mutated after
/// creation. This is the audit trail the report is built from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based attempt number.
    pub number: u32,
    /// Snapshot of the full artifact set compiled in this attempt.
    pub files: Artifacts,
    /// Whether compilation succeeded.
    pub success: bool,
    /// Raw compiler output.
    pub raw_output: String,
    /// Diagnostics classified from `raw_output` (empty on success).
    pub diagnostics: Vec<Diagnostic>,
    /// Wall-clock duration of the generate+compile cycle.
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// One discrete testable unit of functionality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub id: String,
    pub name: String,
    pub description: String,
    pub status: ScenarioStatus,
    /// Latest artifact set (last-known code is preserved on failure).
    pub artifacts: Artifacts,
    /// Number of attempts consumed. Always `<= max_attempts`.
    pub attempt_count: u32,
    /// Diagnostics from the most recent attempt.
    pub diagnostics: Vec<Diagnostic>,
    /// Full audit trail, one record per attempt.
    pub attempts: Vec<AttemptRecord>,
}

impl Scenario {
    pub fn new(id: impl Into<String>, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            status: ScenarioStatus::NotAttempted,
            artifacts: Artifacts::new(),
            attempt_count: 0,
            diagnostics: Vec::new(),
            attempts: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn latest_attempt(&self) -> Option<&AttemptRecord> {
        self.attempts.last()
    }
}
