//! Run lifecycle state machine with explicit states and legal transition
//! guards.
//!
//! The orchestrator calls `advance()` to move a run between stages. Each
//! call validates the transition against the table below and records it in
//! the transition log, so a finished run carries an auditable sequence of
//! stages with timings.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// The set of run stages.
///
/// Every run starts at `Pending` and terminates at either `Completed` or
/// `Failed`. Cancellation is a `Failed` terminal with reason `cancelled`.
///
/// Status consumers may briefly observe `reporting` between the test stage
/// and `completed` while the final report is assembled; treat it like
/// `testing` if only the coarse phase matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    /// Accepted, not yet started.
    Pending,
    /// Requirements analysis in flight.
    Analyzing,
    /// Scenarios are being driven through the feedback loop.
    Generating,
    /// Running tests against compiled scenarios.
    Testing,
    /// Assembling the final report.
    Reporting,
    /// Report available — terminal.
    Completed,
    /// A stage error or cancellation stopped the run — terminal.
    Failed,
}

impl RunStage {
    /// Whether this is a terminal stage (no further transitions allowed).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Analyzing => write!(f, "analyzing"),
            Self::Generating => write!(f, "generating"),
            Self::Testing => write!(f, "testing"),
            Self::Reporting => write!(f, "reporting"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Legal transitions between run stages:
/// ```text
/// Pending → Analyzing
/// Analyzing → Generating
/// Generating → Testing
/// Testing → Reporting
/// Reporting → Completed
/// ```
/// Any non-terminal stage may additionally move to `Failed`.
fn is_legal_transition(from: RunStage, to: RunStage) -> bool {
    use RunStage::*;

    if to == Failed && !from.is_terminal() {
        return true;
    }

    matches!(
        (from, to),
        (Pending, Analyzing)
            | (Analyzing, Generating)
            | (Generating, Testing)
            | (Testing, Reporting)
            | (Reporting, Completed)
    )
}

/// A single recorded stage transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: RunStage,
    pub to: RunStage,
    /// Milliseconds since the machine was created.
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Error returned when an illegal transition is attempted.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Illegal stage transition: {from} -> {to}")]
pub struct IllegalTransition {
    pub from: RunStage,
    pub to: RunStage,
}

/// Tracks the current stage, enforces legal transitions, and keeps a
/// complete transition log for the status snapshot.
#[derive(Debug)]
pub struct StageMachine {
    current: RunStage,
    created_at: Instant,
    log: Vec<TransitionRecord>,
}

impl StageMachine {
    pub fn new() -> Self {
        Self {
            current: RunStage::Pending,
            created_at: Instant::now(),
            log: Vec::new(),
        }
    }

    pub fn current(&self) -> RunStage {
        self.current
    }

    pub fn log(&self) -> &[TransitionRecord] {
        &self.log
    }

    /// Move to `to`, recording the transition.
    pub fn advance(
        &mut self,
        to: RunStage,
        reason: Option<String>,
    ) -> Result<(), IllegalTransition> {
        if !is_legal_transition(self.current, to) {
            return Err(IllegalTransition {
                from: self.current,
                to,
            });
        }

        let record = TransitionRecord {
            from: self.current,
            to,
            elapsed_ms: self.created_at.elapsed().as_millis() as u64,
            reason,
        };
        tracing::debug!(from = %record.from, to = %record.to, "Stage transition");
        self.log.push(record);
        self.current = to;
        Ok(())
    }
}

impl Default for StageMachine {
    fn default() -> Self {
        Self::new()
    }
}
