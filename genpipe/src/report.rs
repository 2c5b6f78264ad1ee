//! Final run report.
//!
//! Assembled once, after every scenario is terminal and tests have run.
//! The report is a pure function of the run's scenarios and aggregated
//! test counts, so re-assembling from the same inputs yields the same
//! report (modulo the generation timestamp).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{Scenario, ScenarioStatus};

/// Aggregated test counts across all compiled scenarios.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSummary {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
}

impl TestSummary {
    pub fn add(&mut self, total: u32, passed: u32, failed: u32, skipped: u32) {
        self.total += total;
        self.passed += passed;
        self.failed += failed;
        self.skipped += skipped;
    }
}

/// Per-scenario slice of the report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub id: String,
    pub name: String,
    pub status: ScenarioStatus,
    pub attempts: u32,
    /// Relative paths of the scenario's final artifact set.
    pub files: Vec<String>,
    /// Diagnostics from the last attempt (empty when compiled).
    pub diagnostics: Vec<String>,
}

/// End-of-run summary handed back to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub run_id: Uuid,
    pub language: String,
    pub scenarios: Vec<ScenarioReport>,
    pub tests: TestSummary,
    /// Percentage of executed tests that passed, 0.0 when none ran.
    pub quality_score: f64,
    /// Human-readable observations: failed scenarios, test caveats.
    pub findings: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

impl Report {
    pub fn compiled_count(&self) -> usize {
        self.scenarios
            .iter()
            .filter(|s| s.status == ScenarioStatus::Compiled)
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.scenarios
            .iter()
            .filter(|s| s.status == ScenarioStatus::Failed)
            .count()
    }
}

/// Build the report for a finished run.
///
/// `test_caveats` carries execution-error strings collected while running
/// tests (runner malfunctions, not test failures).
pub fn assemble(
    run_id: Uuid,
    language: &str,
    scenarios: &[Scenario],
    tests: TestSummary,
    test_caveats: Vec<String>,
) -> Report {
    let mut findings = Vec::new();

    for scenario in scenarios {
        if scenario.status == ScenarioStatus::Failed {
            let summary = scenario
                .diagnostics
                .first()
                .map(|d| d.to_string())
                .unwrap_or_else(|| "no diagnostics recorded".to_string());
            findings.push(format!(
                "scenario '{}' failed after {} attempts: {}",
                scenario.name, scenario.attempt_count, summary
            ));
        }
    }
    if tests.failed > 0 {
        findings.push(format!("{} of {} tests failed", tests.failed, tests.total));
    }
    findings.extend(test_caveats);

    let quality_score = if tests.total > 0 {
        f64::from(tests.passed) / f64::from(tests.total) * 100.0
    } else {
        0.0
    };

    Report {
        run_id,
        language: language.to_string(),
        scenarios: scenarios
            .iter()
            .map(|s| ScenarioReport {
                id: s.id.clone(),
                name: s.name.clone(),
                status: s.status,
                attempts: s.attempt_count,
                files: s.artifacts.keys().cloned().collect(),
                diagnostics: s.diagnostics.iter().map(|d| d.to_string()).collect(),
            })
            .collect(),
        tests,
        quality_score,
        findings,
        generated_at: Utc::now(),
    }
}
