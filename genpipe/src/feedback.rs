//! Bounded generate → compile → classify → regenerate loop.
//!
//! For one scenario, obtain compiling code within a fixed attempt budget,
//! using classified compiler diagnostics to focus regeneration:
//!
//! ```text
//! Scenario → Backend → artifacts → BuildRunner → classify ─┐
//!     ▲                                                    │
//!     └──────── selective regeneration ◄──────────────────-┘
//! ```
//!
//! Only the files implicated by diagnostics are regenerated on a retry;
//! the rest carry over unchanged. Full regeneration on every retry would
//! discard working code and make convergence non-monotonic. When a
//! diagnostic has no extractable location the whole file set is
//! regenerated that attempt (conservative fallback).

use std::collections::BTreeSet;
use std::path::{Component, Path};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backend::{generate_with_retry, GenerationBackend, GenerationRequest};
use crate::classifier::classify;
use crate::error::PipelineError;
use crate::invoke::BuildRunner;
use crate::language::LanguageProfile;
use crate::model::{Artifacts, AttemptRecord, Diagnostic, Scenario, ScenarioStatus};

/// Policy knobs for the feedback loop.
#[derive(Debug, Clone)]
pub struct FeedbackConfig {
    /// Attempt budget per scenario. Attempts are 1-indexed; a scenario
    /// never records more than this many attempts. A zero budget fails
    /// the scenario without calling the backend.
    pub max_attempts: u32,
    /// Extra backend calls after the first, per generation request.
    pub backend_retries: u32,
    /// Initial backoff delay between backend retries (doubles each retry).
    pub backend_backoff: Duration,
    /// Regenerate the whole file set when any diagnostic lacks a location.
    pub regenerate_all_on_unknown: bool,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backend_retries: 2,
            backend_backoff: Duration::from_millis(500),
            regenerate_all_on_unknown: true,
        }
    }
}

/// Drives one scenario to a terminal state.
pub struct FeedbackLoop {
    backend: Arc<dyn GenerationBackend>,
    runner: Arc<dyn BuildRunner>,
    config: FeedbackConfig,
    cancel: CancellationToken,
}

impl FeedbackLoop {
    pub fn new(
        backend: Arc<dyn GenerationBackend>,
        runner: Arc<dyn BuildRunner>,
        config: FeedbackConfig,
    ) -> Self {
        Self::with_cancellation(backend, runner, config, CancellationToken::new())
    }

    /// Loop that stops between cycles when `cancel` fires. Attempt records
    /// for completed cycles stay on the scenario.
    pub fn with_cancellation(
        backend: Arc<dyn GenerationBackend>,
        runner: Arc<dyn BuildRunner>,
        config: FeedbackConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            backend,
            runner,
            config,
            cancel,
        }
    }

    /// Run the loop until the scenario is terminal or the budget is spent.
    ///
    /// Never errs for ordinary compilation failure — that becomes scenario
    /// state. Errs only when the generation backend is unreachable after
    /// its own retry policy, leaving the scenario non-terminal for the
    /// caller to handle as a stage error.
    pub async fn run(
        &self,
        scenario: &mut Scenario,
        profile: &LanguageProfile,
        project_dir: &Path,
    ) -> Result<(), PipelineError> {
        // A zero budget allows no generation at all; the scenario is
        // terminal immediately instead of falling through the loop.
        if self.config.max_attempts == 0 {
            scenario.status = ScenarioStatus::Failed;
            info!(scenario = %scenario.id, "Scenario failed, zero attempt budget");
            return Ok(());
        }

        scenario.status = ScenarioStatus::Compiling;
        let mut files = Artifacts::new();
        // Files to regenerate next attempt; `None` means full generation.
        let mut regen_targets: Option<Vec<String>> = None;
        let mut diagnostics: Vec<Diagnostic> = Vec::new();

        for attempt in 1..=self.config.max_attempts {
            if self.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled("run cancelled".into()));
            }
            let cycle_start = Instant::now();

            let request = GenerationRequest {
                scenario_id: scenario.id.clone(),
                scenario_name: scenario.name.clone(),
                description: scenario.description.clone(),
                language: profile.name.to_string(),
                attempt,
                prior_files: match &regen_targets {
                    None => Artifacts::new(),
                    Some(targets) => targets
                        .iter()
                        .filter_map(|f| files.get(f).map(|c| (f.clone(), c.clone())))
                        .collect(),
                },
                diagnostics: diagnostics.clone(),
            };

            let generated = generate_with_retry(
                self.backend.as_ref(),
                &request,
                self.config.backend_retries,
                self.config.backend_backoff,
            )
            .await?;

            // Merge: regenerated files replace, untouched files carry over.
            files.extend(generated);
            write_artifacts(project_dir, &files)?;

            let compile = self.runner.compile(project_dir, profile).await;
            // A compile aborted by cancellation is not a genuine attempt.
            if self.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled("run cancelled".into()));
            }
            diagnostics = if compile.success {
                Vec::new()
            } else {
                classify(&compile.raw_output, profile)
            };

            scenario.attempt_count = attempt;
            scenario.artifacts = files.clone();
            scenario.diagnostics = diagnostics.clone();
            scenario.attempts.push(AttemptRecord {
                number: attempt,
                files: files.clone(),
                success: compile.success,
                raw_output: compile.raw_output.clone(),
                diagnostics: diagnostics.clone(),
                duration_ms: cycle_start.elapsed().as_millis() as u64,
                timestamp: Utc::now(),
            });

            if compile.success {
                scenario.status = ScenarioStatus::Compiled;
                info!(scenario = %scenario.id, attempt, "Scenario compiled");
                return Ok(());
            }

            debug!(
                scenario = %scenario.id,
                attempt,
                diagnostics = diagnostics.len(),
                "Compile failed"
            );

            if attempt == self.config.max_attempts {
                // Terminal: last-known code and diagnostics stay on the
                // scenario for the report.
                scenario.status = ScenarioStatus::Failed;
                info!(
                    scenario = %scenario.id,
                    attempts = attempt,
                    "Scenario failed, attempt budget exhausted"
                );
                return Ok(());
            }

            regen_targets = Some(self.select_regeneration(&files, &diagnostics));
        }

        unreachable!("loop returns at success or budget exhaustion");
    }

    /// Pick which files the next attempt regenerates.
    ///
    /// Diagnostics with a known file narrow the set; any diagnostic with no
    /// extractable location (or locations that match nothing we generated)
    /// widens back to the full file set.
    fn select_regeneration(&self, files: &Artifacts, diagnostics: &[Diagnostic]) -> Vec<String> {
        let all: Vec<String> = files.keys().cloned().collect();

        let location_unknown = diagnostics.iter().any(|d| d.file.is_none());
        if location_unknown && self.config.regenerate_all_on_unknown {
            return all;
        }

        let implicated: BTreeSet<String> = diagnostics
            .iter()
            .filter_map(|d| d.file.clone())
            .filter(|f| files.contains_key(f))
            .collect();

        if implicated.is_empty() {
            all
        } else {
            implicated.into_iter().collect()
        }
    }
}

/// Write the artifact set under `project_dir`, creating parent directories.
///
/// Paths are generated by an LLM: absolute paths and `..` components are
/// rejected rather than written.
fn write_artifacts(project_dir: &Path, files: &Artifacts) -> Result<(), PipelineError> {
    for (rel_path, content) in files {
        let rel = Path::new(rel_path);
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::RootDir))
        {
            return Err(PipelineError::Validation(format!(
                "refusing to write artifact outside project dir: {rel_path}"
            )));
        }
        let target = project_dir.join(rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        std::fs::write(&target, content)
            .with_context(|| format!("writing {}", target.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GenerationError;
    use crate::invoke::{CompileResult, TestResult};
    use crate::language::{CommandSpec, DiagnosticRule, TestSummaryRules};
    use crate::model::DiagnosticCategory;
    use async_trait::async_trait;
    use regex::Regex;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Profile whose compiler prints `ERR <file>:<line> <message>` lines.
    fn toy_profile() -> LanguageProfile {
        LanguageProfile {
            name: "toy",
            display_name: "Toy",
            extension: "toy",
            build: CommandSpec::new("true", &[]),
            test: CommandSpec::new("true", &[]),
            diagnostic_rules: vec![DiagnosticRule {
                regex: Regex::new(r"(?m)^ERR (?P<file>\S+):(?P<line>\d+) (?P<msg>.+)").unwrap(),
                category: Some(DiagnosticCategory::Syntax),
            }],
            test_summary: TestSummaryRules::default(),
        }
    }

    /// Backend that emits `<path> -> attempt N` content for requested files
    /// (all known files on a full request) and records every request.
    struct RecordingBackend {
        layout: Vec<&'static str>,
        requests: Mutex<Vec<GenerationRequest>>,
        fail_all: bool,
    }

    impl RecordingBackend {
        fn new(layout: Vec<&'static str>) -> Self {
            Self {
                layout,
                requests: Mutex::new(Vec::new()),
                fail_all: false,
            }
        }

        fn requests(&self) -> Vec<GenerationRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl GenerationBackend for RecordingBackend {
        async fn generate(
            &self,
            request: &GenerationRequest,
        ) -> Result<Artifacts, GenerationError> {
            self.requests.lock().unwrap().push(request.clone());
            if self.fail_all {
                return Err(GenerationError::Unavailable("backend down".into()));
            }
            let targets: Vec<String> = if request.prior_files.is_empty() {
                self.layout.iter().map(|s| s.to_string()).collect()
            } else {
                request.prior_files.keys().cloned().collect()
            };
            Ok(targets
                .into_iter()
                .map(|f| {
                    let content = format!("{} -> attempt {}", f, request.attempt);
                    (f, content)
                })
                .collect())
        }
    }

    /// Runner that replays a scripted sequence of compile results.
    struct ScriptedRunner {
        script: Mutex<VecDeque<CompileResult>>,
    }

    impl ScriptedRunner {
        fn new(results: Vec<CompileResult>) -> Self {
            Self {
                script: Mutex::new(results.into_iter().collect()),
            }
        }

        fn ok() -> CompileResult {
            CompileResult {
                success: true,
                exit_code: Some(0),
                raw_output: String::new(),
                duration_ms: 1,
            }
        }

        fn fail(output: &str) -> CompileResult {
            CompileResult {
                success: false,
                exit_code: Some(1),
                raw_output: output.to_string(),
                duration_ms: 1,
            }
        }
    }

    #[async_trait]
    impl BuildRunner for ScriptedRunner {
        async fn compile(&self, _dir: &Path, _profile: &LanguageProfile) -> CompileResult {
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .expect("scripted runner ran out of results")
        }

        async fn run_tests(&self, _dir: &Path, _profile: &LanguageProfile) -> TestResult {
            unimplemented!("feedback loop never runs tests")
        }
    }

    fn quick_config() -> FeedbackConfig {
        FeedbackConfig {
            backend_retries: 0,
            backend_backoff: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn scenario() -> Scenario {
        Scenario::new("s01", "Adder", "Add two numbers")
    }

    #[tokio::test]
    async fn compiles_on_first_attempt() {
        let backend = Arc::new(RecordingBackend::new(vec!["main.toy", "util.toy"]));
        let runner = Arc::new(ScriptedRunner::new(vec![ScriptedRunner::ok()]));
        let fb = FeedbackLoop::new(backend.clone(), runner, quick_config());

        let dir = tempfile::tempdir().unwrap();
        let mut s = scenario();
        fb.run(&mut s, &toy_profile(), dir.path()).await.unwrap();

        assert_eq!(s.status, ScenarioStatus::Compiled);
        assert_eq!(s.attempt_count, 1);
        assert_eq!(s.attempts.len(), 1);
        assert!(s.attempts[0].success);
        assert!(dir.path().join("main.toy").exists());
        assert_eq!(backend.requests().len(), 1);
    }

    #[tokio::test]
    async fn selective_regeneration_preserves_clean_files() {
        let backend = Arc::new(RecordingBackend::new(vec!["bad.toy", "good.toy"]));
        let runner = Arc::new(ScriptedRunner::new(vec![
            ScriptedRunner::fail("ERR bad.toy:3 unexpected token"),
            ScriptedRunner::ok(),
        ]));
        let fb = FeedbackLoop::new(backend.clone(), runner, quick_config());

        let dir = tempfile::tempdir().unwrap();
        let mut s = scenario();
        fb.run(&mut s, &toy_profile(), dir.path()).await.unwrap();

        assert_eq!(s.status, ScenarioStatus::Compiled);
        assert_eq!(s.attempt_count, 2);

        // The correction request asked only for the implicated file,
        // with the prior content and diagnostics attached.
        let requests = backend.requests();
        assert_eq!(requests.len(), 2);
        let correction = &requests[1];
        assert!(correction.is_correction());
        assert_eq!(
            correction.prior_files.keys().collect::<Vec<_>>(),
            vec!["bad.toy"]
        );
        assert_eq!(correction.diagnostics.len(), 1);
        assert_eq!(correction.diagnostics[0].file.as_deref(), Some("bad.toy"));

        // Clean file carried over byte-identical between attempts.
        assert_eq!(
            s.attempts[0].files.get("good.toy"),
            s.attempts[1].files.get("good.toy")
        );
        // Implicated file was regenerated.
        assert_eq!(
            s.attempts[1].files.get("bad.toy").unwrap(),
            "bad.toy -> attempt 2"
        );
    }

    #[tokio::test]
    async fn unknown_location_regenerates_everything() {
        let backend = Arc::new(RecordingBackend::new(vec!["a.toy", "b.toy"]));
        let runner = Arc::new(ScriptedRunner::new(vec![
            ScriptedRunner::fail("linker exploded in a way nobody can parse"),
            ScriptedRunner::ok(),
        ]));
        let fb = FeedbackLoop::new(backend.clone(), runner, quick_config());

        let dir = tempfile::tempdir().unwrap();
        let mut s = scenario();
        fb.run(&mut s, &toy_profile(), dir.path()).await.unwrap();

        let requests = backend.requests();
        let correction = &requests[1];
        // Conservative fallback: all files requested for regeneration.
        assert_eq!(
            correction.prior_files.keys().collect::<Vec<_>>(),
            vec!["a.toy", "b.toy"]
        );
        assert_eq!(
            correction.diagnostics[0].category,
            DiagnosticCategory::Unknown
        );
    }

    #[tokio::test]
    async fn budget_exhaustion_is_terminal_failure() {
        let backend = Arc::new(RecordingBackend::new(vec!["main.toy"]));
        let runner = Arc::new(ScriptedRunner::new(vec![
            ScriptedRunner::fail("ERR main.toy:1 unexpected token"),
            ScriptedRunner::fail("ERR main.toy:1 unexpected token"),
            ScriptedRunner::fail("ERR main.toy:1 unexpected token"),
        ]));
        let fb = FeedbackLoop::new(backend, runner, quick_config());

        let dir = tempfile::tempdir().unwrap();
        let mut s = scenario();
        fb.run(&mut s, &toy_profile(), dir.path()).await.unwrap();

        assert_eq!(s.status, ScenarioStatus::Failed);
        assert_eq!(s.attempt_count, 3);
        assert_eq!(s.attempts.len(), 3);
        // Last-known code and diagnostics preserved for the report.
        assert!(!s.artifacts.is_empty());
        assert_eq!(s.diagnostics.len(), 1);
        assert!(s.attempts.iter().all(|a| !a.success));
    }

    #[tokio::test]
    async fn zero_attempt_budget_fails_without_generating() {
        let backend = Arc::new(RecordingBackend::new(vec!["main.toy"]));
        let runner = Arc::new(ScriptedRunner::new(vec![]));
        let config = FeedbackConfig {
            max_attempts: 0,
            ..quick_config()
        };
        let fb = FeedbackLoop::new(backend.clone(), runner, config);

        let dir = tempfile::tempdir().unwrap();
        let mut s = scenario();
        fb.run(&mut s, &toy_profile(), dir.path()).await.unwrap();

        assert_eq!(s.status, ScenarioStatus::Failed);
        assert_eq!(s.attempt_count, 0);
        assert!(s.attempts.is_empty());
        assert!(backend.requests().is_empty());
    }

    #[tokio::test]
    async fn unreachable_backend_propagates_typed_error() {
        let mut backend = RecordingBackend::new(vec!["main.toy"]);
        backend.fail_all = true;
        let runner = Arc::new(ScriptedRunner::new(vec![]));
        let fb = FeedbackLoop::new(Arc::new(backend), runner, quick_config());

        let dir = tempfile::tempdir().unwrap();
        let mut s = scenario();
        let err = fb
            .run(&mut s, &toy_profile(), dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::BackendExhausted { .. }));
        // No attempt was recorded: compilation never ran.
        assert!(s.attempts.is_empty());
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_generating() {
        let backend = Arc::new(RecordingBackend::new(vec!["main.toy"]));
        let runner = Arc::new(ScriptedRunner::new(vec![]));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let fb = FeedbackLoop::with_cancellation(backend.clone(), runner, quick_config(), cancel);

        let dir = tempfile::tempdir().unwrap();
        let mut s = scenario();
        let err = fb
            .run(&mut s, &toy_profile(), dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled(_)));
        assert!(backend.requests().is_empty());
        assert!(s.attempts.is_empty());
    }

    #[test]
    fn artifact_paths_are_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let mut files = Artifacts::new();
        files.insert("../escape.txt".into(), "nope".into());
        let err = write_artifacts(dir.path(), &files).unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));

        let mut files = Artifacts::new();
        files.insert("/etc/passwd".into(), "nope".into());
        assert!(write_artifacts(dir.path(), &files).is_err());
    }

    #[test]
    fn nested_artifact_paths_create_directories() {
        let dir = tempfile::tempdir().unwrap();
        let mut files = Artifacts::new();
        files.insert("src/deep/module.toy".into(), "content".into());
        write_artifacts(dir.path(), &files).unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("src/deep/module.toy")).unwrap(),
            "content"
        );
    }
}
