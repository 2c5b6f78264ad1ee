//! Workflow orchestrator.
//!
//! Owns the run lifecycle: accept requirements, analyze them into
//! scenarios, drive every scenario through the feedback loop, run tests
//! against whatever compiled, and assemble the report. One spawned task per
//! run; status reads never block the pipeline because consumers only see
//! detached snapshots.
//!
//! A run always reaches a terminal stage. Failed scenarios are ordinary
//! results and the run keeps going; only stage-level errors (unreachable
//! backend, unsupported language, bad input) fail the run.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use genpipe::report::{self, TestSummary};
use genpipe::{
    BuildRunner, CommandInvoker, FeedbackConfig, FeedbackLoop, GenerationBackend, InvokerConfig,
    LanguageRegistry, PipelineError, ScenarioStatus,
};

use crate::analyzer::{AnalysisResult, LlmAnalyzer, RequirementsAnalyzer};
use crate::config::OrchestratorConfig;
use crate::events::{ObserverHub, RunEvent, RunObserver};
use crate::llm::{ChatClient, LlmGenerator};
use crate::run::{Run, RunSnapshot, RunStore, SharedRun};
use crate::state::RunStage;

/// Parameters for starting a run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub requirements: String,
    /// Per-scenario attempt budget override.
    pub max_attempts: Option<u32>,
}

pub struct WorkflowOrchestrator {
    config: OrchestratorConfig,
    registry: LanguageRegistry,
    store: RunStore,
    hub: Arc<ObserverHub>,
    analyzer: Arc<dyn RequirementsAnalyzer>,
    backend: Arc<dyn GenerationBackend>,
    runner: Arc<dyn BuildRunner>,
    cancel_tokens: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl WorkflowOrchestrator {
    /// Orchestrator with explicit collaborators. Tests inject fakes here.
    pub fn new(
        config: OrchestratorConfig,
        analyzer: Arc<dyn RequirementsAnalyzer>,
        backend: Arc<dyn GenerationBackend>,
        runner: Arc<dyn BuildRunner>,
    ) -> Self {
        Self {
            config,
            registry: LanguageRegistry::builtin(),
            store: RunStore::new(),
            hub: Arc::new(ObserverHub::new()),
            analyzer,
            backend,
            runner,
            cancel_tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Production wiring: LLM analyzer and generator against the configured
    /// endpoint, real subprocess invoker.
    pub fn from_config(config: OrchestratorConfig) -> Self {
        let analyzer = Arc::new(LlmAnalyzer::new(ChatClient::new(config.llm.clone())));
        let backend = Arc::new(LlmGenerator::new(ChatClient::new(config.llm.clone())));
        let runner = Arc::new(CommandInvoker::new(InvokerConfig {
            compile_timeout: config.compile_timeout,
            test_timeout: config.test_timeout,
        }));
        Self::new(config, analyzer, backend, runner)
    }

    /// Validate the request, register the run, and spawn its pipeline task.
    /// Returns immediately with the run id.
    pub async fn start(self: &Arc<Self>, request: RunRequest) -> Result<Uuid, PipelineError> {
        if request.requirements.trim().is_empty() {
            return Err(PipelineError::Validation("empty requirements text".into()));
        }

        let id = Uuid::new_v4();
        let max_attempts = request
            .max_attempts
            .unwrap_or(self.config.max_attempts)
            .max(1);
        self.store
            .insert(Run::new(id, request.requirements, max_attempts))
            .await;

        let cancel = CancellationToken::new();
        self.cancel_tokens.lock().unwrap().insert(id, cancel.clone());
        self.hub.publish(RunEvent::RunStarted {
            run_id: id,
            timestamp: Utc::now(),
        });
        info!(run_id = %id, max_attempts, "Run accepted");

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator.execute(id, cancel).await;
        });

        Ok(id)
    }

    /// Detached snapshot of a run, `None` for an unknown id. Safe to call
    /// at any time from any task.
    pub async fn get_status(&self, id: Uuid) -> Option<RunSnapshot> {
        self.store.snapshot(id).await
    }

    /// Request cancellation. Returns `false` for an unknown or already
    /// finished run. The pipeline stops at the next check point; attempt
    /// records made so far stay on the run.
    pub fn cancel(&self, id: Uuid) -> bool {
        match self.cancel_tokens.lock().unwrap().get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn observe(&self, observer: Arc<dyn RunObserver>) -> Uuid {
        self.hub.attach(observer)
    }

    pub fn unobserve(&self, token: Uuid) -> bool {
        self.hub.detach(token)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.hub.subscribe()
    }

    async fn execute(&self, id: Uuid, cancel: CancellationToken) {
        let Some(run) = self.store.get(id).await else {
            return;
        };

        match self.drive(id, &run, &cancel).await {
            Ok(()) => {}
            Err(PipelineError::Cancelled(_)) => self.finish_cancelled(id, &run).await,
            Err(e) => self.finish_failed(id, &run, e).await,
        }
        self.cancel_tokens.lock().unwrap().remove(&id);
    }

    async fn drive(
        &self,
        id: Uuid,
        run: &SharedRun,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        self.advance(id, run, RunStage::Analyzing, None).await?;
        self.progress(id, run, 5, "analyzing requirements").await;

        let requirements = run.read().await.requirements.clone();
        let analysis = self.analyze_with_retry(&requirements).await?;
        let profile = self.registry.get(&analysis.language)?;

        {
            let mut r = run.write().await;
            r.language = Some(profile.name.to_string());
            r.product_name = Some(analysis.product_name.clone());
            r.scenarios = analysis.scenarios.clone();
            r.updated_at = Utc::now();
        }
        self.hub.publish(RunEvent::AnalysisCompleted {
            run_id: id,
            language: profile.name.to_string(),
            scenario_count: analysis.scenarios.len(),
            timestamp: Utc::now(),
        });
        self.progress(id, run, 15, "scenarios identified").await;

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled("run cancelled".into()));
        }
        self.advance(id, run, RunStage::Generating, None).await?;

        let max_attempts = run.read().await.max_attempts;
        let feedback = FeedbackLoop::with_cancellation(
            self.backend.clone(),
            self.runner.clone(),
            FeedbackConfig {
                max_attempts,
                backend_retries: self.config.backend_retries,
                ..Default::default()
            },
            cancel.clone(),
        );

        let mut scenarios = analysis.scenarios;
        let total = scenarios.len();
        let workspace = self.config.workspace_root.join(format!("forge-run-{id}"));

        for index in 0..total {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled("run cancelled".into()));
            }

            let mut scenario = scenarios[index].clone();
            let dir = workspace.join(&scenario.id);
            std::fs::create_dir_all(&dir).map_err(|e| {
                PipelineError::Internal(anyhow::anyhow!("creating {}: {e}", dir.display()))
            })?;

            self.hub.publish(RunEvent::ScenarioStarted {
                run_id: id,
                scenario_id: scenario.id.clone(),
                name: scenario.name.clone(),
                timestamp: Utc::now(),
            });

            let result = feedback.run(&mut scenario, &profile, &dir).await;

            // Persist whatever the loop recorded, even on error paths, so
            // snapshots after cancellation keep the attempt history.
            scenarios[index] = scenario.clone();
            {
                let mut r = run.write().await;
                r.scenarios[index] = scenario.clone();
                r.updated_at = Utc::now();
            }
            result?;

            self.hub.publish(RunEvent::ScenarioCompleted {
                run_id: id,
                scenario_id: scenario.id.clone(),
                status: scenario.status,
                attempts: scenario.attempt_count,
                timestamp: Utc::now(),
            });
            let percent = 15 + ((index + 1) * 70 / total) as u8;
            self.progress(
                id,
                run,
                percent,
                &format!("scenario {}/{} finished", index + 1, total),
            )
            .await;
        }

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled("run cancelled".into()));
        }
        self.advance(id, run, RunStage::Testing, None).await?;
        self.progress(id, run, 85, "running tests").await;

        let mut summary = TestSummary::default();
        let mut caveats = Vec::new();
        for scenario in &scenarios {
            if scenario.status != ScenarioStatus::Compiled {
                continue;
            }
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled("run cancelled".into()));
            }
            let dir = workspace.join(&scenario.id);
            let result = self.runner.run_tests(&dir, &profile).await;
            summary.add(result.total, result.passed, result.failed, result.skipped);
            if let Some(err) = result.execution_error {
                warn!(run_id = %id, scenario = %scenario.id, error = %err, "Test execution caveat");
                caveats.push(format!("scenario '{}': {err}", scenario.name));
            }
        }
        self.hub.publish(RunEvent::TestsCompleted {
            run_id: id,
            summary,
            timestamp: Utc::now(),
        });
        self.progress(id, run, 90, "tests finished").await;

        self.advance(id, run, RunStage::Reporting, None).await?;
        let report = report::assemble(id, profile.name, &scenarios, summary, caveats);
        let quality_score = report.quality_score;
        {
            let mut r = run.write().await;
            r.report = Some(report);
            r.updated_at = Utc::now();
        }

        self.progress(id, run, 100, "run completed").await;
        // Last state mutation: snapshots taken after this are stable.
        self.advance(id, run, RunStage::Completed, None).await?;
        self.hub.publish(RunEvent::RunCompleted {
            run_id: id,
            quality_score,
            timestamp: Utc::now(),
        });
        info!(run_id = %id, quality_score, "Run completed");
        Ok(())
    }

    /// Analysis with bounded retry; only transient errors are retried.
    async fn analyze_with_retry(
        &self,
        requirements: &str,
    ) -> Result<AnalysisResult, PipelineError> {
        let calls = self.config.backend_retries + 1;
        let mut delay = Duration::from_millis(500);

        for call in 1..=calls {
            match self.analyzer.analyze(requirements).await {
                Ok(analysis) => return Ok(analysis),
                Err(e) if e.is_retriable() && call < calls => {
                    warn!(call, error = %e, "Analysis failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("loop returns on final call");
    }

    async fn advance(
        &self,
        id: Uuid,
        run: &SharedRun,
        to: RunStage,
        reason: Option<String>,
    ) -> Result<(), PipelineError> {
        let from;
        {
            let mut r = run.write().await;
            from = r.stage();
            r.machine
                .advance(to, reason)
                .map_err(|e| PipelineError::Internal(anyhow::anyhow!(e)))?;
            r.updated_at = Utc::now();
        }
        self.hub.publish(RunEvent::StageChanged {
            run_id: id,
            from,
            to,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    async fn progress(&self, id: Uuid, run: &SharedRun, percent: u8, message: &str) {
        {
            let mut r = run.write().await;
            r.progress_percent = percent;
            r.updated_at = Utc::now();
        }
        self.hub.publish(RunEvent::ProgressUpdated {
            run_id: id,
            percent,
            message: message.to_string(),
            timestamp: Utc::now(),
        });
    }

    async fn finish_failed(&self, id: Uuid, run: &SharedRun, error: PipelineError) {
        let message = error.to_string();
        error!(run_id = %id, error = %message, "Run failed");
        {
            let mut r = run.write().await;
            let _ = r.machine.advance(RunStage::Failed, Some(message.clone()));
            r.error = Some(message.clone());
            r.updated_at = Utc::now();
        }
        self.hub.publish(RunEvent::RunFailed {
            run_id: id,
            error: message,
            timestamp: Utc::now(),
        });
    }

    /// Cancellation is a failed terminal with reason `cancelled`, keeping
    /// whatever scenario state and attempt records exist.
    async fn finish_cancelled(&self, id: Uuid, run: &SharedRun) {
        info!(run_id = %id, "Run cancelled");
        {
            let mut r = run.write().await;
            let _ = r.machine.advance(RunStage::Failed, Some("cancelled".into()));
            r.error = Some("cancelled".into());
            r.updated_at = Utc::now();
        }
        self.hub.publish(RunEvent::RunCancelled {
            run_id: id,
            timestamp: Utc::now(),
        });
    }
}
