//! LLM workflow orchestration on top of the `genpipe` pipeline.
//!
//! `genpipe` is deterministic machinery; this crate adds the two LLM
//! stages (requirements analysis, code generation), the run lifecycle, and
//! the observer surface.

pub mod analyzer;
pub mod config;
pub mod events;
pub mod llm;
pub mod orchestrator;
pub mod run;
pub mod state;

pub use analyzer::{AnalysisResult, LlmAnalyzer, RequirementsAnalyzer};
pub use config::{LlmEndpoint, OrchestratorConfig};
pub use events::{ObserverHub, RunEvent, RunObserver};
pub use llm::{ChatClient, LlmGenerator};
pub use orchestrator::{RunRequest, WorkflowOrchestrator};
pub use run::{Run, RunSnapshot, RunStore};
pub use state::{RunStage, StageMachine, TransitionRecord};
