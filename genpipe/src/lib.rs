//! Deterministic generation pipeline.
//!
//! This crate holds everything below the LLM orchestration layer:
//! - The data model for scenarios, attempts, and classified diagnostics
//! - The language profile registry (build/test commands, diagnostic rules)
//! - Compiler and test-runner invocation with enforced timeouts
//! - Compiler-output classification into typed diagnostics
//! - The bounded generate → compile → classify → regenerate loop
//! - Final report assembly
//!
//! Everything here is deterministic given its inputs except the two external
//! seams: the [`backend::GenerationBackend`] trait (an LLM or a test fake)
//! and the [`invoke::BuildRunner`] trait (real subprocesses or a test fake).

pub mod backend;
pub mod classifier;
pub mod error;
pub mod feedback;
pub mod invoke;
pub mod language;
pub mod model;
pub mod report;

pub use backend::{generate_with_retry, GeneratedFiles, GenerationBackend, GenerationRequest};
pub use classifier::classify;
pub use error::{GenerationError, PipelineError, RetryCategory};
pub use feedback::{FeedbackConfig, FeedbackLoop};
pub use invoke::{BuildRunner, CommandInvoker, CompileResult, InvokerConfig, TestResult};
pub use language::{LanguageProfile, LanguageRegistry};
pub use model::{
    Artifacts, AttemptRecord, Diagnostic, DiagnosticCategory, Scenario, ScenarioStatus, Severity,
};
pub use report::{Report, ScenarioReport, TestSummary};
