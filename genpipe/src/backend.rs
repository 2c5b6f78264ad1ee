//! Generation backend boundary.
//!
//! The backend is a black box that turns a scenario description (plus
//! optional correction context) into source files. The real implementation
//! lives in the orchestration crate; tests use scripted fakes.

use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::error::{GenerationError, PipelineError};
use crate::model::{Artifacts, Diagnostic};

/// File set returned by one generation call: relative path → content.
pub type GeneratedFiles = Artifacts;

/// One generation request.
///
/// Attempt 1 carries no correction context. Later attempts carry
/// `prior_files` (only the files being regenerated, with their prior
/// content) and the diagnostics from the failed compile.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub scenario_id: String,
    pub scenario_name: String,
    pub description: String,
    /// Normalized language profile name.
    pub language: String,
    /// 1-based attempt number this request is for.
    pub attempt: u32,
    /// Prior content of the files to regenerate. Empty on attempt 1.
    pub prior_files: Artifacts,
    /// Diagnostics from the most recent failed compile. Empty on attempt 1.
    pub diagnostics: Vec<Diagnostic>,
}

impl GenerationRequest {
    /// Whether this is a correction request rather than initial generation.
    pub fn is_correction(&self) -> bool {
        self.attempt > 1
    }
}

/// Black-box code generator.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn generate(&self, request: &GenerationRequest)
        -> Result<GeneratedFiles, GenerationError>;
}

/// Call the backend with bounded exponential backoff.
///
/// `retries` is the number of *extra* calls after the first (default policy:
/// 2, so at most 3 calls). The delay starts at `base_delay` and doubles.
/// When the budget is exhausted the failure surfaces as
/// [`PipelineError::BackendExhausted`].
pub async fn generate_with_retry(
    backend: &dyn GenerationBackend,
    request: &GenerationRequest,
    retries: u32,
    base_delay: Duration,
) -> Result<GeneratedFiles, PipelineError> {
    let mut delay = base_delay;
    let attempts = retries + 1;
    let mut last_error = String::new();

    for call in 1..=attempts {
        match backend.generate(request).await {
            Ok(files) => return Ok(files),
            Err(e) => {
                warn!(
                    scenario = %request.scenario_id,
                    call,
                    error = %e,
                    "Generation call failed"
                );
                last_error = e.to_string();
                if call < attempts {
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }

    Err(PipelineError::BackendExhausted {
        attempts,
        message: last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `fail_first` calls, then returns one file.
    struct FlakyBackend {
        fail_first: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl GenerationBackend for FlakyBackend {
        async fn generate(
            &self,
            _request: &GenerationRequest,
        ) -> Result<GeneratedFiles, GenerationError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_first {
                Err(GenerationError::Unavailable("connection refused".into()))
            } else {
                let mut files = GeneratedFiles::new();
                files.insert("main.rs".into(), "fn main() {}".into());
                Ok(files)
            }
        }
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            scenario_id: "s01".into(),
            scenario_name: "Adder".into(),
            description: "Add two numbers".into(),
            language: "rust".into(),
            attempt: 1,
            prior_files: Artifacts::new(),
            diagnostics: vec![],
        }
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_failure() {
        let backend = FlakyBackend {
            fail_first: 2,
            calls: AtomicU32::new(0),
        };
        let files = generate_with_retry(&backend, &request(), 2, Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_budget_surfaces_typed_error() {
        let backend = FlakyBackend {
            fail_first: 10,
            calls: AtomicU32::new(0),
        };
        let err = generate_with_retry(&backend, &request(), 2, Duration::from_millis(1))
            .await
            .unwrap_err();
        match err {
            PipelineError::BackendExhausted { attempts, message } => {
                assert_eq!(attempts, 3);
                assert!(message.contains("connection refused"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn correction_detection() {
        let mut req = request();
        assert!(!req.is_correction());
        req.attempt = 2;
        assert!(req.is_correction());
    }
}
