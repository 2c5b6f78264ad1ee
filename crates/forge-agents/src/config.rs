use std::path::PathBuf;
use std::time::Duration;

/// Chat-completions endpoint for analysis and code generation.
#[derive(Debug, Clone)]
pub struct LlmEndpoint {
    /// Base URL of an OpenAI-compatible API, e.g. `http://localhost:8080/v1`.
    pub url: String,
    pub model: String,
    /// Bearer token; local endpoints usually need none.
    pub api_key: Option<String>,
}

/// Top-level orchestrator configuration.
///
/// Everything has an environment override so deployments tune behavior
/// without a config file: `FORGE_LLM_URL`, `FORGE_LLM_MODEL`,
/// `FORGE_LLM_API_KEY`, `FORGE_MAX_ATTEMPTS`, `FORGE_WORKSPACE`.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub llm: LlmEndpoint,
    /// Feedback-loop attempt budget per scenario.
    pub max_attempts: u32,
    /// Extra LLM calls after the first, per generation request.
    pub backend_retries: u32,
    pub compile_timeout: Duration,
    pub test_timeout: Duration,
    /// Parent directory for per-run workspaces.
    pub workspace_root: PathBuf,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            llm: LlmEndpoint {
                url: std::env::var("FORGE_LLM_URL")
                    .unwrap_or_else(|_| "http://localhost:8080/v1".into()),
                model: std::env::var("FORGE_LLM_MODEL")
                    .unwrap_or_else(|_| "qwen2.5-coder-32b-instruct".into()),
                api_key: std::env::var("FORGE_LLM_API_KEY").ok(),
            },
            max_attempts: std::env::var("FORGE_MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            backend_retries: 2,
            compile_timeout: Duration::from_secs(300),
            test_timeout: Duration::from_secs(300),
            workspace_root: std::env::var("FORGE_WORKSPACE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| std::env::temp_dir()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.backend_retries, 2);
        assert!(config.llm.url.starts_with("http"));
    }
}
