//! Compiler and test-runner invocation.
//!
//! All commands run through `tokio::process::Command` with an enforced
//! timeout. On Unix the child gets its own process group so that a timeout
//! or cancellation kills the entire tree (compilers spawn helpers; test
//! runners spawn test binaries).
//!
//! A timeout or spawn failure is reported as a failed *result*, never an
//! `Err` — the feedback loop classifies and retries it like any other
//! compile failure.

use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::language::{CommandSpec, LanguageProfile};

/// Timeouts for build/test subprocess invocations.
#[derive(Debug, Clone)]
pub struct InvokerConfig {
    pub compile_timeout: Duration,
    pub test_timeout: Duration,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            compile_timeout: Duration::from_secs(300),
            test_timeout: Duration::from_secs(300),
        }
    }
}

/// Result of one build-command invocation.
#[derive(Debug, Clone)]
pub struct CompileResult {
    pub success: bool,
    /// Exit code when the process ran to completion.
    pub exit_code: Option<i32>,
    /// Combined stdout + stderr (or the timeout/spawn failure message).
    pub raw_output: String,
    pub duration_ms: u64,
}

/// Result of one test-command invocation.
#[derive(Debug, Clone)]
pub struct TestResult {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub raw_output: String,
    pub duration_ms: u64,
    /// Set when the test command itself malfunctioned (spawn failure,
    /// timeout, or non-zero exit with no recognizable test summary).
    /// Distinct from tests failing, which shows up in `failed`.
    pub execution_error: Option<String>,
}

impl TestResult {
    /// All tests ran and passed.
    pub fn all_green(&self) -> bool {
        self.execution_error.is_none() && self.failed == 0
    }
}

/// Seam between the feedback loop / orchestrator and real subprocesses.
/// Integration tests substitute a scripted fake.
#[async_trait]
pub trait BuildRunner: Send + Sync {
    async fn compile(&self, project_dir: &Path, profile: &LanguageProfile) -> CompileResult;
    async fn run_tests(&self, project_dir: &Path, profile: &LanguageProfile) -> TestResult;
}

/// Runs the profile's build/test commands as real subprocesses.
pub struct CommandInvoker {
    config: InvokerConfig,
    cancel: CancellationToken,
}

impl CommandInvoker {
    pub fn new(config: InvokerConfig) -> Self {
        Self::with_cancellation(config, CancellationToken::new())
    }

    /// Invoker whose in-flight subprocesses abort when `cancel` fires.
    pub fn with_cancellation(config: InvokerConfig, cancel: CancellationToken) -> Self {
        Self { config, cancel }
    }

    /// Run a command with the given timeout.
    ///
    /// Returns `Ok((exit_code, combined_output))` when the process ran to
    /// completion, `Err(message)` on spawn failure, timeout, or
    /// cancellation. `kill_on_drop` plus the process group ensures the
    /// child tree dies on the error paths.
    async fn run_command(
        &self,
        spec: &CommandSpec,
        project_dir: &Path,
        timeout: Duration,
    ) -> Result<(Option<i32>, String), String> {
        let mut cmd = tokio::process::Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(project_dir)
            .kill_on_drop(true);

        // New process group so descendants die with the child.
        #[cfg(unix)]
        cmd.process_group(0);

        debug!(program = %spec.program, dir = %project_dir.display(), "Running command");

        tokio::select! {
            _ = self.cancel.cancelled() => {
                Err(format!("{} aborted: run cancelled", spec.program))
            }
            res = tokio::time::timeout(timeout, cmd.output()) => match res {
                Ok(Ok(output)) => {
                    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    if !stderr.trim().is_empty() {
                        if !text.is_empty() {
                            text.push('\n');
                        }
                        text.push_str(&stderr);
                    }
                    Ok((output.status.code(), text))
                }
                Ok(Err(e)) => Err(format!("failed to execute {}: {e}", spec.program)),
                Err(_) => Err(format!(
                    "{} timed out after {}s",
                    spec.program,
                    timeout.as_secs()
                )),
            },
        }
    }
}

#[async_trait]
impl BuildRunner for CommandInvoker {
    async fn compile(&self, project_dir: &Path, profile: &LanguageProfile) -> CompileResult {
        let started = Instant::now();
        match self
            .run_command(&profile.build, project_dir, self.config.compile_timeout)
            .await
        {
            Ok((exit_code, raw_output)) => CompileResult {
                success: exit_code == Some(0),
                exit_code,
                raw_output,
                duration_ms: started.elapsed().as_millis() as u64,
            },
            Err(message) => CompileResult {
                success: false,
                exit_code: None,
                raw_output: message,
                duration_ms: started.elapsed().as_millis() as u64,
            },
        }
    }

    async fn run_tests(&self, project_dir: &Path, profile: &LanguageProfile) -> TestResult {
        let started = Instant::now();
        match self
            .run_command(&profile.test, project_dir, self.config.test_timeout)
            .await
        {
            Ok((exit_code, raw_output)) => {
                let (total, passed, failed, skipped) = profile.test_summary.extract(&raw_output);
                // Non-zero exit with nothing recognizable in the output means
                // the runner itself broke, not that tests failed.
                let execution_error = if total == 0 && exit_code != Some(0) {
                    Some(format!(
                        "test command exited with status {} but produced no test summary",
                        exit_code.map_or_else(|| "?".to_string(), |c| c.to_string())
                    ))
                } else {
                    None
                };
                TestResult {
                    total,
                    passed,
                    failed,
                    skipped,
                    raw_output,
                    duration_ms: started.elapsed().as_millis() as u64,
                    execution_error,
                }
            }
            Err(message) => TestResult {
                total: 0,
                passed: 0,
                failed: 0,
                skipped: 0,
                raw_output: String::new(),
                duration_ms: started.elapsed().as_millis() as u64,
                execution_error: Some(message),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::{CountRule, TestSummaryRules};
    use regex::Regex;

    /// Synthetic profile whose build/test commands are plain shell snippets.
    fn shell_profile(build: &str, test: &str) -> LanguageProfile {
        LanguageProfile {
            name: "shell",
            display_name: "Shell",
            extension: "sh",
            build: CommandSpec::new("sh", &["-c", build]),
            test: CommandSpec::new("sh", &["-c", test]),
            diagnostic_rules: vec![],
            test_summary: TestSummaryRules {
                total: None,
                passed: Some(CountRule::Capture(Regex::new(r"(\d+) passed").unwrap())),
                failed: Some(CountRule::Capture(Regex::new(r"(\d+) failed").unwrap())),
                skipped: None,
            },
        }
    }

    #[tokio::test]
    async fn successful_compile() {
        let invoker = CommandInvoker::new(InvokerConfig::default());
        let profile = shell_profile("echo built", "true");
        let dir = tempfile::tempdir().unwrap();

        let result = invoker.compile(dir.path(), &profile).await;
        assert!(result.success);
        assert_eq!(result.exit_code, Some(0));
        assert!(result.raw_output.contains("built"));
    }

    #[tokio::test]
    async fn failing_compile_captures_stderr() {
        let invoker = CommandInvoker::new(InvokerConfig::default());
        let profile = shell_profile("echo 'boom' >&2; exit 1", "true");
        let dir = tempfile::tempdir().unwrap();

        let result = invoker.compile(dir.path(), &profile).await;
        assert!(!result.success);
        assert_eq!(result.exit_code, Some(1));
        assert!(result.raw_output.contains("boom"));
    }

    #[tokio::test]
    async fn timeout_is_a_failed_result_not_an_error() {
        let config = InvokerConfig {
            compile_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let invoker = CommandInvoker::new(config);
        let profile = shell_profile("sleep 5", "true");
        let dir = tempfile::tempdir().unwrap();

        let result = invoker.compile(dir.path(), &profile).await;
        assert!(!result.success);
        assert!(result.exit_code.is_none());
        assert!(result.raw_output.contains("timed out"));
    }

    #[tokio::test]
    async fn spawn_failure_is_a_failed_result() {
        let invoker = CommandInvoker::new(InvokerConfig::default());
        let mut profile = shell_profile("true", "true");
        profile.build = CommandSpec::new("definitely-not-a-real-binary-xyz", &[]);
        let dir = tempfile::tempdir().unwrap();

        let result = invoker.compile(dir.path(), &profile).await;
        assert!(!result.success);
        assert!(result.raw_output.contains("failed to execute"));
    }

    #[tokio::test]
    async fn cancellation_aborts_in_flight_command() {
        let cancel = CancellationToken::new();
        let invoker = CommandInvoker::with_cancellation(InvokerConfig::default(), cancel.clone());
        let profile = shell_profile("sleep 5", "true");
        let dir = tempfile::tempdir().unwrap();

        cancel.cancel();
        let result = invoker.compile(dir.path(), &profile).await;
        assert!(!result.success);
        assert!(result.raw_output.contains("cancelled"));
    }

    #[tokio::test]
    async fn test_counts_parsed_from_output() {
        let invoker = CommandInvoker::new(InvokerConfig::default());
        let profile = shell_profile("true", "echo '3 passed, 1 failed'; exit 1");
        let dir = tempfile::tempdir().unwrap();

        let result = invoker.run_tests(dir.path(), &profile).await;
        assert_eq!(result.passed, 3);
        assert_eq!(result.failed, 1);
        assert_eq!(result.total, 4);
        assert!(result.execution_error.is_none());
        assert!(!result.all_green());
    }

    #[tokio::test]
    async fn broken_test_command_is_execution_error() {
        let invoker = CommandInvoker::new(InvokerConfig::default());
        let profile = shell_profile("true", "echo 'runner exploded' >&2; exit 2");
        let dir = tempfile::tempdir().unwrap();

        let result = invoker.run_tests(dir.path(), &profile).await;
        assert_eq!(result.total, 0);
        assert!(result.execution_error.is_some());
        assert!(!result.all_green());
    }
}
