//! Language profile registry.
//!
//! A [`LanguageProfile`] maps a normalized language identifier to build/test
//! commands, file conventions, diagnostic extraction rules, and test-summary
//! patterns. The registry is built once at startup and is read-only after
//! that, so it is safe to share behind an `Arc` across concurrent runs.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;

use crate::error::PipelineError;
use crate::model::DiagnosticCategory;

/// An external command plus its fixed arguments.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// One extraction rule for compiler/test output.
///
/// The regex uses named groups: `msg` (required), `file`, `line`, and `sev`,
/// all optional. When `category` is `None` the classifier derives the
/// category from the message text.
#[derive(Debug, Clone)]
pub struct DiagnosticRule {
    pub regex: Regex,
    pub category: Option<DiagnosticCategory>,
}

impl DiagnosticRule {
    fn new(pattern: &str, category: Option<DiagnosticCategory>) -> Self {
        Self {
            regex: Regex::new(pattern).unwrap(),
            category,
        }
    }
}

/// How to pull one test count out of runner output.
#[derive(Debug, Clone)]
pub enum CountRule {
    /// First capture group is the count (e.g. `(\d+) passed`).
    Capture(Regex),
    /// Count the number of matches (e.g. `^--- PASS:` lines from `go test -v`).
    Occurrences(Regex),
}

impl CountRule {
    fn capture(pattern: &str) -> Self {
        Self::Capture(Regex::new(pattern).unwrap())
    }

    fn occurrences(pattern: &str) -> Self {
        Self::Occurrences(Regex::new(pattern).unwrap())
    }

    /// Extract the count from `output`, `None` when the pattern is absent.
    pub fn count(&self, output: &str) -> Option<u32> {
        match self {
            Self::Capture(re) => re
                .captures(output)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse().ok()),
            Self::Occurrences(re) => {
                let n = re.find_iter(output).count() as u32;
                (n > 0).then_some(n)
            }
        }
    }
}

/// Test-summary extraction rules for one language's test runner.
///
/// Runners disagree about what they print: cargo and pytest report passed
/// and failed directly, surefire reports a total plus failures. Missing
/// counts are derived from the others in [`TestSummaryRules::extract`].
#[derive(Debug, Clone, Default)]
pub struct TestSummaryRules {
    pub total: Option<CountRule>,
    pub passed: Option<CountRule>,
    pub failed: Option<CountRule>,
    pub skipped: Option<CountRule>,
}

impl TestSummaryRules {
    /// Resolve `(total, passed, failed, skipped)` from raw runner output.
    ///
    /// Counts the output does not state are derived: `total` from the sum
    /// of the parts, `passed` from `total - failed - skipped`. Output that
    /// matches nothing yields all zeros.
    pub fn extract(&self, output: &str) -> (u32, u32, u32, u32) {
        let failed = self.failed.as_ref().and_then(|r| r.count(output)).unwrap_or(0);
        let skipped = self.skipped.as_ref().and_then(|r| r.count(output)).unwrap_or(0);
        let passed = self.passed.as_ref().and_then(|r| r.count(output));
        let total = self.total.as_ref().and_then(|r| r.count(output));

        let passed = passed.unwrap_or_else(|| {
            total.map_or(0, |t| t.saturating_sub(failed).saturating_sub(skipped))
        });
        let total = total.unwrap_or(passed + failed + skipped);
        (total, passed, failed, skipped)
    }
}

/// Build/test commands and output conventions for one language.
#[derive(Debug, Clone)]
pub struct LanguageProfile {
    /// Normalized identifier (registry key), e.g. `rust`, `csharp`.
    pub name: &'static str,
    pub display_name: &'static str,
    /// Primary source file extension, without the dot.
    pub extension: &'static str,
    pub build: CommandSpec,
    pub test: CommandSpec,
    pub diagnostic_rules: Vec<DiagnosticRule>,
    pub test_summary: TestSummaryRules,
}

/// Pure lookup table from normalized language name to profile.
pub struct LanguageRegistry {
    profiles: HashMap<&'static str, Arc<LanguageProfile>>,
}

impl LanguageRegistry {
    /// Registry seeded with the built-in profiles.
    pub fn builtin() -> Self {
        let mut profiles = HashMap::new();
        for profile in [
            rust_profile(),
            python_profile(),
            javascript_profile(),
            typescript_profile(),
            go_profile(),
            java_profile(),
            csharp_profile(),
        ] {
            profiles.insert(profile.name, Arc::new(profile));
        }
        Self { profiles }
    }

    /// Look up a profile by (possibly aliased, mixed-case) language name.
    pub fn get(&self, name: &str) -> Result<Arc<LanguageProfile>, PipelineError> {
        let key = normalize(name);
        self.profiles
            .get(key.as_str())
            .cloned()
            .ok_or_else(|| PipelineError::UnsupportedLanguage(name.to_string()))
    }

    /// Names of all registered profiles, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.profiles.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl Default for LanguageRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Map aliases and casing onto registry keys.
fn normalize(name: &str) -> String {
    let lowered = name.trim().to_lowercase();
    match lowered.as_str() {
        "c#" | "cs" | "dotnet" | ".net" => "csharp".to_string(),
        "js" | "node" | "nodejs" | "node.js" => "javascript".to_string(),
        "ts" => "typescript".to_string(),
        "golang" => "go".to_string(),
        "py" | "python3" => "python".to_string(),
        "rs" => "rust".to_string(),
        _ => lowered,
    }
}

fn rust_profile() -> LanguageProfile {
    LanguageProfile {
        name: "rust",
        display_name: "Rust",
        extension: "rs",
        build: CommandSpec::new("cargo", &["build"]),
        test: CommandSpec::new("cargo", &["test"]),
        diagnostic_rules: vec![
            DiagnosticRule::new(
                r"(?m)^(?P<sev>error|warning)(?:\[\w+\])?: (?P<msg>[^\n]+)\n +--> (?P<file>[^:\n]+):(?P<line>\d+)",
                None,
            ),
            DiagnosticRule::new(
                r"(?m)^error: failed to parse manifest at (?P<msg>[^\n]+)",
                Some(DiagnosticCategory::Configuration),
            ),
            DiagnosticRule::new(r"(?m)^error(?:\[\w+\])?: (?P<msg>[^\n]+)", None),
        ],
        test_summary: TestSummaryRules {
            total: None,
            passed: Some(CountRule::capture(r"(\d+) passed")),
            failed: Some(CountRule::capture(r"(\d+) failed")),
            skipped: Some(CountRule::capture(r"(\d+) ignored")),
        },
    }
}

fn python_profile() -> LanguageProfile {
    LanguageProfile {
        name: "python",
        display_name: "Python",
        extension: "py",
        build: CommandSpec::new("python3", &["-m", "compileall", "-q", "."]),
        test: CommandSpec::new("python3", &["-m", "pytest"]),
        diagnostic_rules: vec![
            DiagnosticRule::new(
                r#"(?s)File "(?P<file>[^"]+)", line (?P<line>\d+)[\s\S]{0,300}?(?P<msg>\w+Error: [^\n]+)"#,
                None,
            ),
            DiagnosticRule::new(r"(?m)^(?P<msg>\w+Error: [^\n]+)", None),
        ],
        test_summary: TestSummaryRules {
            total: None,
            passed: Some(CountRule::capture(r"(\d+) passed")),
            failed: Some(CountRule::capture(r"(\d+) failed")),
            skipped: Some(CountRule::capture(r"(\d+) skipped")),
        },
    }
}

fn javascript_profile() -> LanguageProfile {
    LanguageProfile {
        name: "javascript",
        display_name: "JavaScript",
        extension: "js",
        build: CommandSpec::new("npm", &["install", "--no-audit", "--no-fund"]),
        test: CommandSpec::new("npm", &["test", "--silent"]),
        diagnostic_rules: vec![
            DiagnosticRule::new(
                r"(?s)(?P<file>[\w./-]+\.(?:js|mjs|cjs)):(?P<line>\d+)[\s\S]{0,300}?(?P<msg>\w*Error: [^\n]+)",
                None,
            ),
            DiagnosticRule::new(
                r"(?m)^npm ERR! (?P<msg>[^\n]+)",
                Some(DiagnosticCategory::Configuration),
            ),
            DiagnosticRule::new(r"(?m)^(?P<msg>\w+Error: [^\n]+)", None),
        ],
        test_summary: TestSummaryRules {
            total: Some(CountRule::capture(r"(\d+) total")),
            passed: Some(CountRule::capture(r"(\d+) passed")),
            failed: Some(CountRule::capture(r"(\d+) failed")),
            skipped: Some(CountRule::capture(r"(\d+) skipped")),
        },
    }
}

fn typescript_profile() -> LanguageProfile {
    LanguageProfile {
        name: "typescript",
        display_name: "TypeScript",
        extension: "ts",
        build: CommandSpec::new("npx", &["tsc", "--noEmit"]),
        test: CommandSpec::new("npx", &["jest"]),
        diagnostic_rules: vec![
            DiagnosticRule::new(
                r"(?m)^(?P<file>[^\s(]+)\((?P<line>\d+),\d+\): (?P<sev>error|warning) (?P<msg>TS\d+: [^\n]+)",
                None,
            ),
            DiagnosticRule::new(r"(?m)^(?P<msg>error TS\d+: [^\n]+)", None),
        ],
        test_summary: TestSummaryRules {
            total: Some(CountRule::capture(r"(\d+) total")),
            passed: Some(CountRule::capture(r"(\d+) passed")),
            failed: Some(CountRule::capture(r"(\d+) failed")),
            skipped: Some(CountRule::capture(r"(\d+) skipped")),
        },
    }
}

fn go_profile() -> LanguageProfile {
    LanguageProfile {
        name: "go",
        display_name: "Go",
        extension: "go",
        build: CommandSpec::new("go", &["build", "./..."]),
        test: CommandSpec::new("go", &["test", "-v", "./..."]),
        diagnostic_rules: vec![
            DiagnosticRule::new(
                r"(?m)^(?P<file>[^\s:]+\.go):(?P<line>\d+)(?::\d+)?: (?P<msg>[^\n]+)",
                None,
            ),
            DiagnosticRule::new(
                r"(?m)^go: (?P<msg>[^\n]+)",
                Some(DiagnosticCategory::Dependency),
            ),
        ],
        test_summary: TestSummaryRules {
            total: None,
            passed: Some(CountRule::occurrences(r"(?m)^\s*--- PASS:")),
            failed: Some(CountRule::occurrences(r"(?m)^\s*--- FAIL:")),
            skipped: Some(CountRule::occurrences(r"(?m)^\s*--- SKIP:")),
        },
    }
}

fn java_profile() -> LanguageProfile {
    LanguageProfile {
        name: "java",
        display_name: "Java",
        extension: "java",
        build: CommandSpec::new("mvn", &["-q", "compile"]),
        test: CommandSpec::new("mvn", &["-q", "test"]),
        diagnostic_rules: vec![
            DiagnosticRule::new(
                r"(?m)^(?P<file>[^\s:\[]+\.java):(?:\[)?(?P<line>\d+)[,\]:]+ ?(?P<msg>[^\n]+)",
                None,
            ),
            DiagnosticRule::new(r"(?m)^\[ERROR\] (?P<msg>[^\n]+)", None),
        ],
        test_summary: TestSummaryRules {
            total: Some(CountRule::capture(r"Tests run: (\d+)")),
            passed: None,
            failed: Some(CountRule::capture(r"Failures: (\d+)")),
            skipped: Some(CountRule::capture(r"Skipped: (\d+)")),
        },
    }
}

fn csharp_profile() -> LanguageProfile {
    LanguageProfile {
        name: "csharp",
        display_name: "C#",
        extension: "cs",
        build: CommandSpec::new("dotnet", &["build", "--nologo"]),
        test: CommandSpec::new("dotnet", &["test", "--nologo"]),
        diagnostic_rules: vec![
            DiagnosticRule::new(
                r"(?m)^(?P<file>[^(\n]+?)\((?P<line>\d+),\d+\): (?P<sev>error|warning) (?P<msg>[A-Z]{1,5}\d+: [^\n]+)",
                None,
            ),
            DiagnosticRule::new(
                r"(?m)(?P<msg>error MSB\d+: [^\n]+)",
                Some(DiagnosticCategory::Configuration),
            ),
            DiagnosticRule::new(
                r"(?m)(?P<msg>error NU\d+: [^\n]+)",
                Some(DiagnosticCategory::Dependency),
            ),
        ],
        test_summary: TestSummaryRules {
            total: Some(CountRule::capture(r"Total:\s+(\d+)")),
            passed: Some(CountRule::capture(r"Passed:\s+(\d+)")),
            failed: Some(CountRule::capture(r"Failed:\s+(\d+)")),
            skipped: Some(CountRule::capture(r"Skipped:\s+(\d+)")),
        },
    }
}
