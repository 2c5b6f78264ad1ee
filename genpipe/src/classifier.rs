//! Compiler-output classification.
//!
//! Turns raw, language-specific compiler/test text into typed
//! [`Diagnostic`]s using the profile's extraction rules plus a
//! cross-language keyword table for the likely-cause category.
//!
//! Totality: for any non-empty failing output the result has at least one
//! diagnostic — downstream selective regeneration relies on that. When no
//! pattern matches, the full raw output (capped) is wrapped into a single
//! `unknown` diagnostic. Classification is a pure function of
//! (output, profile), so attempt records are reproducible.

use std::sync::LazyLock;

use regex::Regex;

use crate::language::LanguageProfile;
use crate::model::{Diagnostic, DiagnosticCategory, Severity};

/// Cap on the message carried by the `unknown` fallback diagnostic.
const UNKNOWN_MESSAGE_CAP: usize = 4000;

/// Compiled keyword patterns for category derivation. Checked in order:
/// dependency before type before syntax, because dependency messages often
/// contain the word "expected" and type messages the word "found".
static DEPENDENCY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(unresolved import|cannot find (crate|module|package|name|symbol|type|value)|no module named|ModuleNotFoundError|ImportError|package [^\s]+ does not exist|could not resolve|cannot be resolved|missing go\.sum entry|E0432|E0433|TS2307)",
    )
    .unwrap()
});

static TYPE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(mismatched types|type mismatch|incompatible type|cannot convert|is not assignable to|trait bound|TypeError|E0308|TS2322|cannot use .* as .* value)",
    )
    .unwrap()
});

static SYNTAX_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(syntax error|SyntaxError|IndentationError|unexpected (token|end|eof|character|indent)|expected [^\n]*(found|but)|expected one of|unclosed|unterminated|';' expected|invalid syntax|missing ;)",
    )
    .unwrap()
});

static CONFIGURATION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(manifest|Cargo\.toml|package\.json|tsconfig|pom\.xml|\.csproj|go\.mod|MSB\d+|npm ERR|misconfigur|configuration)",
    )
    .unwrap()
});

/// Derive a category from message text alone.
fn categorize(message: &str) -> DiagnosticCategory {
    if DEPENDENCY_PATTERN.is_match(message) {
        DiagnosticCategory::Dependency
    } else if TYPE_PATTERN.is_match(message) {
        DiagnosticCategory::Type
    } else if SYNTAX_PATTERN.is_match(message) {
        DiagnosticCategory::Syntax
    } else if CONFIGURATION_PATTERN.is_match(message) {
        DiagnosticCategory::Configuration
    } else {
        DiagnosticCategory::Unknown
    }
}

/// Normalize a captured file path: compilers prefix `./` inconsistently.
fn normalize_file(path: &str) -> String {
    path.trim().trim_start_matches("./").to_string()
}

/// Classify raw compiler/test output into diagnostics.
///
/// Rules run in profile order; a message already captured by an earlier
/// rule is skipped so location-bearing rules win over bare fallbacks.
pub fn classify(raw_output: &str, profile: &LanguageProfile) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    let mut seen_messages: Vec<String> = Vec::new();

    for rule in &profile.diagnostic_rules {
        for caps in rule.regex.captures_iter(raw_output) {
            let message = match caps.name("msg") {
                Some(m) => m.as_str().trim().to_string(),
                None => continue,
            };
            if seen_messages.iter().any(|m| m == &message) {
                continue;
            }

            let severity = match caps.name("sev").map(|m| m.as_str()) {
                Some("warning") => Severity::Warning,
                _ => Severity::Error,
            };
            let category = rule.category.unwrap_or_else(|| categorize(&message));

            seen_messages.push(message.clone());
            diagnostics.push(Diagnostic {
                file: caps.name("file").map(|m| normalize_file(m.as_str())),
                line: caps.name("line").and_then(|m| m.as_str().parse().ok()),
                severity,
                category,
                message,
                hint: None,
            });
        }
    }

    if diagnostics.is_empty() && !raw_output.trim().is_empty() {
        let mut truncated = raw_output.to_string();
        if truncated.len() > UNKNOWN_MESSAGE_CAP {
            let mut cut = UNKNOWN_MESSAGE_CAP;
            while !truncated.is_char_boundary(cut) {
                cut -= 1;
            }
            truncated.truncate(cut);
            truncated.push_str("\n[truncated]");
        }
        diagnostics.push(Diagnostic::unknown(&truncated));
    }

    diagnostics
}
