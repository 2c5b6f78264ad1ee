//! Requirements analysis.
//!
//! Turns free-form requirements text into a target language plus a list of
//! discrete testable scenarios. The LLM answers in a fixed camelCase JSON
//! contract; parsing and deduplication are deterministic so the same reply
//! always yields the same scenario list.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use genpipe::{PipelineError, Scenario};

use crate::llm::{extract_json, ChatClient};

/// Outcome of requirements analysis.
#[derive(Debug, Clone)]
pub struct AnalysisResult {
    /// Language name as the analyzer reported it (registry normalizes).
    pub language: String,
    pub product_name: String,
    pub version: Option<String>,
    pub scenarios: Vec<Scenario>,
}

/// Analysis seam; tests substitute a scripted fake.
#[async_trait]
pub trait RequirementsAnalyzer: Send + Sync {
    async fn analyze(&self, requirements: &str) -> Result<AnalysisResult, PipelineError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAnalysis {
    language: String,
    #[serde(default)]
    product_name: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    scenario_list: Vec<RawScenario>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawScenario {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    purpose: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    expected_outcome: Option<String>,
}

impl RawScenario {
    /// Rough size of the useful text, used to keep the most detailed of
    /// duplicate scenarios.
    fn detail(&self) -> usize {
        self.description.as_deref().unwrap_or("").len()
            + self.purpose.as_deref().unwrap_or("").len()
            + self.expected_outcome.as_deref().unwrap_or("").len()
    }

    /// Collapse the optional fields into one description for generation.
    fn full_description(&self) -> String {
        let mut text = self.description.clone().unwrap_or_default();
        if let Some(purpose) = &self.purpose {
            if !purpose.is_empty() {
                text.push_str(&format!("\nPurpose: {purpose}"));
            }
        }
        if let Some(outcome) = &self.expected_outcome {
            if !outcome.is_empty() {
                text.push_str(&format!("\nExpected outcome: {outcome}"));
            }
        }
        if let (Some(category), Some(priority)) = (&self.category, &self.priority) {
            text.push_str(&format!("\nCategory: {category}, priority: {priority}"));
        }
        text.trim().to_string()
    }
}

/// Parse an analyzer reply into a validated [`AnalysisResult`].
///
/// Duplicate scenario names keep the most detailed entry; first-seen order
/// is preserved. Scenario ids are assigned `s01`, `s02`, ... after
/// deduplication.
pub fn parse_analysis(text: &str) -> Result<AnalysisResult, PipelineError> {
    let json = extract_json(text)
        .map_err(|e| PipelineError::BackendTransient(format!("analysis reply: {e}")))?;
    let raw: RawAnalysis = serde_json::from_str(json)
        .map_err(|e| PipelineError::BackendTransient(format!("analysis reply: {e}")))?;

    if raw.language.trim().is_empty() {
        return Err(PipelineError::BackendTransient(
            "analysis reply named no language".into(),
        ));
    }

    let mut deduped: Vec<RawScenario> = Vec::new();
    for scenario in raw.scenario_list {
        if scenario.name.trim().is_empty() {
            continue;
        }
        match deduped.iter_mut().find(|s| s.name == scenario.name) {
            Some(existing) => {
                if scenario.detail() > existing.detail() {
                    *existing = scenario;
                }
            }
            None => deduped.push(scenario),
        }
    }

    if deduped.is_empty() {
        return Err(PipelineError::BackendTransient(
            "analysis reply contained no scenarios".into(),
        ));
    }

    let scenarios = deduped
        .iter()
        .enumerate()
        .map(|(i, raw)| Scenario::new(format!("s{:02}", i + 1), &raw.name, raw.full_description()))
        .collect();

    Ok(AnalysisResult {
        language: raw.language.trim().to_string(),
        product_name: raw
            .product_name
            .clone()
            .unwrap_or_else(|| "unnamed".to_string()),
        version: raw.version,
        scenarios,
    })
}

const ANALYZER_SYSTEM: &str = "\
You are a requirements analyst. Given product requirements, identify the \
implementation language and the discrete testable scenarios. Respond with a \
single JSON object: {\"language\": ..., \"productName\": ..., \"version\": \
..., \"scenarioList\": [{\"name\": ..., \"description\": ..., \"purpose\": \
..., \"category\": ..., \"priority\": ..., \"expectedOutcome\": ...}]} and \
nothing else. Scenario names must be unique and each scenario must be \
independently implementable.";

/// [`RequirementsAnalyzer`] backed by the chat endpoint.
pub struct LlmAnalyzer {
    client: ChatClient,
}

impl LlmAnalyzer {
    pub fn new(client: ChatClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RequirementsAnalyzer for LlmAnalyzer {
    async fn analyze(&self, requirements: &str) -> Result<AnalysisResult, PipelineError> {
        if requirements.trim().is_empty() {
            return Err(PipelineError::Validation("empty requirements text".into()));
        }

        debug!(chars = requirements.len(), "Analyzing requirements");
        let reply = self
            .client
            .chat(ANALYZER_SYSTEM, requirements)
            .await
            .map_err(|e| PipelineError::BackendTransient(e.to_string()))?;

        let result = parse_analysis(&reply)?;
        info!(
            language = %result.language,
            scenarios = result.scenarios.len(),
            "Requirements analyzed"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPLY: &str = r#"{
        "language": "Python",
        "productName": "calculator",
        "version": "1.0",
        "scenarioList": [
            {
                "name": "Addition",
                "description": "Add two numbers",
                "purpose": "Basic arithmetic",
                "category": "functional",
                "priority": "high",
                "expectedOutcome": "Correct sum returned"
            },
            {
                "name": "Division by zero",
                "description": "Dividing by zero reports an error",
                "expectedOutcome": "Error message, no crash"
            }
        ]
    }"#;

    #[test]
    fn parses_the_full_contract() {
        let result = parse_analysis(REPLY).unwrap();
        assert_eq!(result.language, "Python");
        assert_eq!(result.product_name, "calculator");
        assert_eq!(result.version.as_deref(), Some("1.0"));
        assert_eq!(result.scenarios.len(), 2);
        assert_eq!(result.scenarios[0].id, "s01");
        assert_eq!(result.scenarios[0].name, "Addition");
        assert!(result.scenarios[0].description.contains("Basic arithmetic"));
        assert!(result.scenarios[1]
            .description
            .contains("Error message, no crash"));
    }

    #[test]
    fn parses_reply_wrapped_in_prose_and_fences() {
        let wrapped = format!("Here is the analysis:\n```json\n{REPLY}\n```");
        let result = parse_analysis(&wrapped).unwrap();
        assert_eq!(result.scenarios.len(), 2);
    }

    #[test]
    fn duplicate_names_keep_the_most_detailed() {
        let reply = r#"{
            "language": "go",
            "scenarioList": [
                {"name": "Login", "description": "short"},
                {"name": "Login", "description": "a much longer and more detailed description", "expectedOutcome": "session established"},
                {"name": "Logout", "description": "end the session"}
            ]
        }"#;
        let result = parse_analysis(reply).unwrap();
        assert_eq!(result.scenarios.len(), 2);
        assert!(result.scenarios[0].description.contains("more detailed"));
        assert_eq!(result.scenarios[1].name, "Logout");
    }

    #[test]
    fn missing_scenarios_is_retriable() {
        let err = parse_analysis(r#"{"language": "rust", "scenarioList": []}"#).unwrap_err();
        assert!(err.is_retriable());
    }

    #[test]
    fn garbage_reply_is_retriable() {
        let err = parse_analysis("I'd rather not.").unwrap_err();
        assert!(err.is_retriable());
    }

    #[test]
    fn nameless_scenarios_are_skipped() {
        let reply = r#"{
            "language": "rust",
            "scenarioList": [
                {"name": "", "description": "anonymous"},
                {"name": "Real", "description": "counts"}
            ]
        }"#;
        let result = parse_analysis(reply).unwrap();
        assert_eq!(result.scenarios.len(), 1);
        assert_eq!(result.scenarios[0].name, "Real");
    }
}
