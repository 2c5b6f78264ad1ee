//! Chat-completions client and the LLM-backed generation backend.
//!
//! Talks to any OpenAI-compatible endpoint. Model output is treated as
//! hostile input: responses are stripped of markdown fences, the JSON
//! payload is located by brace matching, and anything that fails schema
//! parsing surfaces as [`GenerationError::InvalidResponse`] so the retry
//! policy can ask again.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use genpipe::{Artifacts, GeneratedFiles, GenerationBackend, GenerationError, GenerationRequest};

use crate::config::LlmEndpoint;

/// Thin client for `POST {base_url}/chat/completions`.
pub struct ChatClient {
    http: reqwest::Client,
    endpoint: LlmEndpoint,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

impl ChatClient {
    pub fn new(endpoint: LlmEndpoint) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint,
        }
    }

    /// One system+user exchange; returns the assistant text.
    pub async fn chat(&self, system: &str, user: &str) -> Result<String, GenerationError> {
        let url = format!("{}/chat/completions", self.endpoint.url.trim_end_matches('/'));
        let body = json!({
            "model": self.endpoint.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
            "temperature": 0.2,
        });

        let mut request = self.http.post(&url).json(&body);
        if let Some(key) = &self.endpoint.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| GenerationError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(GenerationError::Unavailable(format!(
                "endpoint returned {status}: {text}"
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::InvalidResponse(e.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| GenerationError::InvalidResponse("no choices in response".into()))
    }
}

/// Slice out the JSON object from model output that may carry markdown
/// fences or prose around it.
pub(crate) fn extract_json(text: &str) -> Result<&str, GenerationError> {
    let start = text
        .find('{')
        .ok_or_else(|| GenerationError::InvalidResponse("no JSON object in response".into()))?;
    let end = text
        .rfind('}')
        .ok_or_else(|| GenerationError::InvalidResponse("unterminated JSON object".into()))?;
    if end < start {
        return Err(GenerationError::InvalidResponse(
            "malformed JSON object in response".into(),
        ));
    }
    Ok(&text[start..=end])
}

const GENERATOR_SYSTEM: &str = "\
You are a senior software engineer. You produce complete, compilable source \
files for one scenario at a time. Respond with a single JSON object of the \
shape {\"files\": {\"relative/path.ext\": \"full file content\", ...}} and \
nothing else. Every file must be complete; never elide code.";

#[derive(Debug, Deserialize)]
struct FilesPayload {
    files: Artifacts,
}

/// [`GenerationBackend`] backed by the chat endpoint.
pub struct LlmGenerator {
    client: ChatClient,
}

impl LlmGenerator {
    pub fn new(client: ChatClient) -> Self {
        Self { client }
    }

    fn build_prompt(request: &GenerationRequest) -> String {
        let mut prompt = format!(
            "Language: {}\nScenario: {}\n\n{}\n",
            request.language, request.scenario_name, request.description
        );

        if request.is_correction() {
            prompt.push_str(&format!(
                "\nAttempt {} failed to compile. Fix the files below and return \
                 corrected versions of exactly these files.\n\nDiagnostics:\n",
                request.attempt - 1
            ));
            for diag in &request.diagnostics {
                prompt.push_str(&format!("- {diag}\n"));
            }
            prompt.push_str("\nCurrent files:\n");
            for (path, content) in &request.prior_files {
                prompt.push_str(&format!("--- {path} ---\n{content}\n"));
            }
        } else {
            prompt.push_str(
                "\nGenerate a minimal self-contained project implementing this \
                 scenario, including any build manifest the toolchain needs.\n",
            );
        }
        prompt
    }

    fn parse_files(text: &str) -> Result<GeneratedFiles, GenerationError> {
        let payload: FilesPayload = serde_json::from_str(extract_json(text)?)
            .map_err(|e| GenerationError::InvalidResponse(e.to_string()))?;
        if payload.files.is_empty() {
            return Err(GenerationError::InvalidResponse(
                "response contained no files".into(),
            ));
        }
        Ok(payload.files)
    }
}

#[async_trait]
impl GenerationBackend for LlmGenerator {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GeneratedFiles, GenerationError> {
        let prompt = Self::build_prompt(request);
        debug!(
            scenario = %request.scenario_id,
            attempt = request.attempt,
            correction = request.is_correction(),
            "Requesting generation"
        );
        let reply = self.client.chat(GENERATOR_SYSTEM, &prompt).await?;
        Self::parse_files(&reply)
    }
}
