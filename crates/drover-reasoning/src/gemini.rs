use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use drover_core::machine::SystemInfo;
use drover_core::task::{Subtask, Validation};

use crate::error::ReasoningError;
use crate::extract;
use crate::prompts;
use crate::service::ReasoningService;
use crate::types::TaskPlan;

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_MODEL: &str = "gemini-2.0-flash";

/// Reasoning backend over the Gemini generateContent API.
pub struct GeminiReasoning {
    client: Client,
    api_key: String,
    model: String,
}

impl GeminiReasoning {
    pub fn new(api_key: impl Into<String>, model: Option<&str>) -> Self {
        Self {
            client: Client::builder()
                .connect_timeout(CONNECT_TIMEOUT)
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("failed to build HTTP client"),
            api_key: api_key.into(),
            model: model.unwrap_or(DEFAULT_MODEL).to_owned(),
        }
    }

    /// One non-streaming completion round-trip.
    async fn generate(&self, prompt: &str) -> Result<String, ReasoningError> {
        let url = format!(
            "{API_BASE}/{model}:generateContent?key={key}",
            model = self.model,
            key = self.api_key
        );

        let body = GenerateRequest {
            contents: vec![Content {
                parts: vec![Part { text: prompt.to_owned() }],
            }],
            generation_config: GenerationConfig { temperature: 0.1 },
        };

        let response = self.client.post(&url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ReasoningError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: GenerateResponse = response.json().await?;
        let text = parsed
            .candidates
            .into_iter()
            .next()
            .map(|c| {
                c.content
                    .parts
                    .into_iter()
                    .map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        if text.is_empty() {
            return Err(ReasoningError::EmptyResponse);
        }
        debug!(model = %self.model, chars = text.len(), "reasoning response received");
        Ok(text)
    }
}

#[async_trait]
impl ReasoningService for GeminiReasoning {
    #[instrument(skip(self, system_info), fields(model = %self.model))]
    async fn decompose(
        &self,
        prompt: &str,
        system_info: &SystemInfo,
    ) -> Result<TaskPlan, ReasoningError> {
        let text = self.generate(&prompts::decomposition(prompt, system_info)).await?;

        match extract::extract_json(&text).and_then(|j| serde_json::from_str::<TaskPlan>(j).ok()) {
            Some(plan) if !plan.subtasks.is_empty() => Ok(plan),
            _ => {
                warn!("unparsable decomposition, falling back to single-step plan");
                Ok(extract::fallback_plan(prompt))
            }
        }
    }

    #[instrument(skip(self, output), fields(model = %self.model, exit_code))]
    async fn validate(
        &self,
        command: &str,
        output: &str,
        exit_code: i32,
        expected_output: &str,
    ) -> Result<Validation, ReasoningError> {
        let text = self
            .generate(&prompts::validation(command, output, exit_code, expected_output))
            .await?;

        match extract::extract_json(&text).and_then(|j| serde_json::from_str::<Validation>(j).ok())
        {
            Some(validation) => Ok(validation),
            None => {
                warn!("unparsable validation verdict, using heuristic fallback");
                Ok(extract::fallback_validation(command, output, exit_code))
            }
        }
    }

    #[instrument(skip(self, subtasks, _system_info), fields(model = %self.model))]
    async fn summarize(
        &self,
        request: &str,
        subtasks: &[Subtask],
        _system_info: &SystemInfo,
    ) -> Result<String, ReasoningError> {
        let text = self.generate(&prompts::summary(request, subtasks)).await?;
        Ok(text.trim().to_owned())
    }
}

#[derive(Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Serialize, Deserialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Serialize, Deserialize)]
struct Part {
    text: String,
}

#[derive(Serialize)]
struct GenerationConfig {
    temperature: f64,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Content,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_shape() {
        let body = GenerateRequest {
            contents: vec![Content {
                parts: vec![Part { text: "hello".into() }],
            }],
            generation_config: GenerationConfig { temperature: 0.1 },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["contents"][0]["parts"][0]["text"], "hello");
        assert_eq!(json["generationConfig"]["temperature"], 0.1);
    }

    #[test]
    fn response_parses_candidates() {
        let json = r#"{
            "candidates": [
                {"content": {"parts": [{"text": "part one "}, {"text": "part two"}]}}
            ]
        }"#;
        let resp: GenerateResponse = serde_json::from_str(json).unwrap();
        let text: String = resp.candidates[0]
            .content
            .parts
            .iter()
            .map(|p| p.text.clone())
            .collect();
        assert_eq!(text, "part one part two");
    }

    #[test]
    fn empty_candidates_parse() {
        let resp: GenerateResponse = serde_json::from_str("{}").unwrap();
        assert!(resp.candidates.is_empty());
    }

    #[test]
    fn default_model() {
        let svc = GeminiReasoning::new("key", None);
        assert_eq!(svc.model, DEFAULT_MODEL);
        let svc = GeminiReasoning::new("key", Some("gemini-2.5-pro"));
        assert_eq!(svc.model, "gemini-2.5-pro");
    }
}
