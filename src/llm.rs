//! Language-model client shared by query expansion, large-table
//! summarization, and document-domain classification.
//!
//! One model setting (from [`LlmConfig`]) is passed into every component
//! constructor that needs text generation; nothing reads it ambiently.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::config::LlmConfig;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("llm request failed: {0}")]
    Network(String),
    #[error("llm response missing content")]
    EmptyResponse,
}

impl LlmError {
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::Network(_) => true,
            LlmError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Interface to the external language model.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Run one prompt to completion and return the generated text.
    async fn complete(&self, prompt: &str) -> Result<String, LlmError>;
}

/// Chat-completions client for the OpenAI API.
pub struct OpenAiGenerator {
    model: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAiGenerator {
    pub fn new(config: &LlmConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("llm.model required for OpenAI provider"))?;

        if std::env::var("OPENAI_API_KEY").is_err() {
            anyhow::bail!("OPENAI_API_KEY environment variable not set");
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            max_retries: config.max_retries,
            client,
        })
    }
}

#[async_trait]
impl TextGenerator for OpenAiGenerator {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| LlmError::Network("OPENAI_API_KEY not set".to_string()))?;

        let body = serde_json::json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post("https://api.openai.com/v1/chat/completions")
                .header("Authorization", format!("Bearer {}", api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| LlmError::Network(e.to_string()))?;
                        return extract_message_content(&json);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    let err = LlmError::Api {
                        status: status.as_u16(),
                        body: body_text,
                    };
                    if err.is_transient() {
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
                Err(e) => {
                    last_err = Some(LlmError::Network(e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or(LlmError::EmptyResponse))
    }
}

fn extract_message_content(json: &serde_json::Value) -> Result<String, LlmError> {
    json.get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or(LlmError::EmptyResponse)
}

pub fn create_generator(config: &LlmConfig) -> anyhow::Result<std::sync::Arc<dyn TextGenerator>> {
    match config.provider.as_str() {
        "openai" => Ok(std::sync::Arc::new(OpenAiGenerator::new(config)?)),
        "disabled" => anyhow::bail!("llm provider is disabled"),
        other => anyhow::bail!("Unknown llm provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_first_choice_content() {
        let json = serde_json::json!({
            "choices": [{"message": {"content": "  expanded terms  "}}]
        });
        assert_eq!(extract_message_content(&json).unwrap(), "expanded terms");
    }

    #[test]
    fn empty_content_is_an_error() {
        let json = serde_json::json!({"choices": [{"message": {"content": ""}}]});
        assert!(extract_message_content(&json).is_err());
        let json = serde_json::json!({"choices": []});
        assert!(extract_message_content(&json).is_err());
    }

    #[test]
    fn transient_classification() {
        assert!(LlmError::Api { status: 500, body: String::new() }.is_transient());
        assert!(!LlmError::Api { status: 404, body: String::new() }.is_transient());
        assert!(!LlmError::EmptyResponse.is_transient());
    }
}
