//! Vision annotator adapter.
//!
//! Images and table-as-image elements cannot be embedded directly; the
//! annotator turns them into text descriptions using a domain-specific
//! prompt. Failures here are partial failures for the owning chunk, never
//! for the document.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::config::LlmConfig;

#[derive(Debug, Error)]
pub enum AnnotatorError {
    #[error("vision API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("vision request failed: {0}")]
    Network(String),
    #[error("vision response missing description")]
    EmptyResponse,
}

/// Interface to the external vision-description API.
#[async_trait]
pub trait VisionAnnotator: Send + Sync {
    /// Describe a base64-encoded image under the given domain prompt.
    async fn describe(&self, image_payload: &str, prompt: &str) -> Result<String, AnnotatorError>;
}

/// Vision client for the OpenAI chat API with image input.
pub struct OpenAiAnnotator {
    model: String,
    client: reqwest::Client,
}

impl OpenAiAnnotator {
    pub fn new(config: &LlmConfig) -> anyhow::Result<Self> {
        let model = config
            .vision_model
            .clone()
            .or_else(|| config.model.clone())
            .ok_or_else(|| anyhow::anyhow!("llm.vision_model or llm.model required"))?;

        if std::env::var("OPENAI_API_KEY").is_err() {
            anyhow::bail!("OPENAI_API_KEY environment variable not set");
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self { model, client })
    }
}

#[async_trait]
impl VisionAnnotator for OpenAiAnnotator {
    async fn describe(&self, image_payload: &str, prompt: &str) -> Result<String, AnnotatorError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| AnnotatorError::Network("OPENAI_API_KEY not set".to_string()))?;

        let body = serde_json::json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": prompt},
                    {"type": "image_url", "image_url": {
                        "url": format!("data:image/png;base64,{}", image_payload)
                    }},
                ],
            }],
        });

        let response = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| AnnotatorError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(AnnotatorError::Api {
                status: status.as_u16(),
                body: body_text,
            });
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AnnotatorError::Network(e.to_string()))?;

        json.get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or(AnnotatorError::EmptyResponse)
    }
}

/// Prompt handed to the annotator, specialized by the document's
/// classified domain so tables and figures are described with the right
/// vocabulary.
pub fn domain_prompt(domain: &str) -> String {
    format!(
        "You are describing a figure or table from a {} document. \
         Describe its content precisely, including any numbers, labels, \
         row and column headers, and totals. Output plain text only.",
        domain
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_prompt_includes_domain() {
        let prompt = domain_prompt("financial reporting");
        assert!(prompt.contains("financial reporting"));
    }
}
