//! OpenAI-compatible text classifier.
//!
//! Sends a chunk pair to a chat-completions endpoint and reads back a JSON
//! verdict of the form:
//!
//! ```json
//! { "relationship": "equivalent", "confidence": 0.92, "explanation": "..." }
//! ```
//!
//! Requires the `OPENAI_API_KEY` environment variable. The endpoint is
//! configurable, so any server that speaks the same protocol works.
//!
//! Retry strategy:
//! - HTTP 429 or 5xx → retry with exponential backoff
//! - HTTP 4xx (not 429) → fail immediately
//! - Network error → retry

use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use tracing::debug;

use canon_core::classifier::{ClassificationRequest, ClassifierVerdict, TextClassifier};
use canon_core::error::{DedupError, Result};
use canon_core::models::RelationshipType;

use crate::config::ClassifierConfig;

const SERVICE: &str = "text classifier";

/// Longest excerpt of each chunk sent to the model.
const MAX_EXCERPT_CHARS: usize = 4000;

const SYSTEM_PROMPT: &str = "You compare two passages from a knowledge base and decide how \
they relate. Answer with a JSON object with the keys \"relationship\", \"confidence\" and \
\"explanation\". \"relationship\" is one of: equivalent (same information), complementary \
(different facets of one topic), contradictory (incompatible claims), superseding (B is a \
newer version of A), subset (one is fully contained in the other), distinct (unrelated). \
\"confidence\" is a number between 0 and 1. \"explanation\" is one sentence.";

pub struct OpenAiClassifier {
    client: reqwest::Client,
    model: String,
    endpoint: String,
    api_key: String,
    max_retries: u32,
}

impl OpenAiClassifier {
    /// Build the classifier from configuration.
    ///
    /// Fails if `classifier.model` is not set or `OPENAI_API_KEY` is missing.
    pub fn new(config: &ClassifierConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("classifier.model required for OpenAI provider"))?;

        let api_key = match std::env::var("OPENAI_API_KEY") {
            Ok(key) if !key.is_empty() => key,
            _ => bail!("OPENAI_API_KEY environment variable not set"),
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            model,
            endpoint: config.endpoint.clone(),
            api_key,
            max_retries: config.max_retries,
        })
    }

    fn request_body(&self, request: &ClassificationRequest) -> serde_json::Value {
        let user = format!(
            "Vector similarity: {:.3}\n\nPassage A:\n{}\n\nPassage B:\n{}",
            request.similarity,
            excerpt(&request.content_a),
            excerpt(&request.content_b),
        );
        serde_json::json!({
            "model": self.model,
            "temperature": 0,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": user },
            ],
        })
    }
}

#[async_trait]
impl TextClassifier for OpenAiClassifier {
    fn name(&self) -> &str {
        &self.model
    }

    async fn classify(&self, request: &ClassificationRequest) -> Result<ClassifierVerdict> {
        let body = self.request_body(request);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                debug!(attempt, ?delay, "retrying text classifier");
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&self.endpoint)
                .header("Authorization", format!("Bearer {}", self.api_key))
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
                            .map_err(|e| DedupError::external(SERVICE, e.to_string()))?;
                        return parse_completion(&json);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    let err = DedupError::external(
                        SERVICE,
                        format!("API error {}: {}", status, body_text),
                    );
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
                Err(e) => {
                    last_err = Some(DedupError::external(SERVICE, e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| DedupError::external(SERVICE, "classification failed after retries")))
    }
}

fn excerpt(text: &str) -> String {
    text.chars().take(MAX_EXCERPT_CHARS).collect()
}

/// Extract the verdict from a chat-completions response.
fn parse_completion(json: &serde_json::Value) -> Result<ClassifierVerdict> {
    let content = json
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| DedupError::external(SERVICE, "response has no message content"))?;
    parse_verdict(content)
}

fn parse_verdict(content: &str) -> Result<ClassifierVerdict> {
    let trimmed = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let value: serde_json::Value = serde_json::from_str(trimmed)
        .map_err(|e| DedupError::external(SERVICE, format!("verdict is not JSON: {}", e)))?;

    let relationship: RelationshipType = value
        .get("relationship")
        .and_then(|r| r.as_str())
        .ok_or_else(|| DedupError::external(SERVICE, "verdict has no relationship"))?
        .parse()
        .map_err(|e: DedupError| DedupError::external(SERVICE, e.to_string()))?;

    let confidence = value
        .get("confidence")
        .and_then(|c| c.as_f64())
        .ok_or_else(|| DedupError::external(SERVICE, "verdict has no confidence"))?;

    let explanation = value
        .get("explanation")
        .and_then(|e| e.as_str())
        .unwrap_or_default()
        .to_string();

    Ok(ClassifierVerdict {
        relationship,
        confidence: confidence.clamp(0.0, 1.0),
        explanation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_completion_content() {
        let json = serde_json::json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": "{\"relationship\": \"Contradictory\", \"confidence\": 0.91, \"explanation\": \"Different limits.\"}"
                }
            }]
        });
        let verdict = parse_completion(&json).unwrap();
        assert_eq!(verdict.relationship, RelationshipType::Contradictory);
        assert!((verdict.confidence - 0.91).abs() < 1e-9);
        assert_eq!(verdict.explanation, "Different limits.");
    }

    #[test]
    fn strips_code_fences_and_clamps_confidence() {
        let verdict =
            parse_verdict("```json\n{\"relationship\": \"subset\", \"confidence\": 1.4}\n```")
                .unwrap();
        assert_eq!(verdict.relationship, RelationshipType::Subset);
        assert_eq!(verdict.confidence, 1.0);
        assert!(verdict.explanation.is_empty());
    }

    #[test]
    fn rejects_unknown_relationship() {
        let err = parse_verdict("{\"relationship\": \"cousins\", \"confidence\": 0.5}").unwrap_err();
        assert_eq!(err.kind(), "external_dependency");
    }

    #[test]
    fn missing_content_is_an_external_error() {
        let err = parse_completion(&serde_json::json!({ "choices": [] })).unwrap_err();
        assert!(err.to_string().contains("no message content"));
    }

    #[test]
    fn excerpt_truncates_on_char_boundary() {
        let long = "é".repeat(MAX_EXCERPT_CHARS + 10);
        assert_eq!(excerpt(&long).chars().count(), MAX_EXCERPT_CHARS);
    }
}
