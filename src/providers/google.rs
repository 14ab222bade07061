//! Google Gemini provider: 2.5 Pro, 2.5 Flash, 2.0 Flash.

use super::{GenerateParams, Provider};
use crate::error::PerseptorError;
use crate::models::{Message, ModelInfo, ModelTier, ProviderResponse, Role, TokenUsage};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use serde_json::{json, Value};
use std::time::Instant;

const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

const GOOGLE_MODELS: &[ModelInfo] = &[
    ModelInfo {
        provider: "google",
        model_id: "gemini-2.5-pro",
        display_name: "Gemini 2.5 Pro",
        tier: ModelTier::Flagship,
        max_tokens: 1_000_000,
        supports_streaming: true,
        supports_temperature: true,
        cost_per_1k_input: 0.00125,
        cost_per_1k_output: 0.005,
    },
    ModelInfo {
        provider: "google",
        model_id: "gemini-2.5-flash",
        display_name: "Gemini 2.5 Flash",
        tier: ModelTier::Efficient,
        max_tokens: 1_000_000,
        supports_streaming: true,
        supports_temperature: true,
        cost_per_1k_input: 0.00015,
        cost_per_1k_output: 0.0006,
    },
    ModelInfo {
        provider: "google",
        model_id: "gemini-2.0-flash",
        display_name: "Gemini 2.0 Flash",
        tier: ModelTier::Efficient,
        max_tokens: 1_000_000,
        supports_streaming: true,
        supports_temperature: true,
        cost_per_1k_input: 0.0001,
        cost_per_1k_output: 0.0004,
    },
];

const DEFAULT_MODEL: &str = "gemini-2.5-flash";

pub struct GoogleProvider {
    client: reqwest::Client,
    api_key: String,
    default_model: String,
}

impl GoogleProvider {
    pub fn new(api_key: impl Into<String>, default_model: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            default_model: default_model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        }
    }

    fn resolve_model<'a>(&'a self, model: Option<&'a str>) -> &'a str {
        model.unwrap_or(&self.default_model)
    }

    /// Gemini keeps the system instruction out of `contents` and remaps
    /// "assistant" to "model" for prior turns.
    fn build_contents(messages: &[Message]) -> (String, Vec<Value>) {
        let mut system_parts = Vec::new();
        let mut contents = Vec::new();
        for m in messages {
            match m.role {
                Role::System => system_parts.push(m.content.clone()),
                Role::User => contents.push(json!({"role": "user", "parts": [{"text": m.content}]})),
                Role::Assistant => {
                    contents.push(json!({"role": "model", "parts": [{"text": m.content}]}))
                }
            }
        }
        (system_parts.join("\n"), contents)
    }

    fn build_body(messages: &[Message], params: GenerateParams) -> Value {
        let (system_instruction, mut contents) = Self::build_contents(messages);
        if contents.is_empty() {
            contents.push(json!({"role": "user", "parts": [{"text": system_instruction}]}));
            return json!({
                "contents": contents,
                "generationConfig": {
                    "temperature": params.temperature,
                    "maxOutputTokens": params.max_tokens,
                },
            });
        }
        let mut body = json!({
            "contents": contents,
            "generationConfig": {
                "temperature": params.temperature,
                "maxOutputTokens": params.max_tokens,
            },
        });
        if !system_instruction.is_empty() {
            body["systemInstruction"] = json!({"parts": [{"text": system_instruction}]});
        }
        body
    }
}

#[async_trait]
impl Provider for GoogleProvider {
    fn provider_name(&self) -> &'static str {
        "google"
    }

    async fn generate(
        &self,
        messages: &[Message],
        model: Option<&str>,
        params: GenerateParams,
    ) -> Result<ProviderResponse, PerseptorError> {
        let model_id = self.resolve_model(model).to_string();
        let body = Self::build_body(messages, params);
        let start = Instant::now();

        let url = format!("{BASE_URL}/{model_id}:generateContent?key={}", self.api_key);
        let resp = self.client.post(&url).json(&body).send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(crate::error::classify_message(
                &format!("{status}: {text}"),
                Some("google"),
            ));
        }

        let payload: Value = resp.json().await?;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

        let content = payload["candidates"][0]["content"]["parts"]
            .as_array()
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        let usage = TokenUsage {
            prompt_tokens: payload["usageMetadata"]["promptTokenCount"].as_u64().unwrap_or(0),
            completion_tokens: payload["usageMetadata"]["candidatesTokenCount"]
                .as_u64()
                .unwrap_or(0),
            total_tokens: payload["usageMetadata"]["totalTokenCount"].as_u64().unwrap_or(0),
        };

        Ok(ProviderResponse {
            content,
            model: model_id,
            provider: "google".to_string(),
            usage,
            latency_ms,
            finish_reason: payload["candidates"][0]["finishReason"]
                .as_str()
                .unwrap_or("")
                .to_string(),
        })
    }

    async fn generate_stream(
        &self,
        messages: &[Message],
        model: Option<&str>,
        params: GenerateParams,
    ) -> Result<BoxStream<'static, Result<String, PerseptorError>>, PerseptorError> {
        // Gemini's streaming endpoint returns a JSON array of chunks rather
        // than SSE; a single non-streaming call folded into a one-item
        // stream keeps the contract uniform without a bespoke array parser.
        let response = self.generate(messages, model, params).await?;
        Ok(Box::pin(futures::stream::once(async move { Ok(response.content) })))
    }

    fn get_model_info(&self, model: Option<&str>) -> ModelInfo {
        let model_id = self.resolve_model(model);
        GOOGLE_MODELS
            .iter()
            .find(|m| m.model_id == model_id)
            .cloned()
            .unwrap_or_else(|| GOOGLE_MODELS[0].clone())
    }

    fn list_models(&self) -> Vec<ModelInfo> {
        GOOGLE_MODELS.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaps_assistant_to_model_role() {
        let messages = vec![Message::user("hi"), Message::assistant("hello back")];
        let (_, contents) = GoogleProvider::build_contents(&messages);
        assert_eq!(contents[1]["role"], "model");
    }

    #[test]
    fn falls_back_to_system_text_when_no_turns() {
        let messages = vec![Message::system("just a system prompt")];
        let body = GoogleProvider::build_body(&messages, GenerateParams::default());
        assert!(body.get("systemInstruction").is_none());
        assert_eq!(
            body["contents"][0]["parts"][0]["text"],
            "just a system prompt"
        );
    }
}
