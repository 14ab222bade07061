//! OpenAI provider: GPT-4.1/4o flagship & efficient tiers, O-series reasoning models.

use super::{GenerateParams, Provider};
use crate::error::PerseptorError;
use crate::models::{Message, ModelInfo, ModelTier, ProviderResponse, Role, TokenUsage};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::OnceLock;
use std::time::Instant;

const BASE_URL: &str = "https://api.openai.com/v1/chat/completions";

/// O-series reasoning models: no `temperature`, `max_completion_tokens`
/// instead of `max_tokens`, "system" becomes "developer", and assistant
/// few-shot messages must be dropped (the API rejects assistant prefill).
fn o_series_models() -> &'static HashSet<&'static str> {
    static SET: OnceLock<HashSet<&'static str>> = OnceLock::new();
    SET.get_or_init(|| {
        [
            "o1",
            "o1-mini",
            "o1-preview",
            "o1-preview-2024-09-12",
            "o3",
            "o3-mini",
            "o3-mini-2024-09-12",
            "o4",
            "o4-mini",
            "o4-mini-2025-04-16",
        ]
        .into_iter()
        .collect()
    })
}

const OPENAI_MODELS: &[ModelInfo] = &[
    ModelInfo {
        provider: "openai",
        model_id: "gpt-4.1-2025-04-14",
        display_name: "GPT-4.1",
        tier: ModelTier::Flagship,
        max_tokens: 128_000,
        supports_streaming: true,
        supports_temperature: true,
        cost_per_1k_input: 0.002,
        cost_per_1k_output: 0.008,
    },
    ModelInfo {
        provider: "openai",
        model_id: "gpt-4.1-mini-2025-04-14",
        display_name: "GPT-4.1 Mini",
        tier: ModelTier::Efficient,
        max_tokens: 128_000,
        supports_streaming: true,
        supports_temperature: true,
        cost_per_1k_input: 0.0004,
        cost_per_1k_output: 0.0016,
    },
    ModelInfo {
        provider: "openai",
        model_id: "gpt-4o",
        display_name: "GPT-4o",
        tier: ModelTier::Flagship,
        max_tokens: 128_000,
        supports_streaming: true,
        supports_temperature: true,
        cost_per_1k_input: 0.0025,
        cost_per_1k_output: 0.01,
    },
    ModelInfo {
        provider: "openai",
        model_id: "gpt-4o-mini",
        display_name: "GPT-4o Mini",
        tier: ModelTier::Efficient,
        max_tokens: 128_000,
        supports_streaming: true,
        supports_temperature: true,
        cost_per_1k_input: 0.00015,
        cost_per_1k_output: 0.0006,
    },
    ModelInfo {
        provider: "openai",
        model_id: "o4-mini-2025-04-16",
        display_name: "O4 Mini (Reasoning)",
        tier: ModelTier::Reasoning,
        max_tokens: 128_000,
        supports_streaming: true,
        supports_temperature: false,
        cost_per_1k_input: 0.0011,
        cost_per_1k_output: 0.0044,
    },
    ModelInfo {
        provider: "openai",
        model_id: "o3-mini",
        display_name: "O3 Mini (Reasoning)",
        tier: ModelTier::Reasoning,
        max_tokens: 128_000,
        supports_streaming: true,
        supports_temperature: false,
        cost_per_1k_input: 0.0011,
        cost_per_1k_output: 0.0044,
    },
];

const DEFAULT_MODEL: &str = "gpt-4.1-2025-04-14";

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    default_model: String,
}

impl OpenAiProvider {
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

    fn build_body(&self, messages: &[Message], model_id: &str, params: GenerateParams, stream: bool) -> Value {
        let is_o_series = o_series_models().contains(model_id);
        let mut formatted = Vec::new();
        for m in messages {
            let role = match (m.role, is_o_series) {
                (Role::System, true) => "developer",
                (Role::System, false) => "system",
                (Role::User, _) => "user",
                (Role::Assistant, true) => continue,
                (Role::Assistant, false) => "assistant",
            };
            formatted.push(json!({"role": role, "content": m.content}));
        }

        let mut body = json!({
            "model": model_id,
            "messages": formatted,
        });
        if stream {
            body["stream"] = json!(true);
        }
        if is_o_series {
            body["max_completion_tokens"] = json!(params.max_tokens);
        } else {
            body["max_tokens"] = json!(params.max_tokens);
            body["temperature"] = json!(params.temperature);
        }
        body
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn provider_name(&self) -> &'static str {
        "openai"
    }

    async fn generate(
        &self,
        messages: &[Message],
        model: Option<&str>,
        params: GenerateParams,
    ) -> Result<ProviderResponse, PerseptorError> {
        let model_id = self.resolve_model(model).to_string();
        let body = self.build_body(messages, &model_id, params, false);
        let start = Instant::now();

        let resp = self
            .client
            .post(BASE_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(crate::error::classify_message(
                &format!("{status}: {text}"),
                Some("openai"),
            ));
        }

        let payload: Value = resp.json().await?;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

        let choice = &payload["choices"][0];
        let mut content = choice["message"]["content"].as_str().unwrap_or("").to_string();
        if content.is_empty() {
            if let Some(refusal) = choice["message"]["refusal"].as_str() {
                content = refusal.to_string();
            }
        }

        let usage = TokenUsage {
            prompt_tokens: payload["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            completion_tokens: payload["usage"]["completion_tokens"].as_u64().unwrap_or(0),
            total_tokens: payload["usage"]["total_tokens"].as_u64().unwrap_or(0),
        };

        Ok(ProviderResponse {
            content,
            model: model_id,
            provider: "openai".to_string(),
            usage,
            latency_ms,
            finish_reason: choice["finish_reason"].as_str().unwrap_or("").to_string(),
        })
    }

    async fn generate_stream(
        &self,
        messages: &[Message],
        model: Option<&str>,
        params: GenerateParams,
    ) -> Result<BoxStream<'static, Result<String, PerseptorError>>, PerseptorError> {
        let model_id = self.resolve_model(model).to_string();
        let body = self.build_body(messages, &model_id, params, true);

        let resp = self
            .client
            .post(BASE_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(crate::error::classify_message(
                &format!("{status}: {text}"),
                Some("openai"),
            ));
        }

        let byte_stream = resp.bytes_stream().map(|chunk| chunk.map_err(PerseptorError::from));
        let parsed = sse_to_openai_deltas(byte_stream);
        Ok(Box::pin(parsed))
    }

    fn get_model_info(&self, model: Option<&str>) -> ModelInfo {
        let model_id = self.resolve_model(model);
        OPENAI_MODELS
            .iter()
            .find(|m| m.model_id == model_id)
            .cloned()
            .unwrap_or_else(|| OPENAI_MODELS[0].clone())
    }

    fn list_models(&self) -> Vec<ModelInfo> {
        OPENAI_MODELS.to_vec()
    }
}

/// Parses an OpenAI-style `text/event-stream` body into content-delta chunks.
fn sse_to_openai_deltas<S>(
    byte_stream: S,
) -> impl futures::Stream<Item = Result<String, PerseptorError>>
where
    S: futures::Stream<Item = Result<bytes::Bytes, PerseptorError>> + Send + 'static,
{
    stream::unfold(
        (byte_stream, Vec::<u8>::new()),
        |(mut inner, mut buf)| async move {
            loop {
                if let Some(pos) = find_double_newline(&buf) {
                    let line: Vec<u8> = buf.drain(..pos + 2).collect();
                    if let Some(chunk) = parse_sse_event(&line) {
                        return Some((chunk, (inner, buf)));
                    }
                    continue;
                }
                match inner.next().await {
                    Some(Ok(bytes)) => buf.extend_from_slice(&bytes),
                    Some(Err(e)) => return Some((Err(e), (inner, buf))),
                    None => return None,
                }
            }
        },
    )
}

fn find_double_newline(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

fn parse_sse_event(raw: &[u8]) -> Option<Result<String, PerseptorError>> {
    let text = String::from_utf8_lossy(raw);
    for line in text.lines() {
        let Some(data) = line.strip_prefix("data: ") else {
            continue;
        };
        if data.trim() == "[DONE]" {
            return None;
        }
        let parsed: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => return Some(Err(PerseptorError::from(e))),
        };
        if let Some(delta) = parsed["choices"][0]["delta"]["content"].as_str() {
            if !delta.is_empty() {
                return Some(Ok(delta.to_string()));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_assistant_messages_for_o_series() {
        let provider = OpenAiProvider::new("sk-test", None);
        let messages = vec![
            Message::system("sys"),
            Message::assistant("few-shot"),
            Message::user("hello"),
        ];
        let body = provider.build_body(&messages, "o3-mini", GenerateParams::default(), false);
        let msgs = body["messages"].as_array().unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0]["role"], "developer");
        assert!(!body.get("temperature").is_some());
        assert!(body.get("max_completion_tokens").is_some());
    }

    #[test]
    fn keeps_system_role_for_non_reasoning_models() {
        let provider = OpenAiProvider::new("sk-test", None);
        let messages = vec![Message::system("sys"), Message::user("hi")];
        let body = provider.build_body(&messages, "gpt-4.1-2025-04-14", GenerateParams::default(), false);
        let msgs = body["messages"].as_array().unwrap();
        assert_eq!(msgs[0]["role"], "system");
        assert!(body.get("temperature").is_some());
    }

    #[test]
    fn unknown_model_falls_back_to_first() {
        let provider = OpenAiProvider::new("sk-test", None);
        let info = provider.get_model_info(Some("nonexistent-model"));
        assert_eq!(info.model_id, OPENAI_MODELS[0].model_id);
    }
}
