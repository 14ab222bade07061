//! Anthropic provider: Claude Sonnet 4, Opus 4.6, Haiku 4.5.

use super::{GenerateParams, Provider};
use crate::error::PerseptorError;
use crate::models::{Message, ModelInfo, ModelTier, ProviderResponse, Role, TokenUsage};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{json, Value};
use std::time::Instant;

const BASE_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

const ANTHROPIC_MODELS: &[ModelInfo] = &[
    ModelInfo {
        provider: "anthropic",
        model_id: "claude-sonnet-4-20250514",
        display_name: "Claude Sonnet 4",
        tier: ModelTier::Flagship,
        max_tokens: 200_000,
        supports_streaming: true,
        supports_temperature: true,
        cost_per_1k_input: 0.003,
        cost_per_1k_output: 0.015,
    },
    ModelInfo {
        provider: "anthropic",
        model_id: "claude-opus-4-6",
        display_name: "Claude Opus 4.6",
        tier: ModelTier::Flagship,
        max_tokens: 200_000,
        supports_streaming: true,
        supports_temperature: true,
        cost_per_1k_input: 0.015,
        cost_per_1k_output: 0.075,
    },
    ModelInfo {
        provider: "anthropic",
        model_id: "claude-haiku-4-5-20251001",
        display_name: "Claude Haiku 4.5",
        tier: ModelTier::Efficient,
        max_tokens: 200_000,
        supports_streaming: true,
        supports_temperature: true,
        cost_per_1k_input: 0.0008,
        cost_per_1k_output: 0.004,
    },
];

const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    default_model: String,
}

impl AnthropicProvider {
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

    /// Anthropic keeps the system prompt out of the `messages` array; this
    /// folds all system messages together and guarantees at least one user
    /// turn, same fallback the original provider used.
    fn split_system(messages: &[Message]) -> (String, Vec<Value>) {
        let mut system_prompt = String::new();
        let mut user_messages = Vec::new();
        for m in messages {
            match m.role {
                Role::System => {
                    system_prompt.push_str(&m.content);
                    system_prompt.push('\n');
                }
                Role::User => user_messages.push(json!({"role": "user", "content": m.content})),
                Role::Assistant => {
                    user_messages.push(json!({"role": "assistant", "content": m.content}))
                }
            }
        }
        if user_messages.is_empty() {
            let content = system_prompt.trim().to_string();
            return (String::new(), vec![json!({"role": "user", "content": content})]);
        }
        (system_prompt.trim().to_string(), user_messages)
    }

    fn build_body(&self, messages: &[Message], model_id: &str, params: GenerateParams, stream: bool) -> Value {
        let (system_prompt, user_messages) = Self::split_system(messages);
        let mut body = json!({
            "model": model_id,
            "max_tokens": params.max_tokens,
            "temperature": params.temperature,
            "messages": user_messages,
        });
        if !system_prompt.is_empty() {
            body["system"] = json!(system_prompt);
        }
        if stream {
            body["stream"] = json!(true);
        }
        body
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn provider_name(&self) -> &'static str {
        "anthropic"
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
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(crate::error::classify_message(
                &format!("{status}: {text}"),
                Some("anthropic"),
            ));
        }

        let payload: Value = resp.json().await?;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

        let content = payload["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| b["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        let input_tokens = payload["usage"]["input_tokens"].as_u64().unwrap_or(0);
        let output_tokens = payload["usage"]["output_tokens"].as_u64().unwrap_or(0);

        Ok(ProviderResponse {
            content,
            model: model_id,
            provider: "anthropic".to_string(),
            usage: TokenUsage {
                prompt_tokens: input_tokens,
                completion_tokens: output_tokens,
                total_tokens: input_tokens + output_tokens,
            },
            latency_ms,
            finish_reason: payload["stop_reason"].as_str().unwrap_or("").to_string(),
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
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(crate::error::classify_message(
                &format!("{status}: {text}"),
                Some("anthropic"),
            ));
        }

        let byte_stream = resp.bytes_stream().map(|c| c.map_err(PerseptorError::from));
        Ok(Box::pin(sse_to_text_deltas(byte_stream)))
    }

    fn get_model_info(&self, model: Option<&str>) -> ModelInfo {
        let model_id = self.resolve_model(model);
        ANTHROPIC_MODELS
            .iter()
            .find(|m| m.model_id == model_id)
            .cloned()
            .unwrap_or_else(|| ANTHROPIC_MODELS[0].clone())
    }

    fn list_models(&self) -> Vec<ModelInfo> {
        ANTHROPIC_MODELS.to_vec()
    }
}

fn sse_to_text_deltas<S>(byte_stream: S) -> impl futures::Stream<Item = Result<String, PerseptorError>>
where
    S: futures::Stream<Item = Result<bytes::Bytes, PerseptorError>> + Send + 'static,
{
    stream::unfold(
        (byte_stream, Vec::<u8>::new()),
        |(mut inner, mut buf)| async move {
            loop {
                if let Some(pos) = buf.windows(2).position(|w| w == b"\n\n") {
                    let event: Vec<u8> = buf.drain(..pos + 2).collect();
                    if let Some(chunk) = parse_anthropic_event(&event) {
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

/// Anthropic's `content_block_delta` events carry `delta.text`, distinct from
/// OpenAI's `delta.content` shape.
fn parse_anthropic_event(raw: &[u8]) -> Option<Result<String, PerseptorError>> {
    let text = String::from_utf8_lossy(raw);
    for line in text.lines() {
        let Some(data) = line.strip_prefix("data: ") else {
            continue;
        };
        let parsed: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => return Some(Err(PerseptorError::from(e))),
        };
        if let Some(delta) = parsed["delta"]["text"].as_str() {
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
    fn separates_system_from_user_messages() {
        let messages = vec![
            Message::system("You are an analyst."),
            Message::user("Analyze this."),
        ];
        let (system, user) = AnthropicProvider::split_system(&messages);
        assert_eq!(system, "You are an analyst.");
        assert_eq!(user.len(), 1);
    }

    #[test]
    fn falls_back_to_system_as_user_when_no_user_turns() {
        let messages = vec![Message::system("only a system prompt")];
        let (system, user) = AnthropicProvider::split_system(&messages);
        assert!(system.is_empty());
        assert_eq!(user[0]["content"], "only a system prompt");
    }
}
