//! Provider abstraction (C4): one trait, three vendor-specific implementations.
//!
//! Every provider normalizes its quirks (role remapping, temperature support,
//! token-limit field names) at the edge so the rest of the pipeline only ever
//! deals with [`Message`] / [`ProviderResponse`].

pub mod anthropic;
pub mod factory;
pub mod google;
pub mod openai;

use crate::error::PerseptorError;
use crate::models::{Message, ModelInfo, ProviderResponse};
use async_trait::async_trait;
use futures::stream::BoxStream;

#[derive(Debug, Clone, Copy)]
pub struct GenerateParams {
    pub temperature: f64,
    pub max_tokens: u32,
}

impl Default for GenerateParams {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            max_tokens: 4096,
        }
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn provider_name(&self) -> &'static str;

    async fn generate(
        &self,
        messages: &[Message],
        model: Option<&str>,
        params: GenerateParams,
    ) -> Result<ProviderResponse, PerseptorError>;

    /// Stream of content chunks. Providers without a native streaming call
    /// may fall back to a single-item stream carrying the full response.
    async fn generate_stream(
        &self,
        messages: &[Message],
        model: Option<&str>,
        params: GenerateParams,
    ) -> Result<BoxStream<'static, Result<String, PerseptorError>>, PerseptorError>;

    fn get_model_info(&self, model: Option<&str>) -> ModelInfo;

    fn list_models(&self) -> Vec<ModelInfo>;
}

/// Picks a provider id from an API key's shape when the caller doesn't name
/// one explicitly, mirroring the `key_prefix` hints in the original factory's
/// `get_available_providers`.
pub fn guess_provider_from_key(api_key: &str) -> &'static str {
    if api_key.starts_with("sk-ant-") {
        "anthropic"
    } else if api_key.starts_with("AIza") {
        "google"
    } else {
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guesses_anthropic_from_prefix() {
        assert_eq!(guess_provider_from_key("sk-ant-abc123"), "anthropic");
    }

    #[test]
    fn guesses_google_from_prefix() {
        assert_eq!(guess_provider_from_key("AIzaSyAbc"), "google");
    }

    #[test]
    fn falls_back_to_openai() {
        assert_eq!(guess_provider_from_key("sk-abc123"), "openai");
    }
}
