//! Provider factory (§4.1): builds and caches provider instances per
//! `(provider, api_key)` pair, same cache key shape as the original
//! `get_provider`/`_hash_key`.

use super::anthropic::AnthropicProvider;
use super::google::GoogleProvider;
use super::openai::OpenAiProvider;
use super::Provider;
use crate::error::PerseptorError;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::sync::OnceLock;
use tracing::info;

fn cache() -> &'static DashMap<String, Arc<dyn Provider>> {
    static CACHE: OnceLock<DashMap<String, Arc<dyn Provider>>> = OnceLock::new();
    CACHE.get_or_init(DashMap::new)
}

fn hash_key(api_key: &str) -> String {
    let digest = Sha256::digest(api_key.as_bytes());
    digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
}

/// Returns a cached provider for `(provider_name, api_key)`, constructing one
/// if this is the first time the pair has been seen. `model` only affects
/// construction; it does not retroactively change a cached instance's
/// default model, unlike the Python factory -- callers pass the model
/// explicitly on every `generate` call instead.
pub fn get_provider(
    provider_name: &str,
    api_key: &str,
    model: Option<String>,
) -> Result<Arc<dyn Provider>, PerseptorError> {
    if api_key.is_empty() {
        return Err(PerseptorError::InvalidRequest(format!(
            "API key is required for provider '{provider_name}'"
        )));
    }

    let name = provider_name.to_lowercase();
    let cache_key = format!("{name}:{}", hash_key(api_key));

    if let Some(existing) = cache().get(&cache_key) {
        return Ok(existing.clone());
    }

    let provider: Arc<dyn Provider> = match name.as_str() {
        "openai" => Arc::new(OpenAiProvider::new(api_key, model)),
        "anthropic" => Arc::new(AnthropicProvider::new(api_key, model)),
        "google" => Arc::new(GoogleProvider::new(api_key, model)),
        other => {
            return Err(PerseptorError::InvalidRequest(format!(
                "unsupported provider '{other}'. supported: openai, anthropic, google"
            )))
        }
    };

    cache().insert(cache_key, provider.clone());
    info!(provider = %name, "created new provider instance (cached)");
    Ok(provider)
}

pub fn clear_cache() {
    cache().clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_api_key() {
        let err = get_provider("openai", "", None).unwrap_err();
        assert!(matches!(err, PerseptorError::InvalidRequest(_)));
    }

    #[test]
    fn rejects_unsupported_provider() {
        let err = get_provider("cohere", "sk-test", None).unwrap_err();
        assert!(matches!(err, PerseptorError::InvalidRequest(_)));
    }

    #[test]
    fn returns_same_instance_for_same_key() {
        clear_cache();
        let a = get_provider("openai", "sk-test-factory", None).unwrap();
        let b = get_provider("openai", "sk-test-factory", None).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn hash_key_is_deterministic() {
        assert_eq!(hash_key("abc"), hash_key("abc"));
        assert_ne!(hash_key("abc"), hash_key("xyz"));
    }
}
