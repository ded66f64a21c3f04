//! Adapter construction from a stored [`ProviderConfig`].

use std::sync::Arc;
use std::time::Duration;

use crate::entity::{ProviderConfig, ProviderKind};
use crate::provider::{
    AnthropicProvider, ChatProvider, GeminiProvider, OllamaProvider, OpenAiProvider,
};

/// Builds the adapter for a provider record with the stock timeouts (120s
/// per call, 15s health). `model_override` (an agent's `model_id`) wins over
/// the provider default when set and non-empty.
pub fn build_provider(
    config: &ProviderConfig,
    model_override: Option<&str>,
) -> Arc<dyn ChatProvider> {
    build_provider_with_timeouts(
        config,
        model_override,
        Duration::from_secs(120),
        Duration::from_secs(15),
    )
}

/// [`build_provider`] with explicit per-call and health-check timeouts.
pub fn build_provider_with_timeouts(
    config: &ProviderConfig,
    model_override: Option<&str>,
    request_timeout: Duration,
    health_timeout: Duration,
) -> Arc<dyn ChatProvider> {
    let model = model_override
        .filter(|m| !m.is_empty())
        .unwrap_or(&config.model_id)
        .to_string();
    let api_key = config.api_key.clone();
    let base_url = config.base_url.clone();
    let sampling = config.sampling.clone();

    match config.kind {
        ProviderKind::Anthropic => Arc::new(
            AnthropicProvider::new(api_key, base_url, model, sampling)
                .with_timeouts(request_timeout, health_timeout),
        ),
        ProviderKind::Google => Arc::new(
            GeminiProvider::new(api_key, base_url, model, sampling)
                .with_timeouts(request_timeout, health_timeout),
        ),
        ProviderKind::Ollama => Arc::new(
            OllamaProvider::new(base_url, model, sampling)
                .with_timeouts(request_timeout, health_timeout),
        ),
        // OpenRouter and custom gateways speak the OpenAI wire protocol.
        ProviderKind::Openai | ProviderKind::Openrouter | ProviderKind::Custom => {
            let base_url = match (config.kind, base_url) {
                (ProviderKind::Openrouter, None) => Some("https://openrouter.ai/api".to_string()),
                (_, b) => b,
            };
            Arc::new(
                OpenAiProvider::new(api_key, base_url, model, sampling)
                    .with_timeouts(request_timeout, health_timeout),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::SamplingConfig;

    fn config(kind: ProviderKind) -> ProviderConfig {
        ProviderConfig {
            id: "p1".into(),
            owner_id: "u1".into(),
            kind,
            base_url: None,
            api_key: Some("k".into()),
            model_id: "default-model".into(),
            sampling: SamplingConfig::default(),
        }
    }

    /// **Scenario**: the agent model override wins; empty overrides are ignored.
    #[test]
    fn model_override_rules() {
        let c = config(ProviderKind::Openai);
        assert_eq!(build_provider(&c, None).model_id(), "default-model");
        assert_eq!(build_provider(&c, Some("gpt-4o")).model_id(), "gpt-4o");
        assert_eq!(build_provider(&c, Some("")).model_id(), "default-model");
    }

    /// **Scenario**: every provider kind constructs an adapter.
    #[test]
    fn all_kinds_construct() {
        for kind in [
            ProviderKind::Openai,
            ProviderKind::Anthropic,
            ProviderKind::Google,
            ProviderKind::Ollama,
            ProviderKind::Openrouter,
            ProviderKind::Custom,
        ] {
            let provider = build_provider(&config(kind), None);
            assert_eq!(provider.model_id(), "default-model");
        }
    }
}
