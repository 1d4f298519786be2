//! Provider selection — builds the configured generation backend.
//!
//! `gemini` gets the native Gemini client; every other name is treated as an
//! OpenAI-compatible endpoint with a well-known default base URL.

use std::sync::Arc;
use std::time::Duration;

use lunavilla_config::AppConfig;
use lunavilla_core::error::ProviderError;
use lunavilla_core::provider::Provider;
use tracing::info;

use crate::gemini::GeminiProvider;
use crate::openai_compat::OpenAiCompatProvider;

/// Providers that run locally and accept any key.
const KEYLESS_PROVIDERS: &[&str] = &["ollama", "vllm", "llamacpp", "llama.cpp"];

/// Build the provider named by `config.default_provider`.
pub fn build_from_config(config: &AppConfig) -> Result<Arc<dyn Provider>, ProviderError> {
    let name = config.default_provider.as_str();
    let keyless = KEYLESS_PROVIDERS.contains(&name);

    let api_key = match config.api_key.clone().filter(|k| !k.is_empty()) {
        Some(key) => key,
        None if keyless => name.to_string(),
        None => {
            return Err(ProviderError::NotConfigured(format!(
                "no API key set for provider '{name}' (set GEMINI_API_KEY or api_key in config.toml)"
            )))
        }
    };

    // A gap this long between reply bytes fails the request
    let read_timeout = Duration::from_secs(config.chat.stream_idle_timeout_secs);

    let provider: Arc<dyn Provider> = if name == "gemini" {
        let base_url = config
            .api_url
            .clone()
            .unwrap_or_else(|| crate::gemini::DEFAULT_BASE_URL.to_string());
        Arc::new(GeminiProvider::new(base_url, api_key, read_timeout))
    } else {
        let base_url = config
            .api_url
            .clone()
            .or_else(|| default_base_url(name))
            .ok_or_else(|| {
                ProviderError::NotConfigured(format!(
                    "unknown provider '{name}' needs api_url in config.toml"
                ))
            })?;
        Arc::new(OpenAiCompatProvider::new(name, base_url, api_key, read_timeout))
    };

    info!(provider = %provider.name(), model = %config.default_model, "Provider ready");
    Ok(provider)
}

/// Get the default base URL for well-known OpenAI-compatible providers.
fn default_base_url(provider_name: &str) -> Option<String> {
    let url = match provider_name {
        "openrouter" => "https://openrouter.ai/api/v1",
        "openai" => "https://api.openai.com/v1",
        "ollama" => "http://localhost:11434/v1",
        "deepseek" => "https://api.deepseek.com/v1",
        "groq" => "https://api.groq.com/openai/v1",
        "together" => "https://api.together.xyz/v1",
        "vllm" => "http://localhost:8000/v1",
        "llamacpp" | "llama.cpp" => "http://localhost:8080/v1",
        _ => return None,
    };
    Some(url.to_string())
}
