//! Relay defaults and the advertised model catalog.

use std::time::Duration;

use chatrelay_core::RelayConfig;

pub const OPENAI_MODELS: &[&str] = &["gpt-4o-mini"];
pub const GEMINI_MODELS: &[&str] = &["gemini-2.5-flash", "gemini-2.5-pro"];

/// Models advertised for a provider (empty for unknown providers).
pub fn models_for(provider: &str) -> &'static [&'static str] {
    match provider {
        "openai" => OPENAI_MODELS,
        "gemini" => GEMINI_MODELS,
        _ => &[],
    }
}

/// Defaults applied to a turn when the request leaves them out.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub default_provider: String,
    pub default_model: String,
    pub max_output_tokens: u32,
    /// Bounds opening the provider stream and each wait for the next fragment.
    pub provider_timeout: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self::from(&RelayConfig::default())
    }
}

impl From<&RelayConfig> for RelaySettings {
    fn from(config: &RelayConfig) -> Self {
        Self {
            default_provider: config.default_provider.to_lowercase(),
            default_model: config.default_model.clone(),
            max_output_tokens: config.max_output_tokens,
            provider_timeout: config.provider_timeout,
        }
    }
}

impl RelaySettings {
    /// Model used when the request names none: the configured default for the
    /// default provider, otherwise the first catalog model of `provider`.
    pub fn model_for(&self, provider: &str) -> String {
        if provider == self.default_provider {
            return self.default_model.clone();
        }
        models_for(provider)
            .first()
            .map(|m| m.to_string())
            .unwrap_or_else(|| self.default_model.clone())
    }
}
