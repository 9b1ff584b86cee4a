//! Provider registry, built once from configured credentials.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chatrelay_core::{Error, RelayConfig};
use reqwest::Client;
use tracing::{info, warn};

use crate::config::models_for;
use crate::error::RelayError;
use crate::gemini::GeminiClient;
use crate::openai::OpenAiClient;
use crate::provider::ProviderClient;

/// Provider clients keyed by lowercase name. Read-only once the server is
/// running, so it is shared across turns behind an `Arc`.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ProviderClient>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one client per configured credential.
    pub fn from_config(config: &RelayConfig) -> chatrelay_core::Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.provider_timeout)
            .build()
            .map_err(|e| Error::Config(format!("HTTP client: {}", e)))?;

        let mut registry = Self::new();
        for credential in &config.providers {
            let provider: Arc<dyn ProviderClient> = match credential.name.as_str() {
                "openai" => Arc::new(OpenAiClient::new(
                    client.clone(),
                    credential.api_key.clone(),
                    credential.base_url.clone(),
                )),
                "gemini" => Arc::new(GeminiClient::new(
                    client.clone(),
                    credential.api_key.clone(),
                    credential.base_url.clone(),
                )),
                other => {
                    warn!("Ignoring credential for unsupported provider '{}'", other);
                    continue;
                }
            };
            registry.register(&credential.name, provider);
            info!("Registered {} provider", credential.name);
        }

        if registry.providers.is_empty() {
            warn!("No LLM providers configured. Set OPENAI_API_KEY or GEMINI_API_KEY.");
        }

        Ok(registry)
    }

    /// Register a provider implementation under `name` (case-insensitive).
    pub fn register(&mut self, name: &str, provider: Arc<dyn ProviderClient>) {
        self.providers.insert(normalize(name), provider);
    }

    /// Resolve a provider by name. Unknown or unconfigured names fail here,
    /// before any upstream I/O.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn ProviderClient>, RelayError> {
        self.providers.get(&normalize(name)).cloned().ok_or_else(|| {
            RelayError::ProviderUnavailable(format!("Provider '{}' not available", name.trim()))
        })
    }

    /// Names of configured providers, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Advertised models for every configured provider.
    pub fn model_catalog(&self) -> BTreeMap<String, Vec<String>> {
        self.providers
            .keys()
            .map(|name| {
                let models = models_for(name).iter().map(|m| m.to_string()).collect();
                (name.clone(), models)
            })
            .collect()
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatrelay_core::ProviderCredential;

    fn config_with(names: &[&str]) -> RelayConfig {
        RelayConfig {
            providers: names
                .iter()
                .map(|n| ProviderCredential {
                    name: n.to_string(),
                    api_key: "key".into(),
                    base_url: None,
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_is_case_insensitive() {
        let registry = ProviderRegistry::from_config(&config_with(&["openai", "gemini"])).unwrap();
        assert_eq!(registry.resolve("OpenAI").unwrap().name(), "openai");
        assert_eq!(registry.resolve(" gemini ").unwrap().name(), "gemini");
        assert_eq!(registry.names(), vec!["gemini", "openai"]);
    }

    #[test]
    fn test_unconfigured_provider_is_unavailable() {
        let registry = ProviderRegistry::from_config(&config_with(&["openai"])).unwrap();
        assert!(matches!(
            registry.resolve("gemini"),
            Err(RelayError::ProviderUnavailable(_))
        ));
        match registry.resolve("mistral") {
            Err(RelayError::ProviderUnavailable(msg)) => assert!(msg.contains("mistral")),
            _ => panic!("expected ProviderUnavailable"),
        }
    }

    #[test]
    fn test_unsupported_credential_is_skipped() {
        let registry = ProviderRegistry::from_config(&config_with(&["openai", "mistral"])).unwrap();
        assert_eq!(registry.names(), vec!["openai"]);
    }

    #[test]
    fn test_model_catalog_lists_configured_providers() {
        let registry = ProviderRegistry::from_config(&config_with(&["gemini"])).unwrap();
        let catalog = registry.model_catalog();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog["gemini"], vec!["gemini-2.5-flash", "gemini-2.5-pro"]);
    }

    #[test]
    fn test_registry_is_shareable_across_tasks() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProviderRegistry>();
    }
}
