//! Process configuration read from the environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8003;
pub const DEFAULT_CORS_ORIGIN: &str = "http://localhost:5137";
pub const DEFAULT_DATA_DIR: &str = "data";
pub const DEFAULT_PROVIDER: &str = "openai";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 1024;
pub const DEFAULT_PROVIDER_TIMEOUT_SECS: u64 = 60;

/// Providers that can be configured through `<NAME>_API_KEY` / `<NAME>_BASE_URL`.
pub const KNOWN_PROVIDERS: &[&str] = &["openai", "gemini"];

/// Credential for one upstream provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCredential {
    /// Lowercase provider name (`openai`, `gemini`).
    pub name: String,
    pub api_key: String,
    /// Overrides the provider's public endpoint when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

/// Top-level chatrelay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    /// Directory holding `chatrelay.db`.
    pub data_dir: PathBuf,
    #[serde(skip_serializing)]
    pub providers: Vec<ProviderCredential>,
    pub default_provider: String,
    pub default_model: String,
    /// Output budget applied when a request does not carry one.
    pub max_output_tokens: u32,
    /// Bound on opening a provider stream and on each wait for the next fragment.
    pub provider_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.into(),
            port: DEFAULT_PORT,
            cors_origins: vec![DEFAULT_CORS_ORIGIN.into()],
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            providers: Vec::new(),
            default_provider: DEFAULT_PROVIDER.into(),
            default_model: DEFAULT_MODEL.into(),
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
            provider_timeout: Duration::from_secs(DEFAULT_PROVIDER_TIMEOUT_SECS),
        }
    }
}

impl RelayConfig {
    /// Create configuration from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup, falling back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mut config = Self::default();

        if let Some(host) = get("APP_HOST") {
            config.host = host;
        }
        if let Some(port) = get("APP_PORT") {
            config.port = parse_number("APP_PORT", &port)?;
        }
        if let Some(origins) = get("CORS_ORIGINS") {
            config.cors_origins = origins
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect();
        }
        if let Some(dir) = get("CHATRELAY_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(provider) = get("DEFAULT_PROVIDER") {
            config.default_provider = provider.trim().to_lowercase();
        }
        if let Some(model) = get("DEFAULT_MODEL") {
            config.default_model = model;
        }
        if let Some(tokens) = get("MAX_OUTPUT_TOKENS") {
            config.max_output_tokens = parse_number("MAX_OUTPUT_TOKENS", &tokens)?;
            if config.max_output_tokens == 0 {
                return Err(Error::Config("MAX_OUTPUT_TOKENS must be positive".into()));
            }
        }
        if let Some(secs) = get("PROVIDER_TIMEOUT_SECS") {
            let secs: u64 = parse_number("PROVIDER_TIMEOUT_SECS", &secs)?;
            if secs == 0 {
                return Err(Error::Config("PROVIDER_TIMEOUT_SECS must be positive".into()));
            }
            config.provider_timeout = Duration::from_secs(secs);
        }

        for name in KNOWN_PROVIDERS {
            let prefix = name.to_uppercase();
            if let Some(api_key) = get(&format!("{prefix}_API_KEY")) {
                config.providers.push(ProviderCredential {
                    name: name.to_string(),
                    api_key,
                    base_url: get(&format!("{prefix}_BASE_URL")),
                });
            }
        }

        if config.credential(&config.default_provider).is_none() {
            warn!(
                "Default provider '{}' has no credential configured",
                config.default_provider
            );
        }

        Ok(config)
    }

    /// Look up the credential for a provider name (case-insensitive).
    pub fn credential(&self, name: &str) -> Option<&ProviderCredential> {
        self.providers
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name.trim()))
    }

    /// Create the data directory if needed.
    pub fn ensure_data_dir(&self) -> Result<&Path> {
        std::fs::create_dir_all(&self.data_dir)?;
        Ok(&self.data_dir)
    }

    /// Socket address string for the HTTP listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key} must be a number, got '{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_env() {
        let config = RelayConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.port, 8003);
        assert_eq!(config.default_provider, "openai");
        assert_eq!(config.default_model, "gpt-4o-mini");
        assert_eq!(config.max_output_tokens, 1024);
        assert_eq!(config.cors_origins, vec!["http://localhost:5137"]);
        assert!(config.providers.is_empty());
        assert_eq!(config.data_dir, PathBuf::from("data"));
    }

    #[test]
    fn test_provider_credentials_from_keys() {
        let config = RelayConfig::from_lookup(lookup(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("GEMINI_API_KEY", "g-test"),
            ("GEMINI_BASE_URL", "http://127.0.0.1:9000"),
        ]))
        .unwrap();

        assert_eq!(config.providers.len(), 2);
        let gemini = config.credential("GEMINI").unwrap();
        assert_eq!(gemini.api_key, "g-test");
        assert_eq!(gemini.base_url.as_deref(), Some("http://127.0.0.1:9000"));
        assert!(config.credential("openai").unwrap().base_url.is_none());
        assert!(config.credential("mistral").is_none());
    }

    #[test]
    fn test_blank_key_is_not_a_credential() {
        let config = RelayConfig::from_lookup(lookup(&[("OPENAI_API_KEY", "  ")])).unwrap();
        assert!(config.credential("openai").is_none());
    }

    #[test]
    fn test_overrides_and_origin_list() {
        let config = RelayConfig::from_lookup(lookup(&[
            ("APP_PORT", "9100"),
            ("DEFAULT_PROVIDER", "Gemini"),
            ("DEFAULT_MODEL", "gemini-2.5-flash"),
            ("MAX_OUTPUT_TOKENS", "256"),
            ("PROVIDER_TIMEOUT_SECS", "5"),
            ("CORS_ORIGINS", "http://a.test, http://b.test,"),
        ]))
        .unwrap();

        assert_eq!(config.bind_addr(), "0.0.0.0:9100");
        assert_eq!(config.default_provider, "gemini");
        assert_eq!(config.max_output_tokens, 256);
        assert_eq!(config.provider_timeout, Duration::from_secs(5));
        assert_eq!(config.cors_origins, vec!["http://a.test", "http://b.test"]);
    }

    #[test]
    fn test_invalid_numbers_are_config_errors() {
        let result = RelayConfig::from_lookup(lookup(&[("APP_PORT", "eighty")]));
        assert!(matches!(result, Err(Error::Config(_))));

        let result = RelayConfig::from_lookup(lookup(&[("MAX_OUTPUT_TOKENS", "0")]));
        assert!(matches!(result, Err(Error::Config(_))));

        let result = RelayConfig::from_lookup(lookup(&[("PROVIDER_TIMEOUT_SECS", "0")]));
        assert!(matches!(result, Err(Error::Config(_))));

        let result = RelayConfig::from_lookup(lookup(&[("PROVIDER_TIMEOUT_SECS", "-5")]));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
