//! Gemini `streamGenerateContent` adapter.
//!
//! Gemini takes structured multi-part contents: assistant turns are sent with
//! role `model` and system turns move into `systemInstruction`. Only text
//! parts are relayed; function calls and other structured parts are dropped.

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::json;
use tracing::debug;

use crate::error::ProviderError;
use crate::provider::{fragment_stream, request_error, status_error, FragmentStream, ProviderClient, UpstreamEvent};
use crate::types::{ProviderRequest, Role};

pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";

const TEMPERATURE: f64 = 0.7;
const TOP_P: f64 = 0.95;

pub struct GeminiClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl GeminiClient {
    pub fn new(client: Client, api_key: impl Into<String>, base_url: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url
                .unwrap_or_else(|| GEMINI_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl ProviderClient for GeminiClient {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn stream(&self, request: ProviderRequest) -> Result<FragmentStream, ProviderError> {
        request.validate()?;
        if request.messages.iter().all(|m| m.role == Role::System) {
            return Err(ProviderError::InvalidRequest(
                "conversation has no user or assistant turns".into(),
            ));
        }

        let url = stream_url(&self.base_url, &request.model)?;
        debug!("Streaming from Gemini with model {}", request.model);

        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&request_body(&request))
            .send()
            .await
            .map_err(|e| request_error("gemini", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(status_error("gemini", status, &body));
        }

        Ok(fragment_stream("gemini", response.bytes_stream(), parse_payload))
    }
}

/// `{base}/v1beta/models/{model}:streamGenerateContent?alt=sse`, with the
/// model escaped as a single path segment.
fn stream_url(base_url: &str, model: &str) -> Result<Url, ProviderError> {
    let mut url = Url::parse(base_url)
        .map_err(|e| ProviderError::Unavailable(format!("gemini: bad base URL: {}", e)))?;
    let action = format!("{}:streamGenerateContent", model);
    url.path_segments_mut()
        .map_err(|_| ProviderError::Unavailable(format!("gemini: bad base URL: {}", base_url)))?
        .pop_if_empty()
        .extend(["v1beta", "models", action.as_str()]);
    url.query_pairs_mut().append_pair("alt", "sse");
    Ok(url)
}

fn request_body(request: &ProviderRequest) -> serde_json::Value {
    let mut system_parts = Vec::new();
    let mut contents = Vec::new();

    for msg in &request.messages {
        match msg.role {
            Role::System => system_parts.push(json!({"text": msg.content})),
            Role::User => contents.push(json!({"role": "user", "parts": [{"text": msg.content}]})),
            Role::Assistant => {
                contents.push(json!({"role": "model", "parts": [{"text": msg.content}]}))
            }
        }
    }

    let mut body = json!({
        "contents": contents,
        "generationConfig": {
            "maxOutputTokens": request.max_output_tokens,
            "temperature": TEMPERATURE,
            "topP": TOP_P,
        },
    });
    if !system_parts.is_empty() {
        body["systemInstruction"] = json!({"parts": system_parts});
    }
    body
}

/// Text comes from `candidates[0].content.parts[].text`. A `finishReason` of
/// `STOP` or `MAX_TOKENS` marks the final chunk; any other reason (safety,
/// recitation, ...) cut the reply short and is an error.
fn parse_payload(data: &str) -> Result<UpstreamEvent, String> {
    let parsed: serde_json::Value =
        serde_json::from_str(data).map_err(|e| format!("malformed chunk: {}", e))?;

    if let Some(error) = parsed.get("error") {
        let message = error["message"].as_str().unwrap_or("unknown upstream error");
        return Err(format!("upstream error: {}", message));
    }

    let candidate = &parsed["candidates"][0];
    if candidate.is_null() {
        if let Some(reason) = parsed["promptFeedback"]["blockReason"].as_str() {
            return Err(format!("prompt blocked: {}", reason));
        }
        return Ok(UpstreamEvent::default());
    }

    let text: String = candidate["content"]["parts"]
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part["text"].as_str())
                .collect()
        })
        .unwrap_or_default();

    let finished = match candidate["finishReason"].as_str() {
        None => false,
        Some("STOP") | Some("MAX_TOKENS") => true,
        Some(reason) => return Err(format!("generation stopped: {}", reason)),
    };

    Ok(UpstreamEvent {
        text: Some(text).filter(|t| !t.is_empty()),
        finished,
    })
}
