//! OpenAI chat-completions adapter.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::debug;

use crate::error::ProviderError;
use crate::provider::{fragment_stream, request_error, status_error, FragmentStream, ProviderClient, UpstreamEvent};
use crate::types::ProviderRequest;

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Streams from any OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl OpenAiClient {
    pub fn new(client: Client, api_key: impl Into<String>, base_url: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url
                .unwrap_or_else(|| OPENAI_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl ProviderClient for OpenAiClient {
    fn name(&self) -> &str {
        "openai"
    }

    async fn stream(&self, request: ProviderRequest) -> Result<FragmentStream, ProviderError> {
        request.validate()?;

        let url = format!("{}/chat/completions", self.base_url);
        debug!("Streaming from {} with model {}", url, request.model);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request_body(&request))
            .send()
            .await
            .map_err(|e| request_error("openai", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(status_error("openai", status, &body));
        }

        Ok(fragment_stream("openai", response.bytes_stream(), parse_payload))
    }
}

fn request_body(request: &ProviderRequest) -> serde_json::Value {
    let messages: Vec<serde_json::Value> = request
        .messages
        .iter()
        .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
        .collect();

    json!({
        "model": request.model,
        "messages": messages,
        "max_tokens": request.max_output_tokens,
        "stream": true,
    })
}

/// `choices[0].delta.content` carries text; `[DONE]` ends the stream.
/// Role-only and tool-call deltas carry no text and are skipped.
fn parse_payload(data: &str) -> Result<UpstreamEvent, String> {
    if data.trim() == "[DONE]" {
        return Ok(UpstreamEvent::finished());
    }

    let parsed: serde_json::Value =
        serde_json::from_str(data).map_err(|e| format!("malformed chunk: {}", e))?;

    if let Some(error) = parsed.get("error") {
        let message = error["message"].as_str().unwrap_or("unknown upstream error");
        return Err(format!("upstream error: {}", message));
    }

    Ok(match parsed["choices"][0]["delta"]["content"].as_str() {
        Some(text) => UpstreamEvent::text(text),
        None => UpstreamEvent::default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChatMessage, Fragment};
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::post;
    use axum::{Json, Router};
    use tokio_stream::StreamExt;

    fn request() -> ProviderRequest {
        ProviderRequest {
            messages: vec![ChatMessage::system("be brief"), ChatMessage::user("hi")],
            model: "gpt-4o-mini".into(),
            max_output_tokens: 32,
        }
    }

    /// Serve `router` on an ephemeral port and return its base URL.
    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn sse_body(lines: &[&str]) -> String {
        lines.iter().map(|l| format!("data: {}\n\n", l)).collect()
    }

    #[test]
    fn test_request_body_shape() {
        let body = request_body(&request());
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["stream"], true);
        assert_eq!(body["max_tokens"], 32);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
    }

    #[test]
    fn test_parse_payload() {
        let delta = r#"{"choices":[{"index":0,"delta":{"content":"Hel"}}]}"#;
        assert_eq!(parse_payload(delta).unwrap(), UpstreamEvent::text("Hel"));

        let role_only = r#"{"choices":[{"index":0,"delta":{"role":"assistant"}}]}"#;
        assert_eq!(parse_payload(role_only).unwrap(), UpstreamEvent::default());

        let tool_call = r#"{"choices":[{"delta":{"tool_calls":[{"index":0}]}}]}"#;
        assert_eq!(parse_payload(tool_call).unwrap().text, None);

        assert!(parse_payload("[DONE]").unwrap().finished);
        assert!(parse_payload("{not json").is_err());
        assert!(parse_payload(r#"{"error":{"message":"rate limited"}}"#)
            .unwrap_err()
            .contains("rate limited"));
    }

    #[tokio::test]
    async fn test_streams_fragments_from_upstream() {
        let router = Router::new().route(
            "/chat/completions",
            post(|headers: HeaderMap, Json(body): Json<serde_json::Value>| async move {
                assert_eq!(headers["authorization"], "Bearer sk-test");
                assert_eq!(body["stream"], true);
                sse_body(&[
                    r#"{"choices":[{"delta":{"role":"assistant"}}]}"#,
                    r#"{"choices":[{"delta":{"content":"Hel"}}]}"#,
                    r#"{"choices":[{"delta":{"content":"lo!"}}]}"#,
                    r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
                    "[DONE]",
                ])
            }),
        );
        let base = serve(router).await;
        let client = OpenAiClient::new(Client::new(), "sk-test", Some(base));

        let stream = client.stream(request()).await.unwrap();
        let items: Vec<_> = stream.collect().await;
        let fragments: Vec<Fragment> = items.into_iter().map(|i| i.unwrap()).collect();
        let texts: Vec<&str> = fragments.iter().map(|f| f.as_str()).collect();
        assert_eq!(texts, vec!["Hel", "lo!"]);
    }

    #[tokio::test]
    async fn test_missing_done_marker_is_interrupted() {
        let router = Router::new().route(
            "/chat/completions",
            post(|| async {
                sse_body(&[
                    r#"{"choices":[{"delta":{"content":"Par"}}]}"#,
                    r#"{"choices":[{"delta":{"content":"tial"}}]}"#,
                ])
            }),
        );
        let base = serve(router).await;
        let client = OpenAiClient::new(Client::new(), "sk-test", Some(base));

        let items: Vec<_> = client.stream(request()).await.unwrap().collect().await;
        match items.last() {
            Some(Err(ProviderError::Interrupted { partial, .. })) => assert_eq!(partial, "Partial"),
            other => panic!("expected interruption, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_auth_failure_before_any_fragment() {
        let router = Router::new().route(
            "/chat/completions",
            post(|| async {
                (
                    StatusCode::UNAUTHORIZED,
                    Json(serde_json::json!({"error": {"message": "Incorrect API key provided"}})),
                )
                    .into_response()
            }),
        );
        let base = serve(router).await;
        let client = OpenAiClient::new(Client::new(), "sk-bad", Some(base));

        match client.stream(request()).await {
            Err(ProviderError::Unavailable(msg)) => assert!(msg.contains("Incorrect API key")),
            Err(other) => panic!("unexpected error {:?}", other),
            Ok(_) => panic!("expected an error"),
        }
    }

    #[tokio::test]
    async fn test_unknown_model_is_invalid_request() {
        let router = Router::new().route(
            "/chat/completions",
            post(|| async { (StatusCode::NOT_FOUND, "model not found").into_response() }),
        );
        let base = serve(router).await;
        let client = OpenAiClient::new(Client::new(), "sk-test", Some(base));

        assert!(matches!(
            client.stream(request()).await,
            Err(ProviderError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_unavailable() {
        let client = OpenAiClient::new(Client::new(), "sk-test", Some("http://127.0.0.1:1".into()));
        assert!(matches!(
            client.stream(request()).await,
            Err(ProviderError::Unavailable(_))
        ));
    }
}
