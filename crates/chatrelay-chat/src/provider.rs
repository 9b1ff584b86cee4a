//! Provider client trait and the SSE plumbing shared by its implementations.
//!
//! Each adapter translates the uniform role/content history into its
//! upstream's request shape and hands the response body to
//! [`fragment_stream`] together with a parser for one `data:` payload.

use std::fmt::Display;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use reqwest::StatusCode;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::error::ProviderError;
use crate::sse::SseLineBuffer;
use crate::types::{Fragment, ProviderRequest};

/// Lazy, single-pass sequence of fragments.
///
/// Ends with `None` on clean completion. A failure after the stream started is
/// delivered as one `Err(ProviderError::Interrupted { .. })` item, after which
/// the stream ends.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<Fragment, ProviderError>> + Send>>;

/// An upstream LLM service that can stream a reply.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Lowercase provider name (`openai`, `gemini`).
    fn name(&self) -> &str;

    /// Open a reply stream. Connection, auth and request errors are returned
    /// here, before any fragment exists; the body is read only as the returned
    /// stream is polled.
    async fn stream(&self, request: ProviderRequest) -> Result<FragmentStream, ProviderError>;
}

/// What one upstream `data:` payload contributed.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct UpstreamEvent {
    pub text: Option<String>,
    /// The upstream signalled clean completion.
    pub finished: bool,
}

impl UpstreamEvent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            finished: false,
        }
    }

    pub fn finished() -> Self {
        Self {
            text: None,
            finished: true,
        }
    }
}

/// Parser for a single `data:` payload. `Err` carries the reason the stream
/// must be treated as interrupted.
pub(crate) type PayloadParser = fn(&str) -> Result<UpstreamEvent, String>;

/// Decode an SSE response body into fragments.
///
/// A body that ends without the upstream's completion signal is reported as
/// interrupted, never as a clean end.
pub(crate) fn fragment_stream<S, B, E>(
    provider: &'static str,
    body: S,
    parse: PayloadParser,
) -> FragmentStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: Display + Send,
{
    Box::pin(async_stream::stream! {
        tokio::pin!(body);
        let mut lines = SseLineBuffer::new();
        let mut produced = String::new();
        let mut fragments = 0usize;

        loop {
            let (payloads, eof) = match body.next().await {
                Some(Ok(bytes)) => match lines.push(bytes.as_ref()) {
                    Ok(payloads) => (payloads, false),
                    Err(reason) => {
                        warn!("{} stream failed after {} fragment(s): {}", provider, fragments, reason);
                        yield Err(ProviderError::Interrupted {
                            partial: produced.clone(),
                            reason,
                        });
                        return;
                    }
                },
                Some(Err(e)) => {
                    warn!("{} stream read error after {} fragment(s): {}", provider, fragments, e);
                    yield Err(ProviderError::Interrupted {
                        partial: produced.clone(),
                        reason: format!("stream read error: {}", e),
                    });
                    return;
                }
                None => (lines.finish().into_iter().collect::<Vec<_>>(), true),
            };

            for data in payloads {
                match parse(&data) {
                    Ok(event) => {
                        if let Some(fragment) = event.text.and_then(Fragment::new) {
                            produced.push_str(fragment.as_str());
                            fragments += 1;
                            yield Ok(fragment);
                        }
                        if event.finished {
                            debug!("{} stream completed with {} fragment(s)", provider, fragments);
                            return;
                        }
                    }
                    Err(reason) => {
                        warn!("{} stream failed after {} fragment(s): {}", provider, fragments, reason);
                        yield Err(ProviderError::Interrupted {
                            partial: produced.clone(),
                            reason,
                        });
                        return;
                    }
                }
            }

            if eof {
                warn!("{} stream closed before completion after {} fragment(s)", provider, fragments);
                yield Err(ProviderError::Interrupted {
                    partial: produced.clone(),
                    reason: "upstream closed the stream before completion".into(),
                });
                return;
            }
        }
    })
}

/// Map a non-success upstream status to the error taxonomy.
pub(crate) fn status_error(provider: &str, status: StatusCode, body: &str) -> ProviderError {
    let message = format!("{} returned {}: {}", provider, status, upstream_message(body));
    match status {
        StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND | StatusCode::UNPROCESSABLE_ENTITY => {
            ProviderError::InvalidRequest(message)
        }
        _ => ProviderError::Unavailable(message),
    }
}

/// Map a transport failure while connecting.
pub(crate) fn request_error(provider: &str, err: reqwest::Error) -> ProviderError {
    ProviderError::Unavailable(format!("{} request failed: {}", provider, err))
}

/// Pull `error.message` out of a JSON error body, falling back to the raw text.
fn upstream_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_plain(data: &str) -> Result<UpstreamEvent, String> {
        match data {
            "END" => Ok(UpstreamEvent::finished()),
            "BAD" => Err("malformed".into()),
            text => Ok(UpstreamEvent::text(text)),
        }
    }

    async fn drain(stream: FragmentStream) -> Vec<Result<Fragment, ProviderError>> {
        stream.collect().await
    }

    fn body(chunks: Vec<Result<&'static str, String>>) -> impl Stream<Item = Result<&'static str, String>> {
        tokio_stream::iter(chunks)
    }

    #[tokio::test]
    async fn test_clean_completion() {
        let items = drain(fragment_stream(
            "test",
            body(vec![Ok("data: Hel\n"), Ok("data: lo!\ndata: END\n")]),
            parse_plain,
        ))
        .await;
        let texts: Vec<_> = items.into_iter().map(|i| i.unwrap().into_string()).collect();
        assert_eq!(texts, vec!["Hel", "lo!"]);
    }

    #[tokio::test]
    async fn test_eof_without_completion_is_interrupted() {
        let items = drain(fragment_stream(
            "test",
            body(vec![Ok("data: Par\n"), Ok("data: tial\n")]),
            parse_plain,
        ))
        .await;
        assert_eq!(items.len(), 3);
        match &items[2] {
            Err(ProviderError::Interrupted { partial, .. }) => assert_eq!(partial, "Partial"),
            other => panic!("expected interruption, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_error_carries_partial() {
        let items = drain(fragment_stream(
            "test",
            body(vec![Ok("data: Par\n"), Err("connection reset".into()), Ok("data: never\n")]),
            parse_plain,
        ))
        .await;
        assert_eq!(items.len(), 2);
        match &items[1] {
            Err(ProviderError::Interrupted { partial, reason }) => {
                assert_eq!(partial, "Par");
                assert!(reason.contains("connection reset"));
            }
            other => panic!("expected interruption, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_payload_stops_stream() {
        let items = drain(fragment_stream(
            "test",
            body(vec![Ok("data: a\ndata: BAD\ndata: b\n")]),
            parse_plain,
        ))
        .await;
        assert_eq!(items.len(), 2);
        assert!(matches!(items[1], Err(ProviderError::Interrupted { .. })));
    }

    #[tokio::test]
    async fn test_oversized_line_is_interrupted() {
        let chunks = vec![
            Ok::<_, String>(b"data: Par\n".to_vec()),
            Ok(vec![b'x'; crate::sse::MAX_LINE_BYTES + 1]),
            Ok(b"\ndata: END\n".to_vec()),
        ];
        let items = drain(fragment_stream("test", tokio_stream::iter(chunks), parse_plain)).await;
        assert_eq!(items.len(), 2);
        match &items[1] {
            Err(ProviderError::Interrupted { partial, reason }) => {
                assert_eq!(partial, "Par");
                assert!(reason.contains("exceeds"));
            }
            other => panic!("expected interruption, got {:?}", other),
        }
    }

    #[test]
    fn test_status_mapping() {
        let body = r#"{"error":{"message":"The model `nope` does not exist"}}"#;
        match status_error("openai", StatusCode::NOT_FOUND, body) {
            ProviderError::InvalidRequest(msg) => assert!(msg.contains("does not exist")),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            status_error("openai", StatusCode::UNAUTHORIZED, "bad key"),
            ProviderError::Unavailable(_)
        ));
        assert!(matches!(
            status_error("gemini", StatusCode::TOO_MANY_REQUESTS, ""),
            ProviderError::Unavailable(_)
        ));
    }
}
