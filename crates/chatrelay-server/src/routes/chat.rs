//! Chat routes: one turn per request, streamed as SSE or collected.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, KeepAliveStream, Sse};
use axum::routing::post;
use axum::{Json, Router};
use chatrelay_chat::{ChatMessage, RelayEvent, Role, TurnRequest};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::StreamExt;
use tracing::debug;

use crate::error::ApiError;
use crate::state::AppState;

type SseStream = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/chat/{session_id}", post(chat))
        .route("/chat/{session_id}/stream", post(stream_chat))
}

#[derive(Debug, Deserialize)]
struct MessageIn {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatBody {
    messages: Vec<MessageIn>,
    provider: Option<String>,
    model: Option<String>,
    max_tokens: Option<u32>,
}

fn turn_request(
    session_id: String,
    payload: Result<Json<ChatBody>, JsonRejection>,
) -> Result<TurnRequest, ApiError> {
    let Json(body) = payload.map_err(|e| ApiError::bad_request(e.body_text()))?;

    let messages = body
        .messages
        .into_iter()
        .map(|m| {
            let role: Role = m.role.parse().map_err(ApiError::bad_request)?;
            Ok(ChatMessage::new(role, m.content))
        })
        .collect::<Result<Vec<_>, ApiError>>()?;

    Ok(TurnRequest {
        session_id,
        messages,
        provider: body.provider,
        model: body.model,
        max_output_tokens: body.max_tokens,
    })
}

fn data(value: serde_json::Value) -> Event {
    Event::default().data(value.to_string())
}

/// POST /chat/{session_id}/stream
///
/// Errors before the first fragment are plain JSON responses; once the SSE
/// body starts, every event is `data:` JSON and the body ends with `[DONE]`.
async fn stream_chat(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    payload: Result<Json<ChatBody>, JsonRejection>,
) -> Result<Sse<KeepAliveStream<SseStream>>, ApiError> {
    let request = turn_request(session_id, payload)?;
    let relay_stream = state.relay.start(request).await?;
    // The relay task owns persistence; dropping `events` is a disconnect.
    let (mut events, _task) = relay_stream.into_parts();

    let stream: SseStream = Box::pin(async_stream::stream! {
        while let Some(event) = events.next().await {
            match event {
                RelayEvent::Fragment(fragment) => {
                    yield Ok::<_, Infallible>(data(json!({ "delta": fragment.as_str() })));
                }
                RelayEvent::Done { persisted } => {
                    debug!("Stream finished, reply persisted: {}", persisted);
                    break;
                }
                RelayEvent::Interrupted { partial, fragments, reason } => {
                    yield Ok(data(json!({
                        "error": reason,
                        "partial": partial,
                        "fragments": fragments,
                    })));
                    break;
                }
            }
        }
        yield Ok(Event::default().data("[DONE]"));
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// POST /chat/{session_id}: same turn, collected into one reply.
async fn chat(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    payload: Result<Json<ChatBody>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request = turn_request(session_id, payload)?;
    let reply = state.relay.start(request).await?.collect().await?;

    Ok(Json(json!({
        "message": reply.content,
        "provider": reply.provider,
        "model": reply.model,
        "persisted": reply.persisted,
    })))
}
