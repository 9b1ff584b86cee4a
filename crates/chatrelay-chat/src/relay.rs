//! Stream relay: one chat turn from user message to persisted reply.
//!
//! ```text
//! Idle ──persist user──▶ UserPersisted ──resolve+open──▶ Streaming ──clean end──▶ Completed
//!   │                         │                              │
//!   └──invalid / storage──────┴──unavailable────────────────┴──interrupted──▶ Failed
//! ```
//!
//! Interrupted turns (upstream failure, fragment timeout, caller disconnect)
//! persist whatever was already forwarded as an assistant turn flagged
//! `incomplete`; nothing is persisted when no fragment was forwarded.

use std::sync::Arc;
use std::time::Duration;

use chatrelay_store::{MessageStore, NewMessage, Turn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use crate::config::RelaySettings;
use crate::error::RelayError;
use crate::provider::FragmentStream;
use crate::registry::ProviderRegistry;
use crate::types::{ChatMessage, Fragment, ProviderRequest, Role};

/// Fragments in flight between the relay task and the transport. Kept at one
/// so a stalled or departed caller stops upstream consumption right away.
const FORWARD_CAPACITY: usize = 1;

/// One chat turn as submitted by the caller.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub session_id: String,
    /// Conversation history; the last entry is the new user message.
    pub messages: Vec<ChatMessage>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub max_output_tokens: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    UserPersisted,
    Streaming,
    Completed,
    Failed,
}

/// What the transport receives: fragments, then exactly one terminal event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Fragment(Fragment),
    /// Clean completion. `persisted` is false when saving the reply failed.
    Done { persisted: bool },
    Interrupted {
        partial: String,
        fragments: usize,
        reason: String,
    },
}

/// Final state of a streamed turn, reported by the relay task.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub state: RelayState,
    /// Concatenation of every forwarded fragment.
    pub content: String,
    pub fragments: usize,
    pub assistant_turn: Option<Turn>,
    pub error: Option<RelayError>,
}

/// Reply gathered by [`RelayStream::collect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedReply {
    pub content: String,
    pub provider: String,
    pub model: String,
    pub persisted: bool,
}

/// A turn whose provider stream is open.
pub struct RelayStream {
    provider: String,
    model: String,
    user_turn: Turn,
    events: mpsc::Receiver<RelayEvent>,
    task: JoinHandle<TurnOutcome>,
}

impl RelayStream {
    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn user_turn(&self) -> &Turn {
        &self.user_turn
    }

    /// Next event, or `None` once the terminal event was taken.
    pub async fn next_event(&mut self) -> Option<RelayEvent> {
        self.events.recv().await
    }

    /// Split into the event stream for the transport and the relay task.
    /// Dropping the event stream counts as a caller disconnect.
    pub fn into_parts(self) -> (ReceiverStream<RelayEvent>, JoinHandle<TurnOutcome>) {
        (ReceiverStream::new(self.events), self.task)
    }

    /// Drain the turn into one reply.
    pub async fn collect(self) -> Result<CollectedReply, RelayError> {
        let provider = self.provider;
        let model = self.model;
        let mut events = ReceiverStream::new(self.events);
        let mut content = String::new();
        let mut received = 0usize;

        while let Some(event) = events.next().await {
            match event {
                RelayEvent::Fragment(fragment) => {
                    content.push_str(fragment.as_str());
                    received += 1;
                }
                RelayEvent::Done { persisted } => {
                    return Ok(CollectedReply {
                        content,
                        provider,
                        model,
                        persisted,
                    })
                }
                RelayEvent::Interrupted {
                    partial,
                    fragments,
                    reason,
                } => {
                    return Err(RelayError::StreamInterrupted {
                        partial,
                        fragments,
                        reason,
                    })
                }
            }
        }

        Err(RelayError::StreamInterrupted {
            partial: content,
            fragments: received,
            reason: "relay task ended without a terminal event".into(),
        })
    }
}

/// Orchestrates chat turns. Cheap to clone; clones share the registry and store.
#[derive(Clone)]
pub struct StreamRelay {
    registry: Arc<ProviderRegistry>,
    store: Arc<dyn MessageStore>,
    settings: RelaySettings,
}

impl StreamRelay {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        store: Arc<dyn MessageStore>,
        settings: RelaySettings,
    ) -> Self {
        Self {
            registry,
            store,
            settings,
        }
    }

    /// Run the turn up to an open provider stream.
    ///
    /// Errors returned here happen before any fragment is produced. Once this
    /// returns `Ok`, the remaining turn runs on its own task and reports
    /// through the returned [`RelayStream`].
    pub async fn start(&self, request: TurnRequest) -> Result<RelayStream, RelayError> {
        let provider_name = request
            .provider
            .as_deref()
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| self.settings.default_provider.clone());
        let model = request
            .model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| self.settings.model_for(&provider_name));
        let max_output_tokens = request
            .max_output_tokens
            .unwrap_or(self.settings.max_output_tokens);

        let session_id = request.session_id.as_str();

        // Idle: reject malformed turns before any I/O.
        let user_content = validate_conversation(&request.messages)
            .and_then(|content| {
                if max_output_tokens == 0 {
                    return Err(RelayError::InvalidRequest(
                        "max_output_tokens must be positive".into(),
                    ));
                }
                Ok(content.to_string())
            })
            .map_err(|e| {
                debug!("Session {}: rejected turn: {}", session_id, e);
                transition(session_id, RelayState::Idle, RelayState::Failed);
                e
            })?;

        let user_turn = self
            .store
            .append_message(
                NewMessage::user(session_id, user_content).produced_by(&provider_name, &model),
            )
            .await
            .map_err(|e| {
                warn!("Session {}: failed to persist user turn: {}", session_id, e);
                transition(session_id, RelayState::Idle, RelayState::Failed);
                RelayError::from(e)
            })?;
        transition(session_id, RelayState::Idle, RelayState::UserPersisted);

        let client = self.registry.resolve(&provider_name).map_err(|e| {
            warn!("Session {}: {}", session_id, e);
            transition(session_id, RelayState::UserPersisted, RelayState::Failed);
            e
        })?;

        let provider_request = ProviderRequest {
            messages: request.messages,
            model: model.clone(),
            max_output_tokens,
        };
        let timeout = self.settings.provider_timeout;
        let stream = match tokio::time::timeout(timeout, client.stream(provider_request)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!("Session {}: {} failed to open stream: {}", session_id, provider_name, e);
                transition(session_id, RelayState::UserPersisted, RelayState::Failed);
                return Err(e.into());
            }
            Err(_) => {
                warn!("Session {}: {} did not respond within {:?}", session_id, provider_name, timeout);
                transition(session_id, RelayState::UserPersisted, RelayState::Failed);
                return Err(RelayError::ProviderUnavailable(format!(
                    "{} did not respond within {:?}",
                    provider_name, timeout
                )));
            }
        };

        info!(
            "Session {}: streaming from {} ({})",
            session_id, provider_name, model
        );
        transition(session_id, RelayState::UserPersisted, RelayState::Streaming);

        let (tx, rx) = mpsc::channel(FORWARD_CAPACITY);
        let turn = ActiveTurn {
            session_id: request.session_id.clone(),
            provider: provider_name.clone(),
            model: model.clone(),
            store: self.store.clone(),
            fragment_timeout: timeout,
        };
        let task = tokio::spawn(turn.drive(stream, tx));

        Ok(RelayStream {
            provider: provider_name,
            model,
            user_turn,
            events: rx,
            task,
        })
    }
}

fn transition(session_id: &str, from: RelayState, to: RelayState) {
    debug!("Session {}: {:?} -> {:?}", session_id, from, to);
}

/// Check the conversation and return the new user message.
fn validate_conversation(messages: &[ChatMessage]) -> Result<&str, RelayError> {
    let last = messages
        .last()
        .ok_or_else(|| RelayError::InvalidRequest("conversation is empty".into()))?;
    if last.role != Role::User {
        return Err(RelayError::InvalidRequest(
            "last message must have role 'user'".into(),
        ));
    }
    if let Some(pos) = messages.iter().position(|m| m.content.trim().is_empty()) {
        return Err(RelayError::InvalidRequest(format!(
            "message {} has empty content",
            pos
        )));
    }
    Ok(&last.content)
}

/// State owned by the task driving an open stream.
struct ActiveTurn {
    session_id: String,
    provider: String,
    model: String,
    store: Arc<dyn MessageStore>,
    fragment_timeout: Duration,
}

impl ActiveTurn {
    async fn drive(self, mut stream: FragmentStream, tx: mpsc::Sender<RelayEvent>) -> TurnOutcome {
        let mut content = String::new();
        let mut fragments = 0usize;

        let failure = loop {
            let next = tokio::select! {
                biased;
                _ = tx.closed() => break Some("caller disconnected".to_string()),
                next = tokio::time::timeout(self.fragment_timeout, stream.next()) => next,
            };

            match next {
                Ok(Some(Ok(fragment))) => {
                    if tx.send(RelayEvent::Fragment(fragment.clone())).await.is_err() {
                        break Some("caller disconnected".to_string());
                    }
                    content.push_str(fragment.as_str());
                    fragments += 1;
                }
                Ok(Some(Err(e))) => break Some(e.to_string()),
                Ok(None) => break None,
                Err(_) => {
                    break Some(format!("no fragment within {:?}", self.fragment_timeout))
                }
            }
        };

        // Stop pulling from the upstream before touching storage.
        drop(stream);

        match failure {
            None => self.complete(content, fragments, &tx).await,
            Some(reason) => self.interrupt(content, fragments, reason, &tx).await,
        }
    }

    /// Streaming → Completed
    async fn complete(self, content: String, fragments: usize, tx: &mpsc::Sender<RelayEvent>) -> TurnOutcome {
        let message = NewMessage::assistant(&self.session_id, content.clone())
            .produced_by(&self.provider, &self.model);

        let (assistant_turn, error) = match self.store.append_message(message).await {
            Ok(turn) => {
                info!(
                    "Session {}: completed with {} fragment(s), assistant turn {}",
                    self.session_id, fragments, turn.id
                );
                (Some(turn), None)
            }
            Err(e) => {
                error!(
                    "Session {}: reply streamed but not persisted: {}",
                    self.session_id, e
                );
                (None, Some(RelayError::from(e)))
            }
        };

        transition(&self.session_id, RelayState::Streaming, RelayState::Completed);
        let _ = tx
            .send(RelayEvent::Done {
                persisted: assistant_turn.is_some(),
            })
            .await;

        TurnOutcome {
            state: RelayState::Completed,
            content,
            fragments,
            assistant_turn,
            error,
        }
    }

    /// Streaming → Failed
    async fn interrupt(
        self,
        content: String,
        fragments: usize,
        reason: String,
        tx: &mpsc::Sender<RelayEvent>,
    ) -> TurnOutcome {
        warn!(
            "Session {}: stream from {} interrupted after {} fragment(s): {}",
            self.session_id, self.provider, fragments, reason
        );

        let mut assistant_turn = None;
        if !content.is_empty() {
            let message = NewMessage::assistant(&self.session_id, content.clone())
                .produced_by(&self.provider, &self.model)
                .incomplete(true);
            match self.store.append_message(message).await {
                Ok(turn) => assistant_turn = Some(turn),
                Err(e) => error!(
                    "Session {}: failed to persist partial reply: {}",
                    self.session_id, e
                ),
            }
        }

        transition(&self.session_id, RelayState::Streaming, RelayState::Failed);
        let _ = tx
            .send(RelayEvent::Interrupted {
                partial: content.clone(),
                fragments,
                reason: reason.clone(),
            })
            .await;

        TurnOutcome {
            state: RelayState::Failed,
            error: Some(RelayError::StreamInterrupted {
                partial: content.clone(),
                fragments,
                reason,
            }),
            content,
            fragments,
            assistant_turn,
        }
    }
}
