//! Provider-facing chat types.

use serde::{Deserialize, Serialize};

pub use chatrelay_store::Role;

use crate::error::ProviderError;

/// One entry of the conversation history sent upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }
}

/// A non-empty chunk of generated text, in delivery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment(String);

impl Fragment {
    /// Returns `None` for empty text; empty deltas are not fragments.
    pub fn new(text: impl Into<String>) -> Option<Self> {
        let text = text.into();
        if text.is_empty() {
            None
        } else {
            Some(Self(text))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl AsRef<str> for Fragment {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Everything a provider needs to generate one reply. Built fresh per turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub max_output_tokens: u32,
}

impl ProviderRequest {
    /// Check the input constraints shared by every provider.
    pub fn validate(&self) -> Result<(), ProviderError> {
        if self.messages.is_empty() {
            return Err(ProviderError::InvalidRequest("conversation is empty".into()));
        }
        if self.model.trim().is_empty() {
            return Err(ProviderError::InvalidRequest("model is empty".into()));
        }
        if self.max_output_tokens == 0 {
            return Err(ProviderError::InvalidRequest(
                "max_output_tokens must be positive".into(),
            ));
        }
        Ok(())
    }
}
