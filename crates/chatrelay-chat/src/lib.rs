//! Streaming chat relay with external LLM providers (OpenAI/Gemini).
//!
//! A [`StreamRelay`] persists the inbound user turn, resolves a
//! [`ProviderClient`] through the [`ProviderRegistry`], forwards fragments to
//! the caller as they arrive and persists the assembled reply.

pub mod config;
pub mod error;
pub mod gemini;
pub mod openai;
pub mod provider;
pub mod registry;
pub mod relay;
pub mod sse;
pub mod types;

pub use config::RelaySettings;
pub use error::{ProviderError, RelayError};
pub use provider::{FragmentStream, ProviderClient};
pub use registry::ProviderRegistry;
pub use relay::{CollectedReply, RelayEvent, RelayState, RelayStream, StreamRelay, TurnOutcome, TurnRequest};
pub use types::*;
