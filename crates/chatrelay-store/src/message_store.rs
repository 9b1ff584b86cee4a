//! Persistence boundary consumed by the stream relay.

use async_trait::async_trait;
use chatrelay_core::Result;

use crate::types::{NewMessage, Turn};

/// Durable append-only log of per-session messages.
///
/// Implementations must keep per-session append order under concurrent
/// appends and return `Error::NotFound` for unknown sessions.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append one turn to a session and return it as persisted.
    async fn append_message(&self, message: NewMessage) -> Result<Turn>;

    /// All turns of a session in append order.
    async fn list_messages(&self, session_id: &str) -> Result<Vec<Turn>>;
}
