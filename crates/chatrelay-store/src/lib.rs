//! Append-only per-session message log on SQLite.

pub mod message_store;
pub mod schema;
pub mod sqlite;
pub mod types;

pub use message_store::MessageStore;
pub use sqlite::SqliteStore;
pub use types::*;
