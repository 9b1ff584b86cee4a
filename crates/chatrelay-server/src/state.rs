//! Shared application state.

use std::sync::Arc;

use chatrelay_chat::{ProviderRegistry, RelaySettings, StreamRelay};
use chatrelay_core::RelayConfig;
use chatrelay_store::SqliteStore;

/// Shared application state accessible from all route handlers.
pub struct AppState {
    pub config: RelayConfig,
    pub store: Arc<SqliteStore>,
    pub registry: Arc<ProviderRegistry>,
    pub relay: StreamRelay,
}

impl AppState {
    pub fn new(config: RelayConfig, store: Arc<SqliteStore>, registry: Arc<ProviderRegistry>) -> Self {
        let relay = StreamRelay::new(
            registry.clone(),
            store.clone(),
            RelaySettings::from(&config),
        );
        Self {
            config,
            store,
            registry,
            relay,
        }
    }
}
