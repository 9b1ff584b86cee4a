//! Shared error type and process configuration for chatrelay.

pub mod config;
pub mod error;

pub use config::{ProviderCredential, RelayConfig};
pub use error::{Error, Result};
