//! Upstream API credentials.
//!
//! The key is read on every connect through a lock-free snapshot; replacing it
//! goes through [`CredentialStore::rotate`] only.

use arc_swap::ArcSwap;
use std::fmt;
use std::sync::Arc;
use tracing::info;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::ConfigError;

/// Secret API key, wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Raw key, for building request headers only
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey([REDACTED])")
    }
}

/// Process-wide credential holder shared by all sessions.
#[derive(Debug)]
pub struct CredentialStore {
    api_key: ArcSwap<ApiKey>,
}

impl CredentialStore {
    pub fn new(api_key: ApiKey) -> Self {
        Self {
            api_key: ArcSwap::from_pointee(api_key),
        }
    }

    /// Current key. Sessions already connected keep the key they used.
    pub fn api_key(&self) -> Arc<ApiKey> {
        self.api_key.load_full()
    }

    /// Replace the key for subsequent connections.
    pub fn rotate(&self, api_key: ApiKey) -> Result<(), ConfigError> {
        if api_key.expose().trim().is_empty() {
            return Err(ConfigError::Missing("OPENAI_API_KEY"));
        }
        self.api_key.store(Arc::new(api_key));
        info!("Upstream API key rotated");
        Ok(())
    }
}
