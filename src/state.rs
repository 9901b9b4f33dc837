//! Process-wide application state.
//!
//! Built once at startup and shared with every handler. Nothing in here is
//! session state: each connection owns its own session exclusively.

use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::ServerConfig;
use crate::core::credentials::{ApiKey, CredentialStore};
use crate::core::session::SessionSettings;
use crate::core::tools::{ToolExecutor, ToolRegistry};
use crate::core::upstream::UpstreamConnector;
use crate::core::upstream::openai::{OpenAIConnector, OpenAIRealtimeConfig};

/// Why a connection slot could not be acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionLimitError {
    GlobalLimitReached,
    PerIpLimitReached,
}

pub struct AppState {
    pub config: ServerConfig,
    pub credentials: Arc<CredentialStore>,
    pub tools: Arc<dyn ToolExecutor>,
    pub connector: Arc<dyn UpstreamConnector>,

    ws_connections: AtomicUsize,
    ip_connections: DashMap<IpAddr, usize>,
}

impl AppState {
    /// Build state with the OpenAI connector and the configured tools.
    pub async fn new(config: ServerConfig) -> Arc<Self> {
        let credentials = Arc::new(CredentialStore::new(ApiKey::new(
            config.openai_api_key.clone(),
        )));
        let connector = Arc::new(OpenAIConnector::new(
            OpenAIRealtimeConfig {
                url: config.realtime_url.clone(),
                model: config.realtime_model.clone(),
            },
            credentials.clone(),
        ));
        let tools = Arc::new(ToolRegistry::from_config(&config));

        Arc::new(Self::with_parts(config, credentials, connector, tools))
    }

    /// Build state around an explicit connector and tool executor.
    pub fn with_parts(
        config: ServerConfig,
        credentials: Arc<CredentialStore>,
        connector: Arc<dyn UpstreamConnector>,
        tools: Arc<dyn ToolExecutor>,
    ) -> Self {
        Self {
            config,
            credentials,
            tools,
            connector,
            ws_connections: AtomicUsize::new(0),
            ip_connections: DashMap::new(),
        }
    }

    /// Settings for a new session with a fresh id.
    pub fn session_settings(&self, session_id: impl Into<String>) -> SessionSettings {
        let defaults = self.config.session_defaults(self.tools.definitions());
        let codec = self.connector.codec();

        let mut settings = SessionSettings::new(session_id);
        settings.quiet_period = self.config.finalize_quiet_period();
        settings.initial_session = codec.session_config(&defaults);
        settings.response_defaults = codec.response_defaults(&defaults);
        settings.known_tools = self.tools.tool_names().into_iter().collect();
        settings.resume_policy = self.config.resume_policy;
        settings
    }

    /// Reserve a WebSocket slot for `ip`.
    ///
    /// Every successful call must be paired with [`AppState::release_connection`].
    pub fn try_acquire_connection(&self, ip: IpAddr) -> Result<(), ConnectionLimitError> {
        if let Some(max) = self.config.max_websocket_connections {
            let reserved = self
                .ws_connections
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                    (current < max).then_some(current + 1)
                });
            if reserved.is_err() {
                return Err(ConnectionLimitError::GlobalLimitReached);
            }
        } else {
            self.ws_connections.fetch_add(1, Ordering::AcqRel);
        }

        let per_ip_limit = self.config.max_connections_per_ip as usize;
        let mut entry = self.ip_connections.entry(ip).or_insert(0);
        if *entry >= per_ip_limit {
            drop(entry);
            self.ws_connections.fetch_sub(1, Ordering::AcqRel);
            return Err(ConnectionLimitError::PerIpLimitReached);
        }
        *entry += 1;
        Ok(())
    }

    /// Release a slot reserved by [`AppState::try_acquire_connection`].
    pub fn release_connection(&self, ip: IpAddr) {
        let _ = self
            .ws_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(1)
            });

        self.ip_connections.remove_if_mut(&ip, |_, count| {
            *count = count.saturating_sub(1);
            *count == 0
        });
    }

    pub fn ws_connection_count(&self) -> usize {
        self.ws_connections.load(Ordering::Acquire)
    }

    pub fn ip_connection_count(&self, ip: &IpAddr) -> usize {
        self.ip_connections.get(ip).map(|c| *c).unwrap_or(0)
    }
}
