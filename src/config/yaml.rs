use serde::Deserialize;
use std::path::PathBuf;

use super::{ConfigError, ServerConfig, TlsConfig, parse_resume_policy};

/// Complete YAML configuration structure
///
/// All fields are optional so a file can override only what it needs.
/// Values present here win over environment variables.
///
/// # Example YAML structure
/// ```yaml
/// server:
///   host: "0.0.0.0"
///   port: 3001
///   tls:
///     cert_path: "/etc/bridge/cert.pem"
///     key_path: "/etc/bridge/key.pem"
///
/// realtime:
///   api_key: "sk-..."
///   url: "wss://api.openai.com/v1/realtime"
///   model: "gpt-4o-realtime-preview"
///   voice: "alloy"
///   instructions: "You are a helpful voice assistant."
///   transcription_model: "whisper-1"
///
/// vad:
///   enabled: true
///   threshold: 0.5
///   silence_ms: 500
///   prefix_padding_ms: 300
///
/// session:
///   finalize_quiet_ms: 700
///   resume_policy: "serialized"
///   idle_timeout_secs: 300
///
/// tools:
///   webhook_url: "https://hooks.example.com/voice"
///   webhook_secret: "signing-secret"
///
/// security:
///   cors_allowed_origins: "https://app.example.com"
///   rate_limit_requests_per_second: 60
///   rate_limit_burst_size: 10
///   max_websocket_connections: 500
///   max_connections_per_ip: 100
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub server: Option<ServerYaml>,
    pub realtime: Option<RealtimeYaml>,
    pub vad: Option<VadYaml>,
    pub session: Option<SessionYaml>,
    pub tools: Option<ToolsYaml>,
    pub security: Option<SecurityYaml>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ServerYaml {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub tls: Option<TlsYaml>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TlsYaml {
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
}

/// Upstream realtime service
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RealtimeYaml {
    pub api_key: Option<String>,
    pub url: Option<String>,
    pub model: Option<String>,
    pub voice: Option<String>,
    pub instructions: Option<String>,
    pub input_audio_format: Option<String>,
    pub output_audio_format: Option<String>,
    pub transcription_model: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct VadYaml {
    pub enabled: Option<bool>,
    pub threshold: Option<f32>,
    pub silence_ms: Option<u32>,
    pub prefix_padding_ms: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SessionYaml {
    pub finalize_quiet_ms: Option<u64>,
    pub resume_policy: Option<String>,
    pub idle_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ToolsYaml {
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SecurityYaml {
    pub cors_allowed_origins: Option<String>,
    pub rate_limit_requests_per_second: Option<u32>,
    pub rate_limit_burst_size: Option<u32>,
    pub max_websocket_connections: Option<usize>,
    pub max_connections_per_ip: Option<u32>,
}

/// Overwrite `slot` when the YAML value is present.
fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

impl YamlConfig {
    /// Load YAML configuration from a file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or the YAML is malformed.
    pub fn from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let config: YamlConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Layer these values over an environment-derived configuration.
    pub fn apply(self, config: &mut ServerConfig) -> Result<(), ConfigError> {
        if let Some(server) = self.server {
            set(&mut config.host, server.host);
            set(&mut config.port, server.port);
            if let Some(tls) = server.tls {
                match (tls.cert_path, tls.key_path) {
                    (Some(cert_path), Some(key_path)) => {
                        config.tls = Some(TlsConfig {
                            cert_path,
                            key_path,
                        });
                    }
                    (Some(_), None) => return Err(ConfigError::Missing("server.tls.key_path")),
                    (None, Some(_)) => return Err(ConfigError::Missing("server.tls.cert_path")),
                    (None, None) => {}
                }
            }
        }

        if let Some(realtime) = self.realtime {
            if let Some(api_key) = realtime.api_key {
                use zeroize::Zeroize;
                config.openai_api_key.zeroize();
                config.openai_api_key = api_key;
            }
            set(&mut config.realtime_url, realtime.url);
            set(&mut config.realtime_model, realtime.model);
            set(&mut config.voice, realtime.voice);
            if realtime.instructions.is_some() {
                config.instructions = realtime.instructions;
            }
            set(&mut config.input_audio_format, realtime.input_audio_format);
            set(&mut config.output_audio_format, realtime.output_audio_format);
            set(&mut config.transcription_model, realtime.transcription_model);
        }

        if let Some(vad) = self.vad {
            set(&mut config.vad_enabled, vad.enabled);
            set(&mut config.vad_threshold, vad.threshold);
            set(&mut config.vad_silence_ms, vad.silence_ms);
            set(&mut config.vad_prefix_padding_ms, vad.prefix_padding_ms);
        }

        if let Some(session) = self.session {
            set(&mut config.finalize_quiet_ms, session.finalize_quiet_ms);
            if let Some(policy) = session.resume_policy {
                config.resume_policy = parse_resume_policy(&policy)?;
            }
            set(&mut config.idle_timeout_secs, session.idle_timeout_secs);
        }

        if let Some(tools) = self.tools {
            if tools.webhook_url.is_some() {
                config.webhook_url = tools.webhook_url;
            }
            if tools.webhook_secret.is_some() {
                config.webhook_secret = tools.webhook_secret;
            }
        }

        if let Some(security) = self.security {
            if security.cors_allowed_origins.is_some() {
                config.cors_allowed_origins = security.cors_allowed_origins;
            }
            set(
                &mut config.rate_limit_requests_per_second,
                security.rate_limit_requests_per_second,
            );
            set(&mut config.rate_limit_burst_size, security.rate_limit_burst_size);
            if security.max_websocket_connections.is_some() {
                config.max_websocket_connections = security.max_websocket_connections;
            }
            set(
                &mut config.max_connections_per_ip,
                security.max_connections_per_ip,
            );
        }

        Ok(())
    }
}
