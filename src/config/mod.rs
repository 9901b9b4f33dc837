//! Configuration module for the voice bridge
//!
//! Configuration is loaded from environment variables, optionally overridden
//! by a YAML file passed with `--config`.
//!
//! Priority: YAML > ENV vars > .env values > defaults
//!
//! # Example
//! ```rust,no_run
//! use voice_bridge::config::ServerConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // From environment only
//! let config = ServerConfig::from_env()?;
//!
//! // From a YAML file layered over the environment
//! let config = ServerConfig::from_file(&PathBuf::from("config.yaml"))?;
//! println!("Listening on {}", config.address());
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::core::session::ResumePolicy;
use crate::core::tools::ToolDefinition;
use crate::core::upstream::openai::{
    DEFAULT_AUDIO_FORMAT, DEFAULT_REALTIME_MODEL, DEFAULT_TRANSCRIPTION_MODEL, DEFAULT_VOICE,
    OPENAI_REALTIME_URL,
};
use crate::core::upstream::{SessionDefaults, TurnDetectionSettings};

mod env;
mod yaml;

pub use yaml::YamlConfig;

/// Default quiet period before a partial transcript is finalized
pub const DEFAULT_FINALIZE_QUIET_MS: u64 = 700;

/// Default idle timeout for client connections
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },

    #[error("Missing required configuration: {0}")]
    Missing(&'static str),
}

/// TLS configuration for HTTPS support
#[derive(Debug, Clone, PartialEq)]
pub struct TlsConfig {
    /// Path to the certificate file (PEM format)
    pub cert_path: PathBuf,
    /// Path to the private key file (PEM format)
    pub key_path: PathBuf,
}

/// Server configuration
///
/// Holds everything the process needs at startup. It is built once in
/// `main` and shared read-only through `AppState`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,

    /// TLS configuration (optional)
    /// When present, the server listens for HTTPS/WSS connections
    pub tls: Option<TlsConfig>,

    // Upstream realtime service
    /// API key for the realtime service (required)
    pub openai_api_key: String,
    /// WebSocket endpoint of the realtime service
    pub realtime_url: String,
    pub realtime_model: String,
    pub voice: String,
    /// System instructions sent with the initial session configuration
    pub instructions: Option<String>,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub transcription_model: String,

    // Turn detection
    /// Whether the service detects the end of speech itself.
    /// When disabled the client must send `commit`.
    /// Default: true
    pub vad_enabled: bool,
    /// Speech probability threshold (0.0 - 1.0)
    /// Default: 0.5
    pub vad_threshold: f32,
    /// Silence before the service ends a speech segment
    /// Default: 500
    pub vad_silence_ms: u32,
    /// Audio kept before detected speech starts
    /// Default: 300
    pub vad_prefix_padding_ms: u32,

    // Session behavior
    /// Quiet period after the last transcript fragment before the turn is
    /// finalized
    /// Default: 700
    pub finalize_quiet_ms: u64,
    /// How tool-result resumes share the generation channel
    /// Default: serialized
    pub resume_policy: ResumePolicy,

    // Tools
    /// Target of the `post_webhook` tool. The tool is only advertised when set.
    pub webhook_url: Option<String>,
    /// HMAC-SHA256 signing secret for webhook payloads
    pub webhook_secret: Option<String>,

    // Security
    /// CORS allowed origins, comma separated or "*"
    /// Default: None (CORS disabled)
    pub cors_allowed_origins: Option<String>,
    /// Maximum requests per second per IP
    /// Default: 60
    pub rate_limit_requests_per_second: u32,
    /// Burst size for rate limiting
    /// Default: 10
    pub rate_limit_burst_size: u32,

    // Connection limits
    /// Maximum concurrent WebSocket connections
    /// Default: None (unlimited)
    pub max_websocket_connections: Option<usize>,
    /// Maximum connections per IP address
    /// Default: 100
    pub max_connections_per_ip: u32,
    /// Seconds without client traffic before the connection is closed
    /// Default: 300
    pub idle_timeout_secs: u64,
}

/// Zeroize secret fields when the configuration is dropped.
impl Drop for ServerConfig {
    fn drop(&mut self) {
        use zeroize::Zeroize;

        self.openai_api_key.zeroize();
        if let Some(ref mut secret) = self.webhook_secret {
            secret.zeroize();
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            tls: None,
            openai_api_key: String::new(),
            realtime_url: OPENAI_REALTIME_URL.to_string(),
            realtime_model: DEFAULT_REALTIME_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            instructions: None,
            input_audio_format: DEFAULT_AUDIO_FORMAT.to_string(),
            output_audio_format: DEFAULT_AUDIO_FORMAT.to_string(),
            transcription_model: DEFAULT_TRANSCRIPTION_MODEL.to_string(),
            vad_enabled: true,
            vad_threshold: 0.5,
            vad_silence_ms: 500,
            vad_prefix_padding_ms: 300,
            finalize_quiet_ms: DEFAULT_FINALIZE_QUIET_MS,
            resume_policy: ResumePolicy::default(),
            webhook_url: None,
            webhook_secret: None,
            cors_allowed_origins: None,
            rate_limit_requests_per_second: 60,
            rate_limit_burst_size: 10,
            max_websocket_connections: None,
            max_connections_per_ip: 100,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// The `.env` file is loaded by `main` before this is called, so real
    /// environment variables take precedence over it.
    ///
    /// # Errors
    /// Returns an error if a variable has an invalid format or the final
    /// configuration fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = env::load()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file layered over the environment.
    ///
    /// Priority order (highest to lowest):
    /// 1. YAML file values
    /// 2. Environment variables (actual ENV vars override .env values)
    /// 3. .env file values
    /// 4. Default values
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, an environment
    /// variable is malformed, or validation fails.
    pub fn from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let yaml_config = YamlConfig::from_file(path)?;
        let mut config = env::load()?;
        yaml_config.apply(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the merged configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.openai_api_key.trim().is_empty() {
            return Err(ConfigError::Missing("OPENAI_API_KEY"));
        }

        let url = url::Url::parse(&self.realtime_url).map_err(|_| ConfigError::InvalidValue {
            key: "REALTIME_URL",
            value: self.realtime_url.clone(),
        })?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ConfigError::InvalidValue {
                key: "REALTIME_URL",
                value: self.realtime_url.clone(),
            });
        }

        if !(0.0..=1.0).contains(&self.vad_threshold) {
            return Err(ConfigError::InvalidValue {
                key: "VAD_THRESHOLD",
                value: self.vad_threshold.to_string(),
            });
        }

        if self.finalize_quiet_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "FINALIZE_QUIET_MS",
                value: "0".to_string(),
            });
        }

        if self.idle_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "IDLE_TIMEOUT_SECS",
                value: "0".to_string(),
            });
        }

        if self.rate_limit_requests_per_second == 0 {
            return Err(ConfigError::InvalidValue {
                key: "RATE_LIMIT_REQUESTS_PER_SECOND",
                value: "0".to_string(),
            });
        }

        if let Some(webhook_url) = &self.webhook_url {
            let parsed = url::Url::parse(webhook_url).map_err(|_| ConfigError::InvalidValue {
                key: "WEBHOOK_URL",
                value: webhook_url.clone(),
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(ConfigError::InvalidValue {
                    key: "WEBHOOK_URL",
                    value: webhook_url.clone(),
                });
            }
        }

        Ok(())
    }

    /// Get the server address as "host:port"
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if TLS is enabled
    pub fn is_tls_enabled(&self) -> bool {
        self.tls.is_some()
    }

    pub fn finalize_quiet_period(&self) -> Duration {
        Duration::from_millis(self.finalize_quiet_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Provider-neutral session defaults, with the given tools advertised.
    pub fn session_defaults(&self, tools: Vec<ToolDefinition>) -> SessionDefaults {
        SessionDefaults {
            instructions: self.instructions.clone(),
            voice: self.voice.clone(),
            modalities: vec!["text".to_string(), "audio".to_string()],
            input_audio_format: self.input_audio_format.clone(),
            output_audio_format: self.output_audio_format.clone(),
            transcription_model: self.transcription_model.clone(),
            turn_detection: self.vad_enabled.then_some(TurnDetectionSettings {
                threshold: self.vad_threshold,
                prefix_padding_ms: self.vad_prefix_padding_ms,
                silence_duration_ms: self.vad_silence_ms,
            }),
            tools,
        }
    }
}

/// Parse a resume policy name as used in env and YAML.
pub(crate) fn parse_resume_policy(value: &str) -> Result<ResumePolicy, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "serialized" => Ok(ResumePolicy::Serialized),
        "independent" => Ok(ResumePolicy::Independent),
        _ => Err(ConfigError::InvalidValue {
            key: "RESUME_POLICY",
            value: value.to_string(),
        }),
    }
}
