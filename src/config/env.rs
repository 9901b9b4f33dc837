use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use super::{ConfigError, ServerConfig, TlsConfig, parse_resume_policy};

/// Read a variable, treating empty values as unset.
fn var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match var(key) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value }),
        None => Ok(None),
    }
}

fn parse_bool(key: &'static str) -> Result<Option<bool>, ConfigError> {
    match var(key) {
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidValue { key, value }),
        },
        None => Ok(None),
    }
}

/// Build a configuration from environment variables over defaults.
///
/// Validation is left to the caller so YAML overrides can be applied first.
pub(super) fn load() -> Result<ServerConfig, ConfigError> {
    let mut config = ServerConfig::default();

    if let Some(host) = var("HOST") {
        config.host = host;
    }
    if let Some(port) = parse_var("PORT")? {
        config.port = port;
    }

    config.tls = match (var("TLS_CERT_PATH"), var("TLS_KEY_PATH")) {
        (Some(cert), Some(key)) => Some(TlsConfig {
            cert_path: PathBuf::from(cert),
            key_path: PathBuf::from(key),
        }),
        (Some(_), None) => return Err(ConfigError::Missing("TLS_KEY_PATH")),
        (None, Some(_)) => return Err(ConfigError::Missing("TLS_CERT_PATH")),
        (None, None) => None,
    };

    if let Some(key) = var("OPENAI_API_KEY") {
        config.openai_api_key = key;
    }
    if let Some(url) = var("REALTIME_URL") {
        config.realtime_url = url;
    }
    if let Some(model) = var("REALTIME_MODEL") {
        config.realtime_model = model;
    }
    if let Some(voice) = var("REALTIME_VOICE") {
        config.voice = voice;
    }
    config.instructions = var("BRIDGE_INSTRUCTIONS");
    if let Some(format) = var("INPUT_AUDIO_FORMAT") {
        config.input_audio_format = format;
    }
    if let Some(format) = var("OUTPUT_AUDIO_FORMAT") {
        config.output_audio_format = format;
    }
    if let Some(model) = var("TRANSCRIPTION_MODEL") {
        config.transcription_model = model;
    }

    if let Some(enabled) = parse_bool("VAD_ENABLED")? {
        config.vad_enabled = enabled;
    }
    if let Some(threshold) = parse_var("VAD_THRESHOLD")? {
        config.vad_threshold = threshold;
    }
    if let Some(ms) = parse_var("VAD_SILENCE_MS")? {
        config.vad_silence_ms = ms;
    }
    if let Some(ms) = parse_var("VAD_PREFIX_PADDING_MS")? {
        config.vad_prefix_padding_ms = ms;
    }

    if let Some(ms) = parse_var("FINALIZE_QUIET_MS")? {
        config.finalize_quiet_ms = ms;
    }
    if let Some(policy) = var("RESUME_POLICY") {
        config.resume_policy = parse_resume_policy(&policy)?;
    }

    config.webhook_url = var("WEBHOOK_URL");
    config.webhook_secret = var("WEBHOOK_SECRET");

    config.cors_allowed_origins = var("CORS_ALLOWED_ORIGINS");
    if let Some(rps) = parse_var("RATE_LIMIT_REQUESTS_PER_SECOND")? {
        config.rate_limit_requests_per_second = rps;
    }
    if let Some(burst) = parse_var("RATE_LIMIT_BURST_SIZE")? {
        config.rate_limit_burst_size = burst;
    }
    config.max_websocket_connections = parse_var("MAX_WEBSOCKET_CONNECTIONS")?;
    if let Some(per_ip) = parse_var("MAX_CONNECTIONS_PER_IP")? {
        config.max_connections_per_ip = per_ip;
    }
    if let Some(secs) = parse_var("IDLE_TIMEOUT_SECS")? {
        config.idle_timeout_secs = secs;
    }

    Ok(config)
}
