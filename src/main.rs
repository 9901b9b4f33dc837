use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use voice_bridge::{ServerConfig, routes, state::AppState};

/// Voice Bridge - browser voice sessions relayed to a realtime AI service
#[derive(Parser, Debug)]
#[command(name = "voice-bridge")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (must be done before config loading)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // Must happen before any TLS connection is attempted
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();

    let config = if let Some(config_path) = cli.config {
        info!("Loading configuration from {}", config_path.display());
        ServerConfig::from_file(&config_path)?
    } else {
        ServerConfig::from_env()?
    };

    let address = config.address();
    let tls_config = config.tls.clone();
    info!(
        model = %config.realtime_model,
        resume_policy = ?config.resume_policy,
        "Starting voice bridge on {address}"
    );

    let app_state = AppState::new(config).await;
    info!(tools = ?app_state.tools.tool_names(), "Tools registered");

    #[cfg(unix)]
    spawn_credential_reload(app_state.clone());

    let app = routes::create_app(app_state);

    let socket_addr: SocketAddr = address
        .parse()
        .map_err(|e| anyhow!("Invalid server address '{}': {}", address, e))?;

    if let Some(tls) = tls_config {
        let rustls_config = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
            .await
            .map_err(|e| {
                anyhow!(
                    "Failed to load TLS certificates from {} and {}: {}",
                    tls.cert_path.display(),
                    tls.key_path.display(),
                    e
                )
            })?;

        info!("Server listening on https://{} (TLS enabled)", socket_addr);

        axum_server::bind_rustls(socket_addr, rustls_config)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .map_err(|e| anyhow!("TLS server error: {}", e))?;
    } else {
        info!("Server listening on http://{}", socket_addr);

        let listener = TcpListener::bind(&socket_addr).await?;
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;
    }

    Ok(())
}

/// Reload `OPENAI_API_KEY` from the environment and `.env` on SIGHUP.
///
/// Sessions already running keep their upstream connection; new sessions
/// authenticate with the rotated key.
#[cfg(unix)]
fn spawn_credential_reload(state: Arc<AppState>) {
    use tokio::signal::unix::{SignalKind, signal};
    use voice_bridge::ApiKey;

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!("SIGHUP handler unavailable, credential reload disabled: {}", e);
            return;
        }
    };

    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            let _ = dotenvy::dotenv_override();
            let key = std::env::var("OPENAI_API_KEY").unwrap_or_default();
            match state.credentials.rotate(ApiKey::new(key)) {
                Ok(()) => info!("API key reloaded"),
                Err(e) => tracing::warn!("API key reload rejected: {}", e),
            }
        }
    });
}
