//! OpenAI Realtime API WebSocket connector.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

use super::codec::OpenAICodec;
use super::config::OpenAIRealtimeConfig;
use crate::core::credentials::CredentialStore;
use crate::core::upstream::{
    UpstreamCodec, UpstreamConnector, UpstreamError, UpstreamLink, UpstreamMessage, UpstreamResult,
};

/// Channel capacity for both directions of a link
const WS_CHANNEL_CAPACITY: usize = 1024;

/// Opens links to the OpenAI Realtime API.
pub struct OpenAIConnector {
    config: OpenAIRealtimeConfig,
    credentials: Arc<CredentialStore>,
    codec: Arc<OpenAICodec>,
}

impl OpenAIConnector {
    pub fn new(config: OpenAIRealtimeConfig, credentials: Arc<CredentialStore>) -> Self {
        Self {
            config,
            credentials,
            codec: Arc::new(OpenAICodec),
        }
    }

    fn build_request(&self) -> UpstreamResult<http::Request<()>> {
        let ws_url = self.config.ws_url();
        let parsed = url::Url::parse(&ws_url)
            .map_err(|e| UpstreamError::ConnectionFailed(format!("invalid realtime URL: {e}")))?;
        let host = match (parsed.host_str(), parsed.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(UpstreamError::ConnectionFailed(
                    "realtime URL has no host".to_string(),
                ));
            }
        };

        let api_key = self.credentials.api_key();

        http::Request::builder()
            .uri(&ws_url)
            .header("Authorization", format!("Bearer {}", api_key.expose()))
            .header("OpenAI-Beta", "realtime=v1")
            .header(
                "Sec-WebSocket-Key",
                tungstenite::handshake::client::generate_key(),
            )
            .header("Sec-WebSocket-Version", "13")
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Host", host)
            .body(())
            .map_err(|e| UpstreamError::ConnectionFailed(e.to_string()))
    }
}

#[async_trait]
impl UpstreamConnector for OpenAIConnector {
    fn provider(&self) -> &'static str {
        "openai"
    }

    fn codec(&self) -> Arc<dyn UpstreamCodec> {
        self.codec.clone()
    }

    async fn connect(&self) -> UpstreamResult<UpstreamLink> {
        let request = self.build_request()?;

        let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| match e {
                tungstenite::Error::Http(response) if response.status().as_u16() == 401 => {
                    UpstreamError::AuthenticationFailed("realtime API rejected the API key".to_string())
                }
                other => UpstreamError::ConnectionFailed(other.to_string()),
            })?;

        info!(model = %self.config.model, "Connected to OpenAI Realtime API");

        let (mut ws_sink, mut ws_stream) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(WS_CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<UpstreamMessage>(WS_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    outgoing = out_rx.recv() => match outgoing {
                        Some(text) => {
                            if let Err(e) = ws_sink.send(Message::Text(text.into())).await {
                                warn!("Failed to send upstream message: {}", e);
                                let _ = in_tx.send(UpstreamMessage::Failed(e.to_string())).await;
                                break;
                            }
                        }
                        None => {
                            debug!("Upstream link released, closing socket");
                            let _ = ws_sink.send(Message::Close(None)).await;
                            break;
                        }
                    },
                    incoming = ws_stream.next() => match incoming {
                        Some(Ok(Message::Text(text))) => {
                            if in_tx.send(UpstreamMessage::Text(text.as_str().to_owned())).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!("Upstream WebSocket closed by server");
                            let reason = frame.map(|f| f.reason.as_str().to_owned());
                            let _ = in_tx.send(UpstreamMessage::Closed(reason)).await;
                            break;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_sink.send(Message::Pong(data)).await {
                                warn!("Failed to send pong: {}", e);
                            }
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("Upstream WebSocket error: {}", e);
                            let _ = in_tx.send(UpstreamMessage::Failed(e.to_string())).await;
                            break;
                        }
                        None => {
                            let _ = in_tx.send(UpstreamMessage::Closed(None)).await;
                            break;
                        }
                    },
                }
            }
        });

        Ok(UpstreamLink::new(out_tx, in_rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::credentials::ApiKey;

    fn connector(url: &str) -> OpenAIConnector {
        let credentials = Arc::new(CredentialStore::new(ApiKey::new("sk-test")));
        OpenAIConnector::new(OpenAIRealtimeConfig::new(url, "gpt-4o-realtime-preview"), credentials)
    }

    #[test]
    fn test_request_headers() {
        let request = connector("wss://api.openai.com/v1/realtime").build_request().unwrap();
        let headers = request.headers();
        assert_eq!(headers["Authorization"], "Bearer sk-test");
        assert_eq!(headers["OpenAI-Beta"], "realtime=v1");
        assert_eq!(headers["Host"], "api.openai.com");
        assert!(request.uri().to_string().ends_with("model=gpt-4o-realtime-preview"));
    }

    #[test]
    fn test_host_keeps_explicit_port() {
        let request = connector("ws://127.0.0.1:9001/rt").build_request().unwrap();
        assert_eq!(request.headers()["Host"], "127.0.0.1:9001");
    }

    #[test]
    fn test_invalid_url_rejected() {
        let err = connector("not a url").build_request().unwrap_err();
        assert!(matches!(err, UpstreamError::ConnectionFailed(_)));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let err = connector("ws://127.0.0.1:1/rt").connect().await.unwrap_err();
        assert!(matches!(err, UpstreamError::ConnectionFailed(_)));
    }
}
