//! Mock realtime service and bridge harness
//!
//! The mock accepts WebSocket connections the way the realtime API does and
//! hands each one to the test as a [`MockConnection`], so tests script the
//! upstream side event by event.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, accept_hdr_async, tungstenite::Message};

use voice_bridge::core::credentials::{ApiKey, CredentialStore};
use voice_bridge::core::tools::ToolRegistry;
use voice_bridge::core::upstream::openai::{OpenAIConnector, OpenAIRealtimeConfig};
use voice_bridge::{ServerConfig, routes, state::AppState};

pub const TEST_API_KEY: &str = "sk-integration";

/// Bound on every wait, so a broken bridge fails instead of hanging
pub const WAIT: Duration = Duration::from_secs(5);

pub type ClientSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One accepted upstream connection.
pub struct MockConnection {
    /// Handshake headers as (lowercase name, value)
    pub headers: Vec<(String, String)>,
    pub path: String,
    from_bridge: mpsc::UnboundedReceiver<Message>,
    to_bridge: mpsc::UnboundedSender<Message>,
}

impl MockConnection {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Send one server event to the bridge.
    pub fn send(&self, event: Value) {
        let _ = self.to_bridge.send(Message::Text(event.to_string().into()));
    }

    /// Close the socket from the service side.
    pub fn close(&self) {
        let _ = self.to_bridge.send(Message::Close(None));
    }

    /// Next JSON event the bridge sent, or `None` once the socket closed.
    pub async fn next_event(&mut self) -> Option<Value> {
        loop {
            let message = timeout(WAIT, self.from_bridge.recv())
                .await
                .expect("timed out waiting for bridge event")?;
            match message {
                Message::Text(text) => return Some(serde_json::from_str(&text).unwrap()),
                Message::Close(_) => return None,
                _ => continue,
            }
        }
    }

    /// Skip events until one of the given type arrives.
    pub async fn expect_type(&mut self, event_type: &str) -> Value {
        loop {
            let event = self
                .next_event()
                .await
                .unwrap_or_else(|| panic!("upstream closed while waiting for {event_type}"));
            if event["type"] == event_type {
                return event;
            }
        }
    }

    /// Wait until the bridge closes the upstream socket.
    pub async fn expect_closed(&mut self) {
        while self.next_event().await.is_some() {}
    }
}

pub struct MockUpstream {
    pub addr: SocketAddr,
    connections: mpsc::UnboundedReceiver<MockConnection>,
}

impl MockUpstream {
    pub async fn start() -> Self {
        Self::start_with_handshake_delay(Duration::ZERO).await
    }

    /// Delay each handshake, keeping the bridge in its connecting state.
    pub async fn start_with_handshake_delay(delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let conn_tx = conn_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    serve_connection(stream, conn_tx).await;
                });
            }
        });

        Self {
            addr,
            connections: conn_rx,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/v1/realtime", self.addr)
    }

    pub async fn accept(&mut self) -> MockConnection {
        timeout(WAIT, self.connections.recv())
            .await
            .expect("timed out waiting for upstream connection")
            .expect("mock upstream stopped")
    }
}

async fn serve_connection(stream: TcpStream, conn_tx: mpsc::UnboundedSender<MockConnection>) {
    let mut headers = Vec::new();
    let mut path = String::new();
    let callback = |request: &Request, response: Response| {
        path = request.uri().to_string();
        headers = request
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_ascii_lowercase(),
                    v.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();
        Ok::<Response, ErrorResponse>(response)
    };

    let Ok(ws) = accept_hdr_async(stream, callback).await else {
        return;
    };
    let (mut write, mut read) = ws.split();
    let (from_tx, from_rx) = mpsc::unbounded_channel();
    let (to_tx, mut to_rx) = mpsc::unbounded_channel::<Message>();

    let connection = MockConnection {
        headers,
        path,
        from_bridge: from_rx,
        to_bridge: to_tx,
    };
    if conn_tx.send(connection).is_err() {
        return;
    }

    tokio::spawn(async move {
        while let Some(message) = to_rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if write.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    while let Some(Ok(message)) = read.next().await {
        let closing = matches!(message, Message::Close(_));
        if from_tx.send(message).is_err() || closing {
            break;
        }
    }
    let _ = from_tx.send(Message::Close(None));
}

/// Configuration pointing the bridge at the mock.
pub fn bridge_config(upstream: &MockUpstream) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.host = "127.0.0.1".to_string();
    config.port = 0;
    config.openai_api_key = TEST_API_KEY.to_string();
    config.realtime_url = upstream.url();
    config.instructions = Some("You are a test assistant.".to_string());
    config.rate_limit_requests_per_second = 100_000;
    config
}

/// Serve the full bridge application on an ephemeral port.
pub async fn start_bridge(config: ServerConfig) -> SocketAddr {
    let credentials = Arc::new(CredentialStore::new(ApiKey::new(
        config.openai_api_key.clone(),
    )));
    let connector = Arc::new(OpenAIConnector::new(
        OpenAIRealtimeConfig::new(config.realtime_url.clone(), config.realtime_model.clone()),
        credentials.clone(),
    ));
    let tools = Arc::new(ToolRegistry::from_config(&config));
    let state = Arc::new(AppState::with_parts(config, credentials, connector, tools));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = routes::create_app(state);

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    addr
}

pub async fn connect_client(bridge: SocketAddr) -> ClientSocket {
    let (socket, _) = tokio_tungstenite::connect_async(format!("ws://{bridge}/voice"))
        .await
        .expect("client failed to connect to bridge");
    socket
}

pub async fn send_json(client: &mut ClientSocket, value: Value) {
    client
        .send(Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

pub async fn send_audio(client: &mut ClientSocket, frame: &'static [u8]) {
    client
        .send(Message::Binary(bytes::Bytes::from_static(frame)))
        .await
        .unwrap();
}

/// Next JSON event from the bridge, or `None` once the socket closed.
pub async fn next_client_event(client: &mut ClientSocket) -> Option<Value> {
    loop {
        let message = timeout(WAIT, client.next())
            .await
            .expect("timed out waiting for client event")?;
        match message {
            Ok(Message::Text(text)) => return Some(serde_json::from_str(&text).unwrap()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

/// Skip client events until one of the given type arrives.
pub async fn expect_client_type(client: &mut ClientSocket, event_type: &str) -> Value {
    loop {
        let event = next_client_event(client)
            .await
            .unwrap_or_else(|| panic!("bridge closed while waiting for {event_type}"));
        if event["type"] == event_type {
            return event;
        }
    }
}

/// Connect a client and complete the upstream handshake and `ready`.
pub async fn open_session(
    bridge: SocketAddr,
    upstream: &mut MockUpstream,
) -> (ClientSocket, MockConnection, Value) {
    let mut client = connect_client(bridge).await;
    let mut conn = upstream.accept().await;
    let session_update = conn.expect_type("session.update").await;
    expect_client_type(&mut client, "ready").await;
    (client, conn, session_update)
}
