use axum::{
    Extension,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tokio::{select, time::timeout};
use tracing::{debug, error, info, warn};

use crate::core::session::{ClientFrame, ClientRoute, Session, SessionDriver};
use crate::middleware::ClientIp;
use crate::state::AppState;

/// Optimized channel buffer size for audio workloads
const CHANNEL_BUFFER_SIZE: usize = 1024;

/// Maximum WebSocket frame size (10 MB)
const MAX_WS_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Maximum WebSocket message size (10 MB)
const MAX_WS_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// How often the socket loop checks for an idle client
const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for the session and sender to wind down after the loop
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Releases a connection slot when the socket is done, or when the upgrade
/// never happens.
struct ConnectionSlot {
    state: Arc<AppState>,
    ip: Option<IpAddr>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        if let Some(ip) = self.ip {
            self.state.release_connection(ip);
        }
    }
}

/// Voice bridge WebSocket handler
///
/// Upgrades the HTTP connection and runs one bridge session for its lifetime.
///
/// # Arguments
/// * `ws` - The WebSocket upgrade request from Axum
/// * `state` - Application state with configuration, tools and the upstream connector
/// * `client_ip` - Set by the connection limit middleware when a slot was reserved
pub async fn voice_bridge_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    client_ip: Option<Extension<ClientIp>>,
) -> Response {
    let slot = ConnectionSlot {
        state: state.clone(),
        ip: client_ip.map(|Extension(ClientIp(ip))| ip),
    };
    debug!(ip = ?slot.ip, "Voice bridge WebSocket upgrade requested");

    ws.max_frame_size(MAX_WS_FRAME_SIZE)
        .max_message_size(MAX_WS_MESSAGE_SIZE)
        .on_upgrade(move |socket| async move {
            handle_bridge_socket(socket, state).await;
            drop(slot);
        })
}

async fn handle_bridge_socket(socket: WebSocket, app_state: Arc<AppState>) {
    let session_id = Session::generate_id();
    info!(session_id = %session_id, "Voice bridge WebSocket connection established");

    let (mut sender, mut receiver) = socket.split();
    let (client_tx, mut client_rx) = mpsc::channel::<ClientRoute>(CHANNEL_BUFFER_SIZE);

    // Sender task for outgoing messages
    let sender_task = tokio::spawn(async move {
        while let Some(route) = client_rx.recv().await {
            let should_close = matches!(route, ClientRoute::Close);

            let result = match route {
                ClientRoute::Event(event) => match serde_json::to_string(&event) {
                    Ok(json_str) => sender.send(Message::Text(json_str.into())).await,
                    Err(e) => {
                        error!("Failed to serialize bridge event: {}", e);
                        continue;
                    }
                },
                ClientRoute::Passthrough(text) => sender.send(Message::Text(text.into())).await,
                ClientRoute::Close => sender.send(Message::Close(None)).await,
            };

            if let Err(e) = result {
                debug!("Failed to send WebSocket message: {}", e);
                break;
            }

            if should_close {
                break;
            }
        }
    });

    let settings = app_state.session_settings(session_id.clone());
    let (handle, mut driver_task) = SessionDriver::spawn(
        settings,
        app_state.connector.clone(),
        app_state.tools.clone(),
        client_tx,
    );

    let idle_timeout = app_state.config.idle_timeout();
    let idle_check = IDLE_CHECK_INTERVAL.min(idle_timeout);
    let mut last_activity = Instant::now();
    let mut finished: Option<Session> = None;
    let mut driver_done = false;

    loop {
        select! {
            msg_result = receiver.next() => {
                last_activity = Instant::now();

                match msg_result {
                    Some(Ok(Message::Text(text))) => {
                        handle.client_frame(ClientFrame::Text(text.to_string()));
                    }
                    Some(Ok(Message::Binary(data))) => {
                        handle.client_frame(ClientFrame::Binary(data));
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        info!(session_id = %session_id, "Voice bridge connection closed by client");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(session_id = %session_id, "Voice bridge WebSocket error: {}", e);
                        break;
                    }
                }
            }
            result = &mut driver_task => {
                driver_done = true;
                match result {
                    Ok(session) => finished = Some(session),
                    Err(e) => error!(session_id = %session_id, "Session task failed: {}", e),
                }
                break;
            }
            _ = tokio::time::sleep(idle_check) => {
                if last_activity.elapsed() >= idle_timeout {
                    warn!(
                        session_id = %session_id,
                        "Voice bridge connection idle for {}s, closing",
                        last_activity.elapsed().as_secs()
                    );
                    handle.shutdown("idle_timeout", "Connection closed due to inactivity");
                }
            }
        }
    }

    // Cleanup
    handle.client_closed();
    if !driver_done {
        match timeout(SHUTDOWN_GRACE, &mut driver_task).await {
            Ok(Ok(session)) => finished = Some(session),
            Ok(Err(e)) => error!(session_id = %session_id, "Session task failed: {}", e),
            Err(_) => {
                warn!(session_id = %session_id, "Session did not stop in time, aborting");
                driver_task.abort();
            }
        }
    }

    let mut sender_task = sender_task;
    if timeout(SHUTDOWN_GRACE, &mut sender_task).await.is_err() {
        sender_task.abort();
    }

    match finished {
        Some(session) => info!(
            session_id = %session_id,
            turns = session.history().len(),
            lifecycle = %session.lifecycle(),
            "Voice bridge session terminated"
        ),
        None => info!(session_id = %session_id, "Voice bridge session terminated"),
    }
}
