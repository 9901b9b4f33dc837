//! Async shell around [`ConnectionSupervisor`].
//!
//! One task owns the supervisor and drains a single inbox. The connect task,
//! the upstream reader, finalize timers and tool executions only ever post
//! into that inbox, so the state machine sees one ordered stream of inputs.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::model::Session;
use super::protocol::{ClientFrame, ClientRoute};
use super::supervisor::{ConnectionSupervisor, Effect, SessionInput, SessionSettings};
use crate::core::tools::{ExecutionError, ToolExecutor, tool_output};
use crate::core::upstream::{
    UpstreamCodec, UpstreamConnector, UpstreamError, UpstreamLink, UpstreamMessage,
};

enum DriverInput {
    Session(SessionInput),
    UpstreamConnected(UpstreamLink),
}

/// Sending side of a session's inbox, held by the socket handler.
#[derive(Clone)]
pub struct SessionHandle {
    inbox: mpsc::UnboundedSender<DriverInput>,
}

impl SessionHandle {
    fn post(&self, input: SessionInput) {
        if self.inbox.send(DriverInput::Session(input)).is_err() {
            debug!("Session already finished, input dropped");
        }
    }

    pub fn client_frame(&self, frame: ClientFrame) {
        self.post(SessionInput::ClientFrame(frame));
    }

    pub fn client_closed(&self) {
        self.post(SessionInput::ClientClosed);
    }

    /// Close the session from the server side.
    pub fn shutdown(&self, reason: impl Into<String>, message: impl Into<String>) {
        self.post(SessionInput::Shutdown {
            reason: reason.into(),
            message: message.into(),
        });
    }
}

pub struct SessionDriver {
    supervisor: ConnectionSupervisor,
    codec: Arc<dyn UpstreamCodec>,
    tools: Arc<dyn ToolExecutor>,
    client_tx: mpsc::Sender<ClientRoute>,
    inbox_tx: mpsc::UnboundedSender<DriverInput>,
    inbox_rx: mpsc::UnboundedReceiver<DriverInput>,
    upstream_tx: Option<mpsc::Sender<String>>,
    upstream_reader: Option<JoinHandle<()>>,
    finalize_timer: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl SessionDriver {
    /// Start a session: begin connecting upstream and spawn the driver task.
    ///
    /// The returned task resolves to the final session state once both ends
    /// are closed.
    pub fn spawn(
        settings: SessionSettings,
        connector: Arc<dyn UpstreamConnector>,
        tools: Arc<dyn ToolExecutor>,
        client_tx: mpsc::Sender<ClientRoute>,
    ) -> (SessionHandle, JoinHandle<Session>) {
        let codec = connector.codec();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        info!(
            session_id = %settings.session_id,
            provider = connector.provider(),
            "Opening upstream connection"
        );
        spawn_connect(connector, inbox_tx.clone(), cancel.clone());

        let driver = SessionDriver {
            supervisor: ConnectionSupervisor::new(settings, codec.clone()),
            codec,
            tools,
            client_tx,
            inbox_tx: inbox_tx.clone(),
            inbox_rx,
            upstream_tx: None,
            upstream_reader: None,
            finalize_timer: None,
            cancel,
        };

        let handle = SessionHandle { inbox: inbox_tx };
        (handle, tokio::spawn(driver.run()))
    }

    async fn run(mut self) -> Session {
        while let Some(input) = self.inbox_rx.recv().await {
            let effects = match input {
                DriverInput::Session(input) => self.supervisor.handle(input),
                DriverInput::UpstreamConnected(link) => self.attach_upstream(link),
            };

            for effect in effects {
                self.perform(effect).await;
            }

            if self.supervisor.is_closed() {
                break;
            }
        }

        self.release();
        self.supervisor.into_session()
    }

    fn attach_upstream(&mut self, link: UpstreamLink) -> Vec<Effect> {
        if self.supervisor.is_closed() {
            debug!("Upstream opened after session closed, releasing link");
            return Vec::new();
        }

        let UpstreamLink {
            outbound,
            mut inbound,
        } = link;
        self.upstream_tx = Some(outbound);

        let inbox = self.inbox_tx.clone();
        let cancel = self.cancel.clone();
        self.upstream_reader = Some(tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = inbound.recv() => message,
                };

                let (input, last) = match message {
                    Some(UpstreamMessage::Text(text)) => (SessionInput::UpstreamFrame(text), false),
                    Some(UpstreamMessage::Closed(reason)) => (
                        SessionInput::UpstreamClosed {
                            error: UpstreamError::Closed(
                                reason.unwrap_or_else(|| "closed by upstream".to_string()),
                            ),
                        },
                        true,
                    ),
                    Some(UpstreamMessage::Failed(reason)) => (
                        SessionInput::UpstreamClosed {
                            error: UpstreamError::WebSocketError(reason),
                        },
                        true,
                    ),
                    None => (
                        SessionInput::UpstreamClosed {
                            error: UpstreamError::Closed("upstream link ended".to_string()),
                        },
                        true,
                    ),
                };

                if inbox.send(DriverInput::Session(input)).is_err() || last {
                    break;
                }
            }
        }));

        self.supervisor.handle(SessionInput::UpstreamOpened)
    }

    async fn perform(&mut self, effect: Effect) {
        match effect {
            Effect::Client(route) => {
                if self.client_tx.send(route).await.is_err() {
                    debug!("Client writer gone, outbound message dropped");
                }
            }
            Effect::Upstream(op) => {
                let Some(tx) = &self.upstream_tx else {
                    warn!(op = ?op, "No upstream link, operation dropped");
                    return;
                };
                match self.codec.encode(&op) {
                    Ok(frame) => {
                        if tx.send(frame).await.is_err() {
                            warn!("Upstream link closed while sending");
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to encode upstream operation"),
                }
            }
            Effect::ArmFinalizeTimer { epoch, after } => {
                self.abort_timer();
                let inbox = self.inbox_tx.clone();
                let cancel = self.cancel.clone();
                self.finalize_timer = Some(tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(after) => {
                            let _ = inbox.send(DriverInput::Session(SessionInput::FinalizeTimerFired { epoch }));
                        }
                    }
                }));
            }
            Effect::DisarmFinalizeTimer => self.abort_timer(),
            Effect::DispatchTool {
                call_id,
                name,
                arguments,
            } => self.dispatch_tool(call_id, name, arguments),
            Effect::CloseUpstream => {
                // Dropping the sender closes the link.
                self.upstream_tx = None;
            }
        }
    }

    fn dispatch_tool(&self, call_id: String, name: String, arguments: Value) {
        let tools = self.tools.clone();
        let inbox = self.inbox_tx.clone();
        // Dispatched calls run to completion even if the session ends.
        tokio::spawn(async move {
            let executor = {
                let name = name.clone();
                tokio::spawn(async move { tools.execute(&name, arguments).await })
            };
            // A panicking executor still answers the model.
            let outcome = match executor.await {
                Ok(outcome) => outcome,
                Err(e) => Err(ExecutionError::RequestFailed(format!("tool task failed: {e}"))),
            };
            if let Err(e) = &outcome {
                warn!(call_id = %call_id, tool = %name, error = %e, "Tool execution failed");
            }
            let output = tool_output(outcome);
            let _ = inbox.send(DriverInput::Session(SessionInput::ToolCompleted { call_id, output }));
        });
    }

    fn abort_timer(&mut self) {
        if let Some(timer) = self.finalize_timer.take() {
            timer.abort();
        }
    }

    fn release(&mut self) {
        self.cancel.cancel();
        self.abort_timer();
        self.upstream_tx = None;
        if let Some(reader) = self.upstream_reader.take() {
            reader.abort();
        }
    }
}

fn spawn_connect(
    connector: Arc<dyn UpstreamConnector>,
    inbox: mpsc::UnboundedSender<DriverInput>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let input = tokio::select! {
            _ = cancel.cancelled() => return,
            result = connector.connect() => match result {
                Ok(link) => DriverInput::UpstreamConnected(link),
                Err(e) => {
                    warn!(provider = connector.provider(), error = %e, "Upstream connection failed");
                    DriverInput::Session(SessionInput::UpstreamClosed { error: e })
                }
            },
        };
        let _ = inbox.send(input);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::protocol::BridgeEvent;
    use crate::core::tools::ToolDefinition;
    use crate::core::upstream::UpstreamResult;
    use crate::core::upstream::openai::OpenAICodec;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;

    /// Hands out one in-memory link and keeps the far ends for the test.
    struct MemoryConnector {
        link: Mutex<Option<UpstreamLink>>,
        fail: bool,
    }

    struct FarEnd {
        sent: mpsc::Receiver<String>,
        events: mpsc::Sender<UpstreamMessage>,
    }

    fn memory_connector() -> (Arc<MemoryConnector>, FarEnd) {
        let (out_tx, out_rx) = mpsc::channel(64);
        let (in_tx, in_rx) = mpsc::channel(64);
        let connector = MemoryConnector {
            link: Mutex::new(Some(UpstreamLink::new(out_tx, in_rx))),
            fail: false,
        };
        (
            Arc::new(connector),
            FarEnd {
                sent: out_rx,
                events: in_tx,
            },
        )
    }

    #[async_trait]
    impl UpstreamConnector for MemoryConnector {
        fn provider(&self) -> &'static str {
            "memory"
        }

        fn codec(&self) -> Arc<dyn UpstreamCodec> {
            Arc::new(OpenAICodec)
        }

        async fn connect(&self) -> UpstreamResult<UpstreamLink> {
            if self.fail {
                return Err(UpstreamError::ConnectionFailed("refused".to_string()));
            }
            self.link.lock().take().ok_or(UpstreamError::NotConnected)
        }
    }

    struct SlowSearch;

    #[async_trait]
    impl ToolExecutor for SlowSearch {
        async fn execute(&self, name: &str, args: Value) -> Result<Value, ExecutionError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(json!({ "tool": name, "args": args }))
        }

        fn tool_names(&self) -> Vec<String> {
            vec!["search".to_string()]
        }

        fn definitions(&self) -> Vec<ToolDefinition> {
            Vec::new()
        }
    }

    /// Knows `search` but every call fails.
    struct BrokenSearch;

    #[async_trait]
    impl ToolExecutor for BrokenSearch {
        async fn execute(&self, _name: &str, _args: Value) -> Result<Value, ExecutionError> {
            Err(ExecutionError::BadStatus {
                status: 503,
                body: "search index offline".to_string(),
            })
        }

        fn tool_names(&self) -> Vec<String> {
            vec!["search".to_string()]
        }

        fn definitions(&self) -> Vec<ToolDefinition> {
            Vec::new()
        }
    }

    /// Panics on its first call and succeeds afterwards.
    struct FlakySearch {
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl ToolExecutor for FlakySearch {
        async fn execute(&self, name: &str, _args: Value) -> Result<Value, ExecutionError> {
            let call = {
                let mut calls = self.calls.lock();
                *calls += 1;
                *calls
            };
            if call == 1 {
                panic!("search backend crashed");
            }
            Ok(json!({ "tool": name, "call": call }))
        }

        fn tool_names(&self) -> Vec<String> {
            vec!["search".to_string()]
        }

        fn definitions(&self) -> Vec<ToolDefinition> {
            Vec::new()
        }
    }

    fn settings() -> SessionSettings {
        let mut settings = SessionSettings::new("sess_driver");
        settings.quiet_period = Duration::from_millis(700);
        settings.known_tools.insert("search".to_string());
        settings
    }

    async fn next_sent(far: &mut FarEnd) -> Value {
        let text = far.sent.recv().await.unwrap();
        serde_json::from_str(&text).unwrap()
    }

    async fn next_event(client: &mut mpsc::Receiver<ClientRoute>) -> BridgeEvent {
        loop {
            match client.recv().await.unwrap() {
                ClientRoute::Event(event) => return event,
                _ => continue,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_period_finalizes_once() {
        let (connector, mut far) = memory_connector();
        let (client_tx, mut client_rx) = mpsc::channel(64);
        let (handle, task) = SessionDriver::spawn(settings(), connector, Arc::new(SlowSearch), client_tx);

        assert_eq!(next_sent(&mut far).await["type"], "session.update");
        assert!(matches!(next_event(&mut client_rx).await, BridgeEvent::Ready { .. }));

        far.events
            .send(UpstreamMessage::Text(
                json!({"type": "conversation.item.input_audio_transcription.delta", "delta": "hello"}).to_string(),
            ))
            .await
            .unwrap();
        assert!(matches!(next_event(&mut client_rx).await, BridgeEvent::TranscriptPartial { .. }));

        tokio::time::sleep(Duration::from_millis(800)).await;

        assert_eq!(
            next_event(&mut client_rx).await,
            BridgeEvent::TranscriptFinal {
                transcript: "hello".to_string()
            }
        );
        assert_eq!(next_sent(&mut far).await["type"], "response.create");

        handle.client_closed();
        let session = task.await.unwrap();
        assert_eq!(session.history().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tool_result_injected_before_resume() {
        let (connector, mut far) = memory_connector();
        let (client_tx, _client_rx) = mpsc::channel(256);
        let (handle, task) = SessionDriver::spawn(settings(), connector, Arc::new(SlowSearch), client_tx);
        next_sent(&mut far).await;

        for frame in [
            json!({"type": "response.output_item.added", "item": {"type": "function_call", "call_id": "c1", "name": "search"}}),
            json!({"type": "response.function_call_arguments.delta", "call_id": "c1", "delta": "{\"q\":"}),
            json!({"type": "response.function_call_arguments.delta", "call_id": "c1", "delta": "\"test\"}"}),
            json!({"type": "response.function_call_arguments.done", "call_id": "c1", "arguments": "{\"q\":\"test\"}"}),
        ] {
            far.events.send(UpstreamMessage::Text(frame.to_string())).await.unwrap();
        }

        let inject = next_sent(&mut far).await;
        assert_eq!(inject["type"], "conversation.item.create");
        let output: Value = serde_json::from_str(inject["item"]["output"].as_str().unwrap()).unwrap();
        assert_eq!(output["result"]["args"], json!({"q": "test"}));
        assert_eq!(next_sent(&mut far).await["type"], "response.create");

        handle.client_closed();
        let session = task.await.unwrap();
        assert_eq!(session.history().len(), 1);
    }

    async fn call_search(far: &FarEnd, call_id: &str) {
        for frame in [
            json!({"type": "response.output_item.added", "item": {"type": "function_call", "call_id": call_id, "name": "search"}}),
            json!({"type": "response.function_call_arguments.done", "call_id": call_id, "arguments": "{\"q\":\"test\"}"}),
        ] {
            far.events.send(UpstreamMessage::Text(frame.to_string())).await.unwrap();
        }
    }

    async fn injected_output(far: &mut FarEnd) -> Value {
        let inject = next_sent(far).await;
        assert_eq!(inject["type"], "conversation.item.create");
        serde_json::from_str(inject["item"]["output"].as_str().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_failed_tool_reported_as_result_and_resumes() {
        let (connector, mut far) = memory_connector();
        let (client_tx, _client_rx) = mpsc::channel(256);
        let (handle, task) = SessionDriver::spawn(settings(), connector, Arc::new(BrokenSearch), client_tx);
        next_sent(&mut far).await;

        call_search(&far, "c1").await;

        let output = injected_output(&mut far).await;
        assert_eq!(output["ok"], false);
        assert_eq!(output["error"], "Endpoint returned HTTP 503: search index offline");
        assert_eq!(next_sent(&mut far).await["type"], "response.create");

        handle.client_closed();
        let session = task.await.unwrap();
        assert_eq!(session.history().len(), 1);
    }

    #[tokio::test]
    async fn test_panicking_tool_reported_and_later_calls_continue() {
        let (connector, mut far) = memory_connector();
        let (client_tx, _client_rx) = mpsc::channel(256);
        let tools = Arc::new(FlakySearch {
            calls: Mutex::new(0),
        });
        let (handle, task) = SessionDriver::spawn(settings(), connector, tools, client_tx);
        next_sent(&mut far).await;

        call_search(&far, "c1").await;
        let output = injected_output(&mut far).await;
        assert_eq!(output["ok"], false);
        assert!(output["error"].as_str().unwrap().contains("tool task failed"));
        assert_eq!(next_sent(&mut far).await["type"], "response.create");

        far.events
            .send(UpstreamMessage::Text(
                json!({"type": "response.done", "response": {"id": "r1", "status": "completed"}}).to_string(),
            ))
            .await
            .unwrap();

        call_search(&far, "c2").await;
        let output = injected_output(&mut far).await;
        assert_eq!(output["ok"], true);
        assert_eq!(output["result"]["call"], 2);
        assert_eq!(next_sent(&mut far).await["type"], "response.create");

        handle.client_closed();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure_notifies_client() {
        let connector = Arc::new(MemoryConnector {
            link: Mutex::new(None),
            fail: true,
        });
        let (client_tx, mut client_rx) = mpsc::channel(16);
        let (handle, task) = SessionDriver::spawn(settings(), connector, Arc::new(SlowSearch), client_tx);
        handle.client_frame(ClientFrame::Text(json!({"type": "commit"}).to_string()));

        assert!(matches!(next_event(&mut client_rx).await, BridgeEvent::Error { .. }));
        assert!(matches!(next_event(&mut client_rx).await, BridgeEvent::Closing { .. }));
        assert_eq!(client_rx.recv().await, Some(ClientRoute::Close));

        let session = task.await.unwrap();
        assert!(session.history().is_empty());
    }

    #[tokio::test]
    async fn test_client_close_releases_upstream() {
        let (connector, mut far) = memory_connector();
        let (client_tx, _client_rx) = mpsc::channel(16);
        let (handle, task) = SessionDriver::spawn(settings(), connector, Arc::new(SlowSearch), client_tx);
        next_sent(&mut far).await;

        handle.client_closed();
        handle.client_closed();
        task.await.unwrap();

        // the outbound half was dropped
        assert!(far.sent.recv().await.is_none());
    }
}
