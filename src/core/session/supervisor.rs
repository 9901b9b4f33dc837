//! Per-session state machine.
//!
//! [`ConnectionSupervisor::handle`] applies one input and returns the effects
//! the driver must perform, in order. It never blocks and never touches a
//! socket, so every ordering property of a session can be checked by feeding
//! inputs and inspecting effects.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{HashSet, VecDeque};
use std::mem;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::audio::AudioRelay;
use super::model::{Lifecycle, Session, Turn};
use super::multiplexer::OutboundMultiplexer;
use super::protocol::{BridgeEvent, ClientControlMessage, ClientFrame, ClientRoute};
use super::router::{self, RoutedFrame};
use super::tools::{ReadyCall, ToolCallAggregator};
use super::turn::{DEFAULT_QUIET_PERIOD, FragmentOutcome, TurnAccumulator};
use crate::core::tools::unknown_tool_output;
use crate::core::upstream::{JsonObject, UpstreamCodec, UpstreamError, UpstreamEvent, UpstreamOp};
use crate::errors::BridgeError;

/// How tool-result resumes share the upstream generation channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResumePolicy {
    /// One generation at a time; resumes queue in announcement order
    #[default]
    Serialized,
    /// Each result resumes generation as soon as it is reported
    Independent,
}

/// Fixed parameters of one session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub session_id: String,
    pub quiet_period: Duration,
    /// Sent as `session.update` once the upstream opens
    pub initial_session: JsonObject,
    /// Defaults for every generation request
    pub response_defaults: JsonObject,
    pub known_tools: HashSet<String>,
    pub resume_policy: ResumePolicy,
}

impl SessionSettings {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            quiet_period: DEFAULT_QUIET_PERIOD,
            initial_session: JsonObject::new(),
            response_defaults: JsonObject::new(),
            known_tools: HashSet::new(),
            resume_policy: ResumePolicy::default(),
        }
    }
}

/// Everything that can happen to a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionInput {
    ClientFrame(ClientFrame),
    ClientClosed,
    UpstreamOpened,
    UpstreamFrame(String),
    /// Upstream closed, failed, or could not be opened
    UpstreamClosed { error: UpstreamError },
    FinalizeTimerFired { epoch: u64 },
    ToolCompleted { call_id: String, output: Value },
    /// Server-side close, e.g. idle timeout
    Shutdown { reason: String, message: String },
}

/// Work for the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Client(ClientRoute),
    Upstream(UpstreamOp),
    ArmFinalizeTimer { epoch: u64, after: Duration },
    DisarmFinalizeTimer,
    DispatchTool {
        call_id: String,
        name: String,
        arguments: Value,
    },
    CloseUpstream,
}

#[derive(Debug, Clone, PartialEq)]
enum GenerationRequest {
    UserTurn,
    ToolResume { call_id: String },
    Client(Option<JsonObject>),
}

struct Notice {
    message: String,
    details: Option<Value>,
    reason: String,
}

pub struct ConnectionSupervisor {
    session: Session,
    settings: SessionSettings,
    early_frames: VecDeque<ClientFrame>,
    turns: TurnAccumulator,
    tools: ToolCallAggregator,
    audio: AudioRelay,
    mux: OutboundMultiplexer,
    /// A generation is in flight upstream
    generating: bool,
    /// `response.create` sent, `response.created` not yet seen
    awaiting_ack: bool,
    pending_generations: VecDeque<GenerationRequest>,
    /// Set by `interrupt`; tool resumes are dropped until the next turn
    suppressed: bool,
    assistant_text: String,
    response_calls: Vec<String>,
    torn_down: bool,
}

impl ConnectionSupervisor {
    pub fn new(settings: SessionSettings, codec: Arc<dyn UpstreamCodec>) -> Self {
        Self {
            session: Session::new(settings.session_id.clone()),
            turns: TurnAccumulator::new(settings.quiet_period),
            settings,
            early_frames: VecDeque::new(),
            tools: ToolCallAggregator::new(),
            audio: AudioRelay::new(),
            mux: OutboundMultiplexer::new(codec),
            generating: false,
            awaiting_ack: false,
            pending_generations: VecDeque::new(),
            suppressed: false,
            assistant_text: String::new(),
            response_calls: Vec::new(),
            torn_down: false,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn into_session(self) -> Session {
        self.session
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.session.lifecycle()
    }

    pub fn is_closed(&self) -> bool {
        self.session.lifecycle() == Lifecycle::Closed
    }

    pub fn is_generating(&self) -> bool {
        self.generating
    }

    pub fn queued_generations(&self) -> usize {
        self.pending_generations.len()
    }

    pub fn handle(&mut self, input: SessionInput) -> Vec<Effect> {
        let mut fx = Vec::new();

        match input {
            SessionInput::ClientFrame(frame) => match self.lifecycle() {
                Lifecycle::Connecting => self.early_frames.push_back(frame),
                Lifecycle::Active => self.on_client_frame(frame, &mut fx),
                Lifecycle::Closing | Lifecycle::Closed => {
                    debug!(session_id = %self.session.id, "Client frame after close dropped")
                }
            },
            SessionInput::ClientClosed => {
                info!(session_id = %self.session.id, "Client disconnected");
                self.teardown(None, &mut fx);
            }
            SessionInput::UpstreamOpened => self.on_upstream_opened(&mut fx),
            SessionInput::UpstreamFrame(raw) => {
                if !self.session.is_live() {
                    debug!(session_id = %self.session.id, "Upstream frame after close dropped");
                } else {
                    let demuxed = self.mux.demux(raw, &mut self.audio);
                    fx.push(Effect::Client(demuxed.forward));
                    self.on_upstream_event(demuxed.event, &mut fx);
                }
            }
            SessionInput::UpstreamClosed { error } => self.fail(error.into(), &mut fx),
            SessionInput::FinalizeTimerFired { epoch } => {
                if self.session.is_live()
                    && let Some(text) = self.turns.on_timer(epoch)
                {
                    debug!(session_id = %self.session.id, "Utterance finalized by quiet period");
                    self.commit_user_turn(text, &mut fx);
                }
            }
            SessionInput::ToolCompleted { call_id, output } => {
                if !self.session.is_live() {
                    debug!(session_id = %self.session.id, call_id = %call_id, "Tool result after close dropped");
                } else if self.tools.record_result(&call_id, output) {
                    self.report_completed(&mut fx);
                } else {
                    debug!(session_id = %self.session.id, call_id = %call_id, "Result for unknown call dropped");
                }
            }
            SessionInput::Shutdown { reason, message } => {
                let notice = Notice {
                    message,
                    details: Some(json!({ "code": reason })),
                    reason,
                };
                self.teardown(Some(notice), &mut fx);
            }
        }

        fx
    }

    fn on_upstream_opened(&mut self, fx: &mut Vec<Effect>) {
        if self.lifecycle() != Lifecycle::Connecting {
            debug!(session_id = %self.session.id, "Upstream opened outside Connecting, ignored");
            return;
        }
        self.session.advance(Lifecycle::Active);

        fx.push(Effect::Upstream(UpstreamOp::UpdateSession(
            self.settings.initial_session.clone(),
        )));

        let queued = mem::take(&mut self.early_frames);
        if !queued.is_empty() {
            debug!(session_id = %self.session.id, frames = queued.len(), "Flushing early client frames");
        }
        for frame in queued {
            self.on_client_frame(frame, fx);
        }

        info!(session_id = %self.session.id, "Session ready");
        fx.push(Effect::Client(ClientRoute::Event(BridgeEvent::Ready {
            session_id: self.session.id.clone(),
        })));
    }

    fn on_client_frame(&mut self, frame: ClientFrame, fx: &mut Vec<Effect>) {
        match router::route(frame) {
            Ok(RoutedFrame::Audio(data)) => {
                fx.push(Effect::Upstream(self.audio.encode_input(data)));
            }
            Ok(RoutedFrame::Control(message)) => self.on_control(message, fx),
            Err(e) => self.fail(e, fx),
        }
    }

    /// Report an error to the client. Session-fatal errors also tear down.
    fn fail(&mut self, error: BridgeError, fx: &mut Vec<Effect>) {
        if error.is_session_fatal() {
            warn!(session_id = %self.session.id, error = %error, "Upstream connection lost");
            let notice = Notice {
                message: error.client_message(),
                details: error.details(),
                reason: "upstream_closed".to_string(),
            };
            self.teardown(Some(notice), fx);
        } else {
            warn!(session_id = %self.session.id, error = %error, "Rejected client message");
            fx.push(Effect::Client(ClientRoute::Event(BridgeEvent::error(
                error.client_message(),
                error.details(),
            ))));
        }
    }

    fn on_control(&mut self, message: ClientControlMessage, fx: &mut Vec<Effect>) {
        match message {
            ClientControlMessage::SessionInit {
                session_id,
                instructions,
            } => {
                if let Some(label) = session_id {
                    debug!(session_id = %self.session.id, label = %label, "Client session label");
                    self.session.label = Some(label);
                }
                if let Some(instructions) = instructions {
                    let mut patch = JsonObject::new();
                    patch.insert("instructions".to_string(), Value::String(instructions));
                    self.apply_session_patch(patch, fx);
                }
            }
            ClientControlMessage::Interrupt {} => {
                info!(
                    session_id = %self.session.id,
                    generating = self.generating,
                    "Interrupt"
                );
                if self.generating {
                    fx.push(Effect::Upstream(UpstreamOp::CancelResponse));
                }
                fx.push(Effect::Upstream(UpstreamOp::ClearInput));
                self.pending_generations.clear();
                self.suppressed = true;
            }
            ClientControlMessage::Commit {} => {
                fx.push(Effect::Upstream(UpstreamOp::CommitInput));
            }
            ClientControlMessage::ResponseCreate { response } => {
                self.request_generation(GenerationRequest::Client(response), fx);
            }
            ClientControlMessage::SessionUpdate { session } => {
                self.apply_session_patch(session, fx);
            }
        }
    }

    fn apply_session_patch(&mut self, patch: JsonObject, fx: &mut Vec<Effect>) {
        router::merge_fields(&mut self.session.live_config, &patch);
        fx.push(Effect::Upstream(UpstreamOp::UpdateSession(patch)));
    }

    fn on_upstream_event(&mut self, event: UpstreamEvent, fx: &mut Vec<Effect>) {
        match event {
            UpstreamEvent::SessionCreated { id } => {
                debug!(session_id = %self.session.id, upstream_session = %id, "Upstream session created");
            }
            UpstreamEvent::Transcript(fragment) => match self.turns.on_fragment(&fragment) {
                FragmentOutcome::Ignored => {}
                FragmentOutcome::Partial { transcript, epoch } => {
                    fx.push(Effect::Client(ClientRoute::Event(
                        BridgeEvent::TranscriptPartial { transcript },
                    )));
                    fx.push(Effect::ArmFinalizeTimer {
                        epoch,
                        after: self.turns.quiet_period(),
                    });
                }
                FragmentOutcome::Finalized(claimed) => {
                    fx.push(Effect::DisarmFinalizeTimer);
                    if let Some(text) = claimed {
                        self.commit_user_turn(text, fx);
                    }
                }
            },
            UpstreamEvent::ResponseCreated { response_id } => {
                debug!(session_id = %self.session.id, response_id = %response_id, "Generation started");
                self.generating = true;
                self.awaiting_ack = false;
            }
            UpstreamEvent::AssistantText { text } => {
                if !self.assistant_text.is_empty() {
                    self.assistant_text.push(' ');
                }
                self.assistant_text.push_str(&text);
            }
            UpstreamEvent::AudioDelta { .. } | UpstreamEvent::AudioDone { .. } => {}
            UpstreamEvent::FunctionCallAnnounced { call_id, name } => {
                if self.tools.announce(&call_id, &name) {
                    debug!(session_id = %self.session.id, call_id = %call_id, tool = %name, "Function call announced");
                    self.response_calls.push(call_id);
                }
            }
            UpstreamEvent::FunctionCallArgumentsDelta { call_id, delta } => {
                self.tools.append(&call_id, &delta);
            }
            UpstreamEvent::FunctionCallArgumentsDone {
                call_id,
                name,
                arguments,
            } => {
                if self.tools.state(&call_id).is_none()
                    && let Some(name) = name
                    && self.tools.announce(&call_id, &name)
                {
                    self.response_calls.push(call_id.clone());
                }
                match self.tools.mark_ready(&call_id, &arguments) {
                    Some(ready) => self.on_ready_call(ready, fx),
                    None => {
                        debug!(session_id = %self.session.id, call_id = %call_id, "Arguments done for unknown or finished call")
                    }
                }
            }
            UpstreamEvent::ResponseDone {
                response_id,
                status,
            } => self.on_response_done(response_id, status, fx),
            UpstreamEvent::Error { message } => {
                warn!(session_id = %self.session.id, error = %message, "Upstream reported an error");
                if self.awaiting_ack {
                    debug!(session_id = %self.session.id, "Generation request rejected");
                    self.open_generation_gate(fx);
                }
            }
            UpstreamEvent::Opaque => {}
        }
    }

    fn on_ready_call(&mut self, ready: ReadyCall, fx: &mut Vec<Effect>) {
        if let Some(err) = ready.argument_error() {
            warn!(session_id = %self.session.id, error = %err, "Using empty arguments");
        }

        if self.settings.known_tools.contains(&ready.name) {
            info!(
                session_id = %self.session.id,
                call_id = %ready.call_id,
                tool = %ready.name,
                "Dispatching tool call"
            );
            fx.push(Effect::DispatchTool {
                call_id: ready.call_id,
                name: ready.name,
                arguments: ready.arguments,
            });
        } else {
            warn!(
                session_id = %self.session.id,
                call_id = %ready.call_id,
                tool = %ready.name,
                "Model called an unknown tool"
            );
            self.tools
                .record_result(&ready.call_id, unknown_tool_output(&ready.name));
            self.report_completed(fx);
        }
    }

    fn report_completed(&mut self, fx: &mut Vec<Effect>) {
        let in_order = self.settings.resume_policy == ResumePolicy::Serialized;
        for call in self.tools.take_reportable(in_order) {
            let output = call.output.to_string();
            debug!(session_id = %self.session.id, call_id = %call.call_id, tool = %call.name, "Reporting tool result");
            self.session.push_turn(Turn::tool(call.call_id.clone(), output.clone()));
            fx.push(Effect::Upstream(UpstreamOp::InjectToolResult {
                call_id: call.call_id.clone(),
                output,
            }));
            self.request_generation(GenerationRequest::ToolResume { call_id: call.call_id }, fx);
        }
    }

    fn on_response_done(&mut self, response_id: String, status: Option<String>, fx: &mut Vec<Effect>) {
        debug!(
            session_id = %self.session.id,
            response_id = %response_id,
            status = ?status,
            "Generation finished"
        );

        self.tools.abandon_incomplete();
        self.audio.discard(&response_id);
        self.session.push_turn(Turn::assistant(
            mem::take(&mut self.assistant_text),
            mem::take(&mut self.response_calls),
        ));
        fx.push(Effect::Client(ClientRoute::Event(BridgeEvent::TurnComplete {
            response_id,
        })));

        self.open_generation_gate(fx);
    }

    fn open_generation_gate(&mut self, fx: &mut Vec<Effect>) {
        self.generating = false;
        self.awaiting_ack = false;
        if let Some(next) = self.pending_generations.pop_front() {
            self.issue_generation(next, fx);
        }
    }

    fn commit_user_turn(&mut self, text: String, fx: &mut Vec<Effect>) {
        info!(session_id = %self.session.id, chars = text.len(), "User turn committed");
        self.session.push_turn(Turn::user(text.clone()));
        fx.push(Effect::Client(ClientRoute::Event(BridgeEvent::TranscriptFinal {
            transcript: text,
        })));
        self.request_generation(GenerationRequest::UserTurn, fx);
    }

    fn request_generation(&mut self, request: GenerationRequest, fx: &mut Vec<Effect>) {
        match &request {
            GenerationRequest::UserTurn | GenerationRequest::Client(_) => self.suppressed = false,
            GenerationRequest::ToolResume { call_id } => {
                if self.suppressed {
                    debug!(session_id = %self.session.id, call_id = %call_id, "Resume suppressed after interrupt");
                    return;
                }
                if self.settings.resume_policy == ResumePolicy::Independent {
                    self.issue_generation(request, fx);
                    return;
                }
            }
        }

        if self.generating {
            self.pending_generations.push_back(request);
        } else {
            self.issue_generation(request, fx);
        }
    }

    fn issue_generation(&mut self, request: GenerationRequest, fx: &mut Vec<Effect>) {
        let overrides = match &request {
            GenerationRequest::Client(overrides) => overrides.as_ref(),
            _ => None,
        };
        let params = self.effective_response(overrides);
        self.generating = true;
        self.awaiting_ack = true;
        fx.push(Effect::Upstream(UpstreamOp::CreateResponse(params)));
    }

    /// Defaults, then live session values for the same keys, then caller keys.
    fn effective_response(&self, overrides: Option<&JsonObject>) -> JsonObject {
        let mut params = self.settings.response_defaults.clone();
        for (key, value) in params.iter_mut() {
            if let Some(live) = self.session.live_config.get(key) {
                *value = live.clone();
            }
        }
        if let Some(overrides) = overrides {
            router::merge_fields(&mut params, overrides);
        }
        params
    }

    fn teardown(&mut self, notice: Option<Notice>, fx: &mut Vec<Effect>) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.session.advance(Lifecycle::Closing);

        self.turns.disarm();
        fx.push(Effect::DisarmFinalizeTimer);

        if let Some(notice) = notice {
            fx.push(Effect::Client(ClientRoute::Event(BridgeEvent::error(
                notice.message,
                notice.details,
            ))));
            fx.push(Effect::Client(ClientRoute::Event(BridgeEvent::Closing {
                reason: notice.reason,
            })));
            fx.push(Effect::Client(ClientRoute::Close));
        }
        fx.push(Effect::CloseUpstream);

        self.early_frames.clear();
        self.pending_generations.clear();
        self.tools.clear();
        self.session.advance(Lifecycle::Closed);

        info!(
            session_id = %self.session.id,
            turns = self.session.history().len(),
            relayed = self.mux.relayed(),
            "Session closed"
        );
    }
}
