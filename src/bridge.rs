//! Audio/event relay between the telephony leg and the AI leg of one call.
//!
//! Adapters only ever see the neutral event types below, pushed into and popped from
//! [`FrameQueue`]s, so neither leg's wire format leaks into the relay.

use crate::queue::{Frame, FrameQueue};
use crate::recording::{CallRecording, Track};
use crate::transcript::TranscriptRecorder;
use crate::types::{CloseReason, SessionId, Speaker, TurnDraft, TurnKind};
use crate::workflow::{Directive, ToolInvocation};

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// From the telephony leg into the bridge.
#[derive(Debug, PartialEq)]
pub enum TelephonyEvent {
    Audio(Vec<u8>),
    /// Playback of a previously sent mark finished.
    Mark(String),
    Stop,
}

/// From the bridge to the telephony leg.
#[derive(Debug, PartialEq)]
pub enum TelephonyCommand {
    Audio(Vec<u8>),
    /// Flush whatever the far end has buffered for playback.
    Clear,
    Mark(String),
    Hangup,
}

/// From the AI leg into the bridge.
#[derive(Debug, PartialEq)]
pub enum AiEvent {
    SessionReady,
    Audio(Vec<u8>),
    Transcript { speaker: Speaker, text: String },
    /// The caller started talking over the assistant.
    SpeechStarted,
    ResponseStarted,
    ResponseDone,
    ToolCall {
        call_id: String,
        name: String,
        arguments: String,
        /// The AI will not continue until this call has a result.
        exclusive: bool,
    },
    Error(String),
}

/// From the bridge to the AI leg.
#[derive(Debug, PartialEq)]
pub enum AiCommand {
    Audio(Vec<u8>),
    ToolResult { call_id: String, output: String },
    /// Ask the AI to produce its next response.
    RequestResponse,
}

impl Frame for TelephonyEvent {
    fn is_audio(&self) -> bool {
        matches!(self, TelephonyEvent::Audio(_))
    }
}

impl Frame for TelephonyCommand {
    fn is_audio(&self) -> bool {
        matches!(self, TelephonyCommand::Audio(_))
    }
}

impl Frame for AiEvent {
    fn is_audio(&self) -> bool {
        matches!(self, AiEvent::Audio(_))
    }
}

impl Frame for AiCommand {
    fn is_audio(&self) -> bool {
        matches!(self, AiCommand::Audio(_))
    }
}

/// The four queues joining the adapters to the bridge.
#[derive(Clone)]
pub struct BridgeLegs {
    pub from_telephony: Arc<FrameQueue<TelephonyEvent>>,
    pub to_telephony: Arc<FrameQueue<TelephonyCommand>>,
    pub from_ai: Arc<FrameQueue<AiEvent>>,
    pub to_ai: Arc<FrameQueue<AiCommand>>,
}

impl BridgeLegs {
    pub fn new(capacity: usize) -> Self {
        Self {
            from_telephony: Arc::new(FrameQueue::new(capacity)),
            to_telephony: Arc::new(FrameQueue::new(capacity)),
            from_ai: Arc::new(FrameQueue::new(capacity)),
            to_ai: Arc::new(FrameQueue::new(capacity)),
        }
    }

    pub fn close_all(&self) {
        self.from_telephony.close();
        self.to_telephony.close();
        self.from_ai.close();
        self.to_ai.close();
    }

    /// Audio frames lost to back-pressure across all four queues.
    pub fn dropped_audio(&self) -> u64 {
        self.from_telephony.dropped()
            + self.to_telephony.dropped()
            + self.from_ai.dropped()
            + self.to_ai.dropped()
    }
}

/// Dedup key for tool calls.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ToolCallKey {
    pub session_id: SessionId,
    pub call_id: String,
}

enum LedgerEntry {
    Pending,
    Done(String),
}

#[derive(Default)]
struct ResponseTurn {
    in_flight: bool,
    results_waiting: bool,
    completed: u64,
}

struct Shared {
    session_id: SessionId,
    legs: BridgeLegs,
    recorder: Arc<TranscriptRecorder>,
    cancel: CancellationToken,
    stop_reason: Mutex<Option<CloseReason>>,
    ledger: Mutex<HashMap<ToolCallKey, LedgerEntry>>,
    exclusive_calls: AtomicUsize,
    turn: Mutex<ResponseTurn>,
    hangup_grace: Duration,
    recording: Option<Arc<CallRecording>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    /// First reason wins.
    fn shutdown(&self, reason: CloseReason) -> CloseReason {
        let reason = *lock(&self.stop_reason).get_or_insert(reason);
        self.cancel.cancel();
        reason
    }

    fn capture(&self, track: Track, frame: &[u8]) {
        if let Some(recording) = &self.recording {
            recording.push(track, frame);
        }
    }

    fn record(&self, draft: TurnDraft) {
        if let Err(e) = self.recorder.append(self.session_id, draft) {
            debug!(session=%self.session_id, error=%e, "turn not recorded");
        }
    }

    fn deliver_result(&self, call_id: String, output: String) {
        self.legs.to_ai.push(AiCommand::ToolResult { call_id, output });
        let mut turn = lock(&self.turn);
        if turn.in_flight {
            turn.results_waiting = true;
        } else {
            turn.in_flight = true;
            self.legs.to_ai.push(AiCommand::RequestResponse);
        }
    }

    fn response_started(&self) {
        lock(&self.turn).in_flight = true;
    }

    fn response_done(&self) -> u64 {
        let mut turn = lock(&self.turn);
        turn.completed += 1;
        turn.in_flight = false;
        if turn.results_waiting {
            turn.results_waiting = false;
            turn.in_flight = true;
            self.legs.to_ai.push(AiCommand::RequestResponse);
        }
        turn.completed
    }
}

pub struct Bridge {
    shared: Arc<Shared>,
    workflow: mpsc::Sender<ToolInvocation>,
}

impl Bridge {
    pub fn new(
        session_id: SessionId,
        legs: BridgeLegs,
        recorder: Arc<TranscriptRecorder>,
        workflow: mpsc::Sender<ToolInvocation>,
        cancel: CancellationToken,
        hangup_grace: Duration,
        recording: Option<Arc<CallRecording>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                session_id,
                legs,
                recorder,
                cancel,
                stop_reason: Mutex::new(None),
                ledger: Mutex::new(HashMap::new()),
                exclusive_calls: AtomicUsize::new(0),
                turn: Mutex::new(ResponseTurn::default()),
                hangup_grace,
                recording,
            }),
            workflow,
        }
    }

    /// Pump both legs until one of them closes or the session is cancelled. Returns the
    /// reason the relay stopped; all four queues are closed on return.
    pub async fn run(self) -> CloseReason {
        let shared = self.shared.clone();
        let reason = tokio::select! {
            reason = pump_telephony(&shared) => reason,
            reason = pump_ai(&shared, &self.workflow) => reason,
            _ = shared.cancel.cancelled() => CloseReason::Shutdown,
        };
        let reason = shared.shutdown(reason);
        shared.legs.close_all();
        info!(session=%shared.session_id, reason=%reason, "bridge stopped");
        reason
    }
}

async fn pump_telephony(shared: &Shared) -> CloseReason {
    let mut gated: u64 = 0;
    loop {
        match shared.legs.from_telephony.pop().await {
            None => return CloseReason::TelephonyLegClosed,
            Some(TelephonyEvent::Stop) => {
                debug!(session=%shared.session_id, "telephony leg sent stop");
                return CloseReason::TelephonyLegClosed;
            }
            Some(TelephonyEvent::Audio(frame)) => {
                shared.capture(Track::Patient, &frame);
                if shared.exclusive_calls.load(Ordering::SeqCst) > 0 {
                    gated += 1;
                    if gated % 50 == 1 {
                        debug!(session=%shared.session_id, gated, "caller audio held back during tool call");
                    }
                    continue;
                }
                shared.legs.to_ai.push(AiCommand::Audio(frame));
            }
            Some(TelephonyEvent::Mark(name)) => {
                debug!(session=%shared.session_id, mark=%name, "playback reached mark");
            }
        }
    }
}

async fn pump_ai(shared: &Arc<Shared>, workflow: &mpsc::Sender<ToolInvocation>) -> CloseReason {
    loop {
        let Some(event) = shared.legs.from_ai.pop().await else {
            return CloseReason::AiLegClosed;
        };
        match event {
            AiEvent::SessionReady => debug!(session=%shared.session_id, "ai session ready"),
            AiEvent::Audio(frame) => {
                shared.capture(Track::Assistant, &frame);
                shared.legs.to_telephony.push(TelephonyCommand::Audio(frame));
            }
            AiEvent::SpeechStarted => {
                let discarded = shared.legs.to_telephony.discard_audio();
                shared.legs.to_telephony.push(TelephonyCommand::Clear);
                debug!(session=%shared.session_id, discarded, "caller barged in");
            }
            AiEvent::Transcript { speaker, text } => {
                if !text.trim().is_empty() {
                    shared.record(TurnDraft::speech(speaker, text.trim()));
                }
            }
            AiEvent::ResponseStarted => shared.response_started(),
            AiEvent::ResponseDone => {
                let n = shared.response_done();
                shared
                    .legs
                    .to_telephony
                    .push(TelephonyCommand::Mark(format!("response-{n}")));
            }
            AiEvent::ToolCall {
                call_id,
                name,
                arguments,
                exclusive,
            } => dispatch_tool_call(shared, workflow, call_id, name, arguments, exclusive),
            AiEvent::Error(message) => {
                warn!(session=%shared.session_id, error=%message, "ai leg reported an error");
            }
        }
    }
}

fn dispatch_tool_call(
    shared: &Arc<Shared>,
    workflow: &mpsc::Sender<ToolInvocation>,
    call_id: String,
    name: String,
    arguments: String,
    exclusive: bool,
) {
    let key = ToolCallKey {
        session_id: shared.session_id,
        call_id: call_id.clone(),
    };
    let replay = {
        let mut ledger = lock(&shared.ledger);
        match ledger.get(&key) {
            Some(LedgerEntry::Pending) => {
                debug!(session=%shared.session_id, call_id=%call_id, "duplicate tool call while pending");
                return;
            }
            Some(LedgerEntry::Done(output)) => Some(output.clone()),
            None => {
                ledger.insert(key.clone(), LedgerEntry::Pending);
                None
            }
        }
    };
    if let Some(output) = replay {
        debug!(session=%shared.session_id, call_id=%call_id, "duplicate tool call, replaying result");
        shared.deliver_result(call_id, output);
        return;
    }

    shared.record(TurnDraft {
        speaker: Speaker::Assistant,
        kind: TurnKind::ToolCall,
        payload: format!("{name} {arguments}"),
    });
    if exclusive {
        shared.exclusive_calls.fetch_add(1, Ordering::SeqCst);
    }
    debug!(session=%shared.session_id, call_id=%call_id, tool=%name, "dispatching tool call");

    let shared = shared.clone();
    let workflow = workflow.clone();
    tokio::spawn(async move {
        let (reply, result) = oneshot::channel();
        let sent = workflow
            .send(ToolInvocation {
                name,
                arguments,
                reply,
            })
            .await;
        drop(workflow);
        let outcome = match sent {
            Ok(()) => result.await.ok(),
            Err(_) => None,
        };
        if exclusive {
            shared.exclusive_calls.fetch_sub(1, Ordering::SeqCst);
        }
        let Some(outcome) = outcome else {
            warn!(session=%shared.session_id, call_id=%key.call_id, "workflow gone before tool call ran");
            lock(&shared.ledger).remove(&key);
            return;
        };

        let output = outcome.result.to_json();
        {
            let mut ledger = lock(&shared.ledger);
            if outcome.result.is_retryable() {
                ledger.remove(&key);
            } else {
                ledger.insert(key.clone(), LedgerEntry::Done(output.clone()));
            }
        }
        if shared.cancel.is_cancelled() {
            debug!(session=%shared.session_id, call_id=%key.call_id, "session closed, tool result discarded");
            return;
        }
        shared.record(TurnDraft {
            speaker: Speaker::System,
            kind: TurnKind::ToolResult,
            payload: output.clone(),
        });
        shared.deliver_result(key.call_id.clone(), output);

        match outcome.directive {
            Some(Directive::Hangup) => {
                tokio::select! {
                    _ = tokio::time::sleep(shared.hangup_grace) => {
                        shared.legs.to_telephony.push(TelephonyCommand::Hangup);
                        shared.shutdown(CloseReason::AssistantEnded);
                    }
                    _ = shared.cancel.cancelled() => {}
                }
            }
            Some(Directive::CloseBackendUnavailable) => {
                warn!(session=%shared.session_id, "too many backend failures, closing session");
                shared.shutdown(CloseReason::BackendUnavailable);
            }
            None => {}
        }
    });
}
