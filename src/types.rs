use crate::config::Config;
use crate::session::SessionManager;
use crate::twilio_api::TwilioApi;
use crate::twilio_types::TwilioConnectPayload;
use crate::workflow::WorkflowState;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// What the telephony side tells us about a call when its media stream connects.
#[derive(Clone, Debug)]
pub struct CallRef {
    pub call_sid: String,
    pub stream_sid: String,
    pub direction: Direction,
    pub patient_phone: String,
}

/// Why a session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    TelephonyLegClosed,
    AiLegClosed,
    AssistantEnded,
    BackendUnavailable,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::TelephonyLegClosed => "telephony-leg-closed",
            CloseReason::AiLegClosed => "ai-leg-closed",
            CloseReason::AssistantEnded => "assistant-ended",
            CloseReason::BackendUnavailable => "backend-unavailable",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One live call, owned by the session manager.
#[derive(Clone, Debug)]
pub struct CallSession {
    pub id: SessionId,
    pub call_sid: String,
    pub stream_sid: String,
    pub direction: Direction,
    pub patient_phone: String,
    pub patient_id: Option<i32>,
    pub nurse_id: Option<i32>,
    pub appointment_id: Option<i32>,
    pub workflow_state: WorkflowState,
    pub started_at: OffsetDateTime,
    pub ended_at: Option<OffsetDateTime>,
    pub close_reason: Option<CloseReason>,
}

impl CallSession {
    pub fn new(call_ref: CallRef) -> Self {
        Self {
            id: SessionId::new(),
            call_sid: call_ref.call_sid,
            stream_sid: call_ref.stream_sid,
            direction: call_ref.direction,
            patient_phone: call_ref.patient_phone,
            patient_id: None,
            nurse_id: None,
            appointment_id: None,
            workflow_state: WorkflowState::AwaitingIdentity,
            started_at: OffsetDateTime::now_utc(),
            ended_at: None,
            close_reason: None,
        }
    }

    pub fn duration_seconds(&self) -> Option<i64> {
        self.ended_at
            .map(|end| (end - self.started_at).whole_seconds())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Speaker {
    Patient,
    Assistant,
    System,
}

impl Speaker {
    pub fn as_str(self) -> &'static str {
        match self {
            Speaker::Patient => "patient",
            Speaker::Assistant => "assistant",
            Speaker::System => "system",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Speaker::Patient => "Patient",
            Speaker::Assistant => "Assistant",
            Speaker::System => "System",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnKind {
    Speech,
    ToolCall,
    ToolResult,
    Lifecycle,
}

impl TurnKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TurnKind::Speech => "speech",
            TurnKind::ToolCall => "tool_call",
            TurnKind::ToolResult => "tool_result",
            TurnKind::Lifecycle => "lifecycle",
        }
    }
}

/// A transcript entry before the recorder has numbered it.
#[derive(Clone, Debug, PartialEq)]
pub struct TurnDraft {
    pub speaker: Speaker,
    pub kind: TurnKind,
    pub payload: String,
}

impl TurnDraft {
    pub fn speech(speaker: Speaker, text: impl Into<String>) -> Self {
        Self {
            speaker,
            kind: TurnKind::Speech,
            payload: text.into(),
        }
    }

    pub fn lifecycle(text: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::System,
            kind: TurnKind::Lifecycle,
            payload: text.into(),
        }
    }
}

/// One immutable transcript entry. `seq` is the only ordering authority; `recorded_at` is
/// advisory.
#[derive(Clone, Debug, PartialEq)]
pub struct ConversationTurn {
    pub seq: u64,
    pub speaker: Speaker,
    pub kind: TurnKind,
    pub payload: String,
    pub recorded_at: OffsetDateTime,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Scheduled,
    Unresolved,
    Abandoned,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Scheduled => "scheduled",
            Outcome::Unresolved => "unresolved",
            Outcome::Abandoned => "abandoned",
        }
    }
}

/// The persisted, final form of a session's transcript.
#[derive(Clone, Debug)]
pub struct TranscriptRecord {
    pub session_id: SessionId,
    pub turns: Vec<ConversationTurn>,
    pub full_text: String,
    pub partitions: BTreeMap<Speaker, String>,
    pub outcome: Outcome,
    pub summary: Option<String>,
}

impl TranscriptRecord {
    pub fn build(
        session_id: SessionId,
        turns: Vec<ConversationTurn>,
        outcome: Outcome,
        summary: Option<String>,
    ) -> Self {
        let mut full = Vec::new();
        let mut partitions: BTreeMap<Speaker, Vec<&str>> = BTreeMap::new();
        for turn in turns.iter().filter(|t| t.kind == TurnKind::Speech) {
            full.push(format!("{}: {}", turn.speaker.label(), turn.payload));
            partitions
                .entry(turn.speaker)
                .or_default()
                .push(turn.payload.as_str());
        }
        let partitions = partitions
            .into_iter()
            .map(|(speaker, lines)| (speaker, lines.join("\n")))
            .collect();
        let full_text = full.join("\n");

        Self {
            session_id,
            turns,
            full_text,
            partitions,
            outcome,
            summary,
        }
    }

    pub fn partition(&self, speaker: Speaker) -> &str {
        self.partitions.get(&speaker).map(String::as_str).unwrap_or("")
    }
}

/// Connect webhook payloads waiting for their media stream, keyed by call sid. Entries for
/// calls whose stream never connects expire after `ttl`.
pub struct PendingStreams {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, TwilioConnectPayload)>>,
}

impl PendingStreams {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, (Instant, TwilioConnectPayload)>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, payload: TwilioConnectPayload) {
        let now = Instant::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, (at, _)| now.duration_since(*at) < self.ttl);
        if entries.len() < before {
            debug!(expired = before - entries.len(), "dropped stale connect payloads");
        }
        entries.insert(payload.call_sid.clone(), (now, payload));
    }

    pub fn take(&self, call_sid: &str) -> Option<TwilioConnectPayload> {
        let (at, payload) = self.lock().remove(call_sid)?;
        (at.elapsed() < self.ttl).then_some(payload)
    }

    pub fn waiting(&self) -> usize {
        self.lock().len()
    }
}

pub struct AppState {
    pub config: Config,
    pub sessions: Arc<SessionManager>,
    pub twilio_api: TwilioApi,
    pub streams: PendingStreams,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect_payload(call_sid: &str) -> TwilioConnectPayload {
        serde_urlencoded::from_str(&format!(
            "AccountSid=AC1&CallSid={call_sid}&CallStatus=ringing&Direction=inbound\
             &From=%2B15551234567&To=%2B15550001111"
        ))
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn pending_streams_expire_when_no_stream_connects() {
        let streams = PendingStreams::new(Duration::from_secs(60));
        streams.insert(connect_payload("CA1"));
        streams.insert(connect_payload("CA2"));
        assert_eq!(streams.take("CA1").map(|p| p.from), Some("+15551234567".into()));
        assert!(streams.take("CA1").is_none());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(streams.take("CA2").is_none());

        streams.insert(connect_payload("CA3"));
        tokio::time::advance(Duration::from_secs(61)).await;
        streams.insert(connect_payload("CA4"));
        assert_eq!(streams.waiting(), 1);
        assert!(streams.take("CA4").is_some());
    }

    fn turn(seq: u64, speaker: Speaker, kind: TurnKind, payload: &str) -> ConversationTurn {
        ConversationTurn {
            seq,
            speaker,
            kind,
            payload: payload.to_string(),
            recorded_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn transcript_text_only_includes_speech() {
        let turns = vec![
            turn(0, Speaker::System, TurnKind::Lifecycle, "session opened"),
            turn(1, Speaker::Assistant, TurnKind::Speech, "Hello, how can I help?"),
            turn(2, Speaker::Patient, TurnKind::Speech, "I need to see my nurse."),
            turn(3, Speaker::Assistant, TurnKind::ToolCall, "identify_patient {}"),
            turn(4, Speaker::Assistant, TurnKind::Speech, "Let me check."),
        ];
        let record = TranscriptRecord::build(SessionId::new(), turns, Outcome::Abandoned, None);

        assert_eq!(
            record.full_text,
            "Assistant: Hello, how can I help?\nPatient: I need to see my nurse.\nAssistant: Let me check."
        );
        assert_eq!(record.partition(Speaker::Patient), "I need to see my nurse.");
        assert_eq!(
            record.partition(Speaker::Assistant),
            "Hello, how can I help?\nLet me check."
        );
        assert_eq!(record.partition(Speaker::System), "");
        assert_eq!(record.turns.len(), 5);
    }
}
