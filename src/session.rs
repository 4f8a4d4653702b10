use crate::bridge::{Bridge, BridgeLegs};
use crate::config::SessionConfig;
use crate::error::AppError;
use crate::recording::{CallRecording, Track};
use crate::repository::Repository;
use crate::transcript::TranscriptRecorder;
use crate::types::{
    CallRef, CallSession, CloseReason, Outcome, SessionId, TranscriptRecord, TurnDraft,
};
use crate::workflow::{run_workflow, SchedulingWorkflow, WorkflowSnapshot};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

struct LiveSession {
    call: Mutex<CallSession>,
    closed: AtomicBool,
    cancel: CancellationToken,
    legs: BridgeLegs,
    workflow_task: Mutex<Option<JoinHandle<()>>>,
    snapshot: watch::Receiver<WorkflowSnapshot>,
    recording: Option<Arc<CallRecording>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Owns every live call from the moment its telephony leg connects until its transcript has
/// been finalized.
pub struct SessionManager {
    repo: Arc<dyn Repository>,
    recorder: Arc<TranscriptRecorder>,
    config: SessionConfig,
    sessions: Mutex<HashMap<SessionId, Arc<LiveSession>>>,
}

impl SessionManager {
    pub fn new(repo: Arc<dyn Repository>, config: SessionConfig) -> Self {
        let recorder = Arc::new(TranscriptRecorder::new(repo.clone(), config.tool_timeout));
        Self {
            repo,
            recorder,
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Start a session for a freshly connected call. The adapters must already be attached
    /// to `legs`.
    pub async fn open(
        self: &Arc<Self>,
        call_ref: CallRef,
        legs: BridgeLegs,
    ) -> Result<CallSession, AppError> {
        let call = CallSession::new(call_ref);
        let id = call.id;

        self.recorder.begin(id);
        self.recorder.append(
            id,
            TurnDraft::lifecycle(format!(
                "session opened: {} call {}",
                call.direction.as_str(),
                call.call_sid
            )),
        )?;
        match tokio::time::timeout(self.config.tool_timeout, self.repo.record_call_started(&call))
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(session=%id, error=%e, "failed to record call start"),
            Err(_) => warn!(session=%id, "recording call start timed out"),
        }

        let workflow = SchedulingWorkflow::new(
            self.repo.clone(),
            self.config.clone(),
            call.patient_phone.clone(),
            call.started_at.date(),
        );
        let (snapshot_tx, snapshot_rx) = watch::channel(workflow.snapshot());
        let (tool_tx, tool_rx) = mpsc::channel(16);
        let workflow_task = tokio::spawn(run_workflow(workflow, tool_rx, snapshot_tx));

        let cancel = CancellationToken::new();
        let recording = self
            .config
            .recordings_dir
            .as_ref()
            .map(|_| Arc::new(CallRecording::new(self.config.recording_limit_bytes)));
        let bridge = Bridge::new(
            id,
            legs.clone(),
            self.recorder.clone(),
            tool_tx,
            cancel.clone(),
            self.config.hangup_grace,
            recording.clone(),
        );

        let live = Arc::new(LiveSession {
            call: Mutex::new(call.clone()),
            closed: AtomicBool::new(false),
            cancel: cancel.clone(),
            legs,
            workflow_task: Mutex::new(Some(workflow_task)),
            snapshot: snapshot_rx,
            recording,
        });
        lock(&self.sessions).insert(id, live);

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let reason = bridge.run().await;
            manager.close(id, reason).await;
        });

        let recorder = self.recorder.clone();
        let period = self.config.transcript_flush_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = recorder.flush(id).await {
                            warn!(session=%id, error=%e, "periodic transcript flush failed");
                        }
                    }
                }
            }
        });

        info!(session=%id, call_sid=%call.call_sid, phone=%call.patient_phone, "session opened");
        Ok(call)
    }

    /// Tear a session down. Only the first call for a session does any work; later or
    /// concurrent calls return `None`.
    pub async fn close(&self, id: SessionId, reason: CloseReason) -> Option<TranscriptRecord> {
        let live = lock(&self.sessions).get(&id).cloned()?;
        if live.closed.swap(true, Ordering::SeqCst) {
            debug!(session=%id, reason=%reason, "session already closing");
            return None;
        }
        info!(session=%id, reason=%reason, "closing session");
        live.cancel.cancel();
        live.legs.close_all();

        // wait out an in-flight tool call
        let handle = lock(&live.workflow_task).take();
        if let Some(handle) = handle {
            if tokio::time::timeout(self.config.close_drain_timeout, handle)
                .await
                .is_err()
            {
                warn!(session=%id, "tool call still running at close, finalizing without it");
            }
        }

        let (snapshot, outcome) = live.snapshot.borrow().clone().close();
        let lifecycle = [
            (outcome != Outcome::Scheduled).then_some("ended without scheduling".to_string()),
            Some(format!("session closed: {reason}")),
        ];
        for text in lifecycle.into_iter().flatten() {
            if let Err(e) = self.recorder.append(id, TurnDraft::lifecycle(text)) {
                warn!(session=%id, error=%e, "failed to record lifecycle turn");
            }
        }

        let call = {
            let mut call = lock(&live.call);
            call.workflow_state = snapshot.state;
            call.patient_id = snapshot.patient_id;
            call.nurse_id = snapshot.nurse_id;
            call.appointment_id = snapshot.appointment_id;
            call.ended_at = Some(OffsetDateTime::now_utc());
            call.close_reason = Some(reason);
            call.clone()
        };
        match tokio::time::timeout(self.config.tool_timeout, self.repo.record_call_ended(&call))
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(session=%id, error=%e, "failed to record call end"),
            Err(_) => warn!(session=%id, "recording call end timed out"),
        }

        if let (Some(recording), Some(dir)) = (&live.recording, &self.config.recordings_dir) {
            match recording.save(dir, id).await {
                Ok(files) => debug!(
                    session=%id,
                    files = files.len(),
                    patient_bytes = recording.len(Track::Patient),
                    assistant_bytes = recording.len(Track::Assistant),
                    "call audio written"
                ),
                Err(e) => warn!(session=%id, error=%e, "failed to save call audio"),
            }
        }

        let record = match self.recorder.finalize(id, outcome, snapshot.summary).await {
            Ok(record) => Some(record),
            Err(e) => {
                error!(session=%id, error=%e, "failed to finalize transcript");
                None
            }
        };
        lock(&self.sessions).remove(&id);
        info!(
            session=%id,
            outcome = outcome.as_str(),
            duration_seconds = call.duration_seconds().unwrap_or_default(),
            dropped_audio = live.legs.dropped_audio(),
            "session closed"
        );
        record
    }

    /// Whether `id` is open and not yet closing.
    pub fn is_active(&self, id: SessionId) -> bool {
        lock(&self.sessions)
            .get(&id)
            .map(|live| !live.closed.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub fn active_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    /// Close every live session, used on server shutdown.
    pub async fn close_all(&self, reason: CloseReason) {
        let ids: Vec<SessionId> = lock(&self.sessions).keys().copied().collect();
        for id in ids {
            self.close(id, reason).await;
        }
    }
}
