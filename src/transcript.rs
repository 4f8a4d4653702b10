use crate::error::{AppError, RepoError};
use crate::repository::Repository;
use crate::types::{ConversationTurn, Outcome, SessionId, TranscriptRecord, TurnDraft};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, error, warn};

#[derive(Default)]
struct LogState {
    turns: Vec<ConversationTurn>,
    flushed: usize,
    finalized: bool,
}

#[derive(Default)]
struct SessionLog {
    state: Mutex<LogState>,
    flush_lock: tokio::sync::Mutex<()>,
}

impl SessionLog {
    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Single writer for every session's transcript.
///
/// `append` is synchronous and numbers turns under a per-session lock, so the sequence
/// follows the order callers observed the events in. Persistence happens in batches via
/// `flush` and once more in `finalize`.
pub struct TranscriptRecorder {
    repo: Arc<dyn Repository>,
    timeout: Duration,
    logs: Mutex<HashMap<SessionId, Arc<SessionLog>>>,
}

impl TranscriptRecorder {
    pub fn new(repo: Arc<dyn Repository>, timeout: Duration) -> Self {
        Self {
            repo,
            timeout,
            logs: Mutex::new(HashMap::new()),
        }
    }

    fn log(&self, session_id: SessionId) -> Option<Arc<SessionLog>> {
        self.logs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&session_id)
            .cloned()
    }

    pub fn begin(&self, session_id: SessionId) {
        self.logs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(session_id)
            .or_default();
    }

    /// Number and store a turn, returning its sequence number.
    pub fn append(&self, session_id: SessionId, draft: TurnDraft) -> Result<u64, AppError> {
        let log = self.log(session_id).ok_or_else(|| {
            warn!(session=%session_id, "append to unknown transcript");
            AppError("unknown transcript")
        })?;
        let mut state = log.lock();
        if state.finalized {
            debug!(session=%session_id, kind = draft.kind.as_str(), "turn after finalize dropped");
            return Err(AppError("transcript already finalized"));
        }
        let seq = state.turns.len() as u64;
        state.turns.push(ConversationTurn {
            seq,
            speaker: draft.speaker,
            kind: draft.kind,
            payload: draft.payload,
            recorded_at: OffsetDateTime::now_utc(),
        });
        Ok(seq)
    }

    /// Persist turns recorded since the last successful flush.
    pub async fn flush(&self, session_id: SessionId) -> Result<usize, RepoError> {
        let Some(log) = self.log(session_id) else {
            return Ok(0);
        };
        self.flush_log(session_id, &log).await
    }

    async fn flush_log(&self, session_id: SessionId, log: &SessionLog) -> Result<usize, RepoError> {
        let _guard = log.flush_lock.lock().await;
        let (from, pending) = {
            let state = log.lock();
            (state.flushed, state.turns[state.flushed..].to_vec())
        };
        if pending.is_empty() {
            return Ok(0);
        }
        tokio::time::timeout(self.timeout, self.repo.append_turns(session_id, &pending))
            .await
            .map_err(|_| RepoError::Timeout)??;
        let count = pending.len();
        log.lock().flushed = from + count;
        debug!(session=%session_id, count, "flushed transcript turns");
        Ok(count)
    }

    /// Seal the log, persist what is left and store the transcript record. The record is
    /// returned even when the store cannot be reached.
    pub async fn finalize(
        &self,
        session_id: SessionId,
        outcome: Outcome,
        summary: Option<String>,
    ) -> Result<TranscriptRecord, AppError> {
        let log = self.log(session_id).ok_or_else(|| {
            error!(session=%session_id, "finalize of unknown transcript");
            AppError("unknown transcript")
        })?;
        log.lock().finalized = true;

        if let Err(e) = self.flush_log(session_id, &log).await {
            warn!(session=%session_id, error=%e, "final transcript flush failed");
        }
        let turns = log.lock().turns.clone();
        let record = TranscriptRecord::build(session_id, turns, outcome, summary);
        match tokio::time::timeout(self.timeout, self.repo.save_transcript(&record)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(session=%session_id, error=%e, "failed to save transcript"),
            Err(_) => warn!(session=%session_id, "saving transcript timed out"),
        }

        self.logs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&session_id);
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_repository::MemoryRepository;
    use crate::test_support::FlakyRepository;
    use crate::types::Speaker;

    #[tokio::test]
    async fn concurrent_appends_get_contiguous_sequence_numbers() {
        let repo = Arc::new(MemoryRepository::new());
        let recorder = Arc::new(TranscriptRecorder::new(repo.clone(), Duration::from_secs(1)));
        let id = SessionId::new();
        recorder.begin(id);

        let mut tasks = vec![];
        for worker in 0..4 {
            let recorder = recorder.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..25 {
                    recorder
                        .append(id, TurnDraft::speech(Speaker::Patient, format!("{worker}-{i}")))
                        .unwrap();
                    tokio::task::yield_now().await;
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        let record = recorder.finalize(id, Outcome::Abandoned, None).await.unwrap();
        let seqs: Vec<u64> = record.turns.iter().map(|t| t.seq).collect();
        assert_eq!(seqs, (0..100).collect::<Vec<u64>>());
        assert_eq!(repo.stored_turns(id).len(), 100);
        assert!(repo.transcript(id).is_some());
    }

    #[tokio::test]
    async fn incremental_flush_does_not_duplicate_turns() {
        let repo = Arc::new(MemoryRepository::new());
        let recorder = TranscriptRecorder::new(repo.clone(), Duration::from_secs(1));
        let id = SessionId::new();
        recorder.begin(id);

        recorder.append(id, TurnDraft::lifecycle("session opened")).unwrap();
        recorder
            .append(id, TurnDraft::speech(Speaker::Assistant, "Hello"))
            .unwrap();
        assert_eq!(recorder.flush(id).await.unwrap(), 2);
        assert_eq!(recorder.flush(id).await.unwrap(), 0);
        recorder
            .append(id, TurnDraft::speech(Speaker::Patient, "Hi"))
            .unwrap();

        let record = recorder.finalize(id, Outcome::Unresolved, None).await.unwrap();
        assert_eq!(record.turns.len(), 3);
        let stored: Vec<u64> = repo.stored_turns(id).iter().map(|t| t.seq).collect();
        assert_eq!(stored, vec![0, 1, 2]);
        assert!(recorder.append(id, TurnDraft::lifecycle("late")).is_err());
    }

    #[tokio::test]
    async fn finalize_returns_record_when_store_is_down() {
        let inner = Arc::new(MemoryRepository::new());
        let flaky = Arc::new(FlakyRepository::new(inner.clone()));
        flaky.set_failing(true);
        let recorder = TranscriptRecorder::new(flaky.clone(), Duration::from_millis(100));
        let id = SessionId::new();
        recorder.begin(id);
        recorder.append(id, TurnDraft::lifecycle("session opened")).unwrap();
        recorder
            .append(id, TurnDraft::speech(Speaker::Patient, "hello?"))
            .unwrap();

        assert!(recorder.flush(id).await.is_err());
        let record = recorder.finalize(id, Outcome::Abandoned, None).await.unwrap();
        assert_eq!(record.turns.len(), 2);
        assert_eq!(record.full_text, "Patient: hello?");
        assert!(inner.transcript(id).is_none());
    }
}
