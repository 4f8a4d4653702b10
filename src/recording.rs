//! Call audio capture.
//!
//! Both directions of a call are kept as raw 8 kHz μ-law, exactly as they cross the bridge,
//! and written out as one WAV file per side when the session closes.

use crate::types::SessionId;

use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

const SAMPLE_RATE: u32 = 8_000;
const WAVE_FORMAT_MULAW: u16 = 7;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Track {
    Patient,
    Assistant,
}

impl Track {
    pub fn as_str(self) -> &'static str {
        match self {
            Track::Patient => "patient",
            Track::Assistant => "assistant",
        }
    }
}

impl FromStr for Track {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "patient" => Ok(Track::Patient),
            "assistant" => Ok(Track::Assistant),
            _ => Err(()),
        }
    }
}

pub fn file_name(id: SessionId, track: Track) -> String {
    format!("call_{id}_{}.wav", track.as_str())
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Audio captured for one session. Each track stops growing at `limit` bytes.
pub struct CallRecording {
    patient: Mutex<Vec<u8>>,
    assistant: Mutex<Vec<u8>>,
    limit: usize,
    truncated: AtomicBool,
}

impl CallRecording {
    pub fn new(limit: usize) -> Self {
        Self {
            patient: Mutex::new(Vec::new()),
            assistant: Mutex::new(Vec::new()),
            limit,
            truncated: AtomicBool::new(false),
        }
    }

    fn track(&self, track: Track) -> &Mutex<Vec<u8>> {
        match track {
            Track::Patient => &self.patient,
            Track::Assistant => &self.assistant,
        }
    }

    pub fn push(&self, track: Track, frame: &[u8]) {
        let mut buf = lock(self.track(track));
        let room = self.limit.saturating_sub(buf.len());
        if frame.len() > room && !self.truncated.swap(true, Ordering::SeqCst) {
            warn!(track = track.as_str(), limit = self.limit, "call recording is full");
        }
        buf.extend_from_slice(&frame[..frame.len().min(room)]);
    }

    pub fn len(&self, track: Track) -> usize {
        lock(self.track(track)).len()
    }

    /// Write every non-empty track under `dir` and return the files written.
    pub async fn save(&self, dir: &Path, id: SessionId) -> io::Result<Vec<PathBuf>> {
        tokio::fs::create_dir_all(dir).await?;
        let mut written = vec![];
        for track in [Track::Patient, Track::Assistant] {
            let wav = {
                let buf = lock(self.track(track));
                if buf.is_empty() {
                    continue;
                }
                mulaw_wav(&buf)
            };
            let path = dir.join(file_name(id, track));
            tokio::fs::write(&path, wav).await?;
            debug!(session=%id, path=%path.display(), "call audio saved");
            written.push(path);
        }
        Ok(written)
    }
}

/// Wrap raw mono 8 kHz μ-law samples in a WAV container.
pub fn mulaw_wav(samples: &[u8]) -> Vec<u8> {
    let data_len = samples.len() as u32;
    let pad = data_len % 2;
    let mut out = Vec::with_capacity(58 + samples.len() + pad as usize);

    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(4 + 26 + 12 + 8 + data_len + pad).to_le_bytes());
    out.extend_from_slice(b"WAVE");

    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&18u32.to_le_bytes());
    out.extend_from_slice(&WAVE_FORMAT_MULAW.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&SAMPLE_RATE.to_le_bytes());
    // one byte per sample, one channel
    out.extend_from_slice(&SAMPLE_RATE.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&8u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());

    out.extend_from_slice(b"fact");
    out.extend_from_slice(&4u32.to_le_bytes());
    out.extend_from_slice(&data_len.to_le_bytes());

    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    out.extend_from_slice(samples);
    if pad == 1 {
        out.push(0);
    }
    out
}

/// Read a saved recording back. `None` when the session id or track is not one we could
/// have written, or the file does not exist.
pub async fn load(dir: &Path, session: &str, track: &str) -> io::Result<Option<Vec<u8>>> {
    let (Ok(uuid), Ok(track)) = (uuid::Uuid::parse_str(session), track.parse::<Track>()) else {
        return Ok(None);
    };
    let path = dir.join(file_name(SessionId(uuid), track));
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
