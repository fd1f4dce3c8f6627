//! Human-readable session output for the host UI: a short rolling transcript
//! and a single status line.

use std::{
    collections::VecDeque,
    fmt,
    sync::{Mutex, PoisonError},
};
use tokio::sync::{broadcast, watch};

/// How many transcript lines the log keeps.
pub const TRANSCRIPT_CAPACITY: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    Assistant,
    User,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
}

impl fmt::Display for TranscriptEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.speaker {
            Speaker::Assistant => write!(f, "AI: {}", self.text),
            Speaker::User => write!(f, "You: {}", self.text),
            Speaker::System => write!(f, "{}", self.text),
        }
    }
}

/// What the host shows as the one-line session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Connecting,
    Listening,
    MicrophoneUnavailable,
    ConnectionError,
    Ended,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionStatus::Idle => "Mic is off",
            SessionStatus::Connecting => "Connecting…",
            SessionStatus::Listening => "Listening…",
            SessionStatus::MicrophoneUnavailable => "Microphone unavailable",
            SessionStatus::ConnectionError => "Connection error",
            SessionStatus::Ended => "Session ended",
        })
    }
}

pub struct TranscriptLog {
    entries: Mutex<VecDeque<TranscriptEntry>>,
    capacity: usize,
    entries_tx: broadcast::Sender<TranscriptEntry>,
    status: watch::Sender<SessionStatus>,
}

impl TranscriptLog {
    pub fn new(capacity: usize) -> Self {
        let (entries_tx, _) = broadcast::channel(capacity.max(1) * 4);
        let (status, _) = watch::channel(SessionStatus::Idle);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            entries_tx,
            status,
        }
    }

    /// Appends a line, dropping the oldest once the log is full.
    pub fn push(&self, speaker: Speaker, text: impl Into<String>) {
        let entry = TranscriptEntry {
            speaker,
            text: text.into(),
        };
        {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            if self.capacity > 0 {
                entries.push_back(entry.clone());
            }
        }
        // Nobody listening is fine.
        let _ = self.entries_tx.send(entry);
    }

    pub fn entries(&self) -> Vec<TranscriptEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TranscriptEntry> {
        self.entries_tx.subscribe()
    }

    pub fn set_status(&self, status: SessionStatus) {
        self.status.send_replace(status);
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }
}

impl Default for TranscriptLog {
    fn default() -> Self {
        Self::new(TRANSCRIPT_CAPACITY)
    }
}
