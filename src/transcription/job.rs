//! Inference jobs and their outcomes.

use crate::error::SessionError;
use crate::transcription::backend::BackendTranscript;
use actix::prelude::*;
use std::ops::Range;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Partial hypothesis over a still growing utterance.
    Interim,
    /// Transcript of a committed span. Never reordered or dropped as stale.
    Final,
}

/// Identity of a job, carried through the scheduler and back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobTicket {
    /// Per-session, strictly increasing.
    pub seq: u64,
    pub kind: JobKind,
    /// Absolute byte range of the session's audio.
    pub span: Range<u64>,
    pub item_id: String,
}

#[derive(Debug, Clone)]
pub struct InferenceJob {
    pub session_id: String,
    pub ticket: JobTicket,
    /// Owned copy of the span's audio.
    pub audio: Vec<u8>,
    pub language: Option<String>,
    pub submitted_at: Instant,
}

impl InferenceJob {
    pub fn new(
        session_id: &str,
        kind: JobKind,
        span: Range<u64>,
        audio: Vec<u8>,
        item_id: &str,
        language: Option<String>,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            ticket: JobTicket {
                seq: 0,
                kind,
                span,
                item_id: item_id.to_string(),
            },
            audio,
            language,
            submitted_at: Instant::now(),
        }
    }
}

/// Result of one job, delivered back to the owning session.
#[derive(Debug, Clone, Message)]
#[rtype(result = "()")]
pub struct InferenceOutcome {
    pub session_id: String,
    pub ticket: JobTicket,
    pub result: Result<BackendTranscript, SessionError>,
    pub latency: Duration,
}

/// Where a dispatch worker hands finished outcomes.
///
/// In the server this is the session actor's mailbox; tests use a channel.
pub trait OutcomeSink: Send + Sync {
    fn deliver(&self, outcome: InferenceOutcome);
}

impl OutcomeSink for Recipient<InferenceOutcome> {
    fn deliver(&self, outcome: InferenceOutcome) {
        // The session may already be gone; its results are not needed then.
        self.do_send(outcome);
    }
}

impl OutcomeSink for mpsc::UnboundedSender<InferenceOutcome> {
    fn deliver(&self, outcome: InferenceOutcome) {
        let _ = self.send(outcome);
    }
}
