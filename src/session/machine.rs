//! # Session State Machine
//!
//! One realtime session, independent of any socket. The machine consumes
//! decoded client commands and inference outcomes and answers with
//! [`SessionEffect`]s for its owner (the WebSocket actor) to carry out.
//!
//! ## Lifecycle:
//! ```text
//! CREATED ──session.update──▶ CONFIGURED ──append──▶ LISTENING
//!    │                            │                     │
//!    └───────────── finish / fatal error / idle ────────┴──▶ FINISHED
//! ```
//!
//! - Appends are rejected until the session is configured
//! - Re-configuration while LISTENING stays LISTENING and only affects new audio
//! - Once FINISHED every client event fails with `SessionClosed` and late
//!   inference results are dropped
//!
//! The machine owns its buffer, VAD engine, chunk scheduler and job lane.
//! None of them hold a reference back to the session.

use crate::audio::processor::{byte_to_sample, bytes_to_ms};
use crate::audio::{
    AudioBuffer, ChunkEvent, ChunkPolicy, ChunkScheduler, EnergyScorer, SpeechScorer, VadEngine,
    VadParams,
};
use crate::config::SessionDefaults;
use crate::error::SessionError;
use crate::protocol::{
    generate_item_id, ClientCommand, ConversationItem, ServerEvent, SessionDescriptor,
    SessionUpdate,
};
use crate::session::config::{SessionConfig, TurnDetection};
use crate::transcription::{
    InferenceJob, InferenceOutcome, JobKind, JobLane, JobTicket, Resolution,
};
use serde::Serialize;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Created,
    Configured,
    Listening,
    Finished,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Configured => "configured",
            SessionState::Listening => "listening",
            SessionState::Finished => "finished",
        }
    }
}

/// Something the session's owner has to do.
#[derive(Debug)]
pub enum SessionEffect {
    /// Write an event to the client.
    Send(ServerEvent),
    /// Hand a job to the inference scheduler.
    Submit(InferenceJob),
    /// Close the connection. Always preceded by `session.finished`.
    Close,
}

/// Builds a fresh speech scorer whenever server VAD is (re)enabled.
pub type ScorerFactory = Box<dyn Fn() -> Box<dyn SpeechScorer> + Send>;

pub struct SessionMachine {
    id: String,
    model: String,
    defaults: SessionDefaults,
    state: SessionState,
    config: SessionConfig,
    buffer: AudioBuffer,
    vad: Option<VadEngine>,
    scorer_factory: ScorerFactory,
    chunker: ChunkScheduler,
    lane: JobLane,
    /// Item the audio currently being buffered belongs to.
    current_item: Option<String>,
    previous_item: String,
    /// Shared with every job this session submits.
    cancel: Arc<AtomicBool>,
    last_activity: Instant,
}

impl SessionMachine {
    pub fn new(id: String, model: String, defaults: SessionDefaults) -> Self {
        Self::with_scorer(id, model, defaults, Box::new(|| Box::new(EnergyScorer::default())))
    }

    pub fn with_scorer(
        id: String,
        model: String,
        defaults: SessionDefaults,
        scorer_factory: ScorerFactory,
    ) -> Self {
        let mut machine = Self {
            id,
            model,
            state: SessionState::Created,
            config: SessionConfig::defaults(&defaults),
            buffer: AudioBuffer::new(),
            vad: None,
            scorer_factory,
            chunker: ChunkScheduler::new(ChunkPolicy::from_defaults(&defaults)),
            lane: JobLane::new(),
            current_item: None,
            previous_item: String::new(),
            cancel: Arc::new(AtomicBool::new(false)),
            last_activity: Instant::now(),
            defaults,
        };
        machine.vad = machine.build_vad();
        machine
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    #[cfg(test)]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Set once the session finishes; workers skip jobs carrying it.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Milliseconds of audio appended since the session started.
    pub fn received_ms(&self) -> u64 {
        bytes_to_ms(self.buffer.total_len())
    }

    /// `session.created` for a freshly opened connection.
    pub fn open(&mut self) -> Vec<SessionEffect> {
        info!(session_id = %self.id, "Session created");
        vec![SessionEffect::Send(ServerEvent::SessionCreated {
            session: self.descriptor(),
        })]
    }

    /// Process one client command.
    pub fn handle(&mut self, command: ClientCommand, event_id: Option<String>) -> Vec<SessionEffect> {
        let mut effects = Vec::new();
        if self.state == SessionState::Finished {
            effects.push(SessionEffect::Send(ServerEvent::error(
                &SessionError::SessionClosed,
                event_id,
            )));
            return effects;
        }
        self.last_activity = Instant::now();

        let result = match command {
            ClientCommand::UpdateSession(update) => self.update(&update, &mut effects),
            ClientCommand::AppendAudio(audio) => self.append(&audio, &mut effects),
            ClientCommand::Commit => self.commit(&mut effects),
            ClientCommand::Finish => {
                self.terminate("client finished session", &mut effects);
                Ok(())
            }
        };

        if let Err(err) = result {
            self.report(err, event_id, &mut effects);
        }
        self.pump(&mut effects);
        effects
    }

    /// A frame that never became a command (malformed JSON, bad base64, ...).
    pub fn reject(&mut self, error: SessionError, event_id: Option<String>) -> Vec<SessionEffect> {
        let error = if self.state == SessionState::Finished {
            SessionError::SessionClosed
        } else {
            error
        };
        let mut effects = Vec::new();
        self.report(error, event_id, &mut effects);
        effects
    }

    /// Attribute an inference result and translate it for the client.
    pub fn on_outcome(&mut self, outcome: InferenceOutcome) -> Vec<SessionEffect> {
        let mut effects = Vec::new();
        if self.state == SessionState::Finished || outcome.session_id != self.id {
            debug!(
                session_id = %self.id,
                seq = outcome.ticket.seq,
                "Dropping inference result for finished session"
            );
            return effects;
        }

        let ticket = outcome.ticket;
        match (self.lane.resolve(&ticket), outcome.result) {
            (Resolution::Discard(reason), _) => {
                debug!(session_id = %self.id, seq = ticket.seq, reason, "Discarding inference result");
            }
            (Resolution::Emit, Ok(transcript)) => {
                let language = transcript
                    .language
                    .or_else(|| self.config.language.clone())
                    .unwrap_or_default();
                let event = match ticket.kind {
                    JobKind::Interim => ServerEvent::interim(&ticket.item_id, language, &transcript.text),
                    JobKind::Final => {
                        info!(
                            session_id = %self.id,
                            item_id = %ticket.item_id,
                            chars = transcript.text.chars().count(),
                            latency_ms = outcome.latency.as_millis() as u64,
                            "Transcription completed"
                        );
                        ServerEvent::completed(&ticket.item_id, language, transcript.text)
                    }
                };
                effects.push(SessionEffect::Send(event));
            }
            (Resolution::Emit, Err(err)) => {
                if ticket.kind == JobKind::Final {
                    effects.push(SessionEffect::Send(ServerEvent::failed(&ticket.item_id, &err)));
                }
                self.report(err, None, &mut effects);
            }
        }

        self.pump(&mut effects);
        effects
    }

    /// The scheduler refused a job (no slot in time). The job is dropped and
    /// the session carries on with the next one.
    pub fn on_submit_rejected(&mut self, ticket: JobTicket, err: SessionError) -> Vec<SessionEffect> {
        let mut effects = Vec::new();
        if self.state == SessionState::Finished {
            return effects;
        }

        self.lane.fail(ticket.seq);
        if ticket.kind == JobKind::Final {
            effects.push(SessionEffect::Send(ServerEvent::failed(&ticket.item_id, &err)));
        }
        self.report(err, None, &mut effects);
        self.pump(&mut effects);
        effects
    }

    /// Idle timeout reached.
    pub fn expire(&mut self) -> Vec<SessionEffect> {
        let mut effects = Vec::new();
        if self.state != SessionState::Finished {
            self.terminate("idle timeout", &mut effects);
        }
        effects
    }

    /// Connection went away without `session.finish`.
    pub fn abort(&mut self) {
        if self.state != SessionState::Finished {
            let mut discarded = Vec::new();
            self.terminate("connection closed", &mut discarded);
        }
    }

    fn update(&mut self, update: &SessionUpdate, effects: &mut Vec<SessionEffect>) -> Result<(), SessionError> {
        let config = SessionConfig::from_update(update, &self.defaults)?;
        self.apply_config(config);

        if self.state == SessionState::Created {
            self.state = SessionState::Configured;
        }

        info!(
            session_id = %self.id,
            state = self.state.as_str(),
            turn_detection = ?self.config.turn_detection,
            language = ?self.config.language,
            "Session configured"
        );
        effects.push(SessionEffect::Send(ServerEvent::SessionUpdated {
            session: self.descriptor(),
        }));
        Ok(())
    }

    fn apply_config(&mut self, config: SessionConfig) {
        let previous = self.config.turn_detection;
        self.config = config;

        match (previous, self.config.turn_detection) {
            (TurnDetection::ServerVad(_), TurnDetection::ServerVad(settings)) => match self.vad.as_mut() {
                Some(vad) => vad.set_params(settings.threshold, settings.silence_duration_ms),
                None => self.vad = self.build_vad(),
            },
            (TurnDetection::Manual, TurnDetection::ServerVad(_)) => {
                self.chunker.set_vad_origin(self.buffer.total_len());
                self.vad = self.build_vad();
            }
            (_, TurnDetection::Manual) => self.vad = None,
        }
    }

    fn build_vad(&self) -> Option<VadEngine> {
        match self.config.turn_detection {
            TurnDetection::Manual => None,
            TurnDetection::ServerVad(settings) => Some(VadEngine::new(
                VadParams {
                    threshold: settings.threshold,
                    silence_duration_ms: settings.silence_duration_ms,
                    frame_ms: self.defaults.frame_ms,
                },
                (self.scorer_factory)(),
                byte_to_sample(self.buffer.total_len()),
            )),
        }
    }

    fn append(&mut self, audio: &[u8], effects: &mut Vec<SessionEffect>) -> Result<(), SessionError> {
        if self.state == SessionState::Created {
            return Err(SessionError::protocol(
                "session_not_configured",
                "Send session.update before appending audio",
            ));
        }
        if audio.is_empty() {
            return Ok(());
        }

        let events = self
            .chunker
            .on_append(&mut self.buffer, self.vad.as_mut(), audio)?;

        if self.state == SessionState::Configured {
            self.state = SessionState::Listening;
            debug!(session_id = %self.id, "Session listening");
        }
        if !self.config.turn_detection.is_server_vad() && self.current_item.is_none() {
            self.current_item = Some(generate_item_id());
        }

        for event in events {
            self.on_chunk(event, effects);
        }
        Ok(())
    }

    fn commit(&mut self, effects: &mut Vec<SessionEffect>) -> Result<(), SessionError> {
        if self.config.turn_detection.is_server_vad() {
            return Err(SessionError::protocol(
                "commit_not_allowed",
                "input_audio_buffer.commit is not allowed in server_vad mode",
            ));
        }
        let event = self.chunker.commit(&mut self.buffer)?;
        self.on_chunk(event, effects);
        Ok(())
    }

    fn on_chunk(&mut self, event: ChunkEvent, effects: &mut Vec<SessionEffect>) {
        match event {
            ChunkEvent::SpeechStarted { offset } => {
                let item_id = self.current_item.get_or_insert_with(generate_item_id).clone();
                effects.push(SessionEffect::Send(ServerEvent::SpeechStarted {
                    audio_start_ms: bytes_to_ms(offset),
                    item_id,
                }));
            }
            ChunkEvent::SpeechStopped { offset } => {
                let item_id = self.current_item.get_or_insert_with(generate_item_id).clone();
                effects.push(SessionEffect::Send(ServerEvent::SpeechStopped {
                    audio_end_ms: bytes_to_ms(offset),
                    item_id,
                }));
            }
            ChunkEvent::Interim { span, audio } => {
                let item_id = self.current_item.get_or_insert_with(generate_item_id).clone();
                self.enqueue(JobKind::Interim, span, audio, &item_id);
            }
            ChunkEvent::Final { span, audio, reason } => {
                let item_id = self.current_item.take().unwrap_or_else(generate_item_id);
                let previous_item_id = std::mem::replace(&mut self.previous_item, item_id.clone());
                debug!(
                    session_id = %self.id,
                    item_id = %item_id,
                    start_ms = bytes_to_ms(span.start),
                    end_ms = bytes_to_ms(span.end),
                    ?reason,
                    "Audio committed"
                );

                effects.push(SessionEffect::Send(ServerEvent::Committed {
                    previous_item_id: previous_item_id.clone(),
                    item_id: item_id.clone(),
                }));
                effects.push(SessionEffect::Send(ServerEvent::ItemCreated {
                    previous_item_id,
                    item: ConversationItem::input_audio(&item_id),
                }));
                self.enqueue(JobKind::Final, span, audio, &item_id);
            }
        }
    }

    fn enqueue(&mut self, kind: JobKind, span: Range<u64>, audio: Vec<u8>, item_id: &str) {
        let job = InferenceJob::new(&self.id, kind, span, audio, item_id, self.config.language.clone());
        self.lane.enqueue(job);
    }

    /// Hand the next job to the scheduler once the previous one is attributed.
    fn pump(&mut self, effects: &mut Vec<SessionEffect>) {
        if self.state == SessionState::Finished {
            return;
        }
        if let Some(job) = self.lane.next_dispatch() {
            effects.push(SessionEffect::Submit(job));
        }
    }

    fn report(&mut self, err: SessionError, event_id: Option<String>, effects: &mut Vec<SessionEffect>) {
        if err.is_fatal() {
            warn!(session_id = %self.id, code = err.code(), error = %err, "Session failed");
        } else {
            debug!(session_id = %self.id, code = err.code(), error = %err, "Rejected client event");
        }

        effects.push(SessionEffect::Send(ServerEvent::error(&err, event_id)));
        if err.is_fatal() {
            self.terminate("fatal error", effects);
        }
    }

    fn terminate(&mut self, reason: &str, effects: &mut Vec<SessionEffect>) {
        let dropped = self.lane.cancel_pending();
        self.cancel.store(true, Ordering::Release);
        self.state = SessionState::Finished;

        info!(
            session_id = %self.id,
            reason,
            dropped_jobs = dropped,
            received_ms = self.received_ms(),
            "Session finished"
        );
        effects.push(SessionEffect::Send(ServerEvent::SessionFinished));
        effects.push(SessionEffect::Close);
    }

    fn descriptor(&self) -> SessionDescriptor {
        SessionDescriptor::new(&self.id, &self.model, &self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::protocol::{TranscriptionUpdate, TurnDetectionUpdate};
    use crate::transcription::backend::BackendTranscript;

    fn defaults() -> SessionDefaults {
        AppConfig::default().session
    }

    fn machine(defaults: SessionDefaults) -> SessionMachine {
        let mut machine = SessionMachine::new("sess_test".to_string(), "test-model".to_string(), defaults);
        machine.open();
        machine
    }

    fn update(turn_detection: Option<TurnDetectionUpdate>) -> ClientCommand {
        ClientCommand::UpdateSession(SessionUpdate {
            input_audio_format: "pcm16".to_string(),
            sample_rate: 16_000,
            turn_detection,
            input_audio_transcription: Some(TranscriptionUpdate {
                language: Some("en".to_string()),
            }),
        })
    }

    fn server_vad(threshold: Option<f32>, silence_duration_ms: Option<u32>) -> Option<TurnDetectionUpdate> {
        Some(TurnDetectionUpdate {
            kind: "server_vad".to_string(),
            threshold,
            silence_duration_ms,
        })
    }

    fn tone(ms: u64) -> Vec<u8> {
        (0..ms * 16)
            .flat_map(|i| (((i as f32 * 0.3).sin() * 8_000.0) as i16).to_le_bytes())
            .collect()
    }

    fn silence(ms: u64) -> Vec<u8> {
        vec![0; (ms * 32) as usize]
    }

    /// Append in 100ms pieces, collecting every effect.
    fn stream(machine: &mut SessionMachine, audio: &[u8]) -> Vec<SessionEffect> {
        audio
            .chunks(3_200)
            .flat_map(|chunk| machine.handle(ClientCommand::AppendAudio(chunk.to_vec()), None))
            .collect()
    }

    fn events(effects: &[SessionEffect]) -> Vec<&ServerEvent> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                SessionEffect::Send(event) => Some(event),
                _ => None,
            })
            .collect()
    }

    fn types(effects: &[SessionEffect]) -> Vec<&'static str> {
        events(effects).into_iter().map(ServerEvent::type_name).collect()
    }

    fn error_code(effects: &[SessionEffect]) -> Option<&'static str> {
        events(effects).into_iter().find_map(|event| match event {
            ServerEvent::Error { error } => Some(error.code),
            _ => None,
        })
    }

    fn submitted(effects: Vec<SessionEffect>) -> Vec<InferenceJob> {
        effects
            .into_iter()
            .filter_map(|effect| match effect {
                SessionEffect::Submit(job) => Some(job),
                _ => None,
            })
            .collect()
    }

    fn success(job: &InferenceJob, text: &str) -> InferenceOutcome {
        InferenceOutcome {
            session_id: job.session_id.clone(),
            ticket: job.ticket.clone(),
            result: Ok(BackendTranscript {
                text: text.to_string(),
                language: None,
            }),
            latency: Duration::ZERO,
        }
    }

    #[test]
    fn test_open_announces_default_session() {
        let mut machine = SessionMachine::new("sess_1".into(), "test-model".into(), defaults());
        let effects = machine.open();
        assert_eq!(types(&effects), vec!["session.created"]);
        assert_eq!(machine.state(), SessionState::Created);
    }

    #[test]
    fn test_append_requires_configuration() {
        let mut machine = machine(defaults());
        let effects = machine.handle(ClientCommand::AppendAudio(silence(100)), Some("evt_1".into()));
        assert_eq!(error_code(&effects), Some("session_not_configured"));
        assert_eq!(machine.state(), SessionState::Created);
    }

    #[test]
    fn test_update_round_trip_and_reconfigure_while_listening() {
        let mut machine = machine(defaults());
        let effects = machine.handle(update(server_vad(Some(0.65), Some(700))), None);
        assert_eq!(types(&effects), vec!["session.updated"]);
        assert_eq!(machine.state(), SessionState::Configured);
        assert_eq!(
            machine.config().turn_detection,
            TurnDetection::ServerVad(crate::session::config::VadSettings {
                threshold: 0.65,
                silence_duration_ms: 700,
            })
        );
        assert_eq!(machine.config().language.as_deref(), Some("en"));

        stream(&mut machine, &silence(200));
        assert_eq!(machine.state(), SessionState::Listening);

        machine.handle(update(None), None);
        assert_eq!(machine.state(), SessionState::Listening);
        assert_eq!(machine.config().turn_detection, TurnDetection::Manual);
    }

    #[test]
    fn test_invalid_config_leaves_session_untouched() {
        let mut machine = machine(defaults());
        let effects = machine.handle(update(server_vad(Some(3.0), None)), None);
        assert_eq!(error_code(&effects), Some("invalid_config"));
        assert_eq!(machine.state(), SessionState::Created);
        assert_eq!(machine.config(), &SessionConfig::defaults(&defaults()));
    }

    #[test]
    fn test_manual_commit_emits_final_job_once() {
        let mut machine = machine(defaults());
        machine.handle(update(None), None);
        stream(&mut machine, &tone(1_000));

        let effects = machine.handle(ClientCommand::Commit, None);
        assert_eq!(
            types(&effects),
            vec!["input_audio_buffer.committed", "conversation.item.created"]
        );
        let jobs = submitted(effects);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].ticket.kind, JobKind::Final);
        assert_eq!(jobs[0].ticket.span, 0..32_000);
        assert_eq!(jobs[0].language.as_deref(), Some("en"));

        let again = machine.handle(ClientCommand::Commit, None);
        assert_eq!(error_code(&again), Some("input_audio_buffer_commit_empty"));
        assert!(submitted(again).is_empty());

        let result = machine.on_outcome(success(&jobs[0], "hello world"));
        match events(&result).as_slice() {
            [ServerEvent::TranscriptionCompleted {
                item_id,
                transcript,
                language,
                ..
            }] => {
                assert_eq!(item_id, &jobs[0].ticket.item_id);
                assert_eq!(transcript, "hello world");
                assert_eq!(language, "en");
            }
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[test]
    fn test_commit_is_rejected_in_server_vad_mode() {
        let mut machine = machine(defaults());
        machine.handle(update(server_vad(None, None)), None);
        let effects = machine.handle(ClientCommand::Commit, None);
        assert_eq!(error_code(&effects), Some("commit_not_allowed"));
    }

    #[test]
    fn test_server_vad_utterance() {
        let mut defaults = defaults();
        defaults.interim_results = false;
        let mut machine = machine(defaults);
        machine.handle(update(server_vad(Some(0.5), Some(400))), None);

        let mut audio = silence(1_000);
        audio.extend(tone(2_000));
        audio.extend(silence(500));
        let effects = stream(&mut machine, &audio);

        assert_eq!(
            types(&effects),
            vec![
                "input_audio_buffer.speech_started",
                "input_audio_buffer.speech_stopped",
                "input_audio_buffer.committed",
                "conversation.item.created",
            ]
        );
        match events(&effects).as_slice() {
            [ServerEvent::SpeechStarted { audio_start_ms, .. }, ServerEvent::SpeechStopped { audio_end_ms, .. }, ..] => {
                assert_eq!(*audio_start_ms, 1_000);
                assert_eq!(*audio_end_ms, 3_000);
            }
            _ => panic!("unexpected boundary events"),
        }

        let jobs = submitted(effects);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].ticket.span, 32_000..96_000);
        assert_eq!(jobs[0].audio.len(), 64_000);
    }

    #[test]
    fn test_auto_commit_bounds_long_utterances() {
        let mut defaults = defaults();
        defaults.interim_results = false;
        defaults.auto_commit_interval_secs = 1.0;
        let mut machine = machine(defaults);
        machine.handle(update(server_vad(None, None)), None);

        let effects = stream(&mut machine, &tone(2_500));
        let committed = types(&effects)
            .into_iter()
            .filter(|t| *t == "input_audio_buffer.committed")
            .count();
        assert_eq!(committed, 2);

        // Second FINAL waits in the lane until the first is attributed
        let jobs = submitted(effects);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].ticket.span, 0..32_000);
        let next = submitted(machine.on_outcome(success(&jobs[0], "part one")));
        assert_eq!(next[0].ticket.span, 32_000..64_000);
    }

    #[test]
    fn test_queued_final_supersedes_interim() {
        let mut defaults = defaults();
        defaults.max_chunk_seconds = 0.5;
        let mut machine = machine(defaults);
        machine.handle(update(None), None);

        let first = submitted(stream(&mut machine, &tone(500)));
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].ticket.kind, JobKind::Interim);

        assert!(submitted(stream(&mut machine, &tone(500))).is_empty());
        assert!(submitted(machine.handle(ClientCommand::Commit, None)).is_empty());

        let effects = machine.on_outcome(success(&first[0], "a partial hypothesis"));
        assert_eq!(
            types(&effects),
            vec!["conversation.item.input_audio_transcription.text"]
        );
        let next = submitted(effects);
        assert_eq!(next[0].ticket.kind, JobKind::Final);
        assert_eq!(next[0].ticket.span, 0..32_000);
        assert_eq!(next[0].ticket.item_id, first[0].ticket.item_id);
    }

    #[test]
    fn test_buffer_overflow_finishes_session() {
        let mut defaults = defaults();
        defaults.max_buffer_bytes = 32_000;
        let mut machine = machine(defaults);
        machine.handle(update(None), None);

        // The eleventh 100ms append crosses the limit
        let effects = stream(&mut machine, &tone(1_100));
        assert_eq!(error_code(&effects), Some("buffer_overflow"));
        assert!(types(&effects).ends_with(&["error", "session.finished"]));
        assert!(matches!(effects.last(), Some(SessionEffect::Close)));
        assert_eq!(machine.state(), SessionState::Finished);

        let after = machine.handle(ClientCommand::Commit, Some("evt_late".into()));
        assert_eq!(error_code(&after), Some("session_closed"));
    }

    #[test]
    fn test_finish_cancels_pending_work() {
        let mut machine = machine(defaults());
        machine.handle(update(None), None);
        stream(&mut machine, &tone(300));
        let jobs = submitted(machine.handle(ClientCommand::Commit, None));
        stream(&mut machine, &tone(300));
        assert!(submitted(machine.handle(ClientCommand::Commit, None)).is_empty());

        let cancel = machine.cancel_flag();
        let effects = machine.handle(ClientCommand::Finish, None);
        assert_eq!(types(&effects), vec!["session.finished"]);
        assert!(matches!(effects.last(), Some(SessionEffect::Close)));
        assert!(cancel.load(Ordering::Acquire));

        assert!(machine.on_outcome(success(&jobs[0], "too late")).is_empty());
    }

    #[test]
    fn test_backend_failure_is_fatal() {
        let mut machine = machine(defaults());
        machine.handle(update(None), None);
        stream(&mut machine, &tone(300));
        let jobs = submitted(machine.handle(ClientCommand::Commit, None));

        let mut outcome = success(&jobs[0], "");
        outcome.result = Err(SessionError::BackendFailure("model crashed".into()));
        let effects = machine.on_outcome(outcome);
        assert_eq!(
            types(&effects),
            vec![
                "conversation.item.input_audio_transcription.failed",
                "error",
                "session.finished",
            ]
        );
        assert_eq!(machine.state(), SessionState::Finished);
    }

    #[test]
    fn test_busy_backend_is_reported_and_session_continues() {
        let mut machine = machine(defaults());
        machine.handle(update(None), None);
        stream(&mut machine, &tone(300));
        let first = submitted(machine.handle(ClientCommand::Commit, None));
        stream(&mut machine, &tone(300));
        machine.handle(ClientCommand::Commit, None);

        let effects = machine.on_submit_rejected(
            first[0].ticket.clone(),
            SessionError::BackendBusy { waited_ms: 5_000 },
        );
        assert_eq!(error_code(&effects), Some("backend_busy"));
        assert_eq!(machine.state(), SessionState::Listening);
        let next = submitted(effects);
        assert_eq!(next[0].ticket.span, 9_600..19_200);
    }

    #[test]
    fn test_switching_to_vad_keeps_buffered_audio() {
        let mut defaults = defaults();
        defaults.interim_results = false;
        let mut machine = machine(defaults);
        machine.handle(update(None), None);
        stream(&mut machine, &tone(500));

        machine.handle(update(server_vad(None, None)), None);
        let mut audio = tone(500);
        audio.extend(silence(500));
        let jobs = submitted(stream(&mut machine, &audio));
        assert_eq!(jobs.len(), 1);
        // Manual-mode audio is part of the next utterance, not dropped as silence
        assert_eq!(jobs[0].ticket.span, 0..32_000);
    }

    #[test]
    fn test_silence_after_switching_to_vad_keeps_session_alive() {
        let mut defaults = defaults();
        defaults.max_buffer_bytes = 64_000;

        // Server VAD from the start: silence is released as it arrives
        let mut vad_only = machine(defaults.clone());
        vad_only.handle(update(server_vad(None, None)), None);
        let effects = stream(&mut vad_only, &silence(3_000));
        assert_eq!(error_code(&effects), None);
        assert_eq!(vad_only.state(), SessionState::Listening);

        let mut switched = machine(defaults);
        switched.handle(update(None), None);
        stream(&mut switched, &tone(500));
        switched.handle(update(server_vad(None, None)), None);

        let effects = stream(&mut switched, &silence(3_000));
        assert_eq!(error_code(&effects), None);
        assert_eq!(switched.state(), SessionState::Listening);

        // The manual audio is finalized on its own once the hangover passes
        let jobs = submitted(effects);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].ticket.kind, JobKind::Final);
        assert_eq!(jobs[0].ticket.span, 0..16_000);
    }

    #[test]
    fn test_idle_expiry_finishes_once() {
        let mut machine = machine(defaults());
        assert_eq!(types(&machine.expire()), vec!["session.finished"]);
        assert!(machine.expire().is_empty());
    }
}
