//! # Realtime Protocol Events
//!
//! JSON text frames exchanged over the realtime WebSocket, and the mapping
//! between them and the session's internal commands.
//!
//! ## Client → server:
//! | type                        | effect                          |
//! |-----------------------------|---------------------------------|
//! | `session.update`            | validate and apply a new config |
//! | `input_audio_buffer.append` | append base64 PCM16 audio       |
//! | `input_audio_buffer.commit` | manual commit of the tail       |
//! | `session.finish`            | graceful termination            |
//!
//! ## Server → client:
//! Every server event carries a fresh `event_id`. Malformed client frames
//! are answered with an `error` event and never change session state.

use crate::audio::processor::decode_base64_audio;
use crate::error::SessionError;
use crate::session::config::{SessionConfig, TurnDetection};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Characters of an interim hypothesis that are still open to revision.
const INTERIM_STASH_CHARS: usize = 10;
/// Hypotheses up to this length are sent entirely as `stash`.
const INTERIM_CONFIRM_MIN_CHARS: usize = 20;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

fn hex_id(prefix: &str, len: usize) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{}_{}", prefix, &hex[..len])
}

pub fn generate_event_id() -> String {
    hex_id("event", 20)
}

pub fn generate_session_id() -> String {
    hex_id("sess", 16)
}

pub fn generate_item_id() -> String {
    hex_id("item", 20)
}

// ---------------------------------------------------------------------------
// Client events
// ---------------------------------------------------------------------------

/// Payload of `session.update`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SessionUpdate {
    pub input_audio_format: String,
    pub sample_rate: u32,
    /// Required, but `null` selects manual turn detection.
    #[serde(deserialize_with = "required_nullable")]
    pub turn_detection: Option<TurnDetectionUpdate>,
    #[serde(default)]
    pub input_audio_transcription: Option<TranscriptionUpdate>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TurnDetectionUpdate {
    #[serde(rename = "type")]
    pub kind: String,
    pub threshold: Option<f32>,
    pub silence_duration_ms: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TranscriptionUpdate {
    pub language: Option<String>,
}

fn required_nullable<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer)
}

#[derive(Deserialize)]
struct SessionUpdateEvent {
    session: SessionUpdate,
}

#[derive(Deserialize)]
struct AppendEvent {
    audio: String,
}

/// Decoded client command.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    UpdateSession(SessionUpdate),
    /// Already base64-decoded PCM bytes.
    AppendAudio(Vec<u8>),
    Commit,
    Finish,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientEvent {
    pub event_id: Option<String>,
    pub command: ClientCommand,
}

/// A frame that could not be turned into a command.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedEvent {
    /// Echoed back in the error so the client can correlate it.
    pub event_id: Option<String>,
    pub error: SessionError,
}

/// Parse one text frame.
pub fn parse_client_event(text: &str) -> Result<ClientEvent, RejectedEvent> {
    let value: Value = serde_json::from_str(text).map_err(|e| RejectedEvent {
        event_id: None,
        error: SessionError::protocol("invalid_json", format!("Invalid JSON: {}", e)),
    })?;

    let event_id = value
        .get("event_id")
        .and_then(Value::as_str)
        .map(str::to_string);
    let reject = |error: SessionError| RejectedEvent {
        event_id: event_id.clone(),
        error,
    };

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            reject(SessionError::protocol(
                "missing_required_field",
                "Event is missing the 'type' field",
            ))
        })?
        .to_string();

    let command = match kind.as_str() {
        "session.update" => {
            let event: SessionUpdateEvent = from_payload(value).map_err(&reject)?;
            ClientCommand::UpdateSession(event.session)
        }
        "input_audio_buffer.append" => {
            let event: AppendEvent = from_payload(value).map_err(&reject)?;
            let audio = if event.audio.is_empty() {
                Vec::new()
            } else {
                decode_base64_audio(&event.audio).map_err(&reject)?
            };
            ClientCommand::AppendAudio(audio)
        }
        "input_audio_buffer.commit" => ClientCommand::Commit,
        "session.finish" => ClientCommand::Finish,
        other => {
            return Err(reject(SessionError::protocol(
                "invalid_event",
                format!("Unknown event type: {}", other),
            )))
        }
    };

    Ok(ClientEvent { event_id, command })
}

fn from_payload<T: for<'de> Deserialize<'de>>(value: Value) -> Result<T, SessionError> {
    serde_json::from_value(value).map_err(|e| {
        let message = e.to_string();
        let code = if message.starts_with("missing field") {
            "missing_required_field"
        } else {
            "invalid_value"
        };
        SessionError::protocol(code, message)
    })
}

// ---------------------------------------------------------------------------
// Server events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionDescriptor {
    pub id: String,
    pub object: &'static str,
    pub model: String,
    pub modalities: Vec<&'static str>,
    pub input_audio_format: String,
    pub sample_rate: u32,
    pub input_audio_transcription: Option<TranscriptionDescriptor>,
    pub turn_detection: Option<TurnDetectionDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptionDescriptor {
    pub language: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnDetectionDescriptor {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub threshold: f32,
    pub silence_duration_ms: u32,
}

impl SessionDescriptor {
    pub fn new(session_id: &str, model: &str, config: &SessionConfig) -> Self {
        let turn_detection = match &config.turn_detection {
            TurnDetection::Manual => None,
            TurnDetection::ServerVad(vad) => Some(TurnDetectionDescriptor {
                kind: "server_vad",
                threshold: vad.threshold,
                silence_duration_ms: vad.silence_duration_ms,
            }),
        };

        Self {
            id: session_id.to_string(),
            object: "realtime.session",
            model: model.to_string(),
            modalities: vec!["text"],
            input_audio_format: config.format.name.clone(),
            sample_rate: config.format.sample_rate,
            input_audio_transcription: config
                .language
                .as_ref()
                .map(|language| TranscriptionDescriptor {
                    language: language.clone(),
                }),
            turn_detection,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationItem {
    pub id: String,
    pub object: &'static str,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub status: &'static str,
    pub role: &'static str,
    pub content: Vec<ItemContent>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemContent {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub transcript: Option<String>,
}

impl ConversationItem {
    /// A committed user audio item whose transcript is still pending.
    pub fn input_audio(item_id: &str) -> Self {
        Self {
            id: item_id.to_string(),
            object: "realtime.item",
            kind: "message",
            status: "completed",
            role: "user",
            content: vec![ItemContent {
                kind: "input_audio",
                transcript: None,
            }],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureBody {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated { session: SessionDescriptor },

    #[serde(rename = "session.updated")]
    SessionUpdated { session: SessionDescriptor },

    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted { audio_start_ms: u64, item_id: String },

    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped { audio_end_ms: u64, item_id: String },

    #[serde(rename = "input_audio_buffer.committed")]
    Committed {
        previous_item_id: String,
        item_id: String,
    },

    #[serde(rename = "conversation.item.created")]
    ItemCreated {
        previous_item_id: String,
        item: ConversationItem,
    },

    #[serde(rename = "conversation.item.input_audio_transcription.text")]
    TranscriptionText {
        item_id: String,
        content_index: u32,
        language: String,
        emotion: &'static str,
        text: String,
        stash: String,
    },

    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptionCompleted {
        item_id: String,
        content_index: u32,
        language: String,
        emotion: &'static str,
        transcript: String,
    },

    #[serde(rename = "conversation.item.input_audio_transcription.failed")]
    TranscriptionFailed {
        item_id: String,
        content_index: u32,
        error: FailureBody,
    },

    #[serde(rename = "session.finished")]
    SessionFinished,

    #[serde(rename = "error")]
    Error { error: ErrorBody },
}

impl ServerEvent {
    pub fn error(err: &SessionError, event_id: Option<String>) -> Self {
        let param = match err {
            SessionError::InvalidAudioFrame(_) | SessionError::BufferOverflow { .. } => Some("audio"),
            SessionError::InvalidConfig(_) => Some("session"),
            _ => None,
        };

        ServerEvent::Error {
            error: ErrorBody {
                kind: err.error_type(),
                code: err.code(),
                message: err.to_string(),
                param,
                event_id,
            },
        }
    }

    /// Interim hypothesis, split into a confirmed prefix and a tentative tail.
    pub fn interim(item_id: &str, language: String, hypothesis: &str) -> Self {
        let (text, stash) = split_interim(hypothesis);
        ServerEvent::TranscriptionText {
            item_id: item_id.to_string(),
            content_index: 0,
            language,
            emotion: "neutral",
            text,
            stash,
        }
    }

    pub fn completed(item_id: &str, language: String, transcript: String) -> Self {
        ServerEvent::TranscriptionCompleted {
            item_id: item_id.to_string(),
            content_index: 0,
            language,
            emotion: "neutral",
            transcript,
        }
    }

    pub fn failed(item_id: &str, err: &SessionError) -> Self {
        ServerEvent::TranscriptionFailed {
            item_id: item_id.to_string(),
            content_index: 0,
            error: FailureBody {
                code: err.code(),
                message: err.to_string(),
            },
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ServerEvent::SessionCreated { .. } => "session.created",
            ServerEvent::SessionUpdated { .. } => "session.updated",
            ServerEvent::SpeechStarted { .. } => "input_audio_buffer.speech_started",
            ServerEvent::SpeechStopped { .. } => "input_audio_buffer.speech_stopped",
            ServerEvent::Committed { .. } => "input_audio_buffer.committed",
            ServerEvent::ItemCreated { .. } => "conversation.item.created",
            ServerEvent::TranscriptionText { .. } => {
                "conversation.item.input_audio_transcription.text"
            }
            ServerEvent::TranscriptionCompleted { .. } => {
                "conversation.item.input_audio_transcription.completed"
            }
            ServerEvent::TranscriptionFailed { .. } => {
                "conversation.item.input_audio_transcription.failed"
            }
            ServerEvent::SessionFinished => "session.finished",
            ServerEvent::Error { .. } => "error",
        }
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    event_id: String,
    #[serde(flatten)]
    event: &'a ServerEvent,
}

/// Serialize an event into a text frame with a fresh `event_id`.
pub fn encode(event: &ServerEvent) -> Result<String, serde_json::Error> {
    serde_json::to_string(&Envelope {
        event_id: generate_event_id(),
        event,
    })
}

/// Short hypotheses are entirely tentative. Longer ones keep their last few
/// characters (at most a third) in `stash`.
fn split_interim(hypothesis: &str) -> (String, String) {
    let chars: Vec<char> = hypothesis.chars().collect();
    if chars.len() <= INTERIM_CONFIRM_MIN_CHARS {
        return (String::new(), hypothesis.to_string());
    }
    let tentative = INTERIM_STASH_CHARS.min(chars.len() / 3);
    let split = chars.len() - tentative;
    (
        chars[..split].iter().collect(),
        chars[split..].iter().collect(),
    )
}
