//! Per-session configuration as negotiated through `session.update`.

use crate::audio::processor::AudioFormat;
use crate::config::SessionDefaults;
use crate::error::SessionError;
use crate::protocol::SessionUpdate;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadSettings {
    pub threshold: f32,
    pub silence_duration_ms: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TurnDetection {
    /// The client decides utterance boundaries with `input_audio_buffer.commit`.
    Manual,
    ServerVad(VadSettings),
}

impl TurnDetection {
    pub fn is_server_vad(&self) -> bool {
        matches!(self, TurnDetection::ServerVad(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub format: AudioFormat,
    pub turn_detection: TurnDetection,
    /// Language hint for the backend; `None` lets it auto-detect.
    pub language: Option<String>,
}

impl SessionConfig {
    /// Configuration announced in `session.created`: pcm16 with server VAD.
    pub fn defaults(defaults: &SessionDefaults) -> Self {
        Self {
            format: AudioFormat::default(),
            turn_detection: TurnDetection::ServerVad(VadSettings {
                threshold: defaults.vad_threshold,
                silence_duration_ms: defaults.silence_duration_ms,
            }),
            language: None,
        }
    }

    /// Validate a client update. VAD parameters the client left out fall back
    /// to the server defaults.
    pub fn from_update(update: &SessionUpdate, defaults: &SessionDefaults) -> Result<Self, SessionError> {
        let format = AudioFormat::parse(&update.input_audio_format, update.sample_rate)?;

        let turn_detection = match &update.turn_detection {
            None => TurnDetection::Manual,
            Some(td) if td.kind == "server_vad" => {
                let threshold = td.threshold.unwrap_or(defaults.vad_threshold);
                if !(0.0..=1.0).contains(&threshold) {
                    return Err(SessionError::InvalidConfig(format!(
                        "turn_detection.threshold must be within [0, 1], got {}",
                        threshold
                    )));
                }
                let silence_duration_ms = td.silence_duration_ms.unwrap_or(defaults.silence_duration_ms);
                if silence_duration_ms == 0 {
                    return Err(SessionError::InvalidConfig(
                        "turn_detection.silence_duration_ms must be greater than 0".to_string(),
                    ));
                }
                TurnDetection::ServerVad(VadSettings {
                    threshold,
                    silence_duration_ms,
                })
            }
            Some(td) => {
                return Err(SessionError::InvalidConfig(format!(
                    "Unsupported turn_detection type '{}'",
                    td.kind
                )))
            }
        };

        let language = update
            .input_audio_transcription
            .as_ref()
            .and_then(|t| t.language.as_deref())
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.eq_ignore_ascii_case("auto"))
            .map(str::to_string);

        Ok(Self {
            format,
            turn_detection,
            language,
        })
    }
}
