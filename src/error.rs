//! # Error Handling
//!
//! Two error families live here:
//!
//! - **SessionError**: everything that can go wrong inside one realtime session.
//!   Each variant knows how it is reported on the wire (`error.type` / `error.code`)
//!   and whether it ends the session.
//! - **AppError**: failures on the plain HTTP side (upgrade rejected, bad config),
//!   converted into JSON responses through actix's `ResponseError`.
//!
//! ## Local vs fatal:
//! Local errors produce one `error` event and leave the session untouched.
//! Fatal errors (`BufferOverflow`, `BackendFailure`) produce an `error` event
//! followed by `session.finished`, after which the socket is closed.

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

/// Errors raised while driving a realtime transcription session.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    /// Malformed or unknown client message. `code` is the wire-level code
    /// (`invalid_json`, `invalid_event`, `missing_field`, ...).
    #[error("{message}")]
    Protocol { code: &'static str, message: String },

    /// `session.update` carried a configuration we cannot honor.
    #[error("Invalid session configuration: {0}")]
    InvalidConfig(String),

    /// Audio payload could not be decoded or is not sample aligned.
    #[error("Invalid audio frame: {0}")]
    InvalidAudioFrame(String),

    /// Commit requested with nothing uncommitted. Informational only.
    #[error("Input audio buffer is empty, nothing to commit")]
    EmptyCommit,

    /// Uncommitted audio grew past the backpressure ceiling.
    #[error("Uncommitted audio exceeded the {limit} byte buffer limit")]
    BufferOverflow { limit: usize },

    /// No inference slot became available within the submission timeout.
    #[error("Inference backend is busy, no slot within {waited_ms}ms")]
    BackendBusy { waited_ms: u64 },

    /// The backend failed twice in a row (or permanently).
    #[error("Inference backend failed: {0}")]
    BackendFailure(String),

    /// Any client event received after the session finished.
    #[error("Session is already finished")]
    SessionClosed,
}

impl SessionError {
    pub fn protocol(code: &'static str, message: impl Into<String>) -> Self {
        SessionError::Protocol {
            code,
            message: message.into(),
        }
    }

    /// Machine-readable code placed in `error.code`.
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::Protocol { code, .. } => code,
            SessionError::InvalidConfig(_) => "invalid_config",
            SessionError::InvalidAudioFrame(_) => "invalid_audio",
            SessionError::EmptyCommit => "input_audio_buffer_commit_empty",
            SessionError::BufferOverflow { .. } => "buffer_overflow",
            SessionError::BackendBusy { .. } => "backend_busy",
            SessionError::BackendFailure(_) => "backend_failure",
            SessionError::SessionClosed => "session_closed",
        }
    }

    /// Error category placed in `error.type`.
    pub fn error_type(&self) -> &'static str {
        match self {
            SessionError::BufferOverflow { .. }
            | SessionError::BackendBusy { .. }
            | SessionError::BackendFailure(_) => "server_error",
            _ => "invalid_request_error",
        }
    }

    /// Whether this error forces the session into FINISHED.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::BufferOverflow { .. } | SessionError::BackendFailure(_)
        )
    }
}

/// HTTP-facing application errors.
///
/// ## Status mapping:
/// - Internal → 500
/// - BadRequest → 400
/// - Unavailable → 503 (session capacity reached)
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let (error_type, message) = match self {
            AppError::Internal(msg) => ("internal_error", msg),
            AppError::BadRequest(msg) => ("bad_request", msg),
            AppError::Unavailable(msg) => ("unavailable", msg),
        };

        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}
