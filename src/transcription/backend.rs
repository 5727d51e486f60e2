//! # Inference Backends
//!
//! The speech recognizer itself runs out of process. This module defines the
//! narrow interface the scheduler talks to and the two providers selectable
//! through `backend.provider`:
//!
//! - **http**: POSTs the job's audio as base64 JSON to an inference server
//! - **null**: answers every request with an empty transcript
//!
//! ## Wire contract of the http provider:
//! ```text
//! POST <backend.url>
//! {"audio": "<base64 pcm16>", "sample_rate": 16000, "max_new_tokens": 64,
//!  "language": "Chinese" | null, "final": true}
//!
//! 200 {"text": "...", "language": "zh"}
//! ```
//!
//! The recognizer expects language names, so ISO 639 codes from the session
//! config are translated on the way out (`recognizer_language`).

use crate::config::BackendConfig;
use crate::transcription::job::JobKind;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One recognition request as handed to a backend.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub audio: Vec<u8>,
    pub sample_rate: u32,
    pub max_new_tokens: u32,
    pub language: Option<String>,
    pub kind: JobKind,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BackendTranscript {
    pub text: String,
    #[serde(default)]
    pub language: Option<String>,
}

/// Backend failures, split by whether one retry is worth it.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackendError {
    /// Timeouts, refused connections, 429 and 5xx responses.
    #[error("transient backend error: {0}")]
    Transient(String),

    #[error("backend rejected request: {0}")]
    Permanent(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Transient(_))
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() || e.is_request() {
            return BackendError::Transient(e.to_string());
        }
        match e.status() {
            Some(status) if status.is_server_error() || status.as_u16() == 429 => {
                BackendError::Transient(e.to_string())
            }
            _ => BackendError::Permanent(e.to_string()),
        }
    }
}

/// Anything that can turn PCM16 into text.
///
/// Implementors are shared by every dispatch worker behind an `Arc`.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn transcribe(&self, request: BackendRequest) -> Result<BackendTranscript, BackendError>;

    fn name(&self) -> &'static str;
}

/// Map an ISO 639 code to the language name the recognizer understands.
/// Capitalized input is taken as a name already; unknown codes pass through.
pub fn recognizer_language(language: &str) -> &str {
    if language.starts_with(|c: char| c.is_uppercase()) {
        return language;
    }
    match language.to_ascii_lowercase().as_str() {
        "zh" => "Chinese",
        "yue" => "Cantonese",
        "en" => "English",
        "ja" => "Japanese",
        "ko" => "Korean",
        "de" => "German",
        "fr" => "French",
        "es" => "Spanish",
        "pt" => "Portuguese",
        "ar" => "Arabic",
        "it" => "Italian",
        "hi" => "Hindi",
        "id" => "Indonesian",
        "th" => "Thai",
        "tr" => "Turkish",
        "uk" => "Ukrainian",
        "vi" => "Vietnamese",
        "cs" => "Czech",
        "da" => "Danish",
        "fil" => "Filipino",
        "fi" => "Finnish",
        "is" => "Icelandic",
        "ms" => "Malay",
        "no" => "Norwegian",
        "pl" => "Polish",
        "sv" => "Swedish",
        "nl" => "Dutch",
        "fa" => "Persian",
        "el" => "Greek",
        "ro" => "Romanian",
        "hu" => "Hungarian",
        "mk" => "Macedonian",
        "ru" => "Russian",
        _ => language,
    }
}

#[derive(Serialize)]
struct HttpRequestBody<'a> {
    audio: String,
    sample_rate: u32,
    max_new_tokens: u32,
    language: Option<&'a str>,
    #[serde(rename = "final")]
    is_final: bool,
}

/// Remote inference server reached over HTTP.
pub struct HttpBackend {
    client: reqwest::Client,
    url: String,
}

impl HttpBackend {
    pub fn from_config(config: &BackendConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            client,
            url: config.url.clone(),
        })
    }
}

#[async_trait]
impl InferenceBackend for HttpBackend {
    async fn transcribe(&self, request: BackendRequest) -> Result<BackendTranscript, BackendError> {
        let body = HttpRequestBody {
            audio: STANDARD.encode(&request.audio),
            sample_rate: request.sample_rate,
            max_new_tokens: request.max_new_tokens,
            language: request.language.as_deref().map(recognizer_language),
            is_final: request.kind == JobKind::Final,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        response
            .json::<BackendTranscript>()
            .await
            .map_err(|e| BackendError::Permanent(format!("Malformed backend response: {}", e)))
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Returns empty transcripts. Lets the protocol be exercised without a model.
#[derive(Debug, Default)]
pub struct NullBackend;

#[async_trait]
impl InferenceBackend for NullBackend {
    async fn transcribe(&self, _request: BackendRequest) -> Result<BackendTranscript, BackendError> {
        Ok(BackendTranscript::default())
    }

    fn name(&self) -> &'static str {
        "null"
    }
}

/// Build the provider named in the configuration.
pub fn from_config(config: &BackendConfig) -> anyhow::Result<std::sync::Arc<dyn InferenceBackend>> {
    match config.provider.as_str() {
        "http" => Ok(std::sync::Arc::new(HttpBackend::from_config(config)?)),
        "null" => Ok(std::sync::Arc::new(NullBackend)),
        other => Err(anyhow::anyhow!("Unknown backend provider '{}'", other)),
    }
}
