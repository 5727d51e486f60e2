//! # Configuration Management
//!
//! Server configuration is layered from several sources, highest priority last:
//! 1. Built-in defaults (`AppConfig::default`)
//! 2. `config.toml` in the working directory (optional)
//! 3. Environment variables with the `APP` prefix and `__` as section separator
//!    (e.g. `APP_BACKEND__URL`, `APP_SESSION__MAX_BUFFER_BYTES`)
//! 4. `HOST` / `PORT`, which deployment platforms commonly inject
//!
//! ## Sections:
//! - **server**: bind address, WebSocket route, heartbeat timings
//! - **backend**: inference backend location and the admission-control knobs
//! - **session**: per-session defaults (VAD, chunking, backpressure, idle timeout)

use crate::audio::processor::seconds_to_bytes;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Top-level application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub backend: BackendConfig,
    pub session: SessionDefaults,
}

/// HTTP / WebSocket listener settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Route the realtime WebSocket is mounted on.
    pub ws_path: String,
    /// How often the server pings idle clients.
    pub heartbeat_interval_secs: u64,
    /// Connection is dropped when no frame arrives for this long.
    pub client_timeout_secs: u64,
}

/// External inference backend and the scheduler in front of it.
///
/// ## Admission control:
/// `max_concurrent_inferences` is the system-wide cap K on in-flight requests.
/// A job that cannot get a slot within `submit_timeout_ms` fails with
/// `BackendBusy`. Transient backend errors are retried once after
/// `retry_backoff_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// `http` talks to a remote inference server, `null` returns empty
    /// transcripts (smoke testing without a model).
    pub provider: String,
    pub url: String,
    /// Model name reported in `session.created` / `session.updated`.
    pub model: String,
    pub request_timeout_ms: u64,
    pub max_new_tokens: u32,
    pub max_concurrent_inferences: usize,
    pub submit_timeout_ms: u64,
    pub retry_backoff_ms: u64,
}

/// Defaults applied to every new session until the client overrides them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDefaults {
    pub vad_threshold: f32,
    pub silence_duration_ms: u32,
    /// VAD frame length. 20-30ms is the useful range.
    pub frame_ms: u32,
    /// An INTERIM job is cut every time the tail grows by this much audio.
    pub max_chunk_seconds: f64,
    /// Forced FINAL after this much audio without a speech-stop boundary.
    pub auto_commit_interval_secs: f64,
    /// Backpressure ceiling for the uncommitted tail.
    pub max_buffer_bytes: usize,
    pub idle_timeout_secs: u64,
    pub interim_results: bool,
    pub max_concurrent_sessions: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8001,
                ws_path: "/api-ws/v1/realtime".to_string(),
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
            },
            backend: BackendConfig {
                provider: "http".to_string(),
                url: "http://127.0.0.1:8000/v1/transcribe".to_string(),
                model: "qwen3-asr-flash-realtime".to_string(),
                request_timeout_ms: 30_000,
                max_new_tokens: 64,
                max_concurrent_inferences: 4,
                submit_timeout_ms: 5_000,
                retry_backoff_ms: 200,
            },
            session: SessionDefaults {
                vad_threshold: 0.5,
                silence_duration_ms: 400,
                frame_ms: 20,
                max_chunk_seconds: 2.0,
                auto_commit_interval_secs: 60.0,
                // Two minutes of 16kHz mono PCM16
                max_buffer_bytes: 16_000 * 2 * 120,
                idle_timeout_secs: 300,
                interim_results: true,
                max_concurrent_sessions: 64,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow!("Server port cannot be 0"));
        }
        if !self.server.ws_path.starts_with('/') {
            return Err(anyhow!("WebSocket path must start with '/'"));
        }
        if self.server.client_timeout_secs <= self.server.heartbeat_interval_secs {
            return Err(anyhow!("Client timeout must be longer than the heartbeat interval"));
        }

        match self.backend.provider.as_str() {
            "http" => {
                if self.backend.url.is_empty() {
                    return Err(anyhow!("Backend URL is required for the http provider"));
                }
            }
            "null" => {}
            other => return Err(anyhow!("Unknown backend provider '{}'", other)),
        }
        if self.backend.max_concurrent_inferences == 0 {
            return Err(anyhow!("max_concurrent_inferences must be greater than 0"));
        }
        if self.backend.max_new_tokens == 0 {
            return Err(anyhow!("max_new_tokens must be greater than 0"));
        }

        let session = &self.session;
        if !(0.0..=1.0).contains(&session.vad_threshold) {
            return Err(anyhow!("VAD threshold must be within [0, 1]"));
        }
        if session.silence_duration_ms == 0 {
            return Err(anyhow!("silence_duration_ms must be greater than 0"));
        }
        if !(10..=100).contains(&session.frame_ms) {
            return Err(anyhow!("frame_ms must be between 10 and 100"));
        }
        if session.max_chunk_seconds <= 0.0 || session.auto_commit_interval_secs <= 0.0 {
            return Err(anyhow!("Chunking intervals must be positive"));
        }
        if session.max_buffer_bytes == 0 {
            return Err(anyhow!("max_buffer_bytes must be greater than 0"));
        }
        // A speaking utterance must be force-finalized before it can overflow
        if seconds_to_bytes(session.auto_commit_interval_secs) >= session.max_buffer_bytes as u64 {
            return Err(anyhow!(
                "auto_commit_interval_secs must fit inside max_buffer_bytes"
            ));
        }
        if session.max_concurrent_sessions == 0 {
            return Err(anyhow!("max_concurrent_sessions must be greater than 0"));
        }

        Ok(())
    }

    /// Apply a partial JSON document on top of the current configuration.
    ///
    /// Only keys present in the document change; the merged result must still
    /// validate, otherwise `self` is left untouched.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let patch: serde_json::Value = serde_json::from_str(json_str)?;
        let mut current = serde_json::to_value(&*self)?;
        merge_json(&mut current, patch);

        let updated: AppConfig = serde_json::from_value(current)?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl BackendConfig {
    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn merge_json(target: &mut serde_json::Value, patch: serde_json::Value) {
    match (target, patch) {
        (serde_json::Value::Object(target), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(&key) {
                    Some(slot) => merge_json(slot, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8001);
        assert_eq!(config.server.ws_path, "/api-ws/v1/realtime");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.backend.max_concurrent_inferences = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.backend.provider = "grpc".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.session.vad_threshold = 1.5;
        assert!(config.validate().is_err());

        // 60s of auto-commit does not fit in a 30s buffer
        let mut config = AppConfig::default();
        config.session.max_buffer_bytes = 16_000 * 2 * 30;
        assert!(config.validate().is_err());
        config.session.auto_commit_interval_secs = 20.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"backend": {"max_concurrent_inferences": 2}, "session": {"frame_ms": 30}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.backend.max_concurrent_inferences, 2);
        assert_eq!(config.session.frame_ms, 30);
        // Untouched keys keep their values
        assert_eq!(config.backend.submit_timeout_ms, 5_000);
        assert_eq!(config.server.port, 8001);
    }

    #[test]
    fn test_invalid_update_is_rejected_atomically() {
        let mut config = AppConfig::default();
        let json = r#"{"server": {"port": 9000}, "session": {"frame_ms": 5}}"#;
        assert!(config.update_from_json(json).is_err());
        assert_eq!(config, AppConfig::default());
    }
}
