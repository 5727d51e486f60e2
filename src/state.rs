//! # Application State Management
//!
//! Shared state handed to every HTTP worker through `web::Data<AppState>`.
//!
//! ## Contents:
//! - **config**: the loaded `AppConfig`, behind `Arc<RwLock<_>>` so it can be
//!   swapped at runtime without restarting workers
//! - **metrics**: connection / session / event counters reported by `/metrics`
//! - **registry**: index of live realtime sessions, enforces the session cap
//! - **scheduler**: the single inference scheduler all sessions share
//!
//! ## Thread Safety:
//! Every field is either immutable or wrapped in `Arc`, so cloning `AppState`
//! is cheap and all clones observe the same data. Locks are only held long
//! enough to copy a value out; a poisoned lock is recovered rather than
//! propagated because counters stay meaningful after a panicking writer.

use crate::config::AppConfig;
use crate::protocol::ServerEvent;
use crate::session::SessionRegistry;
use crate::transcription::InferenceScheduler;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<AppConfig>>,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub registry: SessionRegistry,
    pub scheduler: InferenceScheduler,
    /// Name of the backend implementation the scheduler talks to.
    pub backend_name: &'static str,
    pub start_time: Instant,
}

/// Counters collected across all realtime connections.
///
/// ## Fields:
/// - **connections_total**: accepted WebSocket upgrades
/// - **connections_rejected**: upgrades refused because the session cap was hit
/// - **sessions_finished**: sessions that reached `FINISHED`
/// - **audio_ms_received**: audio appended by clients, in milliseconds
/// - **events_sent**: server events by `type`
/// - **errors_by_code**: `error` events by code
#[derive(Debug, Default, Clone, Serialize)]
pub struct AppMetrics {
    pub connections_total: u64,
    pub connections_rejected: u64,
    pub active_connections: u32,
    pub sessions_finished: u64,
    pub audio_ms_received: u64,
    pub error_count: u64,
    pub events_sent: HashMap<&'static str, u64>,
    pub errors_by_code: HashMap<&'static str, u64>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        scheduler: InferenceScheduler,
        backend_name: &'static str,
    ) -> Self {
        let registry = SessionRegistry::new(config.session.max_concurrent_sessions);
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            registry,
            scheduler,
            backend_name,
            start_time: Instant::now(),
        }
    }

    /// Copy of the current configuration; the lock is released on return.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the configuration after validating it. Running sessions keep
    /// the settings they were created with.
    pub fn update_config(&self, new_config: AppConfig) -> anyhow::Result<()> {
        new_config.validate()?;
        self.registry
            .set_max_concurrent_sessions(new_config.session.max_concurrent_sessions);
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = new_config;
        Ok(())
    }

    fn with_metrics(&self, f: impl FnOnce(&mut AppMetrics)) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut metrics);
    }

    pub fn connection_opened(&self) {
        self.with_metrics(|m| {
            m.connections_total += 1;
            m.active_connections += 1;
        });
    }

    pub fn connection_rejected(&self) {
        self.with_metrics(|m| m.connections_rejected += 1);
    }

    /// Called once per connection when its actor stops.
    pub fn connection_closed(&self, audio_ms: u64) {
        self.with_metrics(|m| {
            m.active_connections = m.active_connections.saturating_sub(1);
            m.sessions_finished += 1;
            m.audio_ms_received += audio_ms;
        });
    }

    /// Count one event written to a client.
    pub fn record_event(&self, event: &ServerEvent) {
        self.with_metrics(|m| {
            *m.events_sent.entry(event.type_name()).or_insert(0) += 1;
            if let ServerEvent::Error { error } = event {
                m.error_count += 1;
                *m.errors_by_code.entry(error.code).or_insert(0) += 1;
            }
        });
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
