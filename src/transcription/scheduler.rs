//! # Inference Request Scheduler
//!
//! Admission control in front of the inference backend, shared by every
//! session in the process.
//!
//! ## Architecture:
//! ```text
//! session actors ──submit──▶ [Semaphore K] ──▶ bounded queue ──▶ K workers ──▶ backend
//!        ▲                                                            │
//!        └────────────────────── OutcomeSink ◀────────────────────────┘
//! ```
//!
//! - A job must win one of K slots before it enters the queue. The semaphore
//!   is fair, so slots go out in arrival order.
//! - A submission that waits longer than `submit_timeout` fails with
//!   `BackendBusy`; the session survives.
//! - Workers check the job's cancel flag right before dispatch.
//! - Transient backend errors are retried once after `retry_backoff`.
//!
//! The slot is held from admission until the backend call returns, which
//! caps in-flight requests at K system-wide.

use crate::audio::processor::SAMPLE_RATE;
use crate::config::BackendConfig;
use crate::error::SessionError;
use crate::transcription::backend::{BackendRequest, BackendTranscript, InferenceBackend};
use crate::transcription::job::{InferenceJob, InferenceOutcome, OutcomeSink};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub max_concurrent: usize,
    pub submit_timeout: Duration,
    pub retry_backoff: Duration,
    pub max_new_tokens: u32,
}

impl SchedulerOptions {
    pub fn from_config(config: &BackendConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent_inferences,
            submit_timeout: config.submit_timeout(),
            retry_backoff: config.retry_backoff(),
            max_new_tokens: config.max_new_tokens,
        }
    }
}

/// Lifetime counters, readable without locking.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub dispatched: AtomicU64,
    pub retried: AtomicU64,
    pub failed: AtomicU64,
    pub cancelled: AtomicU64,
    pub busy: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub max_concurrent: usize,
    pub available_slots: usize,
    pub dispatched: u64,
    pub retried: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub busy: u64,
}

struct Dispatch {
    job: InferenceJob,
    cancel: Arc<AtomicBool>,
    sink: Arc<dyn OutcomeSink>,
    permit: OwnedSemaphorePermit,
}

#[derive(Clone)]
pub struct InferenceScheduler {
    slots: Arc<Semaphore>,
    queue: mpsc::Sender<Dispatch>,
    stats: Arc<SchedulerStats>,
    options: SchedulerOptions,
}

impl InferenceScheduler {
    /// Spawn the worker pool. Must be called inside a tokio runtime.
    pub fn start(backend: Arc<dyn InferenceBackend>, options: SchedulerOptions) -> Self {
        let workers = options.max_concurrent.max(1);
        let (tx, rx) = mpsc::channel::<Dispatch>(workers);
        let rx = Arc::new(Mutex::new(rx));
        let stats = Arc::new(SchedulerStats::default());

        for worker_id in 0..workers {
            tokio::spawn(worker_loop(
                worker_id,
                rx.clone(),
                backend.clone(),
                stats.clone(),
                options.clone(),
            ));
        }

        info!(
            workers,
            backend = backend.name(),
            submit_timeout_ms = options.submit_timeout.as_millis() as u64,
            "Inference scheduler started"
        );

        Self {
            slots: Arc::new(Semaphore::new(workers)),
            queue: tx,
            stats,
            options,
        }
    }

    /// Wait for a slot and hand the job to the worker pool.
    ///
    /// Returns once the job is queued; the result arrives through `sink`.
    pub async fn submit(
        &self,
        job: InferenceJob,
        cancel: Arc<AtomicBool>,
        sink: Arc<dyn OutcomeSink>,
    ) -> Result<(), SessionError> {
        let waited_ms = self.options.submit_timeout.as_millis() as u64;
        let permit = match tokio::time::timeout(
            self.options.submit_timeout,
            self.slots.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(SessionError::BackendFailure(
                    "Inference scheduler is shut down".to_string(),
                ))
            }
            Err(_) => {
                self.stats.busy.fetch_add(1, Ordering::Relaxed);
                warn!(
                    session_id = %job.session_id,
                    seq = job.ticket.seq,
                    waited_ms,
                    "No inference slot available"
                );
                return Err(SessionError::BackendBusy { waited_ms });
            }
        };

        self.queue
            .send(Dispatch {
                job,
                cancel,
                sink,
                permit,
            })
            .await
            .map_err(|_| SessionError::BackendFailure("Inference workers stopped".to_string()))
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            max_concurrent: self.options.max_concurrent,
            available_slots: self.slots.available_permits(),
            dispatched: self.stats.dispatched.load(Ordering::Relaxed),
            retried: self.stats.retried.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            cancelled: self.stats.cancelled.load(Ordering::Relaxed),
            busy: self.stats.busy.load(Ordering::Relaxed),
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<Dispatch>>>,
    backend: Arc<dyn InferenceBackend>,
    stats: Arc<SchedulerStats>,
    options: SchedulerOptions,
) {
    loop {
        let next = { rx.lock().await.recv().await };
        let Some(Dispatch {
            job,
            cancel,
            sink,
            permit,
        }) = next
        else {
            break;
        };

        if cancel.load(Ordering::Acquire) {
            stats.cancelled.fetch_add(1, Ordering::Relaxed);
            debug!(session_id = %job.session_id, seq = job.ticket.seq, "Dropping cancelled job");
            continue;
        }

        stats.dispatched.fetch_add(1, Ordering::Relaxed);
        let result = transcribe_with_retry(backend.as_ref(), &job, &options, &stats).await;
        drop(permit);

        let latency = job.submitted_at.elapsed();
        debug!(
            worker_id,
            session_id = %job.session_id,
            seq = job.ticket.seq,
            kind = ?job.ticket.kind,
            latency_ms = latency.as_millis() as u64,
            ok = result.is_ok(),
            "Inference job finished"
        );

        sink.deliver(InferenceOutcome {
            session_id: job.session_id,
            ticket: job.ticket,
            result,
            latency,
        });
    }

    debug!(worker_id, "Inference worker exiting");
}

async fn transcribe_with_retry(
    backend: &dyn InferenceBackend,
    job: &InferenceJob,
    options: &SchedulerOptions,
    stats: &SchedulerStats,
) -> Result<BackendTranscript, SessionError> {
    let request = BackendRequest {
        audio: job.audio.clone(),
        sample_rate: SAMPLE_RATE,
        max_new_tokens: options.max_new_tokens,
        language: job.language.clone(),
        kind: job.ticket.kind,
    };

    let err = match backend.transcribe(request.clone()).await {
        Ok(transcript) => return Ok(transcript),
        Err(err) if err.is_transient() => err,
        Err(err) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            error!(session_id = %job.session_id, error = %err, "Inference request rejected");
            return Err(SessionError::BackendFailure(err.to_string()));
        }
    };

    stats.retried.fetch_add(1, Ordering::Relaxed);
    warn!(
        session_id = %job.session_id,
        seq = job.ticket.seq,
        error = %err,
        backoff_ms = options.retry_backoff.as_millis() as u64,
        "Transient inference error, retrying once"
    );
    tokio::time::sleep(options.retry_backoff).await;

    backend.transcribe(request).await.map_err(|err| {
        stats.failed.fetch_add(1, Ordering::Relaxed);
        error!(session_id = %job.session_id, error = %err, "Inference retry failed");
        SessionError::BackendFailure(err.to_string())
    })
}
