//! # Transcription Module
//!
//! Everything between a committed audio span and its transcript.
//!
//! ## Key Components:
//! - **backend**: the out-of-process recognizer interface and its providers
//! - **job**: inference jobs, tickets and outcomes
//! - **lane**: per-session FIFO and monotonicity rules
//! - **scheduler**: system-wide admission control and the dispatch worker pool
//!
//! The recognizer itself is not part of this server. Jobs carry owned PCM16
//! audio at 16kHz and come back as plain text with an optional language tag.

pub mod backend;
pub mod job;
pub mod lane;
pub mod scheduler;

pub use job::{InferenceJob, InferenceOutcome, JobKind, JobTicket, OutcomeSink};
pub use lane::{JobLane, Resolution};
pub use scheduler::{InferenceScheduler, SchedulerOptions};
