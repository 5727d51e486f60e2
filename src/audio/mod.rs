//! # Audio Processing Module
//!
//! Everything that touches raw session audio before it reaches the inference
//! scheduler.
//!
//! ## Key Components:
//! - **processor**: wire audio decoding (base64 → PCM16) and format validation
//! - **buffer**: append-only byte buffer with a committed/uncommitted boundary
//! - **vad**: frame-level voice activity detection with hangover
//! - **chunker**: decides when buffered audio becomes an inference job
//!
//! ## Audio Format:
//! Sessions only accept 16kHz mono little-endian PCM16. All offsets handed
//! between these components are absolute byte offsets since session start.

pub mod buffer;
pub mod chunker;
pub mod processor;
pub mod vad;

pub use buffer::AudioBuffer;
pub use chunker::{ChunkEvent, ChunkPolicy, ChunkScheduler};
pub use vad::{EnergyScorer, SpeechScorer, VadEngine, VadParams};
