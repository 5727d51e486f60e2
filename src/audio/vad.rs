//! # Voice Activity Detection
//!
//! Frame-based turn detector used in `server_vad` mode. Audio is cut into
//! fixed-duration frames, each frame is scored by a pluggable
//! [`SpeechScorer`], and a small run-state machine turns the probability
//! sequence into utterance boundaries.
//!
//! ## Policy:
//! - probability >= threshold extends or starts a SPEECH run
//! - the first speech frame after silence emits `SpeechStarted` at that frame's start
//! - inside an utterance, silence accumulates as hangover; once it *exceeds*
//!   `silence_duration_ms`, `SpeechStopped` is emitted at the start of that
//!   silence run, so the finalized span excludes trailing silence
//!
//! The engine holds no clock: boundaries depend only on the probability
//! sequence and the two parameters. One engine per session.

use crate::audio::processor::SAMPLE_RATE;

/// Scores one frame of PCM16 samples with a speech probability in [0, 1].
pub trait SpeechScorer: Send {
    fn score(&mut self, frame: &[i16]) -> f32;

    /// Forget any internal model state (called when an utterance is force-closed).
    fn reset(&mut self) {}
}

/// RMS energy heuristic mapped linearly from dBFS onto [0, 1].
#[derive(Debug, Clone)]
pub struct EnergyScorer {
    /// Level at or below which a frame scores 0.0.
    pub floor_dbfs: f32,
    /// Level at or above which a frame scores 1.0.
    pub ceiling_dbfs: f32,
}

impl Default for EnergyScorer {
    fn default() -> Self {
        Self {
            floor_dbfs: -55.0,
            ceiling_dbfs: -25.0,
        }
    }
}

impl SpeechScorer for EnergyScorer {
    fn score(&mut self, frame: &[i16]) -> f32 {
        if frame.is_empty() {
            return 0.0;
        }
        let energy: f64 = frame
            .iter()
            .map(|&s| {
                let v = s as f64 / 32768.0;
                v * v
            })
            .sum::<f64>()
            / frame.len() as f64;
        let rms = energy.sqrt();
        if rms <= f64::EPSILON {
            return 0.0;
        }
        let dbfs = 20.0 * rms.log10() as f32;
        ((dbfs - self.floor_dbfs) / (self.ceiling_dbfs - self.floor_dbfs)).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadParams {
    pub threshold: f32,
    pub silence_duration_ms: u32,
    pub frame_ms: u32,
}

impl VadParams {
    pub fn frame_samples(&self) -> usize {
        (SAMPLE_RATE as usize * self.frame_ms as usize) / 1000
    }
}

/// Utterance boundary, positioned in absolute samples since session start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadBoundary {
    SpeechStarted { sample: u64 },
    SpeechStopped { sample: u64 },
}

/// One scored frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadFrame {
    pub start: u64,
    pub end: u64,
    pub probability: f32,
    pub boundary: Option<VadBoundary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Run {
    Silence,
    Speech,
}

pub struct VadEngine {
    params: VadParams,
    scorer: Box<dyn SpeechScorer>,
    frame_samples: usize,
    /// Samples queued for scoring; `pending[cursor..]` is not scored yet.
    pending: Vec<i16>,
    cursor: usize,
    /// Absolute sample index of `pending[cursor]`.
    next_frame_start: u64,
    run: Run,
    in_utterance: bool,
    speech_frames: u64,
    silence_samples: u64,
    silence_start: u64,
}

impl VadEngine {
    /// `start_sample` is the absolute position of the first sample this
    /// engine will see.
    pub fn new(params: VadParams, scorer: Box<dyn SpeechScorer>, start_sample: u64) -> Self {
        Self {
            frame_samples: params.frame_samples().max(1),
            params,
            scorer,
            pending: Vec::new(),
            cursor: 0,
            next_frame_start: start_sample,
            run: Run::Silence,
            in_utterance: false,
            speech_frames: 0,
            silence_samples: 0,
            silence_start: start_sample,
        }
    }

    pub fn params(&self) -> VadParams {
        self.params
    }

    /// Update threshold and hangover in place. The frame size is fixed for the
    /// lifetime of the engine so the pending partial frame stays valid.
    pub fn set_params(&mut self, threshold: f32, silence_duration_ms: u32) {
        self.params.threshold = threshold;
        self.params.silence_duration_ms = silence_duration_ms;
    }

    pub fn is_speaking(&self) -> bool {
        self.in_utterance
    }

    /// Queue samples for scoring without scoring them yet.
    pub fn extend(&mut self, samples: &[i16]) {
        self.pending.extend_from_slice(samples);
    }

    /// Score the next whole frame, if one is queued.
    ///
    /// Stepping one frame at a time lets the caller act on a boundary (or
    /// `reset`) before the following frame is classified.
    pub fn next_frame(&mut self) -> Option<VadFrame> {
        if self.pending.len() - self.cursor < self.frame_samples {
            self.pending.drain(..self.cursor);
            self.cursor = 0;
            return None;
        }

        let window = &self.pending[self.cursor..self.cursor + self.frame_samples];
        let probability = self.scorer.score(window);
        let start = self.next_frame_start;
        let end = start + self.frame_samples as u64;
        let boundary = self.advance(probability, start);

        self.cursor += self.frame_samples;
        self.next_frame_start = end;
        Some(VadFrame {
            start,
            end,
            probability,
            boundary,
        })
    }

    /// Feed samples; returns every frame completed by them, in order.
    #[cfg(test)]
    pub fn push(&mut self, samples: &[i16]) -> Vec<VadFrame> {
        self.extend(samples);
        std::iter::from_fn(|| self.next_frame()).collect()
    }

    fn advance(&mut self, probability: f32, frame_start: u64) -> Option<VadBoundary> {
        if probability >= self.params.threshold {
            self.run = Run::Speech;
            self.speech_frames += 1;
            self.silence_samples = 0;
            if !self.in_utterance {
                self.in_utterance = true;
                return Some(VadBoundary::SpeechStarted { sample: frame_start });
            }
            return None;
        }

        if self.run == Run::Speech {
            self.silence_start = frame_start;
        }
        self.run = Run::Silence;

        if !self.in_utterance || self.speech_frames == 0 {
            return None;
        }

        self.silence_samples += self.frame_samples as u64;
        let silence_ms = self.silence_samples * 1000 / SAMPLE_RATE as u64;
        if silence_ms > self.params.silence_duration_ms as u64 {
            let boundary = VadBoundary::SpeechStopped {
                sample: self.silence_start,
            };
            self.in_utterance = false;
            self.speech_frames = 0;
            self.silence_samples = 0;
            return Some(boundary);
        }
        None
    }

    /// Drop the run-state for the next utterance. Buffered partial-frame
    /// samples are kept so frame alignment with the audio stream survives.
    pub fn reset(&mut self) {
        self.run = Run::Silence;
        self.in_utterance = false;
        self.speech_frames = 0;
        self.silence_samples = 0;
        self.silence_start = self.next_frame_start;
        self.scorer.reset();
    }
}

impl std::fmt::Debug for VadEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VadEngine")
            .field("params", &self.params)
            .field("in_utterance", &self.in_utterance)
            .field("next_frame_start", &self.next_frame_start)
            .finish()
    }
}
