//! # Chunk Scheduler
//!
//! Decides when buffered audio becomes an inference job.
//!
//! ## Rules:
//! - **Manual commit**: the whole uncommitted tail becomes one FINAL job
//! - **Speech stopped**: FINAL over `[committed, silence_start)`
//! - **Liveness**: an utterance that reaches the auto-commit length without a
//!   speech-stop is force-finalized and the VAD run-state is reset
//! - **Interim**: every time the tail grows by one max chunk past the last
//!   interim mark, an INTERIM job over `[committed, end)` is cut
//!
//! Leading silence in VAD mode is released from the buffer without inference.
//! Within a single frame the VAD boundary is handled before the liveness check.

use crate::audio::buffer::AudioBuffer;
use crate::audio::processor::{pcm16_samples, sample_to_byte, seconds_to_bytes};
use crate::audio::vad::{VadBoundary, VadEngine};
use crate::config::SessionDefaults;
use crate::error::SessionError;
use std::ops::Range;
use tracing::debug;

/// Chunking limits, all measured in bytes of 16kHz PCM16.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPolicy {
    pub max_chunk_bytes: u64,
    pub auto_commit_bytes: u64,
    pub max_buffer_bytes: usize,
    pub interim_results: bool,
}

impl ChunkPolicy {
    pub fn from_defaults(defaults: &SessionDefaults) -> Self {
        Self {
            max_chunk_bytes: seconds_to_bytes(defaults.max_chunk_seconds).max(2),
            auto_commit_bytes: seconds_to_bytes(defaults.auto_commit_interval_secs).max(2),
            max_buffer_bytes: defaults.max_buffer_bytes,
            interim_results: defaults.interim_results,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitReason {
    Manual,
    SpeechStopped,
    AutoCommit,
}

/// What an append or commit produced, in stream order.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkEvent {
    SpeechStarted { offset: u64 },
    SpeechStopped { offset: u64 },
    Interim { span: Range<u64>, audio: Vec<u8> },
    Final {
        span: Range<u64>,
        audio: Vec<u8>,
        reason: CommitReason,
    },
}

#[derive(Debug)]
pub struct ChunkScheduler {
    policy: ChunkPolicy,
    /// Buffer end at the last INTERIM cut.
    interim_mark: u64,
    /// Offset at which VAD took over the stream. Audio buffered before it
    /// (while the session was in manual mode) is never released as silence.
    vad_origin: u64,
}

impl ChunkScheduler {
    pub fn new(policy: ChunkPolicy) -> Self {
        Self {
            policy,
            interim_mark: 0,
            vad_origin: 0,
        }
    }

    /// Called when server VAD is switched on for an already running stream.
    pub fn set_vad_origin(&mut self, offset: u64) {
        self.vad_origin = offset;
    }

    /// Append decoded PCM and run every rule that the new audio can trigger.
    ///
    /// With `vad` present the session is in server VAD mode, otherwise manual.
    pub fn on_append(
        &mut self,
        buffer: &mut AudioBuffer,
        mut vad: Option<&mut VadEngine>,
        data: &[u8],
    ) -> Result<Vec<ChunkEvent>, SessionError> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        // Rejected appends leave the buffer and VAD untouched
        if buffer.uncommitted_len() + data.len() > self.policy.max_buffer_bytes {
            return Err(SessionError::BufferOverflow {
                limit: self.policy.max_buffer_bytes,
            });
        }
        buffer.append(data)?;

        let mut events = Vec::new();
        if let Some(vad) = vad.as_deref_mut() {
            self.run_vad(buffer, vad, data, &mut events);
        }

        let speaking = vad.as_deref().map_or(true, VadEngine::is_speaking);
        if self.policy.interim_results && speaking {
            let mark = self.interim_mark.max(buffer.committed_offset());
            if buffer.total_len() - mark >= self.policy.max_chunk_bytes {
                let (span, audio) = buffer.snapshot();
                self.interim_mark = span.end;
                events.push(ChunkEvent::Interim { span, audio });
            }
        }

        Ok(events)
    }

    fn run_vad(
        &mut self,
        buffer: &mut AudioBuffer,
        vad: &mut VadEngine,
        data: &[u8],
        events: &mut Vec<ChunkEvent>,
    ) {
        vad.extend(&pcm16_samples(data));
        while let Some(frame) = vad.next_frame() {
            let frame_end = sample_to_byte(frame.end);

            match frame.boundary {
                Some(VadBoundary::SpeechStarted { sample }) => {
                    let offset = sample_to_byte(sample);
                    self.release_silence(buffer, offset);
                    events.push(ChunkEvent::SpeechStarted { offset });
                }
                Some(VadBoundary::SpeechStopped { sample }) => {
                    let offset = sample_to_byte(sample);
                    events.push(ChunkEvent::SpeechStopped { offset });
                    self.finalize(buffer, offset, CommitReason::SpeechStopped, events);
                }
                None => {}
            }

            if vad.is_speaking() {
                let utterance = frame_end.saturating_sub(buffer.committed_offset());
                if utterance >= self.policy.auto_commit_bytes {
                    debug!(offset = frame_end, "Utterance reached auto-commit length");
                    self.finalize(buffer, frame_end, CommitReason::AutoCommit, events);
                    vad.reset();
                }
            } else if buffer.committed_offset() < self.vad_origin {
                self.settle_manual_tail(buffer, vad, frame_end, events);
            } else {
                self.release_silence(buffer, frame_end);
            }
        }
    }

    /// Audio kept from manual mode waits for the first utterance, but only
    /// for one hangover. Past that it is finalized on its own and the silence
    /// behind it is released like any other.
    fn settle_manual_tail(
        &mut self,
        buffer: &mut AudioBuffer,
        vad: &VadEngine,
        frame_end: u64,
        events: &mut Vec<ChunkEvent>,
    ) {
        let hangover = seconds_to_bytes(vad.params().silence_duration_ms as f64 / 1000.0);
        if frame_end.saturating_sub(self.vad_origin) > hangover {
            debug!(offset = self.vad_origin, "Finalizing audio buffered before server VAD");
            self.finalize(buffer, self.vad_origin, CommitReason::SpeechStopped, events);
            self.release_silence(buffer, frame_end);
        }
    }

    fn release_silence(&mut self, buffer: &mut AudioBuffer, offset: u64) {
        if buffer.committed_offset() >= self.vad_origin {
            buffer.discard_until(offset);
        }
    }

    fn finalize(
        &mut self,
        buffer: &mut AudioBuffer,
        offset: u64,
        reason: CommitReason,
        events: &mut Vec<ChunkEvent>,
    ) {
        let (span, audio) = buffer.commit_to(offset);
        self.interim_mark = buffer.committed_offset();
        if !span.is_empty() {
            events.push(ChunkEvent::Final { span, audio, reason });
        }
    }

    /// Manual commit of the whole tail.
    pub fn commit(&mut self, buffer: &mut AudioBuffer) -> Result<ChunkEvent, SessionError> {
        if buffer.is_empty() {
            return Err(SessionError::EmptyCommit);
        }
        let (span, audio) = buffer.commit_all();
        self.interim_mark = span.end;
        Ok(ChunkEvent::Final {
            span,
            audio,
            reason: CommitReason::Manual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::vad::tests::ScriptedScorer;
    use crate::audio::vad::VadParams;

    const SECOND: u64 = 32_000;

    fn policy(max_chunk_bytes: u64, auto_commit_bytes: u64, interim_results: bool) -> ChunkPolicy {
        ChunkPolicy {
            max_chunk_bytes,
            auto_commit_bytes,
            max_buffer_bytes: 10 * SECOND as usize,
            interim_results,
        }
    }

    fn vad(probabilities: Vec<f32>) -> VadEngine {
        vad_from(probabilities, 0)
    }

    fn vad_from(probabilities: Vec<f32>, start_sample: u64) -> VadEngine {
        let params = VadParams {
            threshold: 0.5,
            silence_duration_ms: 400,
            frame_ms: 20,
        };
        VadEngine::new(
            params,
            Box::new(ScriptedScorer(probabilities.into())),
            start_sample,
        )
    }

    /// Feed `seconds` of audio in 100ms appends and collect every event.
    fn stream(
        chunker: &mut ChunkScheduler,
        buffer: &mut AudioBuffer,
        mut vad: Option<&mut VadEngine>,
        seconds: f64,
    ) -> Vec<ChunkEvent> {
        let appends = (seconds * 10.0).round() as usize;
        let mut events = Vec::new();
        for _ in 0..appends {
            let chunk = vec![0u8; (SECOND / 10) as usize];
            events.extend(chunker.on_append(buffer, vad.as_deref_mut(), &chunk).unwrap());
        }
        events
    }

    fn finals(events: &[ChunkEvent]) -> Vec<(Range<u64>, CommitReason)> {
        events
            .iter()
            .filter_map(|event| match event {
                ChunkEvent::Final { span, reason, .. } => Some((span.clone(), *reason)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_manual_commit_is_idempotent() {
        let mut buffer = AudioBuffer::new();
        let mut chunker = ChunkScheduler::new(policy(SECOND, 60 * SECOND, false));
        stream(&mut chunker, &mut buffer, None, 1.5);

        match chunker.commit(&mut buffer).unwrap() {
            ChunkEvent::Final { span, audio, reason } => {
                assert_eq!(span, 0..48_000);
                assert_eq!(audio.len(), 48_000);
                assert_eq!(reason, CommitReason::Manual);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(chunker.commit(&mut buffer), Err(SessionError::EmptyCommit));
    }

    #[test]
    fn test_manual_interims_follow_max_chunk() {
        let mut buffer = AudioBuffer::new();
        let mut chunker = ChunkScheduler::new(policy(SECOND, 60 * SECOND, true));
        let events = stream(&mut chunker, &mut buffer, None, 2.5);

        let spans: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                ChunkEvent::Interim { span, .. } => Some(span.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(spans, vec![0..SECOND, 0..2 * SECOND]);
    }

    #[test]
    fn test_vad_utterance_excludes_surrounding_silence() {
        let mut probs = vec![0.1; 50];
        probs.extend(vec![0.9; 100]);
        probs.extend(vec![0.1; 25]);
        let mut engine = vad(probs);
        let mut buffer = AudioBuffer::new();
        let mut chunker = ChunkScheduler::new(policy(SECOND, 60 * SECOND, false));

        let events = stream(&mut chunker, &mut buffer, Some(&mut engine), 3.5);

        assert_eq!(events[0], ChunkEvent::SpeechStarted { offset: SECOND });
        assert_eq!(events[1], ChunkEvent::SpeechStopped { offset: 3 * SECOND });
        assert_eq!(
            finals(&events),
            vec![(SECOND..3 * SECOND, CommitReason::SpeechStopped)]
        );
        // Trailing silence after the stop is released as well
        assert_eq!(buffer.committed_offset(), buffer.total_len());
    }

    #[test]
    fn test_leading_silence_is_released() {
        let mut engine = vad(vec![0.0; 50]);
        let mut buffer = AudioBuffer::new();
        let mut chunker = ChunkScheduler::new(policy(SECOND, 60 * SECOND, true));

        let events = stream(&mut chunker, &mut buffer, Some(&mut engine), 1.0);
        assert!(events.is_empty());
        assert_eq!(buffer.committed_offset(), SECOND);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_auto_commit_forces_final_and_resets_vad() {
        let mut engine = vad(vec![0.9; 125]);
        let mut buffer = AudioBuffer::new();
        let mut chunker = ChunkScheduler::new(policy(10 * SECOND, SECOND, false));

        let events = stream(&mut chunker, &mut buffer, Some(&mut engine), 2.5);

        assert_eq!(
            finals(&events),
            vec![
                (0..SECOND, CommitReason::AutoCommit),
                (SECOND..2 * SECOND, CommitReason::AutoCommit),
            ]
        );
        let starts = events
            .iter()
            .filter(|event| matches!(event, ChunkEvent::SpeechStarted { .. }))
            .count();
        assert_eq!(starts, 3);
        assert_eq!(buffer.uncommitted_len() as u64, SECOND / 2);
    }

    #[test]
    fn test_speech_stop_wins_over_auto_commit_in_same_frame() {
        // 0.6s speech then silence; the stop fires on the frame ending at 1.02s
        let mut probs = vec![0.9; 30];
        probs.extend(vec![0.1; 30]);
        let mut engine = vad(probs);
        let mut buffer = AudioBuffer::new();
        let mut chunker = ChunkScheduler::new(policy(10 * SECOND, 32_640, false));

        let events = stream(&mut chunker, &mut buffer, Some(&mut engine), 1.2);
        assert_eq!(
            finals(&events),
            vec![(0..19_200, CommitReason::SpeechStopped)]
        );
    }

    #[test]
    fn test_vad_interims_track_the_utterance() {
        let mut engine = vad(vec![0.9; 125]);
        let mut buffer = AudioBuffer::new();
        let mut chunker = ChunkScheduler::new(policy(SECOND, 60 * SECOND, true));

        let events = stream(&mut chunker, &mut buffer, Some(&mut engine), 2.5);
        let spans: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                ChunkEvent::Interim { span, .. } => Some(span.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(spans, vec![0..SECOND, 0..2 * SECOND]);
    }

    #[test]
    fn test_buffer_overflow_is_reported() {
        let mut buffer = AudioBuffer::new();
        let mut chunker = ChunkScheduler::new(ChunkPolicy {
            max_buffer_bytes: 1_000,
            ..policy(SECOND, 60 * SECOND, false)
        });
        assert!(chunker.on_append(&mut buffer, None, &[0u8; 1_000]).is_ok());
        assert_eq!(
            chunker.on_append(&mut buffer, None, &[0u8; 2]),
            Err(SessionError::BufferOverflow { limit: 1_000 })
        );
        // The rejected append was not buffered
        assert_eq!(buffer.total_len(), 1_000);
    }

    #[test]
    fn test_overflowing_append_cuts_no_final() {
        let mut buffer = AudioBuffer::new();
        let mut chunker = ChunkScheduler::new(ChunkPolicy {
            max_buffer_bytes: SECOND as usize,
            ..policy(10 * SECOND, SECOND / 2, false)
        });
        let mut engine = vad(vec![0.9; 100]);
        let events = chunker
            .on_append(&mut buffer, Some(&mut engine), &vec![0u8; 3 * SECOND as usize / 10])
            .unwrap();
        assert!(finals(&events).is_empty());

        // This append would reach auto-commit, but it overflows first
        let result = chunker.on_append(&mut buffer, Some(&mut engine), &vec![0u8; 8 * SECOND as usize / 10]);
        assert_eq!(result, Err(SessionError::BufferOverflow { limit: SECOND as usize }));
        assert_eq!(buffer.committed_offset(), 0);
        assert_eq!(buffer.total_len(), 3 * SECOND / 10);
    }

    #[test]
    fn test_manual_audio_survives_switch_to_vad() {
        let mut buffer = AudioBuffer::new();
        let mut chunker = ChunkScheduler::new(policy(10 * SECOND, 60 * SECOND, false));
        stream(&mut chunker, &mut buffer, None, 0.5);

        chunker.set_vad_origin(buffer.total_len());
        let mut engine = vad_from(vec![0.0; 50], SECOND / 4);
        // Shorter than the 400ms hangover: manual audio still waits
        let events = stream(&mut chunker, &mut buffer, Some(&mut engine), 0.3);
        assert!(finals(&events).is_empty());
        assert_eq!(buffer.committed_offset(), 0);
        assert_eq!(buffer.uncommitted_len() as u64, 8 * SECOND / 10);

        // Past the hangover it is finalized alone and the silence released
        let events = stream(&mut chunker, &mut buffer, Some(&mut engine), 0.2);
        assert_eq!(
            finals(&events),
            vec![(0..SECOND / 2, CommitReason::SpeechStopped)]
        );
        assert_eq!(buffer.committed_offset(), buffer.total_len());
    }

    #[test]
    fn test_silence_after_switch_to_vad_does_not_grow_the_tail() {
        let mut buffer = AudioBuffer::new();
        let mut chunker = ChunkScheduler::new(ChunkPolicy {
            max_buffer_bytes: 2 * SECOND as usize,
            ..policy(10 * SECOND, 60 * SECOND, false)
        });
        stream(&mut chunker, &mut buffer, None, 0.5);

        chunker.set_vad_origin(buffer.total_len());
        let mut engine = vad_from(vec![0.0; 150], SECOND / 4);
        let events = stream(&mut chunker, &mut buffer, Some(&mut engine), 3.0);
        assert_eq!(finals(&events).len(), 1);
        assert!(buffer.is_empty());
    }
}
