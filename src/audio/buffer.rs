//! # Session Audio Buffer
//!
//! Append-only accumulator for one session's PCM bytes, split at the
//! *committed offset*:
//!
//! ```text
//!  0                committed                      total
//!  |--- released ---|====== uncommitted tail ======|
//! ```
//!
//! Offsets are absolute (bytes since session start) so spans stay meaningful
//! after committed audio has been released from memory.
//!
//! ## Invariants:
//! - `committed <= total` at all times
//! - the committed offset only moves forward
//! - bytes before the committed offset are gone and can never be handed out again

use crate::audio::processor::validate_alignment;
use crate::error::SessionError;
use std::ops::Range;

#[derive(Debug, Default)]
pub struct AudioBuffer {
    /// Bytes at and after the committed offset.
    tail: Vec<u8>,
    /// Absolute offset of `tail[0]`.
    committed: u64,
}

impl AudioBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append PCM bytes to the uncommitted tail.
    ///
    /// Returns the absolute span the bytes now occupy. Misaligned payloads are
    /// rejected before anything is written.
    pub fn append(&mut self, data: &[u8]) -> Result<Range<u64>, SessionError> {
        validate_alignment(data)?;
        let start = self.total_len();
        self.tail.extend_from_slice(data);
        Ok(start..self.total_len())
    }

    /// Total bytes ever appended.
    pub fn total_len(&self) -> u64 {
        self.committed + self.tail.len() as u64
    }

    pub fn committed_offset(&self) -> u64 {
        self.committed
    }

    pub fn uncommitted_len(&self) -> usize {
        self.tail.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tail.is_empty()
    }

    /// Copy of the whole uncommitted tail together with its span.
    pub fn snapshot(&self) -> (Range<u64>, Vec<u8>) {
        (self.committed..self.total_len(), self.tail.clone())
    }

    /// Advance the committed offset to `offset` and hand back the bytes it
    /// passed over.
    ///
    /// `offset` is clamped to `[committed, total]` and rounded down to a
    /// sample boundary, so the returned span may be empty.
    pub fn commit_to(&mut self, offset: u64) -> (Range<u64>, Vec<u8>) {
        let start = self.committed;
        let target = offset.clamp(start, self.total_len());
        let target = target - (target - start) % 2;
        let taken: Vec<u8> = self.tail.drain(..(target - start) as usize).collect();
        self.committed = target;
        (start..target, taken)
    }

    /// Commit everything that is buffered.
    pub fn commit_all(&mut self) -> (Range<u64>, Vec<u8>) {
        self.commit_to(self.total_len())
    }

    /// Advance the committed offset without producing a job. Used to drop
    /// leading silence that never needs to be transcribed.
    pub fn discard_until(&mut self, offset: u64) -> u64 {
        let (span, _) = self.commit_to(offset);
        span.end - span.start
    }
}
