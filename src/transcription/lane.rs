//! # Per-session Job Lane
//!
//! Keeps one session's jobs in FIFO order and lets at most one of them be
//! with the scheduler at a time, so job N+1 is never submitted before job N's
//! result has been attributed.
//!
//! ## Monotonicity:
//! - a queued FINAL drops queued INTERIMs that start before its end
//! - a newer INTERIM replaces queued older ones
//! - an INTERIM result whose span starts before the finalized offset is discarded
//! - out-of-sequence results are discarded

use crate::transcription::job::{InferenceJob, JobKind, JobTicket};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Emit,
    Discard(&'static str),
}

#[derive(Debug, Default)]
pub struct JobLane {
    next_seq: u64,
    queue: VecDeque<InferenceJob>,
    in_flight: Option<JobTicket>,
    /// End of the latest FINAL whose result was emitted.
    finalized_offset: u64,
}

impl JobLane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a job and assign its sequence number.
    pub fn enqueue(&mut self, mut job: InferenceJob) -> u64 {
        self.next_seq += 1;
        job.ticket.seq = self.next_seq;

        match job.ticket.kind {
            JobKind::Final => {
                let end = job.ticket.span.end;
                self.queue
                    .retain(|queued| queued.ticket.kind == JobKind::Final || queued.ticket.span.start >= end);
            }
            JobKind::Interim => {
                self.queue.retain(|queued| queued.ticket.kind == JobKind::Final);
            }
        }

        self.queue.push_back(job);
        self.next_seq
    }

    /// Next job to hand to the scheduler, if the lane is idle.
    pub fn next_dispatch(&mut self) -> Option<InferenceJob> {
        if self.in_flight.is_some() {
            return None;
        }
        let job = self.queue.pop_front()?;
        self.in_flight = Some(job.ticket.clone());
        Some(job)
    }

    /// Attribute a result to the in-flight job and decide whether it reaches
    /// the client.
    pub fn resolve(&mut self, ticket: &JobTicket) -> Resolution {
        match &self.in_flight {
            Some(current) if current.seq == ticket.seq => self.in_flight = None,
            _ => return Resolution::Discard("out of sequence"),
        }

        match ticket.kind {
            JobKind::Final => {
                if ticket.span.end <= self.finalized_offset {
                    return Resolution::Discard("span already finalized");
                }
                self.finalized_offset = ticket.span.end;
                Resolution::Emit
            }
            JobKind::Interim => {
                if ticket.span.start < self.finalized_offset {
                    return Resolution::Discard("superseded by final");
                }
                Resolution::Emit
            }
        }
    }

    /// The in-flight job never produced a result (busy or failed submission).
    pub fn fail(&mut self, seq: u64) {
        if self.in_flight.as_ref().map(|t| t.seq) == Some(seq) {
            self.in_flight = None;
        }
    }

    /// Drop everything not yet dispatched. Returns how many jobs were dropped.
    pub fn cancel_pending(&mut self) -> usize {
        let dropped = self.queue.len();
        self.queue.clear();
        dropped
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    #[cfg(test)]
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.queue.is_empty()
    }

    #[cfg(test)]
    pub fn finalized_offset(&self) -> u64 {
        self.finalized_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(kind: JobKind, start: u64, end: u64) -> InferenceJob {
        InferenceJob::new("sess_test", kind, start..end, vec![0; (end - start) as usize], "item_1", None)
    }

    #[test]
    fn test_fifo_with_single_job_in_flight() {
        let mut lane = JobLane::new();
        assert_eq!(lane.enqueue(job(JobKind::Final, 0, 10)), 1);
        assert_eq!(lane.enqueue(job(JobKind::Final, 10, 20)), 2);

        let first = lane.next_dispatch().unwrap();
        assert_eq!(first.ticket.seq, 1);
        assert!(lane.next_dispatch().is_none());

        assert_eq!(lane.resolve(&first.ticket), Resolution::Emit);
        let second = lane.next_dispatch().unwrap();
        assert_eq!(second.ticket.seq, 2);
    }

    #[test]
    fn test_queued_final_supersedes_interims() {
        let mut lane = JobLane::new();
        let running = lane.enqueue(job(JobKind::Final, 0, 4));
        assert_eq!(running, 1);
        let _ = lane.next_dispatch();

        lane.enqueue(job(JobKind::Interim, 4, 8));
        lane.enqueue(job(JobKind::Interim, 4, 12));
        assert_eq!(lane.pending(), 1);
        lane.enqueue(job(JobKind::Final, 4, 14));
        assert_eq!(lane.pending(), 1);
    }

    #[test]
    fn test_late_interim_is_discarded() {
        let mut lane = JobLane::new();
        lane.enqueue(job(JobKind::Final, 0, 100));
        let final_job = lane.next_dispatch().unwrap();
        assert_eq!(lane.resolve(&final_job.ticket), Resolution::Emit);
        assert_eq!(lane.finalized_offset(), 100);

        let stale = JobTicket {
            seq: 2,
            kind: JobKind::Interim,
            span: 50..120,
            item_id: "item_1".to_string(),
        };
        lane.enqueue(job(JobKind::Interim, 50, 120));
        let _ = lane.next_dispatch();
        assert_eq!(lane.resolve(&stale), Resolution::Discard("superseded by final"));
    }

    #[test]
    fn test_out_of_sequence_result_is_discarded() {
        let mut lane = JobLane::new();
        lane.enqueue(job(JobKind::Final, 0, 10));
        let dispatched = lane.next_dispatch().unwrap();
        let mut other = dispatched.ticket.clone();
        other.seq = 7;
        assert_eq!(lane.resolve(&other), Resolution::Discard("out of sequence"));
        assert_eq!(lane.resolve(&dispatched.ticket), Resolution::Emit);
    }

    #[test]
    fn test_fail_and_cancel() {
        let mut lane = JobLane::new();
        lane.enqueue(job(JobKind::Final, 0, 10));
        lane.enqueue(job(JobKind::Final, 10, 20));
        let first = lane.next_dispatch().unwrap();
        lane.fail(first.ticket.seq);
        assert_eq!(lane.cancel_pending(), 1);
        assert!(lane.is_idle());
    }
}
