use std::time::{Duration, Instant};

use super::job::{JobState, NotificationJob};
use super::rate_limit::TokenBucket;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LaneCounters {
    pub submitted: u64,
    pub delivered: u64,
    pub retried: u64,
    pub dropped: u64,
}

/// Everything a lane mutates, kept under one lock.
#[derive(Debug)]
pub struct LaneState {
    queue: Vec<NotificationJob>,
    bucket: TokenBucket,
    next_seq: u64,
    pub(crate) in_flight: usize,
    pub(crate) counters: LaneCounters,
    /// Set once shutdown begins; queued work left at this instant is dropped.
    pub(crate) deadline: Option<Instant>,
    warn_depth: usize,
    over_warn_depth: bool,
}

impl LaneState {
    pub fn new(bucket: TokenBucket, warn_depth: usize) -> Self {
        Self {
            queue: Vec::new(),
            bucket,
            next_seq: 0,
            in_flight: 0,
            counters: LaneCounters::default(),
            deadline: None,
            warn_depth,
            over_warn_depth: false,
        }
    }

    /// Enqueue a fresh job. Returns true when this push crossed the warning
    /// depth.
    pub fn push(&mut self, mut job: NotificationJob) -> bool {
        job.seq = self.next_seq;
        job.state = JobState::Queued;
        self.next_seq += 1;
        self.counters.submitted += 1;
        self.queue.push(job);
        self.check_depth()
    }

    /// Put a failed job back behind its backoff gate.
    pub fn requeue(&mut self, mut job: NotificationJob, not_before: Instant) {
        job.state = JobState::Queued;
        job.not_before = not_before;
        self.counters.retried += 1;
        self.queue.push(job);
    }

    fn check_depth(&mut self) -> bool {
        if self.queue.len() >= self.warn_depth {
            let crossed = !self.over_warn_depth;
            self.over_warn_depth = true;
            crossed
        } else {
            self.over_warn_depth = false;
            false
        }
    }

    /// Pop the next job to send: highest tier, then lowest sequence, among
    /// jobs past their backoff gate. Consumes one token; with no token the
    /// queue is left untouched.
    pub fn take_ready(&mut self, now: Instant) -> Option<NotificationJob> {
        let idx = self
            .queue
            .iter()
            .enumerate()
            .filter(|(_, job)| job.is_ready(now))
            .max_by(|(_, a), (_, b)| a.priority.cmp(&b.priority).then(b.seq.cmp(&a.seq)))
            .map(|(idx, _)| idx)?;
        if !self.bucket.try_acquire(now) {
            return None;
        }
        let mut job = self.queue.swap_remove(idx);
        job.state = JobState::InFlight;
        job.attempts += 1;
        self.in_flight += 1;
        self.check_depth();
        Some(job)
    }

    /// How long the worker may sleep before something could become ready.
    /// `None` means nothing is queued and only a new push can wake it.
    pub fn next_wake(&mut self, now: Instant, tick: Duration) -> Option<Duration> {
        let earliest_gate = self.queue.iter().map(|job| job.not_before).min()?;
        let mut wait = if earliest_gate > now && self.bucket.has_token(now) {
            earliest_gate - now
        } else {
            tick
        };
        if let Some(deadline) = self.deadline {
            wait = wait.min(deadline.saturating_duration_since(now));
        }
        Some(wait)
    }

    /// Remove everything still queued.
    pub fn drain(&mut self) -> Vec<NotificationJob> {
        let mut jobs: Vec<NotificationJob> = self.queue.drain(..).collect();
        jobs.sort_by_key(|job| job.seq);
        for job in &mut jobs {
            job.state = JobState::Dropped;
        }
        self.counters.dropped += jobs.len() as u64;
        self.over_warn_depth = false;
        jobs
    }

    pub fn depth(&self) -> usize {
        self.queue.len()
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.in_flight == 0
    }

    pub fn tokens(&mut self, now: Instant) -> f64 {
        self.bucket.tokens(now)
    }
}
