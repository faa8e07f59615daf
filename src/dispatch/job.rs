use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::config::PrioritySettings;
use crate::GestureEvent;

/// Delivery tier. Declaration order is the ordering: `Critical` sorts highest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Info,
    Warning,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Info => "info",
            Priority::Warning => "warning",
            Priority::Critical => "critical",
        }
    }

    /// One tier up, saturating at `Critical`.
    pub fn escalate(self) -> Self {
        match self {
            Priority::Info => Priority::Warning,
            Priority::Warning | Priority::Critical => Priority::Critical,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tier for an event: per-label mapping (or the default), raised one tier
/// when the event's confidence reaches `escalate_above`.
pub fn priority_for(event: &GestureEvent, settings: &PrioritySettings) -> Priority {
    let base = settings
        .labels
        .get(&event.label())
        .copied()
        .unwrap_or(settings.default);
    match settings.escalate_above {
        Some(level) if event.confidence() >= level => base.escalate(),
        _ => base,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    InFlight,
    Delivered,
    FailedRetryable,
    Dropped,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::InFlight => "in_flight",
            JobState::Delivered => "delivered",
            JobState::FailedRetryable => "failed_retryable",
            JobState::Dropped => "dropped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Delivered | JobState::Dropped)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One event bound for one channel.
#[derive(Clone, Debug)]
pub struct NotificationJob {
    pub event: Arc<GestureEvent>,
    pub channel: String,
    pub priority: Priority,
    pub attempts: u32,
    pub state: JobState,
    pub enqueued_at: Instant,
    /// Backoff gate; the job is not eligible before this instant.
    pub not_before: Instant,
    /// FIFO tiebreak within a tier. Assigned by the lane on enqueue.
    pub seq: u64,
    pub last_error: Option<String>,
}

impl NotificationJob {
    pub fn new(event: Arc<GestureEvent>, channel: &str, priority: Priority, now: Instant) -> Self {
        Self {
            event,
            channel: channel.to_string(),
            priority,
            attempts: 0,
            state: JobState::Queued,
            enqueued_at: now,
            not_before: now,
            seq: 0,
            last_error: None,
        }
    }

    pub fn is_ready(&self, now: Instant) -> bool {
        self.state == JobState::Queued && now >= self.not_before
    }
}
