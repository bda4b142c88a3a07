use crate::config::CaptureConfig;
use std::time::Duration;
use tokio::time::Instant;

/// How hard an intent pushes through the heuristic gates. Ordering matters:
/// comparisons like `importance >= High` express bypass rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Importance {
    Low,
    High,
    Critical,
}

/// A requested frame emission. At most one exists per engine; a newer intent
/// supersedes the prior one only after it has been drained.
#[derive(Debug, Clone, Copy)]
pub struct CaptureIntent {
    pub wanted_at: Instant,
    pub deadline: Instant,
    pub generation: u64,
    pub importance: Importance,
    /// Next moment the engine re-evaluates a deferred intent.
    pub poll_at: Instant,
}

impl CaptureIntent {
    pub fn new(now: Instant, generation: u64, importance: Importance, grace: Duration) -> Self {
        Self {
            wanted_at: now,
            deadline: now + grace,
            generation,
            importance,
            poll_at: now,
        }
    }

    pub fn past_deadline(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

/// Deadline grace for a new intent: 0.9 s at rest, clamped to 0.3 s while
/// the UI is in motion and 0.1 s for High/Critical intents.
pub fn intent_grace(config: &CaptureConfig, importance: Importance, in_motion: bool) -> Duration {
    if importance >= Importance::High {
        config.grace_high
    } else if in_motion {
        config.grace_motion
    } else {
        config.grace_baseline
    }
}

/// Fixed-rate tick source feeding Low-importance intents while recording.
///
/// The display-synchronised host tick maps onto this; alignment after pauses
/// keeps resumes from bursting a backlog of missed ticks.
#[derive(Debug, Clone)]
pub struct IntentClock {
    every: Duration,
    next_due: Instant,
}

impl IntentClock {
    pub fn new(fps: f32, first_due: Instant) -> Self {
        let fps = if fps.is_finite() && fps > 0.0 { fps } else { 1.0 };
        Self {
            every: Duration::from_secs_f64(1.0 / fps as f64),
            next_due: first_due,
        }
    }

    pub fn next_due(&self) -> Instant {
        self.next_due
    }

    pub fn should_tick(&self, now: Instant) -> bool {
        now >= self.next_due
    }

    /// Advances one interval, skipping forward when ticks were missed so a
    /// stall never produces back-to-back captures.
    pub fn mark_ticked(&mut self, now: Instant) {
        let mut due = self.next_due + self.every;
        if due <= now {
            due = now + self.every;
        }
        self.next_due = due;
    }

    /// Re-anchors the clock at `now`, used when resuming from pause.
    pub fn align_next_due(&mut self, now: Instant) {
        self.next_due = now;
    }
}
