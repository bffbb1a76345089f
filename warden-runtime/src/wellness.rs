//! Worker wellness metrics.
//!
//! Each pool worker carries a [`Wellness`] record. The pool reads it to pick
//! the least stressed worker and to refuse assignment to a worker that is
//! due a mandatory break. All methods take `now` explicitly so the policy
//! can be exercised without waiting on real clocks.
//!
//! The work-duration limit counts continuous activity only: the clock starts
//! with the first task after an idle spell and stops when the worker finds
//! its queue empty or rests.

use std::time::{Duration, Instant};

use crate::config::PoolConfig;

/// Wellness state of one worker.
#[derive(Debug, Clone)]
pub struct Wellness {
    consecutive_tasks: u32,
    stress: f32,
    last_rest: Instant,
    active_since: Option<Instant>,
    started_at: Instant,
    total_completed: u64,
    rests_taken: u64,
}

impl Wellness {
    /// Fresh metrics: no stress, counted as rested at `now`.
    pub fn new(now: Instant) -> Self {
        Self {
            consecutive_tasks: 0,
            stress: 0.0,
            last_rest: now,
            active_since: None,
            started_at: now,
            total_completed: 0,
            rests_taken: 0,
        }
    }

    /// Current stress in `[0, 1]`.
    pub fn stress(&self) -> f32 {
        self.stress
    }

    /// Tasks completed since the last rest.
    pub fn consecutive_tasks(&self) -> u32 {
        self.consecutive_tasks
    }

    /// Tasks completed over the worker's lifetime.
    pub fn total_completed(&self) -> u64 {
        self.total_completed
    }

    /// Whether the worker must rest before taking more work: too many
    /// consecutive tasks, working too long without a pause, or too stressed.
    pub fn needs_break(&self, policy: &PoolConfig, now: Instant) -> bool {
        self.consecutive_tasks >= policy.max_consecutive_tasks
            || self.active_for(now) >= policy.max_work_duration
            || self.stress >= policy.break_stress
    }

    /// Length of the current uninterrupted working spell.
    pub fn active_for(&self, now: Instant) -> Duration {
        self.active_since
            .map_or(Duration::ZERO, |since| now.saturating_duration_since(since))
    }

    /// Whether the work clock is running.
    pub fn is_working(&self) -> bool {
        self.active_since.is_some()
    }

    /// Start the work clock unless it is already running.
    pub fn begin_work(&mut self, now: Instant) {
        self.active_since.get_or_insert(now);
    }

    /// Stop the work clock; the worker has nothing queued.
    pub fn go_idle(&mut self) {
        self.active_since = None;
    }

    /// Account for one successfully completed task.
    ///
    /// Work soon after a rest raises stress; work later on relieves it.
    pub fn record_completion(&mut self, policy: &PoolConfig, now: Instant) {
        self.consecutive_tasks = self.consecutive_tasks.saturating_add(1);
        self.total_completed += 1;

        if now.saturating_duration_since(self.last_rest) < policy.rapid_window {
            self.stress = (self.stress + policy.stress_increment).min(1.0);
        } else {
            self.stress = (self.stress - policy.stress_relief).max(0.0);
        }
    }

    /// Account for a finished rest.
    pub fn complete_rest(&mut self, now: Instant) {
        self.stress *= 0.5;
        self.consecutive_tasks = 0;
        self.last_rest = now;
        self.active_since = None;
        self.rests_taken += 1;
    }

    /// Copy the metrics for reporting.
    pub fn snapshot(&self, now: Instant) -> WellnessSnapshot {
        WellnessSnapshot {
            stress: self.stress,
            consecutive_tasks: self.consecutive_tasks,
            total_completed: self.total_completed,
            rests_taken: self.rests_taken,
            since_rest: now.saturating_duration_since(self.last_rest),
            uptime: now.saturating_duration_since(self.started_at),
        }
    }

    #[cfg(test)]
    pub(crate) fn set_stress(&mut self, stress: f32) {
        self.stress = stress;
    }
}

/// Point-in-time copy of a worker's wellness.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WellnessSnapshot {
    /// Stress in `[0, 1]`.
    pub stress: f32,
    /// Tasks completed since the last rest.
    pub consecutive_tasks: u32,
    /// Tasks completed over the worker's lifetime.
    pub total_completed: u64,
    /// Rests completed over the worker's lifetime.
    pub rests_taken: u64,
    /// Time since the last rest (or start).
    pub since_rest: Duration,
    /// Time since the worker started.
    pub uptime: Duration,
}
