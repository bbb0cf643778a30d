//! Stall and tick-freeze detection.
//!
//! Both monitors are plain state machines fed by the harness poll loop and
//! read with an explicit `now`, so they are deterministic under paused
//! tokio time.

use std::time::Duration;

use tickwire_types::Position;
use tokio::time::Instant;

/// No progress was reported within the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StallSignal {
    /// Time since the last progress.
    pub idle: Duration,
    /// Last observed position.
    pub position: Option<Position>,
}

/// The simulation tick has not advanced within the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickFrozen {
    /// Last tick seen.
    pub last_tick: Option<u64>,
    /// Time since it last changed.
    pub frozen_for: Duration,
}

/// Tracks routine progress.
///
/// Progress is either an explicit mark by the routine (a call to
/// `progress()`) or a change of player position. Acknowledgements alone do
/// not count: a command the simulation accepts may still do nothing.
#[derive(Debug, Clone)]
pub struct ProgressMonitor {
    threshold: Duration,
    last_progress: Instant,
    last_position: Option<Position>,
}

impl ProgressMonitor {
    /// Monitor starting its idle clock at `now`.
    pub const fn new(threshold: Duration, now: Instant) -> Self {
        Self {
            threshold,
            last_progress: now,
            last_position: None,
        }
    }

    /// Record progress at `now`.
    pub const fn mark(&mut self, now: Instant) {
        self.last_progress = now;
    }

    /// Feed the current position; a change counts as progress.
    pub fn observe_position(&mut self, position: Option<Position>, now: Instant) {
        if position.is_some() && position != self.last_position {
            if self.last_position.is_some() {
                self.last_progress = now;
            }
            self.last_position = position;
        }
    }

    /// Time since the last progress.
    pub fn idle(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_progress)
    }

    /// Signal a stall if idle for longer than the threshold.
    pub fn check(&self, now: Instant) -> Option<StallSignal> {
        let idle = self.idle(now);
        (idle >= self.threshold).then_some(StallSignal {
            idle,
            position: self.last_position,
        })
    }
}

/// Tracks whether the simulation is still ticking.
#[derive(Debug, Clone)]
pub struct TickMonitor {
    threshold: Duration,
    last_tick: Option<u64>,
    last_change: Instant,
}

impl TickMonitor {
    /// Monitor starting its clock at `now`.
    pub const fn new(threshold: Duration, now: Instant) -> Self {
        Self {
            threshold,
            last_tick: None,
            last_change: now,
        }
    }

    /// Feed the latest tick.
    pub fn observe(&mut self, tick: Option<u64>, now: Instant) {
        if tick.is_some() && tick != self.last_tick {
            self.last_tick = tick;
            self.last_change = now;
        }
    }

    /// Last tick seen.
    pub const fn last_tick(&self) -> Option<u64> {
        self.last_tick
    }

    /// Signal a freeze if no new tick arrived within the threshold.
    pub fn check(&self, now: Instant) -> Option<TickFrozen> {
        let frozen_for = now.saturating_duration_since(self.last_change);
        (frozen_for >= self.threshold).then_some(TickFrozen {
            last_tick: self.last_tick,
            frozen_for,
        })
    }
}

#[cfg(test)]
#[allow(clippy::arithmetic_side_effects)]
mod tests {
    use super::*;

    const SECOND: Duration = Duration::from_secs(1);

    #[test]
    fn stalls_after_threshold_without_progress() {
        let start = Instant::now();
        let mut monitor = ProgressMonitor::new(SECOND * 10, start);
        assert!(monitor.check(start + SECOND * 9).is_none());

        monitor.mark(start + SECOND * 5);
        assert!(monitor.check(start + SECOND * 14).is_none());

        let stall = monitor.check(start + SECOND * 15);
        assert_eq!(stall.map(|s| s.idle), Some(SECOND * 10));
    }

    #[test]
    fn first_position_is_not_progress_but_moving_is() {
        let start = Instant::now();
        let mut monitor = ProgressMonitor::new(SECOND * 10, start);
        monitor.observe_position(Some(Position::new(1, 1)), start + SECOND * 8);
        assert!(monitor.check(start + SECOND * 10).is_some());

        monitor.observe_position(Some(Position::new(1, 1)), start + SECOND * 11);
        assert!(monitor.check(start + SECOND * 11).is_some());

        monitor.observe_position(Some(Position::new(2, 1)), start + SECOND * 12);
        assert!(monitor.check(start + SECOND * 12).is_none());
    }

    #[test]
    fn tick_freeze_resets_on_new_ticks() {
        let start = Instant::now();
        let mut monitor = TickMonitor::new(SECOND * 3, start);
        monitor.observe(Some(1), start + SECOND);
        monitor.observe(Some(1), start + SECOND * 3);
        assert!(monitor.check(start + SECOND * 3).is_none());

        let frozen = monitor.check(start + SECOND * 4);
        assert_eq!(
            frozen,
            Some(TickFrozen {
                last_tick: Some(1),
                frozen_for: SECOND * 3
            })
        );

        monitor.observe(Some(2), start + SECOND * 4);
        assert!(monitor.check(start + SECOND * 5).is_none());
        assert_eq!(monitor.last_tick(), Some(2));
    }

    #[test]
    fn never_ticking_counts_as_frozen() {
        let start = Instant::now();
        let monitor = TickMonitor::new(SECOND, start);
        assert_eq!(
            monitor.check(start + SECOND).map(|f| f.last_tick),
            Some(None)
        );
    }
}
