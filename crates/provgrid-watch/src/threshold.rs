//! Threshold state machine for one (watch, instance) pair.
//!
//! ```text
//!            value > high                 value < low
//!   Normal ───────────────▶ BreachedHigh  Normal ──────────────▶ BreachedLow
//!   Normal ◀─────────────── BreachedHigh  Normal ◀────────────── BreachedLow
//!          value <= high - margin                value >= low + margin
//! ```
//!
//! Events are emitted on transitions only. Transition logic runs on sample
//! timestamps: a sample older than the newest one already seen is ignored,
//! so delivered events are never re-emitted or reordered.

use tracing::debug;

use provgrid_state::{Direction, SlaSpec, ThresholdEvent, WatchSample};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdState {
    Normal,
    BreachedHigh,
    BreachedLow,
}

/// Hysteresis tracker for a single watch on a single instance.
#[derive(Debug, Clone)]
pub struct ThresholdTracker {
    low: f64,
    high: f64,
    margin: f64,
    state: ThresholdState,
    /// Timestamp of the newest sample applied.
    last_timestamp: Option<u64>,
}

impl ThresholdTracker {
    pub fn new(sla: &SlaSpec) -> Self {
        Self {
            low: sla.low,
            high: sla.high,
            margin: sla.clear_margin,
            state: ThresholdState::Normal,
            last_timestamp: None,
        }
    }

    /// Apply new thresholds. The current state is kept; the next sample
    /// is judged against the new values.
    pub fn reconfigure(&mut self, sla: &SlaSpec) {
        self.low = sla.low;
        self.high = sla.high;
        self.margin = sla.clear_margin;
    }

    pub fn state(&self) -> ThresholdState {
        self.state
    }

    /// Feed one sample; returns the events for any transitions it caused.
    ///
    /// A value that jumps from one breach straight past the opposite
    /// threshold yields `Cleared` followed by the new breach.
    pub fn observe(&mut self, sample: &WatchSample) -> Vec<ThresholdEvent> {
        if let Some(last) = self.last_timestamp
            && sample.timestamp < last
        {
            debug!(
                element = %sample.element,
                watch = %sample.watch,
                instance = sample.instance_id,
                timestamp = sample.timestamp,
                newest = last,
                "late sample ignored for threshold transitions"
            );
            return Vec::new();
        }
        self.last_timestamp = Some(sample.timestamp);

        let value = sample.value;
        let mut directions = Vec::new();

        if self.state == ThresholdState::BreachedHigh && value <= self.high - self.margin {
            self.state = ThresholdState::Normal;
            directions.push(Direction::Cleared);
        }
        if self.state == ThresholdState::BreachedLow && value >= self.low + self.margin {
            self.state = ThresholdState::Normal;
            directions.push(Direction::Cleared);
        }
        if self.state == ThresholdState::Normal {
            if value > self.high {
                self.state = ThresholdState::BreachedHigh;
                directions.push(Direction::BreachedHigh);
            } else if value < self.low {
                self.state = ThresholdState::BreachedLow;
                directions.push(Direction::BreachedLow);
            }
        }

        directions
            .into_iter()
            .map(|direction| ThresholdEvent {
                element: sample.element.clone(),
                watch: sample.watch.clone(),
                instance_id: sample.instance_id,
                direction,
                value,
                timestamp: sample.timestamp,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use provgrid_state::ElementId;

    fn sla(low: f64, high: f64, margin: f64) -> SlaSpec {
        SlaSpec {
            watch: "cpu".to_string(),
            low,
            high,
            clear_margin: margin,
            sample_interval_ms: 1_000,
            rule: None,
        }
    }

    fn sample(value: f64, timestamp: u64) -> WatchSample {
        WatchSample {
            element: ElementId::new("shop", "api"),
            watch: "cpu".to_string(),
            instance_id: 1,
            value,
            timestamp,
        }
    }

    fn directions(tracker: &mut ThresholdTracker, values: &[(f64, u64)]) -> Vec<Direction> {
        values
            .iter()
            .flat_map(|&(v, t)| tracker.observe(&sample(v, t)))
            .map(|e| e.direction)
            .collect()
    }

    #[test]
    fn breach_emitted_once_then_cleared_past_margin() {
        let mut tracker = ThresholdTracker::new(&sla(0.2, 0.8, 0.05));
        let got = directions(
            &mut tracker,
            &[(0.85, 1), (0.86, 2), (0.90, 3), (0.78, 4), (0.75, 5)],
        );
        assert_eq!(got, vec![Direction::BreachedHigh, Direction::Cleared]);
        assert_eq!(tracker.state(), ThresholdState::Normal);
    }

    #[test]
    fn boundary_value_does_not_breach() {
        let mut tracker = ThresholdTracker::new(&sla(0.2, 0.8, 0.0));
        assert!(tracker.observe(&sample(0.8, 1)).is_empty());
        assert!(tracker.observe(&sample(0.2, 2)).is_empty());
    }

    #[test]
    fn low_breach_and_clear() {
        let mut tracker = ThresholdTracker::new(&sla(0.2, 0.8, 0.05));
        let got = directions(&mut tracker, &[(0.1, 1), (0.22, 2), (0.25, 3)]);
        assert_eq!(got, vec![Direction::BreachedLow, Direction::Cleared]);
    }

    #[test]
    fn jump_across_both_thresholds() {
        let mut tracker = ThresholdTracker::new(&sla(0.2, 0.8, 0.05));
        let got = directions(&mut tracker, &[(0.9, 1), (0.1, 2)]);
        assert_eq!(
            got,
            vec![Direction::BreachedHigh, Direction::Cleared, Direction::BreachedLow]
        );
    }

    #[test]
    fn late_sample_is_ignored() {
        let mut tracker = ThresholdTracker::new(&sla(0.2, 0.8, 0.05));
        assert_eq!(tracker.observe(&sample(0.9, 10)).len(), 1);
        // Older sample would clear, but it arrives late.
        assert!(tracker.observe(&sample(0.5, 5)).is_empty());
        assert_eq!(tracker.state(), ThresholdState::BreachedHigh);
    }

    #[test]
    fn events_alternate() {
        let mut tracker = ThresholdTracker::new(&sla(0.2, 0.8, 0.05));
        let values = [0.9, 0.95, 0.5, 0.1, 0.05, 0.9, 0.5, 0.5, 0.85, 0.1];
        let got: Vec<Direction> = values
            .iter()
            .enumerate()
            .flat_map(|(i, &v)| tracker.observe(&sample(v, i as u64)))
            .map(|e| e.direction)
            .collect();

        for pair in got.windows(2) {
            let breach = |d: Direction| d != Direction::Cleared;
            assert_ne!(breach(pair[0]), breach(pair[1]), "{got:?}");
        }
    }

    #[test]
    fn reconfigure_keeps_state() {
        let mut tracker = ThresholdTracker::new(&sla(0.2, 0.8, 0.0));
        tracker.observe(&sample(0.85, 1));
        tracker.reconfigure(&sla(0.2, 0.9, 0.0));
        assert_eq!(tracker.state(), ThresholdState::BreachedHigh);
        let got = directions(&mut tracker, &[(0.87, 2)]);
        assert_eq!(got, vec![Direction::Cleared]);
    }
}
