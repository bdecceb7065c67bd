use std::collections::VecDeque;

use crate::geometry::Pos;

/// Pixels per millisecond under which the pointer counts as slowing down.
pub const MOVING_AVG_THRESHOLD: f64 = 0.3;
pub const SPEED_WINDOW: usize = 10;
/// Samples closer together than this are debounced.
pub const MIN_SAMPLE_INTERVAL_MS: u64 = 20;

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanRate {
    /// No periodic scan, only explicit triggers.
    #[default]
    Moderate,
    /// Periodic scan on a fixed interval.
    Frequent,
}

/// Turns pointer motion into a scan rate decision.
///
/// A slowing pointer means the user is fine-tuning the selection, so it gets
/// live feedback via frequent scans.
#[derive(Debug, Default)]
pub struct RateController {
    last: Option<(Pos, u64)>,
    speeds: VecDeque<f64>,
    decision: ScanRate,
}

impl RateController {
    pub fn new() -> Self {
        Self {
            last: None,
            speeds: VecDeque::with_capacity(SPEED_WINDOW + 1),
            decision: ScanRate::Moderate,
        }
    }

    /// Forgets the last sample. The speed window is kept.
    pub fn reset(&mut self) {
        self.last = None;
    }

    pub fn decide(&mut self, x: i32, y: i32, now_ms: u64) -> ScanRate {
        let pos = Pos::new(x, y);
        let Some((last_pos, last_ms)) = self.last else {
            self.last = Some((pos, now_ms));
            self.decision = ScanRate::Moderate;
            return self.decision;
        };

        let elapsed = now_ms.saturating_sub(last_ms);
        if elapsed < MIN_SAMPLE_INTERVAL_MS {
            return self.decision;
        }
        self.last = Some((pos, now_ms));

        self.speeds.push_back(pos.distance(last_pos) / elapsed as f64);
        while self.speeds.len() > SPEED_WINDOW {
            self.speeds.pop_front();
        }
        if self.speeds.len() < SPEED_WINDOW {
            self.decision = ScanRate::Moderate;
            return self.decision;
        }

        // divided by the latest interval only, not the window's total time
        let moving_avg = self.speeds.iter().sum::<f64>() / elapsed as f64;
        self.decision = if moving_avg < MOVING_AVG_THRESHOLD {
            ScanRate::Frequent
        } else {
            ScanRate::Moderate
        };
        self.decision
    }

    #[cfg(test)]
    fn window_len(&self) -> usize {
        self.speeds.len()
    }
}
