use std::collections::VecDeque;

const MS_PER_HOUR: f64 = 3_600_000.0;

/// Derivatives smaller than this (°C/h) are treated as "no movement".
pub const DERIVATIVE_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub timestamp_ms: u64,
    pub value: f64,
}

/// Time-bounded buffer of readings. Eviction is by age relative to the newest
/// sample, never by count.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleWindow {
    window_ms: u64,
    samples: VecDeque<Sample>,
}

impl SampleWindow {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            samples: VecDeque::new(),
        }
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn newest(&self) -> Option<Sample> {
        self.samples.back().copied()
    }

    /// Appends a reading. Non-finite values and readings older than the newest
    /// retained sample are dropped; a reading at the newest timestamp replaces it.
    pub fn record(&mut self, timestamp_ms: u64, value: f64) -> bool {
        if !value.is_finite() {
            return false;
        }
        match self.samples.back_mut() {
            Some(last) if timestamp_ms < last.timestamp_ms => return false,
            Some(last) if timestamp_ms == last.timestamp_ms => last.value = value,
            _ => self.samples.push_back(Sample {
                timestamp_ms,
                value,
            }),
        }
        self.expire(timestamp_ms);
        true
    }

    /// Drops samples older than the window as seen from `now_ms`.
    pub fn expire(&mut self, now_ms: u64) {
        let cutoff = now_ms.saturating_sub(self.window_ms);
        while self
            .samples
            .front()
            .is_some_and(|sample| sample.timestamp_ms < cutoff)
        {
            self.samples.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Slope between the oldest and newest retained samples in °C/h, rounded
    /// to 0.1. `None` means no trend is available.
    pub fn derivative(&self) -> Option<f64> {
        if self.samples.len() < 2 {
            return None;
        }
        let oldest = self.samples.front()?;
        let newest = self.samples.back()?;
        let elapsed_ms = newest.timestamp_ms.saturating_sub(oldest.timestamp_ms);
        if elapsed_ms == 0 {
            return None;
        }
        let per_hour = (newest.value - oldest.value) / (elapsed_ms as f64 / MS_PER_HOUR);
        Some(round_tenth(per_hour))
    }
}

/// Minutes until `current` reaches `target` at `derivative` °C/h.
///
/// Undefined when there is no trend, the trend is flat or points away from
/// the target, or the target has already been reached.
pub fn eta_minutes(current: f64, target: f64, derivative: Option<f64>) -> Option<f64> {
    let derivative = derivative?;
    if !current.is_finite() || !target.is_finite() || !derivative.is_finite() {
        return None;
    }
    if derivative.abs() < DERIVATIVE_EPSILON {
        return None;
    }
    let delta = target - current;
    if delta <= 0.0 || delta * derivative <= 0.0 {
        return None;
    }
    Some(delta / derivative * 60.0)
}

pub fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivative_needs_two_samples() {
        let mut window = SampleWindow::new(900_000);
        assert_eq!(window.derivative(), None);

        window.record(0, 18.0);
        assert_eq!(window.derivative(), None);
    }

    #[test]
    fn derivative_over_one_hour() {
        let mut window = SampleWindow::new(7_200_000);
        window.record(1_000, 18.0);
        window.record(3_601_000, 19.0);

        assert_eq!(window.derivative(), Some(1.0));
    }

    #[test]
    fn same_timestamp_replaces_and_keeps_derivative_undefined() {
        let mut window = SampleWindow::new(900_000);
        window.record(5_000, 20.0);
        window.record(5_000, 20.4);

        assert_eq!(window.len(), 1);
        assert_eq!(window.newest().map(|s| s.value), Some(20.4));
        assert_eq!(window.derivative(), None);
    }

    #[test]
    fn evicts_by_age_not_count() {
        let mut window = SampleWindow::new(900_000);
        for minute in 0..=20u64 {
            window.record(minute * 60_000, 20.0 + minute as f64 * 0.1);
        }

        // Samples older than 15 minutes before the newest one are gone.
        assert_eq!(window.len(), 16);
        assert_eq!(window.derivative(), Some(6.0));
    }

    #[test]
    fn rejects_non_finite_and_out_of_order() {
        let mut window = SampleWindow::new(900_000);
        assert!(window.record(10_000, 19.0));
        assert!(!window.record(20_000, f64::NAN));
        assert!(!window.record(5_000, 18.0));
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn expire_drops_stale_samples() {
        let mut window = SampleWindow::new(900_000);
        window.record(0, 19.0);
        window.record(60_000, 19.1);

        window.expire(2_000_000);
        assert!(window.is_empty());
    }

    #[test]
    fn eta_examples() {
        assert_eq!(eta_minutes(17.0, 20.0, Some(1.0)), Some(180.0));
        assert_eq!(eta_minutes(17.0, 20.0, Some(0.0)), None);
        assert_eq!(eta_minutes(17.0, 20.0, None), None);
        assert_eq!(eta_minutes(17.0, 20.0, Some(-0.5)), None);
        assert_eq!(eta_minutes(20.0, 20.0, Some(1.0)), None);
        assert_eq!(eta_minutes(21.0, 20.0, Some(-1.0)), None);
        assert_eq!(eta_minutes(17.0, 20.0, Some(1e-9)), None);
    }
}
