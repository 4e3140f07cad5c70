//! Throughput smoothing and time-left estimates for transfers

use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

/// Mean of the last `window` samples
#[derive(Debug, Clone)]
pub struct MovingAverage {
    window: usize,
    samples: VecDeque<f64>,
    sum: f64,
}

impl MovingAverage {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            samples: VecDeque::with_capacity(window),
            sum: 0.0,
        }
    }

    /// Add a sample and return the new mean.
    pub fn update(&mut self, value: f64) -> f64 {
        if self.samples.len() == self.window {
            if let Some(old) = self.samples.pop_front() {
                self.sum -= old;
            }
        }
        self.samples.push_back(value);
        self.sum += value;
        self.sum / self.samples.len() as f64
    }

    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            None
        } else {
            Some(self.sum / self.samples.len() as f64)
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.sum = 0.0;
    }
}

/// Smoothed bytes-per-second from cumulative byte counts. Rate samples are
/// taken at most once per `min_interval`.
#[derive(Debug, Clone)]
pub struct ThroughputMeter {
    avg: MovingAverage,
    last: Option<(Instant, u64)>,
    min_interval: Duration,
}

impl ThroughputMeter {
    pub fn new(window: usize) -> Self {
        Self {
            avg: MovingAverage::new(window),
            last: None,
            min_interval: Duration::from_secs(1),
        }
    }

    /// Feed the cumulative byte count; returns the smoothed rate, if known.
    pub fn sample(&mut self, bytes: u64, now: Instant) -> Option<f64> {
        let Some((t0, b0)) = self.last else {
            self.last = Some((now, bytes));
            self.avg.clear();
            return None;
        };
        let dt = now.saturating_duration_since(t0);
        if dt < self.min_interval {
            return self.avg.mean();
        }
        let bps = bytes.saturating_sub(b0) as f64 / dt.as_secs_f64();
        self.last = Some((now, bytes));
        Some(self.avg.update(bps))
    }

    pub fn rate(&self) -> Option<f64> {
        self.avg.mean()
    }

    pub fn reset(&mut self) {
        self.last = None;
        self.avg.clear();
    }
}

/// Estimated time left
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Eta {
    Remaining(Duration),
    /// Longer than the display horizon; carries the horizon
    Beyond(Duration),
}

impl Eta {
    /// `None` when no positive rate is known.
    pub fn estimate(remaining_bytes: u64, rate_bps: f64, horizon: Duration) -> Option<Eta> {
        if !rate_bps.is_finite() || rate_bps <= 0.0 {
            return None;
        }
        let secs = remaining_bytes as f64 / rate_bps;
        if secs > horizon.as_secs_f64() {
            Some(Eta::Beyond(horizon))
        } else {
            Some(Eta::Remaining(Duration::from_secs_f64(secs)))
        }
    }
}

impl fmt::Display for Eta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Eta::Remaining(d) => f.write_str(&format_hms(*d)),
            Eta::Beyond(d) => write!(f, "+{}", format_hms(*d)),
        }
    }
}

pub fn format_hms(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moving_average_keeps_last_window() {
        let mut avg = MovingAverage::new(3);
        assert_eq!(avg.mean(), None);
        avg.update(1.0);
        avg.update(2.0);
        assert_eq!(avg.update(3.0), 2.0);
        assert_eq!(avg.update(10.0), 5.0);
        assert_eq!(avg.len(), 3);
    }

    #[test]
    fn meter_samples_at_most_once_per_second() {
        let mut meter = ThroughputMeter::new(25);
        let t0 = Instant::now();
        assert_eq!(meter.sample(0, t0), None);
        assert_eq!(meter.sample(500, t0 + Duration::from_millis(300)), None);
        let rate = meter.sample(2000, t0 + Duration::from_secs(2)).unwrap();
        assert!((rate - 1000.0).abs() < 1e-6);
        let again = meter.sample(2100, t0 + Duration::from_millis(2500)).unwrap();
        assert!((again - 1000.0).abs() < 1e-6, "sub-second sample reuses the mean");
    }

    #[test]
    fn eta_is_capped_at_horizon() {
        let horizon = Duration::from_secs(180 * 60);
        let eta = Eta::estimate(1_000, 10.0, horizon).unwrap();
        assert_eq!(eta, Eta::Remaining(Duration::from_secs(100)));
        assert_eq!(eta.to_string(), "00:01:40");

        let far = Eta::estimate(1_000_000_000, 1.0, horizon).unwrap();
        assert_eq!(far, Eta::Beyond(horizon));
        assert_eq!(far.to_string(), "+03:00:00");

        assert_eq!(Eta::estimate(10, 0.0, horizon), None);
    }
}
