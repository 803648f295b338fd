//! Rolling statistics over a fixed window of samples.
//!
//! Definitions, with `w` the samples currently in the window and `dt` the sample
//! interval in seconds:
//!
//! | statistic      | definition                                   |
//! |----------------|----------------------------------------------|
//! | `mean`         | arithmetic mean of `w`                       |
//! | `rms`          | `sqrt(mean(w²))`                             |
//! | `std`          | population standard deviation of `w`         |
//! | `gradient`     | `(last - previous) / dt`                     |
//! | `acceleration` | `(gradient - previous gradient) / dt`        |
//! | `sum`          | sum of every sample pushed, not just `w`     |

use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

/// Window size when none is configured.
pub const DEFAULT_WINDOW: usize = 128;

/// Point-in-time view of a [`RollingStatistics`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatisticsSnapshot {
    /// Values in the window.
    pub samples: usize,
    /// Arithmetic mean.
    pub mean: Option<f64>,
    /// Root mean square.
    pub rms: Option<f64>,
    /// Population standard deviation.
    pub std: Option<f64>,
    /// First derivative at the newest sample.
    pub gradient: Option<f64>,
    /// Second derivative at the newest sample.
    pub acceleration: Option<f64>,
    /// Running total of every sample pushed.
    pub sum: f64,
}

/// Statistics over the most recent samples of one column.
#[derive(Debug, Clone)]
pub struct RollingStatistics {
    window: VecDeque<f64>,
    capacity: usize,
    dt: f64,
    sum: f64,
    gradient: Option<f64>,
    acceleration: Option<f64>,
}

impl RollingStatistics {
    /// Window of `capacity` samples spaced `interval` apart.
    pub fn new(capacity: usize, interval: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            dt: interval.as_secs_f64(),
            sum: 0.0,
            gradient: None,
            acceleration: None,
        }
    }

    /// Non-finite samples are ignored.
    pub fn push(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(value);
        self.sum += value;

        let n = self.window.len();
        if n < 2 || self.dt <= 0.0 {
            return;
        }
        let gradient = (self.window[n - 1] - self.window[n - 2]) / self.dt;
        self.acceleration = self.gradient.map(|previous| (gradient - previous) / self.dt);
        self.gradient = Some(gradient);
    }

    /// Push several values.
    pub fn extend(&mut self, values: impl IntoIterator<Item = f64>) {
        for value in values {
            self.push(value);
        }
    }

    /// Samples currently held.
    pub fn len(&self) -> usize {
        self.window.len()
    }

    /// True before the first push.
    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Mean of the window.
    pub fn mean(&self) -> Option<f64> {
        if self.window.is_empty() {
            return None;
        }
        Some(self.window.iter().sum::<f64>() / self.window.len() as f64)
    }

    /// RMS of the window.
    pub fn rms(&self) -> Option<f64> {
        if self.window.is_empty() {
            return None;
        }
        let mean_square = self.window.iter().map(|v| v * v).sum::<f64>() / self.window.len() as f64;
        Some(mean_square.sqrt())
    }

    /// Standard deviation of the window.
    pub fn std(&self) -> Option<f64> {
        let mean = self.mean()?;
        let variance = self
            .window
            .iter()
            .map(|v| (v - mean).powi(2))
            .sum::<f64>()
            / self.window.len() as f64;
        Some(variance.sqrt())
    }

    /// Rate of change per second.
    pub fn gradient(&self) -> Option<f64> {
        self.gradient
    }

    /// Change of the rate per second.
    pub fn acceleration(&self) -> Option<f64> {
        self.acceleration
    }

    /// Running total of every sample pushed.
    pub fn sum(&self) -> f64 {
        self.sum
    }

    /// All statistics at once.
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            samples: self.window.len(),
            mean: self.mean(),
            rms: self.rms(),
            std: self.std(),
            gradient: self.gradient,
            acceleration: self.acceleration,
            sum: self.sum,
        }
    }
}
