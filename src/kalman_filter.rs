//! Adaptive scalar Kalman filter used to smooth raw path-delay samples.
//!
//! Online-estimates both measurement noise R (from a sliding window of raw
//! samples) and process noise Q (from the change in the estimate between
//! updates). Grounded on `original_source/KalmanFilter1D.{h,cpp}`; the
//! windowed-variance-floor / ratio-clamp variant (spec §4.C, §9) is the one
//! implemented here.

use std::collections::VecDeque;
use tracing::warn;

/// Tunable knobs, all with defaults matching spec §4.C.
#[derive(Debug, Clone, Copy)]
pub struct KalmanFilter1DConfig {
    pub initial_estimate: f64,
    pub window_size: usize,
    pub q_scale: f64,
    pub q_min: f64,
    pub q_max: f64,
}

impl Default for KalmanFilter1DConfig {
    fn default() -> Self {
        KalmanFilter1DConfig {
            initial_estimate: 0.0,
            window_size: 20,
            q_scale: 0.01,
            q_min: 1e-6,
            q_max: 10.0,
        }
    }
}

/// A snapshot of filter internals after an [`KalmanFilter1D::update`] call,
/// used purely for the per-update diagnostic line (spec §6).
#[derive(Debug, Clone, Copy)]
pub struct Snapshot {
    pub estimate: f64,
    pub gain: f64,
    pub measurement_noise: f64,
    pub process_noise: f64,
    pub estimate_uncertainty: f64,
    pub innovation_mean: f64,
    pub nis_mean: f64,
}

const INNOVATION_HISTORY_LEN: usize = 20;
const NIS_WARNING_THRESHOLD: f64 = 5.0;
const NIS_WARNING_STREAK: u32 = 5;

pub struct KalmanFilter1D {
    config: KalmanFilter1DConfig,

    estimate: f64,
    estimate_uncertainty: f64,
    measurement_noise: f64,
    process_noise: f64,
    gain: f64,

    prev_estimate: Option<f64>,
    measurements: VecDeque<f64>,

    innovation_history: VecDeque<f64>,
    nis_history: VecDeque<f64>,
    consecutive_high_nis: u32,
}

impl KalmanFilter1D {
    pub fn new(config: KalmanFilter1DConfig) -> Self {
        KalmanFilter1D {
            estimate: config.initial_estimate,
            estimate_uncertainty: 1.0,
            measurement_noise: 1.0,
            process_noise: 1.0,
            gain: 0.0,
            prev_estimate: None,
            measurements: VecDeque::with_capacity(config.window_size),
            innovation_history: VecDeque::with_capacity(INNOVATION_HISTORY_LEN),
            nis_history: VecDeque::with_capacity(INNOVATION_HISTORY_LEN),
            consecutive_high_nis: 0,
            config,
        }
    }

    pub fn estimate(&self) -> f64 {
        self.estimate
    }

    pub fn measurement_noise(&self) -> f64 {
        self.measurement_noise
    }

    pub fn process_noise(&self) -> f64 {
        self.process_noise
    }

    pub fn gain(&self) -> f64 {
        self.gain
    }

    pub fn estimate_uncertainty(&self) -> f64 {
        self.estimate_uncertainty
    }

    /// Feeds one scalar measurement through the filter and returns the
    /// post-update estimate, following spec §4.C's update order exactly.
    pub fn update(&mut self, measurement: f64) -> f64 {
        // 1. measurement-noise estimation from a sliding window of raw samples.
        self.measurements.push_back(measurement);
        while self.measurements.len() > self.config.window_size {
            self.measurements.pop_front();
        }
        if self.measurements.len() >= 2 {
            let n = self.measurements.len() as f64;
            let mean = self.measurements.iter().sum::<f64>() / n;
            let variance = self
                .measurements
                .iter()
                .map(|v| (v - mean) * (v - mean))
                .sum::<f64>()
                / (n - 1.0);
            self.measurement_noise = variance.max(1e-6);
        }

        // 2. process-noise estimation from the change in the prior estimate.
        if let Some(prev) = self.prev_estimate {
            let delta = (self.estimate - prev).abs();
            self.process_noise = (self.config.q_scale * delta * delta)
                .clamp(self.config.q_min, self.config.q_max);
        }
        self.prev_estimate = Some(self.estimate);

        // 3. covariance extrapolation.
        self.estimate_uncertainty += self.process_noise;

        // 4. Kalman gain, ratio-clamp variant.
        let ratio = (self.estimate_uncertainty / self.measurement_noise).clamp(0.1, 10.0);
        self.gain = ratio / (1.0 + ratio);

        // 5. state update.
        let innovation = measurement - self.estimate;
        self.estimate += self.gain * innovation;

        // 6. covariance update.
        self.estimate_uncertainty *= 1.0 - self.gain;

        // 7. diagnostics: innovation/NIS history, soft warning on a NIS streak.
        self.innovation_history.push_back(innovation);
        if self.innovation_history.len() > INNOVATION_HISTORY_LEN {
            self.innovation_history.pop_front();
        }
        let s = self.estimate_uncertainty + self.measurement_noise;
        let nis = innovation * innovation / s;
        self.nis_history.push_back(nis);
        if self.nis_history.len() > INNOVATION_HISTORY_LEN {
            self.nis_history.pop_front();
        }

        if nis > NIS_WARNING_THRESHOLD {
            self.consecutive_high_nis += 1;
            if self.consecutive_high_nis > NIS_WARNING_STREAK {
                warn!(nis, streak = self.consecutive_high_nis, "filter degraded: NIS exceeded threshold for consecutive updates");
            }
        } else {
            self.consecutive_high_nis = 0;
        }

        self.estimate
    }

    pub fn snapshot(&self) -> Snapshot {
        let n = self.innovation_history.len().max(1) as f64;
        Snapshot {
            estimate: self.estimate,
            gain: self.gain,
            measurement_noise: self.measurement_noise,
            process_noise: self.process_noise,
            estimate_uncertainty: self.estimate_uncertainty,
            innovation_mean: self.innovation_history.iter().sum::<f64>() / n,
            nis_mean: self.nis_history.iter().sum::<f64>() / n,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_input_converges() {
        let mut filter = KalmanFilter1D::new(KalmanFilter1DConfig {
            initial_estimate: 5.0,
            ..Default::default()
        });
        let mut last = 5.0;
        for _ in 0..200 {
            last = filter.update(5.0);
        }
        assert!((last - 5.0).abs() < 1e-3);
        assert!((filter.process_noise() - filter.config.q_min).abs() < 1e-9);
        assert!(filter.gain() < 0.05);
    }

    #[test]
    fn step_input_converges_within_ten_samples() {
        let mut filter = KalmanFilter1D::new(KalmanFilter1DConfig {
            initial_estimate: 0.0,
            ..Default::default()
        });
        for _ in 0..50 {
            filter.update(0.0);
        }
        let mut prev = filter.estimate();
        let mut monotonic = true;
        for i in 0..10 {
            let cur = filter.update(100.0);
            if cur < prev {
                monotonic = false;
            }
            prev = cur;
            if i == 9 {
                assert!((cur - 100.0).abs() < 30.0, "expected convergence, got {cur}");
            }
        }
        assert!(monotonic, "estimate should be non-decreasing after the step");
    }

    #[test]
    fn window_invariant_holds_after_w_updates() {
        let mut filter = KalmanFilter1D::new(KalmanFilter1DConfig::default());
        for i in 0..30 {
            filter.update(i as f64);
        }
        assert_eq!(filter.measurements.len(), filter.config.window_size);
    }

    #[test]
    fn r_never_drops_below_floor() {
        let mut filter = KalmanFilter1D::new(KalmanFilter1DConfig::default());
        for _ in 0..50 {
            filter.update(3.0);
            assert!(filter.measurement_noise() >= 1e-6);
        }
    }

    #[test]
    fn q_stays_within_bounds_after_second_update() {
        let mut filter = KalmanFilter1D::new(KalmanFilter1DConfig::default());
        filter.update(1.0);
        for i in 0..50 {
            filter.update(i as f64 * 0.3);
            assert!(filter.process_noise() >= filter.config.q_min);
            assert!(filter.process_noise() <= filter.config.q_max);
        }
    }
}
