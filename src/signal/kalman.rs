//! Scalar Kalman filter for noisy RSSI series.
//!
//! Static model: state transition 1, no control input, direct observation.

/// One-dimensional Kalman filter.
#[derive(Debug, Clone)]
pub struct KalmanFilter {
    /// Process noise (R).
    process_noise: f64,
    /// Measurement noise (Q).
    measurement_noise: f64,
    /// Current estimate, `None` until the first reading.
    estimate: Option<f64>,
    /// Estimate covariance.
    covariance: f64,
}

impl KalmanFilter {
    pub fn new(process_noise: f64, measurement_noise: f64) -> Self {
        Self {
            process_noise,
            measurement_noise,
            estimate: None,
            covariance: 0.0,
        }
    }

    /// Feed a reading and return the new estimate.
    pub fn filter(&mut self, measurement: f64) -> f64 {
        let estimate = match self.estimate {
            None => {
                self.covariance = self.measurement_noise;
                measurement
            }
            Some(previous) => {
                let predicted_cov = self.covariance + self.process_noise;
                let gain = predicted_cov / (predicted_cov + self.measurement_noise);
                self.covariance = predicted_cov - gain * predicted_cov;
                previous + gain * (measurement - previous)
            }
        };
        self.estimate = Some(estimate);
        estimate
    }

    /// Last estimate, if any reading was filtered yet.
    pub fn last_estimate(&self) -> Option<f64> {
        self.estimate
    }
}
