//! Per-address RSSI smoothing.

use super::kalman::KalmanFilter;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Owns one [`KalmanFilter`] per address.
///
/// Filters are created on the first reading of an address and live for the
/// rest of the process. Filters of different addresses never share state.
pub struct SignalSmoother {
    process_noise: f64,
    measurement_noise: f64,
    filters: Mutex<HashMap<String, KalmanFilter>>,
}

impl SignalSmoother {
    pub fn new(process_noise: f64, measurement_noise: f64) -> Self {
        Self {
            process_noise,
            measurement_noise,
            filters: Mutex::new(HashMap::new()),
        }
    }

    /// Smooth `rssi` with the filter belonging to `address`.
    pub fn filter(&self, address: &str, rssi: f64) -> f64 {
        let mut filters = self.filters.lock();
        filters
            .entry(address.to_string())
            .or_insert_with(|| KalmanFilter::new(self.process_noise, self.measurement_noise))
            .filter(rssi)
    }

    /// Addresses that have a filter.
    pub fn tracked_addresses(&self) -> Vec<String> {
        self.filters.lock().keys().cloned().collect()
    }
}
