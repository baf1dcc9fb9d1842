//! Signal processing for raw RSSI readings.
//!
//! Readings are smoothed per address with a one-dimensional Kalman filter and
//! then classified against the configured minimum RSSI.

pub mod kalman;
pub mod range;
pub mod smoother;

pub use kalman::KalmanFilter;
pub use range::MinRssi;
pub use smoother::SignalSmoother;
