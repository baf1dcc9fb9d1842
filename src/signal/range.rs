//! Minimum RSSI thresholds.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Key of the fallback entry in a per-address threshold map.
pub const DEFAULT_KEY: &str = "default";

/// Configured minimum RSSI, either one value for every address or a map of
/// per-address values with an optional `"default"` fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MinRssi {
    Global(f64),
    PerAddress(HashMap<String, f64>),
}

impl MinRssi {
    /// Effective threshold for `address`: the per-address entry, then the
    /// map's default entry, then the global value.
    pub fn threshold_for(&self, address: &str) -> Option<f64> {
        match self {
            MinRssi::Global(value) => Some(*value),
            MinRssi::PerAddress(map) => map
                .get(address)
                .or_else(|| map.get(DEFAULT_KEY))
                .copied(),
        }
    }
}

/// Whether `rssi` falls below the threshold configured for `address`.
///
/// A reading equal to the threshold is in range; without any threshold every
/// reading is in range.
pub fn is_out_of_range(min_rssi: Option<&MinRssi>, address: &str, rssi: f64) -> bool {
    match min_rssi.and_then(|m| m.threshold_for(address)) {
        Some(threshold) => rssi < threshold,
        None => false,
    }
}
