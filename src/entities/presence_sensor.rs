//! Room presence sensor fed by distance readings from every instance.
//!
//! Each cluster instance reports its own distance to the device. The sensor
//! state is the name of the closest instance that still has the device in
//! range, or [`NOT_HOME`] when none does. Readings older than the configured
//! timeout are dropped by [`PresenceSensor::check_for_timeout`].

use log::{debug, info};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

pub const NOT_HOME: &str = "not_home";

#[derive(Debug, Clone, PartialEq)]
pub struct DistanceEntry {
    pub distance: f64,
    pub out_of_range: bool,
    pub last_updated: Instant,
}

pub struct PresenceSensor {
    id: String,
    name: String,
    /// Seconds of silence after which an instance's reading is dropped.
    timeout: AtomicU64,
    distances: RwLock<HashMap<String, DistanceEntry>>,
    state: RwLock<String>,
    version: AtomicU32,
}

impl PresenceSensor {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            timeout: AtomicU64::new(0),
            distances: RwLock::new(HashMap::new()),
            state: RwLock::new(NOT_HOME.to_string()),
            version: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timeout(&self) -> u64 {
        self.timeout.load(Ordering::SeqCst)
    }

    pub fn set_timeout(&self, seconds: u64) {
        self.timeout.store(seconds, Ordering::SeqCst);
    }

    /// Closest in-range instance, or [`NOT_HOME`].
    pub fn state(&self) -> String {
        self.state.read().clone()
    }

    /// Incremented each time the state changes.
    pub fn version(&self) -> u32 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn distance_from(&self, instance: &str) -> Option<DistanceEntry> {
        self.distances.read().get(instance).cloned()
    }

    /// Record the distance `instance` measured to this device.
    pub fn handle_new_distance(&self, instance: &str, distance: f64, out_of_range: bool) {
        self.handle_new_distance_at(instance, distance, out_of_range, Instant::now());
    }

    fn handle_new_distance_at(
        &self,
        instance: &str,
        distance: f64,
        out_of_range: bool,
        now: Instant,
    ) {
        debug!(
            "[Sensor] {}: {} reports distance {:.2}{}",
            self.id,
            instance,
            distance,
            if out_of_range { " (out of range)" } else { "" }
        );
        let mut distances = self.distances.write();
        distances.insert(
            instance.to_string(),
            DistanceEntry {
                distance,
                out_of_range,
                last_updated: now,
            },
        );
        self.update_state(&distances);
    }

    /// Drop readings that have not been refreshed within the timeout.
    pub fn check_for_timeout(&self) {
        self.check_for_timeout_at(Instant::now());
    }

    fn check_for_timeout_at(&self, now: Instant) {
        let timeout = Duration::from_secs(self.timeout());
        let mut distances = self.distances.write();
        let before = distances.len();
        distances.retain(|_, entry| now.saturating_duration_since(entry.last_updated) <= timeout);
        let removed = before - distances.len();

        if removed > 0 {
            debug!("[Sensor] {}: {} stale reading(s) dropped", self.id, removed);
            self.update_state(&distances);
        }
    }

    /// Must be called with the `distances` write guard held.
    fn update_state(&self, distances: &HashMap<String, DistanceEntry>) {
        let closest = distances
            .iter()
            .filter(|(_, entry)| !entry.out_of_range)
            .min_by(|(_, a), (_, b)| a.distance.total_cmp(&b.distance))
            .map(|(instance, _)| instance.clone())
            .unwrap_or_else(|| NOT_HOME.to_string());

        let mut state = self.state.write();
        if *state != closest {
            info!("[Sensor] {} is now {}", self.name, closest);
            *state = closest;
            self.version.fetch_add(1, Ordering::SeqCst);
        }
    }
}
