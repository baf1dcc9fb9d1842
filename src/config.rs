use crate::error::{CoordinatorError, Result};
use crate::radio::hcitool::is_valid_address;
use crate::signal::range::MinRssi;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Fraction of the inquiry interval a single RSSI query may take before it
/// is killed.
const DEFAULT_QUERY_BUDGET: f64 = 0.75;

/// Load `KEY=value` pairs from a dotenv file into the process environment.
///
/// Values may contain spaces without quoting; surrounding quotes are stripped.
/// Variables that are already set win over the file. Returns the number of
/// variables that were set.
pub fn load_dotenv(path: &Path) -> usize {
    let Ok(content) = fs::read_to_string(path) else {
        return 0;
    };

    let mut loaded = 0;
    for line in content.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = strip_quotes(value.trim());

        if std::env::var_os(key).is_none() {
            // SAFETY: called from main before the tokio runtime spawns threads
            unsafe { std::env::set_var(key, value) };
            loaded += 1;
        }
    }
    loaded
}

fn strip_quotes(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Name this node uses in the cluster and in published measurements.
    pub instance_name: String,
    pub bluetooth: BluetoothConfig,
    pub cluster: ClusterConfig,
    pub mqtt: MqttConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BluetoothConfig {
    /// Address roster, in scheduling order.
    pub addresses: Vec<String>,
    /// Index of the `hciN` adapter.
    pub hci_device_id: u32,
    /// Seconds between scheduling ticks.
    pub interval: f64,
    /// Number of silent rotations after which a distance reading goes stale.
    pub timeout_cycles: u32,
    pub min_rssi: Option<MinRssi>,
    /// Time budget for a single RSSI query in seconds.
    /// Defaults to three quarters of `interval`.
    pub query_timeout: Option<f64>,
    /// Kalman filter process noise (R).
    pub process_noise: f64,
    /// Kalman filter measurement noise (Q).
    pub measurement_noise: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ClusterMode {
    /// Single node, always leader.
    Standalone,
    /// Membership and messaging over an MQTT broker.
    Mqtt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClusterConfig {
    pub mode: ClusterMode,
    pub topic_prefix: String,
    /// Seconds between membership heartbeats.
    pub heartbeat_interval: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            instance_name: gethostname::gethostname().to_string_lossy().into_owned(),
            bluetooth: BluetoothConfig::default(),
            cluster: ClusterConfig::default(),
            mqtt: MqttConfig::default(),
        }
    }
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            addresses: Vec::new(),
            hci_device_id: 0,
            interval: 10.0,
            timeout_cycles: 2,
            min_rssi: None,
            query_timeout: None,
            process_noise: 0.008,
            measurement_noise: 4.0,
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            mode: ClusterMode::Mqtt,
            topic_prefix: "bt-presence".to_string(),
            heartbeat_interval: 5,
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            client_id: format!("bt-presence-{}", uuid::Uuid::new_v4().simple()),
            username: None,
            password: None,
        }
    }
}

impl BluetoothConfig {
    pub fn interval_duration(&self) -> Duration {
        Duration::from_secs_f64(self.interval)
    }

    pub fn query_timeout_duration(&self) -> Duration {
        Duration::from_secs_f64(
            self.query_timeout
                .unwrap_or(self.interval * DEFAULT_QUERY_BUDGET),
        )
    }

    /// Seconds a presence sensor tolerates silence from an instance.
    ///
    /// Scales with `cluster_size` because each address is only measured once
    /// per rotation.
    pub fn sensor_timeout(&self, cluster_size: usize) -> u64 {
        let cycles = self.timeout_cycles as f64 * cluster_size as f64;
        (cycles * self.interval).ceil() as u64
    }
}

impl Config {
    /// Default location of the JSON configuration file.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("bt-presence-coordinator").join("config.json"))
    }

    /// Build the configuration from defaults, an optional JSON file, and the
    /// process environment, in that order.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Apply `KEY=value` overrides resolved through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup("INSTANCE_NAME") {
            self.instance_name = name;
        }

        if let Some(addresses) = lookup("BT_ADDRESSES") {
            self.bluetooth.addresses = addresses
                .split(',')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(id) = lookup("BT_HCI_DEVICE_ID")
            && let Ok(id) = id.parse()
        {
            self.bluetooth.hci_device_id = id;
        }
        if let Some(interval) = lookup("BT_INTERVAL")
            && let Ok(interval) = interval.parse()
        {
            self.bluetooth.interval = interval;
        }
        if let Some(cycles) = lookup("BT_TIMEOUT_CYCLES")
            && let Ok(cycles) = cycles.parse()
        {
            self.bluetooth.timeout_cycles = cycles;
        }
        if let Some(min_rssi) = lookup("BT_MIN_RSSI") {
            self.bluetooth.min_rssi = Some(serde_json::from_str(&min_rssi)?);
        }

        if let Some(mode) = lookup("CLUSTER_MODE") {
            self.cluster.mode = mode.parse().map_err(|_| {
                CoordinatorError::InvalidConfig(format!("unknown cluster mode '{}'", mode))
            })?;
        }

        if let Some(host) = lookup("MQTT_BROKER_HOST") {
            self.mqtt.broker_host = host;
        }
        if let Some(port) = lookup("MQTT_BROKER_PORT")
            && let Ok(port) = port.parse()
        {
            self.mqtt.broker_port = port;
        }
        if let Some(client_id) = lookup("MQTT_CLIENT_ID") {
            self.mqtt.client_id = client_id;
        }
        if let Some(username) = lookup("MQTT_USERNAME") {
            self.mqtt.username = Some(username);
        }
        if let Some(password) = lookup("MQTT_PASSWORD") {
            self.mqtt.password = Some(password);
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.instance_name.trim().is_empty() {
            return Err(CoordinatorError::InvalidConfig(
                "instance name must not be empty".to_string(),
            ));
        }
        if self.cluster.mode == ClusterMode::Mqtt
            && self.instance_name.contains(['/', '+', '#'])
        {
            return Err(CoordinatorError::InvalidConfig(format!(
                "instance name '{}' must not contain '/', '+' or '#'",
                self.instance_name
            )));
        }

        let bt = &self.bluetooth;
        if bt.addresses.is_empty() {
            return Err(CoordinatorError::InvalidConfig(
                "at least one address must be configured".to_string(),
            ));
        }
        // Addresses end up inside a shell command line.
        if let Some(bad) = bt.addresses.iter().find(|a| !is_valid_address(a)) {
            return Err(CoordinatorError::InvalidConfig(format!(
                "invalid address '{}'",
                bad
            )));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = bt
            .addresses
            .iter()
            .find(|a| !seen.insert(a.to_ascii_uppercase()))
        {
            return Err(CoordinatorError::InvalidConfig(format!(
                "address '{}' is listed more than once",
                dup
            )));
        }
        if !(bt.interval.is_finite() && bt.interval > 0.0) {
            return Err(CoordinatorError::InvalidConfig(
                "interval must be a positive number of seconds".to_string(),
            ));
        }
        if bt.timeout_cycles == 0 {
            return Err(CoordinatorError::InvalidConfig(
                "timeoutCycles must be at least 1".to_string(),
            ));
        }
        if let Some(timeout) = bt.query_timeout
            && !(timeout.is_finite() && timeout > 0.0)
        {
            return Err(CoordinatorError::InvalidConfig(
                "queryTimeout must be a positive number of seconds".to_string(),
            ));
        }
        if self.cluster.heartbeat_interval == 0 {
            return Err(CoordinatorError::InvalidConfig(
                "heartbeatInterval must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}
