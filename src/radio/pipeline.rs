//! RSSI acquisition and device identity lookup.

use super::hcitool::{self, HciTool};
use super::runner::{CommandError, CommandRunner};
use crate::error::{CoordinatorError, Result};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

/// Budget for the one-off availability check and identity lookups that have
/// no tick-derived budget of their own.
const AUXILIARY_TIMEOUT: Duration = Duration::from_secs(10);

/// Identity of a monitored Bluetooth device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub address: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
}

impl Device {
    /// Placeholder identity used when the lookup yields no name.
    pub fn unnamed(address: &str) -> Self {
        Self {
            address: address.to_string(),
            name: address.to_string(),
            manufacturer: None,
        }
    }
}

/// Runs radio queries for single addresses.
///
/// Owns the device identity cache: the first lookup for an address, whether
/// it succeeded or not, is cached for the process lifetime.
pub struct MeasurementPipeline {
    runner: Arc<dyn CommandRunner>,
    hcitool: HciTool,
    query_timeout: Duration,
    devices: RwLock<HashMap<String, Device>>,
    /// Serializes identity lookups per address.
    lookups: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl MeasurementPipeline {
    pub fn new(runner: Arc<dyn CommandRunner>, hci_device_id: u32, query_timeout: Duration) -> Self {
        Self {
            runner,
            hcitool: HciTool::new(hci_device_id),
            query_timeout,
            devices: RwLock::new(HashMap::new()),
            lookups: Mutex::new(HashMap::new()),
        }
    }

    /// Verify that `hcitool` can be invoked. Failing here is fatal.
    pub async fn check_capability(&self) -> Result<()> {
        match self
            .runner
            .run(hcitool::AVAILABILITY_COMMAND, AUXILIARY_TIMEOUT)
            .await
        {
            Ok(path) => {
                info!("[Radio] Using {}", path.trim());
                Ok(())
            }
            Err(e) => Err(CoordinatorError::RadioToolMissing(format!(
                "hcitool is not invocable: {}",
                e
            ))),
        }
    }

    /// Query the RSSI of `address`.
    ///
    /// Returns `None` when no reading could be taken. A query that exceeds its
    /// time budget resets the adapter before returning.
    pub async fn measure_signal(&self, address: &str) -> Option<i32> {
        let command = self.hcitool.rssi_command(address);

        match self.runner.run(&command, self.query_timeout).await {
            Ok(output) => {
                let rssi = hcitool::parse_rssi(&output);
                if rssi.is_none() {
                    debug!("[Radio] No RSSI value in output for {}", address);
                }
                rssi
            }
            Err(CommandError::Killed) => {
                warn!(
                    "[Radio] Query of {} took too long, resetting {}",
                    address,
                    self.hcitool.interface()
                );
                self.reset_interface().await;
                None
            }
            Err(CommandError::Failed { ref stderr, .. }) if stderr.contains("Input/output error") => {
                debug!("[Radio] Connection to {} failed: {}", address, stderr);
                None
            }
            Err(e) => {
                error!("[Radio] RSSI query for {} failed: {}", address, e);
                None
            }
        }
    }

    /// Identity of `address`, looked up once and cached.
    ///
    /// Concurrent callers for the same address share a single lookup.
    pub async fn resolve_device(&self, address: &str) -> Device {
        if let Some(device) = self.cached_device(address) {
            return device;
        }

        let lookup = Arc::clone(self.lookups.lock().entry(address.to_string()).or_default());
        let _guard = lookup.lock().await;
        if let Some(device) = self.cached_device(address) {
            return device;
        }

        let command = self.hcitool.info_command(address);
        let device = match self.runner.run(&command, AUXILIARY_TIMEOUT).await {
            Ok(output) => {
                let info = hcitool::parse_device_info(&output);
                Device {
                    address: address.to_string(),
                    name: info.name.unwrap_or_else(|| address.to_string()),
                    manufacturer: info.manufacturer,
                }
            }
            Err(e) => {
                debug!("[Radio] Device info lookup for {} failed: {}", address, e);
                Device::unnamed(address)
            }
        };

        self.devices
            .write()
            .insert(address.to_string(), device.clone());
        device
    }

    pub fn cached_device(&self, address: &str) -> Option<Device> {
        self.devices.read().get(address).cloned()
    }

    async fn reset_interface(&self) {
        let command = self.hcitool.reset_command();
        if let Err(e) = self.runner.run(&command, AUXILIARY_TIMEOUT).await {
            error!(
                "[Radio] Resetting {} failed: {}",
                self.hcitool.interface(),
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::testing::{Reply, ScriptedRunner};

    const ADDR: &str = "AA:BB:CC:DD:EE:FF";

    fn pipeline(runner: ScriptedRunner) -> (Arc<ScriptedRunner>, MeasurementPipeline) {
        let runner = Arc::new(runner);
        let pipeline = MeasurementPipeline::new(runner.clone(), 0, Duration::from_secs(1));
        (runner, pipeline)
    }

    #[tokio::test]
    async fn test_measure_signal_parses_value() {
        let (_, pipeline) = pipeline(
            ScriptedRunner::new().on(" rssi ", Reply::Stdout("RSSI return value: -4\n".into())),
        );
        assert_eq!(pipeline.measure_signal(ADDR).await, Some(-4));
    }

    #[tokio::test]
    async fn test_unparsable_output_is_absent() {
        let (runner, pipeline) =
            pipeline(ScriptedRunner::new().on(" rssi ", Reply::Stdout("Not connected.\n".into())));
        assert_eq!(pipeline.measure_signal(ADDR).await, None);
        assert_eq!(runner.count("reset"), 0);
    }

    #[tokio::test]
    async fn test_io_error_is_absent_without_reset() {
        let (runner, pipeline) = pipeline(ScriptedRunner::new().on(
            " rssi ",
            Reply::Failed("Could not create connection: Input/output error".into()),
        ));
        assert_eq!(pipeline.measure_signal(ADDR).await, None);
        assert_eq!(runner.count("reset"), 0);
    }

    #[tokio::test]
    async fn test_killed_query_resets_interface_once() {
        let (runner, pipeline) = pipeline(
            ScriptedRunner::new()
                .on(" rssi ", Reply::Killed)
                .on("reset", Reply::Stdout(String::new())),
        );
        assert_eq!(pipeline.measure_signal(ADDR).await, None);
        assert_eq!(runner.count("hciconfig hci0 reset"), 1);
    }

    #[tokio::test]
    async fn test_failed_reset_is_swallowed() {
        let (runner, pipeline) = pipeline(
            ScriptedRunner::new()
                .on(" rssi ", Reply::Killed)
                .on("reset", Reply::Failed("Operation not permitted".into())),
        );
        assert_eq!(pipeline.measure_signal(ADDR).await, None);
        assert_eq!(runner.count("reset"), 1);
    }

    #[tokio::test]
    async fn test_resolve_device_is_cached() {
        let (runner, pipeline) = pipeline(ScriptedRunner::new().on(
            " info ",
            Reply::Stdout("\tOUI Company: Apple, Inc. (F0-99-BF)\n\tDevice Name: Phone\n".into()),
        ));

        let first = pipeline.resolve_device(ADDR).await;
        let second = pipeline.resolve_device(ADDR).await;

        assert_eq!(first.name, "Phone");
        assert_eq!(first.manufacturer.as_deref(), Some("Apple, Inc."));
        assert_eq!(first, second);
        assert_eq!(runner.count(" info "), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_lookups_share_one_query() {
        let (runner, pipeline) = pipeline(ScriptedRunner::new().on(
            " info ",
            Reply::Delayed(Duration::from_secs(8), "\tDevice Name: Phone\n".into()),
        ));

        let (first, second) =
            tokio::join!(pipeline.resolve_device(ADDR), pipeline.resolve_device(ADDR));

        assert_eq!(first.name, "Phone");
        assert_eq!(first, second);
        assert_eq!(runner.count(" info "), 1);
    }

    #[tokio::test]
    async fn test_failed_lookup_is_cached_with_address_as_name() {
        let (runner, pipeline) =
            pipeline(ScriptedRunner::new().on(" info ", Reply::Failed("Host is down".into())));

        let device = pipeline.resolve_device(ADDR).await;
        assert_eq!(device, Device::unnamed(ADDR));

        pipeline.resolve_device(ADDR).await;
        assert_eq!(runner.count(" info "), 1);
    }

    #[tokio::test]
    async fn test_capability_check() {
        let (_, ok) = pipeline(
            ScriptedRunner::new().on("command -v", Reply::Stdout("/usr/bin/hcitool\n".into())),
        );
        assert!(ok.check_capability().await.is_ok());

        let (_, missing) = pipeline(ScriptedRunner::new());
        assert!(matches!(
            missing.check_capability().await,
            Err(CoordinatorError::RadioToolMissing(_))
        ));
    }
}
