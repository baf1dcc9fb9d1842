//! Cluster-wide Bluetooth Classic presence coordination.
//!
//! The leader plans a rotation every interval and hands out one address per
//! participating node. Each node measures its address, smooths and classifies
//! the reading, broadcasts it, and every node (the originator included) feeds
//! the reading into the device's presence sensor.

use crate::cluster::{Channel, Cluster, ClusterMember, ClusterMessage};
use crate::config::BluetoothConfig;
use crate::entities::{Entity, EntityRegistry, InquirySwitch, PresenceSensor};
use crate::error::Result;
use crate::radio::{Device, MeasurementPipeline};
use crate::scheduler::{Assignment, Scheduler, Target};
use crate::signal::{SignalSmoother, range};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub const SENSOR_ID_PREFIX: &str = "bluetooth-classic";

/// A smoothed, classified RSSI reading as broadcast to the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Measurement {
    /// Node that took the reading.
    pub instance_name: String,
    pub device: Device,
    pub rssi: f64,
    pub out_of_range: bool,
}

/// Directed request to measure one address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RssiRequest {
    pub address: String,
}

/// Registry id of the presence sensor for `address`.
pub fn sensor_id(address: &str) -> String {
    let slug: String = address
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    format!("{}-{}", SENSOR_ID_PREFIX, slug)
}

pub struct Coordinator {
    config: BluetoothConfig,
    cluster: Arc<dyn Cluster>,
    pipeline: MeasurementPipeline,
    smoother: SignalSmoother,
    scheduler: Scheduler,
    registry: Arc<EntityRegistry>,
    switch: Arc<InquirySwitch>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl Coordinator {
    /// Create the coordinator and register its inquiry switch.
    pub fn new(
        config: BluetoothConfig,
        cluster: Arc<dyn Cluster>,
        pipeline: MeasurementPipeline,
        registry: Arc<EntityRegistry>,
        shutdown: CancellationToken,
    ) -> Self {
        let switch = match registry.add(Entity::Switch(Arc::new(InquirySwitch::default()))) {
            Entity::Switch(switch) => switch,
            Entity::Sensor(_) => Arc::new(InquirySwitch::default()),
        };

        Self {
            smoother: SignalSmoother::new(config.process_noise, config.measurement_noise),
            config,
            cluster,
            pipeline,
            scheduler: Scheduler::new(),
            registry,
            switch,
            tasks: TaskTracker::new(),
            shutdown,
        }
    }

    /// Turn inquiries on and join both channels so this node participates.
    pub async fn bootstrap(&self) -> Result<()> {
        self.switch.turn_on();
        self.cluster.subscribe(Channel::RssiRequest.as_ref()).await?;
        self.cluster.subscribe(Channel::NewRssi.as_ref()).await?;
        info!(
            "[Scheduler] {} monitoring {} address(es) every {}s",
            self.cluster.instance_name(),
            self.config.addresses.len(),
            self.config.interval
        );
        Ok(())
    }

    pub fn switch(&self) -> &Arc<InquirySwitch> {
        &self.switch
    }

    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    pub fn should_inquire(&self) -> bool {
        self.switch.state()
    }

    /// Peers that receive measurement broadcasts.
    pub fn participating_nodes(&self) -> HashMap<String, ClusterMember> {
        self.cluster
            .members()
            .into_iter()
            .filter(|(_, member)| member.is_subscribed(Channel::NewRssi))
            .collect()
    }

    /// Run one scheduling round.
    ///
    /// Only the leader schedules, and only while inquiries are enabled. Local
    /// work is spawned and its handles returned; remote work is sent as
    /// directed requests. Nothing here waits for a measurement to finish.
    pub async fn tick(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        if !self.should_inquire() || !self.cluster.is_leader() {
            return Vec::new();
        }

        let peers: Vec<String> = self.participating_nodes().into_keys().collect();
        let assignments = self.scheduler.next_plan(&peers, &self.config.addresses);

        let mut local = Vec::new();
        for Assignment { target, address } in assignments {
            match target {
                Target::Local => {
                    debug!("[Scheduler] Measuring {} locally", address);
                    local.push(self.spawn_request(address));
                }
                Target::Remote(node) => {
                    debug!("[Scheduler] Requesting {} from {}", address, node);
                    let payload = serde_json::json!({ "address": address });
                    if let Err(e) = self
                        .cluster
                        .send_to(Channel::RssiRequest.as_ref(), payload, &node)
                        .await
                    {
                        warn!("[Scheduler] Failed to dispatch request to {}: {}", node, e);
                    }
                }
            }
        }
        local
    }

    /// Measure `address`, publish the result and apply it locally.
    ///
    /// Returns the published measurement, or `None` when the address is empty,
    /// inquiries are disabled, or no reading could be taken.
    pub async fn handle_rssi_request(&self, address: &str) -> Option<Measurement> {
        if address.is_empty() || !self.should_inquire() {
            return None;
        }

        let rssi = self.pipeline.measure_signal(address).await?;
        let device = self.pipeline.resolve_device(address).await;
        let filtered = self.smoother.filter(address, rssi as f64);
        let out_of_range =
            range::is_out_of_range(self.config.min_rssi.as_ref(), address, filtered);

        let measurement = Measurement {
            instance_name: self.cluster.instance_name().to_string(),
            device,
            rssi: filtered,
            out_of_range,
        };

        match serde_json::to_value(&measurement) {
            Ok(payload) => {
                if let Err(e) = self.cluster.publish(Channel::NewRssi.as_ref(), payload).await {
                    warn!("[Scheduler] Failed to publish measurement of {}: {}", address, e);
                }
            }
            Err(e) => warn!("[Scheduler] Failed to encode measurement: {}", e),
        }

        self.handle_new_rssi(&measurement);
        Some(measurement)
    }

    /// Feed a measurement into the presence sensor of its device, creating the
    /// sensor and its staleness watchdog on first sight.
    pub fn handle_new_rssi(&self, measurement: &Measurement) -> Option<Arc<PresenceSensor>> {
        if !self.should_inquire() {
            return None;
        }

        let id = sensor_id(&measurement.device.address);
        let sensor = match self.registry.get(&id).and_then(|e| e.as_sensor().cloned()) {
            Some(sensor) => sensor,
            None => self.create_sensor(id, &measurement.device),
        };

        sensor.handle_new_distance(
            &measurement.instance_name,
            -measurement.rssi,
            measurement.out_of_range,
        );
        Some(sensor)
    }

    fn create_sensor(&self, id: String, device: &Device) -> Arc<PresenceSensor> {
        let candidate = Arc::new(PresenceSensor::new(
            id,
            format!("{} Room Presence", device.name),
        ));
        let registered = self.registry.add(Entity::Sensor(Arc::clone(&candidate)));
        let sensor = registered.as_sensor().cloned().unwrap_or_else(|| Arc::clone(&candidate));

        // Another task may have registered the sensor in the meantime.
        if Arc::ptr_eq(&sensor, &candidate) {
            let cluster_size = self.participating_nodes().len() + 1;
            sensor.set_timeout(self.config.sensor_timeout(cluster_size));
            self.spawn_watchdog(Arc::clone(&sensor));
            info!(
                "[Sensor] Created {} for {} (timeout {}s)",
                sensor.id(),
                device.address,
                sensor.timeout()
            );
        }
        sensor
    }

    fn spawn_watchdog(&self, sensor: Arc<PresenceSensor>) {
        let period = self.config.interval_duration();
        let shutdown = self.shutdown.clone();
        self.tasks.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => sensor.check_for_timeout(),
                    _ = shutdown.cancelled() => break,
                }
            }
        });
    }

    fn spawn_request(self: &Arc<Self>, address: String) -> JoinHandle<()> {
        let this = Arc::clone(self);
        self.tasks.spawn(async move {
            this.handle_rssi_request(&address).await;
        })
    }

    /// Route a message received from another node.
    pub fn handle_message(self: &Arc<Self>, message: ClusterMessage) {
        match message.channel.parse::<Channel>() {
            Ok(Channel::RssiRequest) => {
                match serde_json::from_value::<RssiRequest>(message.payload) {
                    Ok(request) => {
                        self.spawn_request(request.address);
                    }
                    Err(e) => warn!("[Cluster] Invalid RSSI request from {}: {}", message.origin, e),
                }
            }
            Ok(Channel::NewRssi) => match serde_json::from_value::<Measurement>(message.payload) {
                Ok(measurement) => {
                    self.handle_new_rssi(&measurement);
                }
                Err(e) => warn!("[Cluster] Invalid measurement from {}: {}", message.origin, e),
            },
            Err(_) => debug!("[Cluster] Ignoring message on {}", message.channel),
        }
    }

    /// Drive scheduling ticks and incoming messages until shutdown.
    pub async fn run(self: Arc<Self>, mut inbox: mpsc::Receiver<ClusterMessage>) {
        let mut ticker = tokio::time::interval(self.config.interval_duration());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
                message = inbox.recv() => match message {
                    Some(message) => self.handle_message(message),
                    None => {
                        warn!("[Cluster] Message channel closed");
                        break;
                    }
                },
            }
        }
    }

    /// Stop watchdogs and wait for in-flight measurements to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{MemoryCluster, MemoryHub};
    use crate::entities::NOT_HOME;
    use crate::radio::testing::{Reply, ScriptedRunner};
    use crate::signal::MinRssi;
    use std::time::Duration;

    const ADDR: &str = "AA:BB:CC:DD:EE:FF";
    const OTHER: &str = "11:22:33:44:55:66";

    struct Peer {
        node: Arc<MemoryCluster>,
        inbox: mpsc::Receiver<ClusterMessage>,
    }

    fn bt_config(addresses: &[&str]) -> BluetoothConfig {
        BluetoothConfig {
            addresses: addresses.iter().map(|a| a.to_string()).collect(),
            interval: 6.0,
            timeout_cycles: 2,
            ..BluetoothConfig::default()
        }
    }

    fn healthy_radio() -> ScriptedRunner {
        ScriptedRunner::new()
            .on(" rssi ", Reply::Stdout("RSSI return value: -4\n".into()))
            .on(" info ", Reply::Stdout("\tDevice Name: Phone\n".into()))
            .on("reset", Reply::Stdout(String::new()))
    }

    /// Local node "a" plus `peers`; peers listed in `listening` subscribe to
    /// measurement broadcasts.
    async fn setup(
        config: BluetoothConfig,
        runner: ScriptedRunner,
        peers: &[&str],
        listening: &[&str],
    ) -> (Arc<Coordinator>, Arc<ScriptedRunner>, HashMap<String, Peer>) {
        let hub = MemoryHub::new();
        let (local, _local_inbox) = hub.join("a");

        let mut handles = HashMap::new();
        for name in peers {
            let (node, inbox) = hub.join(*name);
            if listening.contains(name) {
                node.subscribe(Channel::NewRssi.as_ref()).await.unwrap();
            }
            handles.insert(name.to_string(), Peer { node, inbox });
        }

        let runner = Arc::new(runner);
        let pipeline = MeasurementPipeline::new(runner.clone(), 0, Duration::from_secs(1));
        let coordinator = Arc::new(Coordinator::new(
            config,
            local,
            pipeline,
            Arc::new(EntityRegistry::new()),
            CancellationToken::new(),
        ));
        coordinator.bootstrap().await.unwrap();
        (coordinator, runner, handles)
    }

    fn measurement_from(origin: &str, rssi: f64, out_of_range: bool) -> Measurement {
        Measurement {
            instance_name: origin.to_string(),
            device: Device::unnamed(ADDR),
            rssi,
            out_of_range,
        }
    }

    #[test]
    fn test_sensor_id() {
        assert_eq!(sensor_id(ADDR), "bluetooth-classic-aa-bb-cc-dd-ee-ff");
    }

    #[tokio::test]
    async fn test_bootstrap_turns_switch_on_and_registers_it() {
        let (coordinator, _, _) = setup(bt_config(&[ADDR]), healthy_radio(), &[], &[]).await;
        assert!(coordinator.should_inquire());
        assert!(coordinator.registry().has(crate::entities::INQUIRY_SWITCH_ID));
    }

    #[tokio::test]
    async fn test_disabled_gate_suppresses_everything() {
        let (coordinator, runner, mut peers) =
            setup(bt_config(&[ADDR, OTHER]), healthy_radio(), &["b"], &["b"]).await;
        coordinator.switch().turn_off();

        assert!(coordinator.tick().await.is_empty());
        assert!(coordinator.handle_rssi_request(ADDR).await.is_none());
        assert!(coordinator.handle_new_rssi(&measurement_from("b", -3.0, false)).is_none());

        assert!(runner.calls().is_empty());
        assert!(peers.get_mut("b").unwrap().inbox.try_recv().is_err());
        assert!(coordinator.registry().sensors().is_empty());
    }

    #[tokio::test]
    async fn test_measurement_is_published_and_applied_locally() {
        let (coordinator, _, mut peers) =
            setup(bt_config(&[ADDR]), healthy_radio(), &["b"], &["b"]).await;

        let measurement = coordinator.handle_rssi_request(ADDR).await.unwrap();
        assert_eq!(measurement.instance_name, "a");
        assert_eq!(measurement.device.name, "Phone");
        assert_eq!(measurement.rssi, -4.0);
        assert!(!measurement.out_of_range);

        let message = peers.get_mut("b").unwrap().inbox.try_recv().unwrap();
        assert_eq!(message.channel, Channel::NewRssi.as_ref());
        let received: Measurement = serde_json::from_value(message.payload).unwrap();
        assert_eq!(received, measurement);

        let sensors = coordinator.registry().sensors();
        assert_eq!(sensors.len(), 1);
        assert_eq!(sensors[0].name(), "Phone Room Presence");
        assert_eq!(sensors[0].state(), "a");
        assert_eq!(sensors[0].distance_from("a").unwrap().distance, 4.0);
    }

    #[tokio::test]
    async fn test_killed_query_publishes_nothing_and_resets_once() {
        let runner = ScriptedRunner::new()
            .on(" rssi ", Reply::Killed)
            .on("reset", Reply::Stdout(String::new()));
        let (coordinator, runner, mut peers) =
            setup(bt_config(&[ADDR]), runner, &["b"], &["b"]).await;

        assert!(coordinator.handle_rssi_request(ADDR).await.is_none());
        assert_eq!(runner.count("hciconfig hci0 reset"), 1);
        assert_eq!(runner.count(" info "), 0);
        assert!(peers.get_mut("b").unwrap().inbox.try_recv().is_err());
        assert!(coordinator.registry().sensors().is_empty());
    }

    #[tokio::test]
    async fn test_device_identity_is_looked_up_once() {
        let (coordinator, runner, _) = setup(bt_config(&[ADDR]), healthy_radio(), &[], &[]).await;

        coordinator.handle_rssi_request(ADDR).await.unwrap();
        coordinator.handle_rssi_request(ADDR).await.unwrap();

        assert_eq!(runner.count(" rssi "), 2);
        assert_eq!(runner.count(" info "), 1);
    }

    #[tokio::test]
    async fn test_sensor_timeout_scales_with_participants() {
        let (coordinator, _, _) =
            setup(bt_config(&[ADDR]), healthy_radio(), &["b", "c"], &["b"]).await;

        // "c" is a member but does not listen for measurements.
        assert_eq!(coordinator.participating_nodes().len(), 1);

        let sensor = coordinator
            .handle_new_rssi(&measurement_from("b", -3.0, false))
            .unwrap();
        assert_eq!(sensor.timeout(), 24);
    }

    #[tokio::test]
    async fn test_existing_sensor_is_reused() {
        let (coordinator, _, _) = setup(bt_config(&[ADDR]), healthy_radio(), &["b"], &["b"]).await;

        let first = coordinator
            .handle_new_rssi(&measurement_from("b", -3.0, false))
            .unwrap();
        first.set_timeout(99);
        let second = coordinator
            .handle_new_rssi(&measurement_from("a", -1.0, false))
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.timeout(), 99);
        assert_eq!(second.state(), "a");
        assert_eq!(coordinator.registry().sensors().len(), 1);
    }

    #[tokio::test]
    async fn test_out_of_range_reading_reaches_sensor() {
        let mut config = bt_config(&[ADDR]);
        config.min_rssi = Some(MinRssi::Global(-2.0));
        let (coordinator, _, _) = setup(config, healthy_radio(), &[], &[]).await;

        let measurement = coordinator.handle_rssi_request(ADDR).await.unwrap();
        assert!(measurement.out_of_range);

        let sensor = coordinator.registry().sensors().pop().unwrap();
        assert!(sensor.distance_from("a").unwrap().out_of_range);
        assert_eq!(sensor.state(), NOT_HOME);
    }

    #[tokio::test]
    async fn test_empty_address_is_ignored() {
        let (coordinator, runner, _) = setup(bt_config(&[ADDR]), healthy_radio(), &[], &[]).await;
        assert!(coordinator.handle_rssi_request("").await.is_none());
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_leader_tick_splits_work() {
        let (coordinator, runner, mut peers) =
            setup(bt_config(&[ADDR, OTHER]), healthy_radio(), &["b"], &["b"]).await;

        let local = coordinator.tick().await;
        assert_eq!(local.len(), 1);
        for handle in local {
            handle.await.unwrap();
        }

        assert_eq!(runner.count(&format!("rssi \"{}\"", ADDR)), 1);
        assert_eq!(runner.count(&format!("rssi \"{}\"", OTHER)), 0);

        let inbox = &mut peers.get_mut("b").unwrap().inbox;
        let mut received = vec![inbox.try_recv().unwrap(), inbox.try_recv().unwrap()];
        received.sort_by(|x, y| x.channel.cmp(&y.channel));

        // The local measurement was broadcast as well.
        assert_eq!(received[0].channel, Channel::NewRssi.as_ref());
        assert_eq!(received[1].channel, Channel::RssiRequest.as_ref());
        assert_eq!(
            serde_json::from_value::<RssiRequest>(received[1].payload.clone()).unwrap(),
            RssiRequest { address: OTHER.to_string() }
        );
    }

    #[tokio::test]
    async fn test_follower_tick_is_noop() {
        let (coordinator, runner, peers) =
            setup(bt_config(&[ADDR]), healthy_radio(), &["b"], &["b"]).await;
        peers["b"].node.hub().set_leader(Some("b".to_string()));

        assert!(coordinator.tick().await.is_empty());
        assert!(runner.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_local_measurement_does_not_stall_rotation() {
        let runner = ScriptedRunner::new().on(" rssi ", Reply::Hang);
        let (coordinator, runner, mut peers) =
            setup(bt_config(&[ADDR, OTHER]), runner, &["b"], &["b"]).await;

        let first = coordinator.tick().await;
        assert_eq!(first.len(), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!first[0].is_finished());

        let second = tokio::time::timeout(Duration::from_secs(1), coordinator.tick())
            .await
            .expect("second tick must not wait for the first measurement");
        assert_eq!(second.len(), 1);
        assert_eq!(coordinator.scheduler.cursor(), 2);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(runner.count(&format!("rssi \"{}\"", ADDR)), 1);
        assert_eq!(runner.count(&format!("rssi \"{}\"", OTHER)), 1);

        let inbox = &mut peers.get_mut("b").unwrap().inbox;
        let requests: Vec<RssiRequest> = std::iter::from_fn(|| inbox.try_recv().ok())
            .map(|m| serde_json::from_value(m.payload).unwrap())
            .collect();
        assert_eq!(
            requests,
            vec![
                RssiRequest { address: OTHER.to_string() },
                RssiRequest { address: ADDR.to_string() },
            ]
        );
    }

    #[tokio::test]
    async fn test_departed_member_leaves_rotation() {
        let (coordinator, runner, peers) =
            setup(bt_config(&[ADDR, OTHER]), healthy_radio(), &["b"], &["b"]).await;
        assert_eq!(coordinator.participating_nodes().len(), 1);

        peers["b"].node.hub().leave("b");
        assert!(coordinator.participating_nodes().is_empty());

        for handle in coordinator.tick().await {
            handle.await.unwrap();
        }
        for handle in coordinator.tick().await {
            handle.await.unwrap();
        }
        assert_eq!(runner.count(&format!("rssi \"{}\"", ADDR)), 1);
        assert_eq!(runner.count(&format!("rssi \"{}\"", OTHER)), 1);
    }

    #[tokio::test]
    async fn test_remote_request_is_measured_and_broadcast() {
        let (coordinator, runner, mut peers) =
            setup(bt_config(&[ADDR]), healthy_radio(), &["b"], &["b"]).await;

        coordinator.handle_message(ClusterMessage {
            channel: Channel::RssiRequest.as_ref().to_string(),
            origin: "b".to_string(),
            payload: serde_json::json!({ "address": ADDR }),
        });
        coordinator.shutdown().await;

        assert_eq!(runner.count(" rssi "), 1);
        let message = peers.get_mut("b").unwrap().inbox.try_recv().unwrap();
        let measurement: Measurement = serde_json::from_value(message.payload).unwrap();
        assert_eq!(measurement.instance_name, "a");
    }

    #[tokio::test]
    async fn test_received_broadcast_updates_sensor() {
        let (coordinator, runner, _) = setup(bt_config(&[ADDR]), healthy_radio(), &["b"], &["b"]).await;

        let payload = serde_json::to_value(measurement_from("b", -7.0, false)).unwrap();
        coordinator.handle_message(ClusterMessage {
            channel: Channel::NewRssi.as_ref().to_string(),
            origin: "b".to_string(),
            payload,
        });

        let sensor = coordinator.registry().sensors().pop().unwrap();
        assert_eq!(sensor.state(), "b");
        assert_eq!(sensor.distance_from("b").unwrap().distance, 7.0);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_messages_are_ignored() {
        let (coordinator, _, _) = setup(bt_config(&[ADDR]), healthy_radio(), &[], &[]).await;

        coordinator.handle_message(ClusterMessage {
            channel: Channel::NewRssi.as_ref().to_string(),
            origin: "b".to_string(),
            payload: serde_json::json!("garbage"),
        });
        coordinator.handle_message(ClusterMessage {
            channel: "something.else".to_string(),
            origin: "b".to_string(),
            payload: serde_json::json!({}),
        });

        assert!(coordinator.registry().sensors().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_expires_stale_readings() {
        let (coordinator, _, _) = setup(bt_config(&[ADDR]), healthy_radio(), &[], &[]).await;
        let sensor = coordinator
            .handle_new_rssi(&measurement_from("a", -3.0, false))
            .unwrap();
        assert_eq!(sensor.timeout(), 12);
        assert_eq!(sensor.state(), "a");

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(sensor.state(), NOT_HOME);
    }
}
