//! Cluster adapter over an MQTT broker.
//!
//! Provides membership (retained heartbeats), leader election (smallest live
//! id), broadcast and directed messaging. Payloads travel in a JSON envelope
//! carrying the origin id; a node drops its own broadcasts.

mod client;
pub mod membership;

pub use client::{MqttClient, MqttEvent};
pub use membership::{Heartbeat, MembershipTable, TopicKind, Topics};

use super::{Cluster, ClusterMember, ClusterMessage, INBOX_CAPACITY};
use crate::config::Config;
use crate::error::{CoordinatorError, Result};
use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info, warn};
use parking_lot::RwLock;
use rumqttc::{AsyncClient, LastWill, QoS};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    origin: String,
    payload: serde_json::Value,
}

pub struct MqttCluster {
    name: String,
    topics: Topics,
    client: AsyncClient,
    channels: RwLock<HashSet<String>>,
    membership: RwLock<MembershipTable>,
}

impl MqttCluster {
    /// Connect to the broker and start the event router and heartbeat tasks.
    ///
    /// Both tasks stop when `shutdown` is cancelled; the node then clears its
    /// membership entry.
    pub fn start(
        config: &Config,
        shutdown: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<ClusterMessage>) {
        let topics = Topics::new(config.cluster.topic_prefix.clone());
        let heartbeat_interval = Duration::from_secs(config.cluster.heartbeat_interval);
        let name = config.instance_name.clone();

        let will = LastWill::new(topics.member(&name), Vec::<u8>::new(), QoS::AtLeastOnce, true);
        let mqtt = MqttClient::new(&config.mqtt, Some(will));

        let cluster = Arc::new(Self {
            name,
            topics,
            client: mqtt.client(),
            channels: RwLock::new(HashSet::new()),
            membership: RwLock::new(MembershipTable::new(heartbeat_interval)),
        });

        info!(
            "[MQTT] Connecting to {}:{} as {}",
            config.mqtt.broker_host, config.mqtt.broker_port, cluster.name
        );

        let (event_tx, event_rx) = mpsc::channel(INBOX_CAPACITY);
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);

        let event_loop = tokio::spawn(mqtt.run(event_tx));

        let router = Arc::clone(&cluster);
        let router_shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = router.route_events(event_rx, inbox_tx) => {}
                _ = router_shutdown.cancelled() => {}
            }
        });

        let heartbeat = Arc::clone(&cluster);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => heartbeat.publish_heartbeat().await,
                    _ = shutdown.cancelled() => break,
                }
            }
            heartbeat.leave().await;
            event_loop.abort();
        });

        (cluster, inbox_rx)
    }

    async fn route_events(
        &self,
        mut events: mpsc::Receiver<MqttEvent>,
        inbox: mpsc::Sender<ClusterMessage>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                MqttEvent::Connected => self.renew_subscriptions().await,
                MqttEvent::Message { topic, payload } => {
                    if let Some(message) = self.handle_message(&topic, &payload)
                        && inbox.send(message).await.is_err()
                    {
                        warn!("[Cluster] Inbox closed, stopping router");
                        break;
                    }
                }
            }
        }
    }

    /// Apply membership updates; return messages meant for the coordinator.
    fn handle_message(&self, topic: &str, payload: &[u8]) -> Option<ClusterMessage> {
        match self.topics.classify(topic)? {
            TopicKind::Member(id) => {
                if id == self.name {
                    return None;
                }
                if payload.is_empty() {
                    debug!("[Cluster] {} left", id);
                    self.membership.write().remove(&id);
                    return None;
                }
                match serde_json::from_slice::<Heartbeat>(payload) {
                    Ok(heartbeat) => self.membership.write().record(&id, heartbeat, Utc::now()),
                    Err(e) => warn!("[Cluster] Invalid heartbeat from {}: {}", id, e),
                }
                None
            }
            TopicKind::Directed { target, .. } if target != self.name => None,
            TopicKind::Broadcast(channel) | TopicKind::Directed { channel, .. } => {
                let envelope = match serde_json::from_slice::<Envelope>(payload) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!("[Cluster] Invalid message on {}: {}", topic, e);
                        return None;
                    }
                };
                (envelope.origin != self.name).then(|| ClusterMessage {
                    channel,
                    origin: envelope.origin,
                    payload: envelope.payload,
                })
            }
        }
    }

    async fn renew_subscriptions(&self) {
        let mut topics = vec![self.topics.all_members()];
        let channels: Vec<String> = self.channels.read().iter().cloned().collect();
        for channel in &channels {
            topics.push(self.topics.broadcast(channel));
            topics.push(self.topics.directed(channel, &self.name));
        }

        for topic in topics {
            if let Err(e) = self.client.subscribe(&topic, QoS::AtLeastOnce).await {
                warn!("[MQTT] Failed to subscribe to {}: {:?}", topic, e);
            }
        }
        self.publish_heartbeat().await;
    }

    async fn publish_heartbeat(&self) {
        let heartbeat = Heartbeat {
            channels: self.channels.read().clone(),
            last_seen: Utc::now(),
        };
        let payload = match serde_json::to_vec(&heartbeat) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("[Cluster] Failed to encode heartbeat: {}", e);
                return;
            }
        };
        if let Err(e) = self
            .client
            .publish(self.topics.member(&self.name), QoS::AtLeastOnce, true, payload)
            .await
        {
            warn!("[MQTT] Failed to publish heartbeat: {:?}", e);
        }
    }

    async fn leave(&self) {
        info!("[Cluster] {} leaving", self.name);
        let _ = self
            .client
            .publish(self.topics.member(&self.name), QoS::AtLeastOnce, true, Vec::<u8>::new())
            .await;
        let _ = self.client.disconnect().await;
    }

    async fn send_envelope(&self, topic: String, payload: serde_json::Value) -> Result<()> {
        let envelope = Envelope {
            origin: self.name.clone(),
            payload,
        };
        let bytes = serde_json::to_vec(&envelope)?;
        self.client
            .publish(topic, QoS::AtLeastOnce, false, bytes)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Cluster for MqttCluster {
    fn instance_name(&self) -> &str {
        &self.name
    }

    async fn subscribe(&self, channel: &str) -> Result<()> {
        if channel.contains('/') {
            return Err(CoordinatorError::Cluster(format!(
                "channel '{}' must not contain '/'",
                channel
            )));
        }
        self.channels.write().insert(channel.to_string());

        self.client
            .subscribe(self.topics.broadcast(channel), QoS::AtLeastOnce)
            .await?;
        self.client
            .subscribe(self.topics.directed(channel, &self.name), QoS::AtLeastOnce)
            .await?;
        self.publish_heartbeat().await;
        Ok(())
    }

    fn members(&self) -> HashMap<String, ClusterMember> {
        self.membership.read().live_members(Utc::now())
    }

    async fn send_to(&self, channel: &str, payload: serde_json::Value, target: &str) -> Result<()> {
        self.send_envelope(self.topics.directed(channel, target), payload)
            .await
    }

    async fn publish(&self, channel: &str, payload: serde_json::Value) -> Result<()> {
        self.send_envelope(self.topics.broadcast(channel), payload)
            .await
    }

    fn is_leader(&self) -> bool {
        self.membership.read().leader(&self.name, Utc::now()) == self.name
    }
}
