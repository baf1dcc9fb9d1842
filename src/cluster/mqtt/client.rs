//! MQTT client wrapper for cluster traffic.

use crate::config::MqttConfig;
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet};
use std::time::Duration;
use tokio::sync::mpsc;

/// Event forwarded from the MQTT event loop.
#[derive(Debug, Clone)]
pub enum MqttEvent {
    /// (Re)connected to the broker; subscriptions must be renewed.
    Connected,
    Message { topic: String, payload: Vec<u8> },
}

pub struct MqttClient {
    client: AsyncClient,
    event_loop: EventLoop,
}

impl MqttClient {
    /// Create a new MQTT client. `last_will` is published by the broker if
    /// this client disappears without disconnecting.
    pub fn new(config: &MqttConfig, last_will: Option<LastWill>) -> Self {
        let mut options =
            MqttOptions::new(&config.client_id, &config.broker_host, config.broker_port);
        options.set_keep_alive(Duration::from_secs(30));

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }
        if let Some(will) = last_will {
            options.set_last_will(will);
        }

        let (client, event_loop) = AsyncClient::new(options, 100);

        Self { client, event_loop }
    }

    /// Get a clone of the async client for publishing from other tasks.
    pub fn client(&self) -> AsyncClient {
        self.client.clone()
    }

    /// Run the MQTT event loop and forward events to `tx`.
    ///
    /// Runs until `tx` is closed. Connection errors are retried after a delay.
    pub async fn run(mut self, tx: mpsc::Sender<MqttEvent>) {
        info!("[MQTT] Starting event loop");

        loop {
            let event = match self.event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("[MQTT] Connected to broker");
                    MqttEvent::Connected
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    debug!("[MQTT] Received message on {}", publish.topic);
                    MqttEvent::Message {
                        topic: publish.topic.clone(),
                        payload: publish.payload.to_vec(),
                    }
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!("[MQTT] Connection error: {:?}", e);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };

            if tx.send(event).await.is_err() {
                error!("[MQTT] Event channel closed");
                break;
            }
        }
    }
}
