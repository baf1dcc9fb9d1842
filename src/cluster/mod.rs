//! Cluster collaborator interface.
//!
//! Membership, leader election, and message transport are owned by the
//! cluster adapter; the coordinator only consumes them through [`Cluster`].
//! Incoming messages are delivered on the receiver returned when an adapter
//! is built, never echoed back to the node that broadcast them.

pub mod memory;
pub mod mqtt;

pub use memory::{MemoryCluster, MemoryHub};
pub use mqtt::MqttCluster;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Capacity of the inbound message queue of every adapter.
pub const INBOX_CAPACITY: usize = 64;

/// Message channels used by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::AsRefStr, strum::EnumString, strum::Display)]
pub enum Channel {
    /// Directed requests to measure one address.
    #[strum(serialize = "bluetooth-classic.rssi-request")]
    RssiRequest,
    /// Cluster-wide measurement broadcasts.
    #[strum(serialize = "bluetooth-classic.new-rssi")]
    NewRssi,
}

/// Another node as seen by the membership layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMember {
    pub channels: HashSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

impl ClusterMember {
    pub fn is_subscribed(&self, channel: Channel) -> bool {
        self.channels.contains(channel.as_ref())
    }
}

/// Message received from another node.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterMessage {
    pub channel: String,
    /// Id of the sending node.
    pub origin: String,
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait Cluster: Send + Sync {
    /// Id of this node.
    fn instance_name(&self) -> &str;

    /// Announce interest in `channel`. Subscriptions are visible to peers
    /// through [`ClusterMember::channels`].
    async fn subscribe(&self, channel: &str) -> Result<()>;

    /// Other live members, keyed by id. Never contains this node.
    fn members(&self) -> HashMap<String, ClusterMember>;

    /// Send `payload` on `channel` to the node `target` only.
    async fn send_to(&self, channel: &str, payload: serde_json::Value, target: &str) -> Result<()>;

    /// Send `payload` on `channel` to every other subscribed node.
    async fn publish(&self, channel: &str, payload: serde_json::Value) -> Result<()>;

    /// Whether this node currently holds leadership.
    fn is_leader(&self) -> bool;
}
